// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::Ed25519PublicKey;

/// The local trust state of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified,
    /// The device been blacklisted from communicating.
    BlackListed,
    /// The trust state of the device is being ignored.
    Ignored,
    /// The trust state is unset.
    #[default]
    Unset,
}

impl LocalTrust {
    pub fn is_verified(&self) -> bool {
        matches!(self, LocalTrust::Verified)
    }
}

/// The public identity of a device, either one of ours or one of another
/// user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    ed25519_key: Ed25519PublicKey,
    display_name: Option<String>,
}

impl Device {
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        ed25519_key: Ed25519PublicKey,
    ) -> Self {
        Self { user_id, device_id, ed25519_key, display_name: None }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The long term signing key of the device, this is the key that gets
    /// verified.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.ed25519_key
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Does this device belong to the given user and have the given id.
    pub fn is(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.user_id() == user_id && self.device_id() == device_id
    }
}
