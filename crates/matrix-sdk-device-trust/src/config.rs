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

//! Configuration of the pairing channel and of interactive verifications.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::VerificationMethod;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CANCEL_SEND_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(60 * 10);
const DEFAULT_MAX_REQUEST_AGE: Duration = Duration::from_secs(60 * 10);
const DEFAULT_MAX_FUTURE_SKEW: Duration = Duration::from_secs(60 * 5);

/// Settings for a [`RendezvousChannel`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use matrix_sdk_device_trust::config::RendezvousSettings;
///
/// let settings = RendezvousSettings::new()
///     .connect_timeout(Duration::from_secs(30))
///     .confirmation_timeout(Duration::from_secs(60));
/// ```
///
/// [`RendezvousChannel`]: crate::rendezvous::RendezvousChannel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousSettings {
    pub(crate) connect_timeout: Duration,
    pub(crate) confirmation_timeout: Duration,
    pub(crate) cancel_send_timeout: Duration,
}

impl Default for RendezvousSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            cancel_send_timeout: DEFAULT_CANCEL_SEND_TIMEOUT,
        }
    }
}

impl RendezvousSettings {
    /// Create new default `RendezvousSettings`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// How long we wait for the other device to show up and finish the
    /// handshake. The default is one minute.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long we wait for the other device to confirm the digits after we
    /// confirmed them. The default is two minutes.
    #[must_use]
    pub fn confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// How long we try to tell the other side that we're giving up before we
    /// release the transport anyway.
    #[must_use]
    pub fn cancel_send_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_send_timeout = timeout;
        self
    }
}

/// Settings for the [`VerificationMachine`].
///
/// [`VerificationMachine`]: crate::verification::VerificationMachine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub(crate) timeout: Duration,
    pub(crate) max_request_age: Duration,
    pub(crate) max_future_skew: Duration,
    pub(crate) methods: Vec<VerificationMethod>,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_VERIFICATION_TIMEOUT,
            max_request_age: DEFAULT_MAX_REQUEST_AGE,
            max_future_skew: DEFAULT_MAX_FUTURE_SKEW,
            methods: vec![
                VerificationMethod::SasV1,
                VerificationMethod::QrCodeShowV1,
                VerificationMethod::QrCodeScanV1,
                VerificationMethod::ReciprocateV1,
            ],
        }
    }
}

impl VerificationSettings {
    /// Create new default `VerificationSettings`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// After how long a verification that didn't finish gets cancelled. The
    /// default is ten minutes.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Requests older than this are ignored.
    #[must_use]
    pub fn max_request_age(mut self, age: Duration) -> Self {
        self.max_request_age = age;
        self
    }

    /// Requests this far, or further, in the future are ignored.
    #[must_use]
    pub fn max_future_skew(mut self, skew: Duration) -> Self {
        self.max_future_skew = skew;
        self
    }

    /// The verification methods we advertise, all of them by default.
    #[must_use]
    pub fn methods(mut self, methods: Vec<VerificationMethod>) -> Self {
        self.methods = methods;
        self
    }
}

/// The configuration of a [`DeviceTrustMachine`].
///
/// [`DeviceTrustMachine`]: crate::DeviceTrustMachine
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTrustConfig {
    pub rendezvous: RendezvousSettings,
    pub verification: VerificationSettings,
}
