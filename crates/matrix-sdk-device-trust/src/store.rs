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

//! The local trust store, the place where verified devices are recorded.

use std::{
    collections::BTreeMap,
    future,
    sync::{Arc, RwLock as StdRwLock},
};

use futures_core::Stream;
use futures_util::StreamExt;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{info, warn};

use crate::identities::{Device, LocalTrust};

/// A notification that a device became trusted or lost its trust.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustChange {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub trusted: bool,
}

#[derive(Debug)]
struct DeviceEntry {
    device: Device,
    trust: LocalTrust,
}

type DeviceMap = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceEntry>>;

/// In-memory store of the devices we know about and of their local trust
/// state.
///
/// The store is cheap to clone, all clones share the same data.
#[derive(Clone, Debug)]
pub struct TrustStore {
    devices: Arc<StdRwLock<DeviceMap>>,
    trust_changes: broadcast::Sender<TrustChange>,
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustStore {
    pub fn new() -> Self {
        let (trust_changes, _) = broadcast::channel(100);

        Self { devices: Default::default(), trust_changes }
    }

    /// Add a device or update its public identity, the trust state of a known
    /// device is preserved.
    pub fn add_device(&self, device: Device) {
        let mut devices = self.devices.write().unwrap();

        devices
            .entry(device.user_id().to_owned())
            .or_default()
            .entry(device.device_id().to_owned())
            .and_modify(|entry| entry.device = device.clone())
            .or_insert(DeviceEntry { device, trust: LocalTrust::Unset });
    }

    pub fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Device> {
        self.devices.read().unwrap().get(user_id)?.get(device_id).map(|e| e.device.clone())
    }

    pub fn get_user_devices(&self, user_id: &UserId) -> Vec<Device> {
        self.devices
            .read()
            .unwrap()
            .get(user_id)
            .map(|d| d.values().map(|e| e.device.clone()).collect())
            .unwrap_or_default()
    }

    /// Get the local trust state of a device, unknown devices are `Unset`.
    pub fn local_trust(&self, user_id: &UserId, device_id: &DeviceId) -> LocalTrust {
        self.devices
            .read()
            .unwrap()
            .get(user_id)
            .and_then(|d| d.get(device_id))
            .map(|e| e.trust)
            .unwrap_or_default()
    }

    /// Is the given device verified.
    pub fn is_trusted(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.local_trust(user_id, device_id).is_verified()
    }

    /// Set the local trust state of a known device.
    ///
    /// Returns the [`TrustChange`] if the device gained or lost its verified
    /// status, the change is also published on the
    /// [`TrustStore::trust_changes()`] stream. Returns `None` if the device is
    /// unknown or its verified status didn't change.
    pub fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> Option<TrustChange> {
        let change = {
            let mut devices = self.devices.write().unwrap();

            let Some(entry) = devices.get_mut(user_id).and_then(|d| d.get_mut(device_id)) else {
                warn!(?user_id, ?device_id, "Tried to set the trust state of an unknown device");
                return None;
            };

            let was_trusted = entry.trust.is_verified();
            entry.trust = trust;

            (was_trusted != trust.is_verified()).then(|| TrustChange {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                trusted: trust.is_verified(),
            })
        };

        if let Some(change) = &change {
            info!(?user_id, ?device_id, trusted = change.trusted, "The trust of a device changed");
            // Nobody might be listening, that's fine.
            let _ = self.trust_changes.send(change.clone());
        }

        change
    }

    /// Receive notifications every time a device gains or loses its verified
    /// status.
    ///
    /// If the reader of the stream lags too far behind, a warning will be
    /// logged and items will be dropped.
    pub fn trust_changes(&self) -> impl Stream<Item = TrustChange> + use<> {
        BroadcastStream::new(self.trust_changes.subscribe()).filter_map(|result| {
            future::ready(match result {
                Ok(change) => Some(change),
                Err(BroadcastStreamRecvError::Lagged(lag)) => {
                    warn!("The trust change stream missed {lag} updates");
                    None
                }
            })
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use futures_util::{pin_mut, FutureExt, StreamExt};
    use ruma::{device_id, user_id, DeviceId, UserId};
    use similar_asserts::assert_eq;
    use vodozemac::Ed25519SecretKey;

    use super::{TrustChange, TrustStore};
    use crate::identities::{Device, LocalTrust};

    pub(crate) fn device(user_id: &UserId, device_id: &DeviceId) -> Device {
        Device::new(user_id.to_owned(), device_id.to_owned(), Ed25519SecretKey::new().public_key())
    }

    #[test]
    fn unknown_devices_are_untrusted() {
        let store = TrustStore::new();

        assert!(!store.is_trusted(user_id!("@alice:localhost"), device_id!("ALICEDEVICE")));
        assert_eq!(
            store.set_local_trust(
                user_id!("@alice:localhost"),
                device_id!("ALICEDEVICE"),
                LocalTrust::Verified
            ),
            None
        );
    }

    #[test]
    fn readding_a_device_keeps_its_trust() {
        let store = TrustStore::new();
        let device = device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));

        store.add_device(device.clone());
        store.set_local_trust(device.user_id(), device.device_id(), LocalTrust::Verified);
        store.add_device(device.clone().with_display_name("Alice's phone"));

        assert!(store.is_trusted(device.user_id(), device.device_id()));
        assert_eq!(
            store.get_device(device.user_id(), device.device_id()).unwrap().display_name(),
            Some("Alice's phone")
        );
        assert_eq!(store.get_user_devices(device.user_id()).len(), 1);
    }

    #[tokio::test]
    async fn trust_changes_are_published_once() {
        let store = TrustStore::new();
        let device = device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        store.add_device(device.clone());

        let stream = store.trust_changes();
        pin_mut!(stream);

        assert!(store
            .set_local_trust(device.user_id(), device.device_id(), LocalTrust::Verified)
            .is_some());
        // Verifying an already verified device isn't a change.
        assert!(store
            .set_local_trust(device.user_id(), device.device_id(), LocalTrust::Verified)
            .is_none());
        assert!(store
            .set_local_trust(device.user_id(), device.device_id(), LocalTrust::BlackListed)
            .is_some());

        let expected = |trusted| TrustChange {
            user_id: device.user_id().to_owned(),
            device_id: device.device_id().to_owned(),
            trusted,
        };

        assert_eq!(stream.next().await, Some(expected(true)));
        assert_eq!(stream.next().await, Some(expected(false)));
        assert!(stream.next().now_or_never().is_none());
    }
}
