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

use std::sync::Arc;

use ruma::{DeviceId, UserId};
use tracing::{debug, instrument};

use crate::{
    backups::{BackupStorage, KeysBackupResolver},
    config::DeviceTrustConfig,
    error::{EntropyError, RendezvousResult},
    gossiping::{KeyGossipCoordinator, RoomKeySource},
    identities::{Device, LocalTrust},
    rendezvous::{PairingCode, RendezvousChannel, RendezvousTransport},
    store::{TrustChange, TrustStore},
    types::BackupVersionInfo,
    verification::{RendezvousCarrier, VerificationMachine},
};

/// Ties the device trust components of a single device together.
///
/// The machine owns the [`TrustStore`] and makes sure that every change of the
/// trust of a device reaches the [`KeyGossipCoordinator`], no matter if the
/// device was verified interactively or its trust was set manually.
#[derive(Clone, Debug)]
pub struct DeviceTrustMachine {
    own_device: Device,
    store: TrustStore,
    verification_machine: VerificationMachine,
    key_gossip: KeyGossipCoordinator,
    backups: KeysBackupResolver,
    config: DeviceTrustConfig,
}

impl DeviceTrustMachine {
    /// Create a new machine for our own device.
    ///
    /// # Arguments
    ///
    /// * `own_device` - The device this machine runs on.
    ///
    /// * `room_keys` - Where the room keys our other devices ask for come
    ///   from.
    ///
    /// * `backup_storage` - The server side storage of the key backups.
    ///
    /// * `trusted_backup` - The backup we decided to trust the last time we
    ///   ran, if any.
    ///
    /// * `config` - The settings of the rendezvous and verification flows.
    pub fn new(
        own_device: Device,
        room_keys: Arc<dyn RoomKeySource>,
        backup_storage: Arc<dyn BackupStorage>,
        trusted_backup: Option<BackupVersionInfo>,
        config: DeviceTrustConfig,
    ) -> Self {
        let store = TrustStore::new();
        store.add_device(own_device.clone());

        let key_gossip = KeyGossipCoordinator::new(
            own_device.user_id().to_owned(),
            own_device.device_id().to_owned(),
            store.clone(),
            room_keys,
        );
        let verification_machine = VerificationMachine::new(
            own_device.clone(),
            store.clone(),
            key_gossip.clone(),
            config.verification.clone(),
        );
        let backups = KeysBackupResolver::new(backup_storage, trusted_backup);

        Self { own_device, store, verification_machine, key_gossip, backups, config }
    }

    pub fn user_id(&self) -> &UserId {
        self.own_device.user_id()
    }

    pub fn device_id(&self) -> &DeviceId {
        self.own_device.device_id()
    }

    pub fn own_device(&self) -> &Device {
        &self.own_device
    }

    pub fn store(&self) -> &TrustStore {
        &self.store
    }

    pub fn verification_machine(&self) -> &VerificationMachine {
        &self.verification_machine
    }

    pub fn key_gossip(&self) -> &KeyGossipCoordinator {
        &self.key_gossip
    }

    pub fn backups(&self) -> &KeysBackupResolver {
        &self.backups
    }

    pub fn config(&self) -> &DeviceTrustConfig {
        &self.config
    }

    /// Let the machine know about a device, e.g. after a key query.
    pub fn add_device(&self, device: Device) {
        self.store.add_device(device);
    }

    /// Manually set the trust of a device.
    ///
    /// Pending room key requests of the device are granted if it became
    /// verified and cancelled if it lost its verified status.
    #[instrument(skip(self))]
    pub fn set_device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> Option<TrustChange> {
        let change = self.store.set_local_trust(user_id, device_id, trust)?;

        let granted =
            self.key_gossip.on_device_trust_changed(user_id, device_id, change.trusted);
        debug!(granted = granted.len(), "Updated the room key requests of the device");

        Some(change)
    }

    /// Start linking a new device, the [`PairingCode`] of the returned channel
    /// needs to be shown to the new device.
    pub fn link_new_device(
        &self,
        transport: impl RendezvousTransport + 'static,
    ) -> Result<RendezvousChannel, EntropyError> {
        RendezvousChannel::initiate(transport, self.config.rendezvous)
    }

    /// Join the rendezvous of one of our existing devices using the
    /// [`PairingCode`] it showed us.
    pub fn join_rendezvous(
        &self,
        transport: impl RendezvousTransport + 'static,
        code: PairingCode,
    ) -> RendezvousChannel {
        RendezvousChannel::join(transport, code, self.config.rendezvous)
    }

    /// Use a confirmed rendezvous channel to carry verification messages
    /// between this device and another device of our own user.
    ///
    /// Messages that come over the channel from any other user are dropped.
    pub fn rendezvous_carrier(
        &self,
        channel: RendezvousChannel,
    ) -> RendezvousResult<RendezvousCarrier> {
        RendezvousCarrier::new(channel, self.user_id().to_owned(), self.user_id().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use ruma::{device_id, room_id, user_id, DeviceId, UserId};
    use similar_asserts::assert_eq;

    use super::DeviceTrustMachine;
    use crate::{
        backups::BackupStorage,
        error::{BackupFetchError, RendezvousError},
        gossiping::{KeyShareState, MemoryRoomKeySource},
        identities::{Device, LocalTrust},
        rendezvous::MemoryTransport,
        store::tests::device,
        types::{ExportedRoomKey, KeysBackupLastVersionResult},
    };

    #[derive(Debug)]
    struct NoBackups;

    #[async_trait::async_trait]
    impl BackupStorage for NoBackups {
        async fn fetch_latest_version(
            &self,
        ) -> Result<KeysBackupLastVersionResult, BackupFetchError> {
            Ok(KeysBackupLastVersionResult::NoBackupExists)
        }
    }

    fn alice_id() -> &'static UserId {
        user_id!("@alice:localhost")
    }

    fn alice_device_id() -> &'static DeviceId {
        device_id!("ALICEDEVICE")
    }

    fn trust_machine(
        own_device: Device,
        room_keys: MemoryRoomKeySource,
    ) -> DeviceTrustMachine {
        DeviceTrustMachine::new(
            own_device,
            Arc::new(room_keys),
            Arc::new(NoBackups),
            None,
            Default::default(),
        )
    }

    #[test]
    fn manual_trust_reaches_the_key_gossip() {
        let room_keys = MemoryRoomKeySource::new();
        room_keys.add_room_key(ExportedRoomKey {
            room_id: room_id!("!test:localhost").to_owned(),
            session_id: "session".to_owned(),
            session_key: "key".to_owned(),
        });

        let machine = trust_machine(device(alice_id(), alice_device_id()), room_keys);
        let other = device(alice_id(), device_id!("OTHERDEVICE"));
        machine.add_device(other.clone());

        let request_id = machine.key_gossip().request_keys(
            room_id!("!test:localhost"),
            "session",
            (other.user_id(), other.device_id()),
        );
        assert_eq!(
            machine.key_gossip().get_request(&request_id).unwrap().state,
            KeyShareState::Pending
        );

        let change = machine
            .set_device_trust(other.user_id(), other.device_id(), LocalTrust::Verified)
            .unwrap();
        assert!(change.trusted);
        assert_eq!(
            machine.key_gossip().get_request(&request_id).unwrap().state,
            KeyShareState::Granted
        );
        assert_eq!(machine.key_gossip().outgoing_forwards().len(), 1);

        // Setting the same trust again changes nothing.
        assert!(machine
            .set_device_trust(other.user_id(), other.device_id(), LocalTrust::Verified)
            .is_none());
        assert_eq!(machine.key_gossip().outgoing_forwards().len(), 1);
    }

    #[test]
    fn unconfirmed_channels_cant_carry_verifications() {
        let machine =
            trust_machine(device(alice_id(), alice_device_id()), MemoryRoomKeySource::new());
        let (transport, _) = MemoryTransport::pair();

        let channel = machine.link_new_device(transport).unwrap();
        assert_matches!(machine.rendezvous_carrier(channel), Err(RendezvousError::InvalidState(_)));
    }
}
