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

//! The short authentication string strategy of a verification.

use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId};
use tracing::trace;
use vodozemac::{
    sas::{EstablishedSas, Mac, Sas},
    Ed25519PublicKey,
};

use crate::types::{CancelCode, MacContent};

/// The ids of the two devices taking part in a SAS flow.
#[derive(Clone, Debug)]
pub(super) struct SasIds {
    pub own_user_id: OwnedUserId,
    pub own_device_id: OwnedDeviceId,
    pub other_user_id: OwnedUserId,
    pub other_device_id: OwnedDeviceId,
    pub flow_id: OwnedTransactionId,
}

/// The SAS specific state of a verification.
pub(super) struct SasFlow {
    ids: SasIds,
    started_by_us: bool,
    sas: Option<Sas>,
    established: Option<Box<EstablishedSas>>,
}

impl SasFlow {
    /// Start a SAS flow, returns the flow and the public key that needs to be
    /// sent to the other side.
    pub fn start(ids: SasIds) -> (Self, String) {
        let sas = Sas::new();
        let public_key = sas.public_key().to_base64();

        (Self { ids, started_by_us: true, sas: Some(sas), established: None }, public_key)
    }

    /// Accept a SAS flow the other side started.
    ///
    /// Returns the flow and our public key which needs to be sent back.
    pub fn accept(ids: SasIds, their_public_key: &str) -> Result<(Self, String), CancelCode> {
        let sas = Sas::new();
        let public_key = sas.public_key().to_base64();

        let mut flow = Self { ids, started_by_us: false, sas: Some(sas), established: None };
        flow.establish(their_public_key)?;

        Ok((flow, public_key))
    }

    /// Finish the key agreement using the public key of the other side.
    pub fn establish(&mut self, their_public_key: &str) -> Result<(), CancelCode> {
        let sas = self.sas.take().ok_or(CancelCode::UnexpectedMessage)?;
        let established =
            sas.diffie_hellman_with_raw(their_public_key).map_err(|_| CancelCode::InvalidMessage)?;

        self.established = Some(Box::new(established));

        Ok(())
    }

    pub fn started_by_us(&self) -> bool {
        self.started_by_us
    }

    pub fn is_established(&self) -> bool {
        self.established.is_some()
    }

    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        let sas = self.established.as_ref()?;
        Some(sas.bytes(&self.extra_info(sas)).decimals())
    }

    pub fn emoji_indices(&self) -> Option<[u8; 7]> {
        let sas = self.established.as_ref()?;
        Some(sas.bytes(&self.extra_info(sas)).emoji_indices())
    }

    /// Calculate the MAC of our own device key.
    pub fn mac_content(&self, own_key: Ed25519PublicKey) -> Option<MacContent> {
        let sas = self.established.as_ref()?;
        let info = self.mac_info(true);

        Some(MacContent { mac: sas.calculate_mac(&own_key.to_base64(), &info).to_base64() })
    }

    /// Check the MAC the other side sent us against the key we have stored
    /// for its device.
    pub fn verify_mac(
        &self,
        their_key: Ed25519PublicKey,
        content: &MacContent,
    ) -> Result<(), CancelCode> {
        let sas = self.established.as_ref().ok_or(CancelCode::UnexpectedMessage)?;
        let mac = Mac::from_base64(&content.mac).map_err(|_| CancelCode::InvalidMessage)?;

        sas.verify_mac(&their_key.to_base64(), &self.mac_info(false), &mac)
            .map_err(|_| CancelCode::KeyMismatch)
    }

    /// The info used to derive the short authentication string, the side
    /// that started the SAS flow always comes first.
    fn extra_info(&self, sas: &EstablishedSas) -> String {
        let ids = &self.ids;

        let our_info = format!(
            "{}|{}|{}",
            ids.own_user_id,
            ids.own_device_id,
            sas.our_public_key().to_base64()
        );
        let their_info = format!(
            "{}|{}|{}",
            ids.other_user_id,
            ids.other_device_id,
            sas.their_public_key().to_base64()
        );

        let (first_info, second_info) =
            if self.started_by_us { (our_info, their_info) } else { (their_info, our_info) };

        let info = format!("MATRIX_DEVICE_TRUST_SAS|{first_info}|{second_info}|{}", ids.flow_id);
        trace!("Generated a SAS extra info: {info}");

        info
    }

    fn mac_info(&self, sending: bool) -> String {
        let ids = &self.ids;
        let ours = (&ids.own_user_id, &ids.own_device_id);
        let theirs = (&ids.other_user_id, &ids.other_device_id);

        let ((sender_user, sender_device), (receiver_user, receiver_device)) =
            if sending { (ours, theirs) } else { (theirs, ours) };

        format!(
            "MATRIX_DEVICE_TRUST_MAC|{sender_user}|{sender_device}|\
             {receiver_user}|{receiver_device}|{}",
            ids.flow_id
        )
    }
}
