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

//! The QR code strategy of a verification.
//!
//! The device that shows the QR code embeds its own device key, the key it
//! believes the other device has and a fresh shared secret. The scanning
//! device checks the keys and proves that it scanned the code by sending the
//! secret back in a reciprocate start message.

use std::fmt;

use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{
    error::EntropyError, identities::Device, secret::SharedSecretGenerator, types::CancelCode,
};

/// The data a QR code shown during a verification contains.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrVerificationData {
    /// The flow the QR code belongs to.
    pub flow_id: OwnedTransactionId,
    /// The owner of the device showing the QR code.
    pub user_id: OwnedUserId,
    /// The device showing the QR code.
    pub device_id: OwnedDeviceId,
    /// The ed25519 key of the device showing the QR code, unpadded base64.
    pub device_key: String,
    /// The ed25519 key the showing device believes the scanning device has.
    pub other_device_key: String,
    /// The shared secret the scanning device needs to echo back.
    pub secret: String,
}

impl fmt::Debug for QrVerificationData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QrVerificationData")
            .field("flow_id", &self.flow_id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("device_key", &self.device_key)
            .field("other_device_key", &self.other_device_key)
            .finish_non_exhaustive()
    }
}

impl QrVerificationData {
    /// Encode the data into the bytes that should be rendered as a QR code.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode the bytes of a scanned QR code.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Generate the data for a QR code we are going to show to `other_device`.
pub(super) fn generate(
    flow_id: OwnedTransactionId,
    own_device: &Device,
    other_device: &Device,
) -> Result<QrVerificationData, EntropyError> {
    let secret = SharedSecretGenerator::generate()?;

    Ok(QrVerificationData {
        flow_id,
        user_id: own_device.user_id().to_owned(),
        device_id: own_device.device_id().to_owned(),
        device_key: own_device.ed25519_key().to_base64(),
        other_device_key: other_device.ed25519_key().to_base64(),
        secret: secret.to_base64(),
    })
}

/// Check a QR code we scanned from `other_device`.
pub(super) fn check_scanned(
    data: &QrVerificationData,
    flow_id: &OwnedTransactionId,
    own_device: &Device,
    other_device: &Device,
) -> Result<(), CancelCode> {
    if &data.flow_id != flow_id {
        Err(CancelCode::UnknownTransaction)
    } else if data.user_id.as_str() != other_device.user_id().as_str()
        || data.device_id.as_str() != other_device.device_id().as_str()
    {
        Err(CancelCode::UserMismatch)
    } else if data.device_key != other_device.ed25519_key().to_base64()
        || data.other_device_key != own_device.ed25519_key().to_base64()
    {
        Err(CancelCode::KeyMismatch)
    } else {
        Ok(())
    }
}

/// Check the secret the scanning side echoed back.
pub(super) fn check_reciprocation(
    data: &QrVerificationData,
    secret: &str,
) -> Result<(), CancelCode> {
    if bool::from(data.secret.as_bytes().ct_eq(secret.as_bytes())) {
        Ok(())
    } else {
        Err(CancelCode::KeyMismatch)
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, TransactionId};
    use similar_asserts::assert_eq;

    use super::{check_reciprocation, check_scanned, generate, QrVerificationData};
    use crate::{store::tests::device, types::CancelCode};

    #[test]
    fn scanned_codes_are_checked() {
        let alice = device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = device(user_id!("@alice:localhost"), device_id!("BOBDEVICE"));
        let flow_id = TransactionId::new();

        let data = generate(flow_id.clone(), &alice, &bob).unwrap();
        let data = QrVerificationData::from_bytes(&data.to_bytes().unwrap()).unwrap();

        check_scanned(&data, &flow_id, &bob, &alice).unwrap();
        check_reciprocation(&data, &data.secret).unwrap();

        let impostor = device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        assert_eq!(check_scanned(&data, &flow_id, &bob, &impostor), Err(CancelCode::KeyMismatch));
        assert_eq!(
            check_scanned(&data, &TransactionId::new(), &bob, &alice),
            Err(CancelCode::UnknownTransaction)
        );
        assert_eq!(check_reciprocation(&data, "AAAAAAAAAAA"), Err(CancelCode::KeyMismatch));
    }

    #[test]
    fn reciprocation_needs_the_exact_secret() {
        let alice = device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = device(user_id!("@alice:localhost"), device_id!("BOBDEVICE"));

        let data = generate(TransactionId::new(), &alice, &bob).unwrap();
        let secret = data.secret.clone();

        let mut flipped = secret.clone().into_bytes();
        let last = flipped.len() - 1;
        flipped[last] = if flipped[last] == b'A' { b'B' } else { b'A' };
        let flipped = String::from_utf8(flipped).unwrap();

        assert_eq!(check_reciprocation(&data, &secret), Ok(()));
        assert_eq!(check_reciprocation(&data, &flipped), Err(CancelCode::KeyMismatch));
        assert_eq!(check_reciprocation(&data, &secret[..last]), Err(CancelCode::KeyMismatch));
        assert_eq!(
            check_reciprocation(&data, &format!("{secret}A")),
            Err(CancelCode::KeyMismatch)
        );
        assert_eq!(check_reciprocation(&data, ""), Err(CancelCode::KeyMismatch));
    }

    #[test]
    fn the_secret_isnt_logged() {
        let alice = device(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = device(user_id!("@alice:localhost"), device_id!("BOBDEVICE"));

        let data = generate(TransactionId::new(), &alice, &bob).unwrap();

        assert!(!format!("{data:?}").contains(&data.secret));
    }
}
