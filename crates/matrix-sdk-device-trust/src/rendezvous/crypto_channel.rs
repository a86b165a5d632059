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

//! The cryptographic part of a [`RendezvousChannel`].
//!
//! This wraps the ECIES based secure channel provided by vodozemac and derives
//! the confirmation digits the users compare on both devices.
//!
//! [`RendezvousChannel`]: super::RendezvousChannel

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use vodozemac::{
    ecies::{CheckCode, Ecies, EstablishedEcies, InitialMessage, Message},
    Curve25519PublicKey,
};

use crate::{error::ProtocolError, secret::PairingSecret};

const DIGITS_INFO: &str = "MATRIX_DEVICE_TRUST_RENDEZVOUS_DIGITS";

/// The ephemeral key pair of a side whose secure channel isn't established
/// yet.
pub(super) struct CryptoChannel(Ecies);

impl CryptoChannel {
    pub(super) fn new() -> Self {
        Self(Ecies::new())
    }

    pub(super) fn public_key(&self) -> Curve25519PublicKey {
        self.0.public_key()
    }

    /// Open the initial message of the responder, returns the established
    /// channel and the plaintext of the message.
    pub(super) fn establish_inbound_channel(
        self,
        message: &[u8],
    ) -> Result<(EstablishedCryptoChannel, Vec<u8>), ProtocolError> {
        let message = InitialMessage::decode(std::str::from_utf8(message)?)?;
        let result = self.0.establish_inbound_channel(&message)?;

        Ok((EstablishedCryptoChannel(result.ecies), result.message))
    }

    /// Seal `plaintext` into the initial message for the owner of
    /// `their_public_key`.
    pub(super) fn establish_outbound_channel(
        self,
        their_public_key: Curve25519PublicKey,
        plaintext: &[u8],
    ) -> Result<(EstablishedCryptoChannel, Vec<u8>), ProtocolError> {
        let result = self.0.establish_outbound_channel(their_public_key, plaintext)?;
        let initial_message = result.message.encode().into_bytes();

        Ok((EstablishedCryptoChannel(result.ecies), initial_message))
    }
}

/// Both sides agreed on a shared secret, every frame from now on is sealed.
pub(super) struct EstablishedCryptoChannel(EstablishedEcies);

impl EstablishedCryptoChannel {
    pub(super) fn check_code(&self) -> &CheckCode {
        self.0.check_code()
    }

    pub(super) fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        self.0.encrypt(plaintext).encode().into_bytes()
    }

    pub(super) fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let message = Message::decode(std::str::from_utf8(sealed)?)?;
        Ok(self.0.decrypt(&message)?)
    }
}

/// The short, human comparable, string both devices display once the
/// rendezvous channel is established.
///
/// The digits are three numbers between 1000 and 9191, displayed as
/// `1234-5678-9012`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmationDigits([u16; 3]);

impl ConfirmationDigits {
    /// Derive the digits from the pairing secret, the check code of the
    /// established channel and the public key of the initiating device.
    ///
    /// The check code already depends on both ephemeral keys, a device that
    /// talks to a different peer than it thinks ends up with different digits.
    pub(super) fn derive(
        secret: &PairingSecret,
        check_code: &CheckCode,
        initiator_key: Curve25519PublicKey,
    ) -> Result<Self, ProtocolError> {
        let salt = check_code.as_bytes().as_slice();
        let hkdf = Hkdf::<Sha256>::new(Some(salt), secret.as_bytes());
        let info = format!("{DIGITS_INFO}|{}", initiator_key.to_base64());

        let mut bytes = [0u8; 5];
        hkdf.expand(info.as_bytes(), &mut bytes).map_err(|_| ProtocolError::KeyDerivation)?;

        Ok(Self::from_bytes(bytes))
    }

    /// Split 39 bits into three 13 bit numbers, the same way the decimal SAS
    /// is calculated.
    fn from_bytes(bytes: [u8; 5]) -> Self {
        let [b0, b1, b2, b3, b4] = bytes.map(u16::from);

        let first = (b0 << 5) | (b1 >> 3);
        let second = ((b1 & 0x7) << 10) | (b2 << 2) | (b3 >> 6);
        let third = ((b3 & 0x3f) << 7) | (b4 >> 1);

        Self([first + 1000, second + 1000, third + 1000])
    }

    pub fn as_array(&self) -> [u16; 3] {
        self.0
    }
}

impl fmt::Display for ConfirmationDigits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [first, second, third] = self.0;
        write!(f, "{first:04}-{second:04}-{third:04}")
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use similar_asserts::assert_eq;

    use super::{ConfirmationDigits, CryptoChannel};
    use crate::secret::PairingSecret;

    #[test]
    fn both_sides_derive_the_same_digits() {
        let initiator = CryptoChannel::new();
        let initiator_key = initiator.public_key();
        let secret = PairingSecret::from_bytes(*b"87654321");

        let (mut responder, initial) = CryptoChannel::new()
            .establish_outbound_channel(initiator_key, b"hello")
            .unwrap();
        let (mut initiator, plaintext) = initiator.establish_inbound_channel(&initial).unwrap();

        assert_eq!(plaintext, b"hello");

        let sealed = initiator.seal(b"reply");
        assert_eq!(responder.open(&sealed).unwrap(), b"reply");

        let initiator_digits =
            ConfirmationDigits::derive(&secret, initiator.check_code(), initiator_key).unwrap();
        let responder_digits =
            ConfirmationDigits::derive(&secret, responder.check_code(), initiator_key).unwrap();

        assert_eq!(initiator_digits, responder_digits);

        let other_secret = PairingSecret::from_bytes(*b"12345678");
        let other_digits =
            ConfirmationDigits::derive(&other_secret, responder.check_code(), initiator_key)
                .unwrap();
        assert_ne!(initiator_digits, other_digits);
    }

    #[test]
    fn digits_formatting() {
        assert_eq!(ConfirmationDigits([1000, 4567, 9191]).to_string(), "1000-4567-9191");
        assert_eq!(ConfirmationDigits::from_bytes([0; 5]).as_array(), [1000, 1000, 1000]);
        assert_eq!(ConfirmationDigits::from_bytes([0xff; 5]).as_array(), [9191, 9191, 9191]);
    }

    #[test]
    fn tampered_messages_dont_open() {
        let initiator = CryptoChannel::new();
        let (mut responder, _) = CryptoChannel::new()
            .establish_outbound_channel(initiator.public_key(), b"hello")
            .unwrap();

        responder.open(b"not a sealed message").expect_err("Garbage should not decrypt");
    }

    proptest! {
        #[test]
        fn digits_stay_in_range(bytes in any::<[u8; 5]>()) {
            for digit in ConfirmationDigits::from_bytes(bytes).as_array() {
                prop_assert!((1000..=9191).contains(&digit));
            }
        }
    }
}
