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

//! Generation of the random secret that seeds a pairing attempt.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, DecodeError, Engine};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::EntropyError;

/// The length of a [`PairingSecret`] in bytes.
pub const PAIRING_SECRET_LENGTH: usize = 8;

/// A random secret that is created once per pairing attempt.
///
/// The secret is used to derive the confirmation digits the user compares on
/// both devices. It's never persisted and its bytes are zeroized when it's
/// dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PairingSecret([u8; PAIRING_SECRET_LENGTH]);

impl PairingSecret {
    /// Create a secret from raw bytes, used when the secret was received over
    /// an out-of-band channel.
    pub fn from_bytes(bytes: [u8; PAIRING_SECRET_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PAIRING_SECRET_LENGTH] {
        &self.0
    }

    /// Encode the secret as URL-safe, unpadded base64 so it can be embedded
    /// in a URL or a QR code.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Decode a secret that was encoded with [`PairingSecret::to_base64()`].
    pub fn from_base64(input: &str) -> Result<Self, DecodeError> {
        let mut decoded = URL_SAFE_NO_PAD.decode(input)?;

        let secret = match <[u8; PAIRING_SECRET_LENGTH]>::try_from(decoded.as_slice()) {
            Ok(bytes) => Ok(Self(bytes)),
            Err(_) => Err(DecodeError::InvalidLength(decoded.len())),
        };

        decoded.zeroize();

        secret
    }
}

impl PartialEq for PairingSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for PairingSecret {}

impl fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingSecret").finish_non_exhaustive()
    }
}

/// Produces the random [`PairingSecret`] of a pairing attempt.
#[derive(Clone, Copy, Debug, Default)]
pub struct SharedSecretGenerator;

impl SharedSecretGenerator {
    /// Generate a new secret using the operating system's random number
    /// generator.
    ///
    /// There's no fallback if the operating system can't provide randomness,
    /// the pairing attempt needs to be aborted in that case.
    pub fn generate() -> Result<PairingSecret, EntropyError> {
        Self::generate_with(&mut OsRng)
    }

    /// Generate a new secret using the given cryptographically secure random
    /// number generator.
    pub fn generate_with<R: RngCore + CryptoRng>(
        rng: &mut R,
    ) -> Result<PairingSecret, EntropyError> {
        let mut bytes = [0u8; PAIRING_SECRET_LENGTH];
        rng.try_fill_bytes(&mut bytes)?;

        let secret = PairingSecret(bytes);
        bytes.zeroize();

        Ok(secret)
    }
}
