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

use ruma::{OwnedDeviceId, OwnedUserId};
use thiserror::Error;
use vodozemac::{ecies::MessageDecodeError, KeyError};

use crate::types::{BackupVersionInfo, CancelCode};

pub type RendezvousResult<T> = Result<T, RendezvousError>;
pub type VerificationResult<T> = Result<T, VerificationError>;

/// The coarse classification every error of this crate falls into.
///
/// Callers can use the kind to decide on a retry policy without matching on
/// every single variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connectivity problems or timeouts, the caller may retry.
    Transport,
    /// The other side sent something malformed or out of sequence.
    Protocol,
    /// The flow was explicitly rejected, by us or by the other side.
    UserDeclined,
    /// Two backup trust anchors disagree and need explicit resolution.
    TrustConflict,
    /// The operating system couldn't give us any randomness.
    Entropy,
}

/// The operating system's source of randomness failed.
///
/// This is the only fatal condition of the pairing process, we never fall back
/// to a weaker random number generator.
#[derive(Debug, Error)]
#[error("the operating system's entropy source is unavailable: {0}")]
pub struct EntropyError(#[from] rand::Error);

/// Errors a [`RendezvousTransport`] can report.
///
/// [`RendezvousTransport`]: crate::rendezvous::RendezvousTransport
#[derive(Debug, Error)]
pub enum TransportError {
    /// An IO error happened in the underlying byte pipe.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The transport has not been opened or was already released.
    #[error("the transport is not connected")]
    NotConnected,

    /// The transport can only be opened once.
    #[error("the transport has already been opened")]
    AlreadyOpen,

    /// An operation didn't complete in time.
    #[error("the operation on the transport timed out")]
    Timeout,

    /// The other side went away without saying goodbye.
    #[error("the transport was closed by the other side")]
    Closed,
}

/// The other side of a rendezvous, or of a verification, didn't follow the
/// protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A sealed message wasn't valid UTF-8.
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    /// The secure channel couldn't be established or a message couldn't be
    /// decrypted.
    #[error(transparent)]
    Ecies(#[from] vodozemac::ecies::Error),

    /// A message of the secure channel couldn't be decoded.
    #[error(transparent)]
    MessageDecode(#[from] MessageDecodeError),

    /// The public key of the pairing code is invalid.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// A payload of the channel wasn't valid base64.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    /// A frame of the channel wasn't valid JSON or had an unknown shape.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A message arrived that isn't valid in the current state.
    #[error("expected {expected}, but received {received}")]
    UnexpectedMessage { expected: &'static str, received: String },

    /// The other side closed the transport in the middle of the handshake.
    #[error("the other side closed the channel before the handshake completed")]
    PeerClosed,

    /// The confirmation digits couldn't be derived.
    #[error("could not derive the confirmation digits")]
    KeyDerivation,
}

impl ProtocolError {
    /// The cancel code that is sent to the other side when this error ends a
    /// session.
    pub fn cancel_code(&self) -> CancelCode {
        match self {
            ProtocolError::UnexpectedMessage { .. } | ProtocolError::PeerClosed => {
                CancelCode::UnexpectedMessage
            }
            ProtocolError::Utf8(_)
            | ProtocolError::Ecies(_)
            | ProtocolError::MessageDecode(_)
            | ProtocolError::Key(_)
            | ProtocolError::Base64(_)
            | ProtocolError::Json(_)
            | ProtocolError::KeyDerivation => CancelCode::InvalidMessage,
        }
    }
}

/// A pairing code couldn't be parsed.
#[derive(Debug, Error)]
pub enum PairingCodeError {
    /// The code doesn't consist of a public key and a secret.
    #[error("the pairing code should contain a public key and a secret separated by a dot")]
    Malformed,

    /// One of the parts isn't valid base64 or has the wrong length.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    /// The public key isn't a valid Curve25519 key.
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Error type for the [`RendezvousChannel`].
///
/// [`RendezvousChannel`]: crate::rendezvous::RendezvousChannel
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// The transport failed or timed out.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The other side sent something we didn't expect.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The other side cancelled the rendezvous.
    #[error("the other device cancelled the rendezvous: {0}")]
    Declined(CancelCode),

    /// The rendezvous was aborted through a [`RendezvousAbortHandle`].
    ///
    /// [`RendezvousAbortHandle`]: crate::rendezvous::RendezvousAbortHandle
    #[error("the rendezvous was aborted")]
    Aborted,

    /// The operation isn't allowed in the current state of the channel.
    #[error("the operation isn't valid while the channel is {0}")]
    InvalidState(&'static str),

    /// We couldn't generate the pairing secret.
    #[error(transparent)]
    Entropy(#[from] EntropyError),
}

impl RendezvousError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RendezvousError::Transport(_) | RendezvousError::InvalidState(_) => {
                ErrorKind::Transport
            }
            RendezvousError::Protocol(_) => ErrorKind::Protocol,
            RendezvousError::Declined(_) | RendezvousError::Aborted => ErrorKind::UserDeclined,
            RendezvousError::Entropy(_) => ErrorKind::Entropy,
        }
    }
}

/// Errors a local action on a verification can produce.
///
/// Protocol failures of the other side never surface as errors, they move the
/// verification into the cancelled state instead.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// There's already a live verification with the given device.
    #[error("a verification with {user_id} {device_id:?} is already in progress")]
    AlreadyInProgress { user_id: OwnedUserId, device_id: Option<OwnedDeviceId> },

    /// We don't know the device, so we can't verify its keys.
    #[error("the device {device_id} of {user_id} is unknown")]
    UnknownDevice { user_id: OwnedUserId, device_id: OwnedDeviceId },

    /// The action isn't valid in the current state of the verification.
    #[error("the verification is in the wrong state to {0}")]
    InvalidState(&'static str),

    /// The action made us cancel the verification.
    #[error("the verification was cancelled: {0}")]
    Cancelled(CancelCode),

    /// We couldn't generate the QR code secret.
    #[error(transparent)]
    Entropy(#[from] EntropyError),
}

impl VerificationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VerificationError::AlreadyInProgress { .. }
            | VerificationError::UnknownDevice { .. }
            | VerificationError::InvalidState(_) => ErrorKind::Protocol,
            VerificationError::Cancelled(code) => code.error_kind(),
            VerificationError::Entropy(_) => ErrorKind::Entropy,
        }
    }
}

/// The backup storage couldn't tell us what the latest backup is.
///
/// This is never the same as the server telling us that there is no backup.
#[derive(Debug, Error)]
pub enum BackupFetchError {
    /// The request didn't reach the server or the server failed.
    #[error("the latest backup version couldn't be fetched: {0}")]
    Network(String),

    /// The server replied with something we don't understand.
    #[error("the latest backup version couldn't be parsed: {0}")]
    Parse(String),
}

/// Errors of the [`KeysBackupResolver`].
///
/// [`KeysBackupResolver`]: crate::backups::KeysBackupResolver
#[derive(Debug, Error)]
pub enum BackupError {
    /// Fetching the latest backup version failed.
    #[error(transparent)]
    Fetch(#[from] BackupFetchError),

    /// Adopting the remote backup would overwrite a different trusted backup.
    #[error(
        "the backup {} is trusted locally, refusing to replace it with {}",
        local.version,
        remote.version
    )]
    TrustConflict { local: Box<BackupVersionInfo>, remote: Box<BackupVersionInfo> },

    /// The recovery key the user entered doesn't belong to the remote backup.
    #[error("the recovery key doesn't match the backup {version}")]
    RecoveryKeyMismatch { version: String },
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Fetch(_) => ErrorKind::Transport,
            BackupError::TrustConflict { .. } | BackupError::RecoveryKeyMismatch { .. } => {
                ErrorKind::TrustConflict
            }
        }
    }
}
