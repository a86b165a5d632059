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

//! The shared vocabulary describing why and when a verification flow or a
//! rendezvous session stops.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// The reason a verification or a rendezvous ended early.
///
/// The code is attached to the terminal state and it is also sent to the other
/// side, so both sides agree on why the flow stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelCode {
    /// The user cancelled the flow.
    #[serde(rename = "m.user")]
    User,

    /// The flow didn't complete in time.
    #[serde(rename = "m.timeout")]
    Timeout,

    /// The device doesn't know about the referenced flow.
    #[serde(rename = "m.unknown_transaction")]
    UnknownTransaction,

    /// The device doesn't support the requested method.
    #[serde(rename = "m.unknown_method")]
    UnknownMethod,

    /// The device received a message it didn't expect at this point.
    #[serde(rename = "m.unexpected_message")]
    UnexpectedMessage,

    /// The key that was verified doesn't match the expected one.
    #[serde(rename = "m.key_mismatch")]
    KeyMismatch,

    /// The user that was verified doesn't match the expected one.
    #[serde(rename = "m.user_mismatch")]
    UserMismatch,

    /// A received message was malformed.
    #[serde(rename = "m.invalid_message")]
    InvalidMessage,

    /// Another device of ours accepted the request.
    #[serde(rename = "m.accepted")]
    Accepted,

    /// The user said the short authentication strings didn't match.
    #[serde(rename = "m.mismatched_sas")]
    MismatchedSas,

    /// A hash commitment didn't match.
    #[serde(rename = "m.mismatched_commitment")]
    MismatchedCommitment,

    /// Both sides started a flow with each other at the same time and this one
    /// lost the tie-break.
    #[serde(rename = "org.matrix.device_trust.glare")]
    Glare,
}

impl CancelCode {
    /// The wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::Timeout => "m.timeout",
            CancelCode::UnknownTransaction => "m.unknown_transaction",
            CancelCode::UnknownMethod => "m.unknown_method",
            CancelCode::UnexpectedMessage => "m.unexpected_message",
            CancelCode::KeyMismatch => "m.key_mismatch",
            CancelCode::UserMismatch => "m.user_mismatch",
            CancelCode::InvalidMessage => "m.invalid_message",
            CancelCode::Accepted => "m.accepted",
            CancelCode::MismatchedSas => "m.mismatched_sas",
            CancelCode::MismatchedCommitment => "m.mismatched_commitment",
            CancelCode::Glare => "org.matrix.device_trust.glare",
        }
    }

    /// A human readable explanation of the code.
    pub fn reason(&self) -> &'static str {
        match self {
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::Timeout => "The verification process timed out.",
            CancelCode::UnknownTransaction => {
                "The device does not know about the given transaction ID."
            }
            CancelCode::UnknownMethod => {
                "The device does not know how to handle the requested method."
            }
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
            CancelCode::KeyMismatch => "The expected key did not match the verified one",
            CancelCode::UserMismatch => "The expected user did not match the verified user",
            CancelCode::InvalidMessage => "The received message was invalid.",
            CancelCode::Accepted => "The request was accepted by a different device.",
            CancelCode::MismatchedSas => "The short authentication strings did not match.",
            CancelCode::MismatchedCommitment => "The hash commitment did not match.",
            CancelCode::Glare => {
                "Both devices started a verification at the same time, the other one was kept."
            }
        }
    }

    /// Which kind of error a flow cancelled with this code maps to.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            CancelCode::User | CancelCode::Accepted | CancelCode::Glare => ErrorKind::UserDeclined,
            CancelCode::Timeout => ErrorKind::Transport,
            CancelCode::UnknownTransaction
            | CancelCode::UnknownMethod
            | CancelCode::UnexpectedMessage
            | CancelCode::KeyMismatch
            | CancelCode::UserMismatch
            | CancelCode::InvalidMessage
            | CancelCode::MismatchedSas
            | CancelCode::MismatchedCommitment => ErrorKind::Protocol,
        }
    }
}

impl fmt::Display for CancelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information about the cancellation of a verification or a rendezvous.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    cancelled_by_us: bool,
    cancel_code: CancelCode,
}

impl CancelInfo {
    pub(crate) fn new(cancelled_by_us: bool, cancel_code: CancelCode) -> Self {
        Self { cancelled_by_us, cancel_code }
    }

    /// Get the human readable reason of the cancellation.
    pub fn reason(&self) -> &'static str {
        self.cancel_code.reason()
    }

    /// Get the `CancelCode` that cancelled this flow.
    pub fn cancel_code(&self) -> CancelCode {
        self.cancel_code
    }

    /// Was the flow cancelled by us?
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }
}

/// The state of a verification transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationTxState {
    /// The request was sent or received but the other side didn't answer yet.
    Requested,
    /// Both sides agreed to verify and picked the methods they support.
    Ready,
    /// A verification method was started and accepted by both sides.
    Accepted,
    /// Both devices verified each other.
    Done,
    /// The flow was cancelled.
    Cancelled(CancelInfo),
}

impl VerificationTxState {
    /// Is the state final, no more messages can change it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VerificationTxState::Done | VerificationTxState::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::{CancelCode, CancelInfo, VerificationTxState};

    #[test]
    fn cancel_code_serializes_to_its_wire_string() {
        for code in [CancelCode::User, CancelCode::Glare, CancelCode::KeyMismatch] {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(code.as_str()));
        }

        let code: CancelCode =
            serde_json::from_value(json!("org.matrix.device_trust.glare")).unwrap();
        assert_eq!(code, CancelCode::Glare);
    }

    #[test]
    fn unknown_cancel_codes_are_rejected() {
        serde_json::from_value::<CancelCode>(json!("m.something_else"))
            .expect_err("Unknown cancel codes should not deserialize");
    }

    #[test]
    fn terminal_states() {
        assert!(!VerificationTxState::Ready.is_terminal());
        assert!(VerificationTxState::Done.is_terminal());
        assert!(VerificationTxState::Cancelled(CancelInfo::new(false, CancelCode::Timeout))
            .is_terminal());
    }
}
