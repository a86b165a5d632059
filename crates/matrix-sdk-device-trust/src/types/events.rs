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

//! Contents of the messages two devices exchange while they verify each other
//! and while they gossip room keys.

use std::fmt;

use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedRoomId, OwnedTransactionId};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::CancelCode;

/// A verification method one of the devices supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationMethod {
    /// Interactive verification comparing short authentication strings.
    #[serde(rename = "m.sas.v1")]
    SasV1,
    /// The device can show a QR code.
    #[serde(rename = "m.qr_code.show.v1")]
    QrCodeShowV1,
    /// The device can scan a QR code.
    #[serde(rename = "m.qr_code.scan.v1")]
    QrCodeScanV1,
    /// The device can reciprocate a scanned QR code.
    #[serde(rename = "m.reciprocate.v1")]
    ReciprocateV1,
    /// A method we don't know about.
    #[serde(other)]
    Unknown,
}

/// The method specific part of a start message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StartMethod {
    /// Start a SAS verification, the public key is the ephemeral key of the
    /// starting side.
    #[serde(rename = "m.sas.v1")]
    SasV1 { public_key: String },
    /// The scanning side tells the showing side that it scanned the code and
    /// proves it by echoing the shared secret.
    #[serde(rename = "m.reciprocate.v1")]
    ReciprocateV1 { secret: String },
    /// A method we don't know about.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContent {
    pub from_device: OwnedDeviceId,
    pub methods: Vec<VerificationMethod>,
    pub timestamp: MilliSecondsSinceUnixEpoch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyContent {
    pub from_device: OwnedDeviceId,
    pub methods: Vec<VerificationMethod>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartContent {
    pub from_device: OwnedDeviceId,
    pub method: StartMethod,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptContent {
    /// The ephemeral SAS key of the accepting side.
    pub public_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacContent {
    /// The MAC of the sender's ed25519 device key, unpadded base64.
    pub mac: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelContent {
    pub code: CancelCode,
    pub reason: String,
}

impl CancelContent {
    pub fn new(code: CancelCode) -> Self {
        Self { code, reason: code.reason().to_owned() }
    }
}

/// Any of the messages of a verification flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VerificationContent {
    #[serde(rename = "m.key.verification.request")]
    Request(RequestContent),
    #[serde(rename = "m.key.verification.ready")]
    Ready(ReadyContent),
    #[serde(rename = "m.key.verification.start")]
    Start(StartContent),
    #[serde(rename = "m.key.verification.accept")]
    Accept(AcceptContent),
    #[serde(rename = "m.key.verification.mac")]
    Mac(MacContent),
    #[serde(rename = "m.key.verification.done")]
    Done,
    #[serde(rename = "m.key.verification.cancel")]
    Cancel(CancelContent),
}

impl VerificationContent {
    /// The event type of the content, used for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            VerificationContent::Request(_) => "m.key.verification.request",
            VerificationContent::Ready(_) => "m.key.verification.ready",
            VerificationContent::Start(_) => "m.key.verification.start",
            VerificationContent::Accept(_) => "m.key.verification.accept",
            VerificationContent::Mac(_) => "m.key.verification.mac",
            VerificationContent::Done => "m.key.verification.done",
            VerificationContent::Cancel(_) => "m.key.verification.cancel",
        }
    }
}

/// A verification content tagged with the flow it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationMessage {
    pub transaction_id: OwnedTransactionId,
    pub content: VerificationContent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRequestAction {
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "request_cancellation")]
    RequestCancellation,
}

/// The room and session a key request is about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    pub room_id: OwnedRoomId,
    pub session_id: String,
}

/// A `m.room_key_request` content, either requesting a room key or
/// withdrawing an earlier request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    pub action: KeyRequestAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
    pub requesting_device_id: OwnedDeviceId,
    pub request_id: OwnedTransactionId,
}

impl RoomKeyRequestContent {
    pub fn new_request(
        info: RequestedKeyInfo,
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self {
            action: KeyRequestAction::Request,
            body: Some(info),
            requesting_device_id,
            request_id,
        }
    }

    pub fn new_cancellation(
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self {
            action: KeyRequestAction::RequestCancellation,
            body: None,
            requesting_device_id,
            request_id,
        }
    }
}

/// An exported room key, ready to be forwarded to another device.
///
/// The session key is opaque to this crate, the key material is zeroized
/// when the value is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    pub room_id: OwnedRoomId,
    pub session_id: String,
    pub session_key: String,
}

impl Drop for ExportedRoomKey {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}

impl fmt::Debug for ExportedRoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedRoomKey")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, room_id, TransactionId};
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn verification_message_shape() {
        let message = VerificationMessage {
            transaction_id: "flow".into(),
            content: VerificationContent::Start(StartContent {
                from_device: device_id!("ALICEDEVICE").to_owned(),
                method: StartMethod::SasV1 { public_key: "key".to_owned() },
            }),
        };

        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(
            value,
            json!({
                "transaction_id": "flow",
                "content": {
                    "type": "m.key.verification.start",
                    "from_device": "ALICEDEVICE",
                    "method": {
                        "type": "m.sas.v1",
                        "public_key": "key",
                    },
                },
            })
        );

        let done: VerificationMessage = serde_json::from_value(json!({
            "transaction_id": "flow",
            "content": { "type": "m.key.verification.done" },
        }))
        .unwrap();
        assert_eq!(done.content, VerificationContent::Done);
    }

    #[test]
    fn unknown_methods_deserialize() {
        let content: StartContent = serde_json::from_value(json!({
            "from_device": "BOBDEVICE",
            "method": { "type": "m.something.v9", "field": 1 },
        }))
        .unwrap();
        assert_eq!(content.method, StartMethod::Unknown);

        let methods: Vec<VerificationMethod> =
            serde_json::from_value(json!(["m.sas.v1", "m.fancy.v2"])).unwrap();
        assert_eq!(methods, [VerificationMethod::SasV1, VerificationMethod::Unknown]);
    }

    #[test]
    fn key_request_cancellation_has_no_body() {
        let request_id = TransactionId::new();
        let content =
            RoomKeyRequestContent::new_cancellation(device_id!("BOBDEVICE").to_owned(), request_id);

        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["action"], "request_cancellation");
        assert!(value.get("body").is_none());

        let request: RoomKeyRequestContent = serde_json::from_value(json!({
            "action": "request",
            "body": { "room_id": "!room:localhost", "session_id": "session" },
            "requesting_device_id": "BOBDEVICE",
            "request_id": "req",
        }))
        .unwrap();
        let body = assert_matches!(request.body, Some(body) => body);
        assert_eq!(body.room_id.as_str(), "!room:localhost");
    }

    #[test]
    fn exported_keys_dont_leak_in_debug_output() {
        let key = ExportedRoomKey {
            room_id: room_id!("!room:localhost").to_owned(),
            session_id: "session".to_owned(),
            session_key: "secret key material".to_owned(),
        };

        assert!(!format!("{key:?}").contains("secret key material"));
    }
}
