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

//! Interactive verification of another device.
//!
//! A verification starts with a request, the other side answers with a ready
//! message listing the methods it supports and one of the sides then starts
//! either a short authentication string comparison or a QR code scan. Once
//! both sides confirmed each other's keys the other device is marked as
//! verified.
//!
//! The messages of a verification are carried either as to-device messages or
//! over a confirmed [`RendezvousChannel`], see the [`VerificationCarrier`]
//! implementations.
//!
//! [`RendezvousChannel`]: crate::rendezvous::RendezvousChannel

mod carrier;
mod machine;
mod qrcode;
mod sas;
mod transaction;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex},
};

pub use carrier::{MessagingTransport, RendezvousCarrier, ToDeviceCarrier, VerificationCarrier};
pub use machine::VerificationMachine;
pub use qrcode::QrVerificationData;
use ruma::{DeviceId, OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId, UserId};
use tracing::trace;
pub use transaction::VerificationTransaction;

use crate::{
    gossiping::KeyGossipCoordinator,
    identities::{Device, LocalTrust},
    rendezvous::RendezvousId,
    store::TrustStore,
    types::VerificationMessage,
};

/// How the messages of a verification travel between the devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CarrierKind {
    /// As to-device messages through the homeserver.
    ToDevice,
    /// Over the confirmed rendezvous channel with the given id.
    Rendezvous(RendezvousId),
}

/// A verification message that needs to be sent out.
#[derive(Clone, Debug)]
pub struct OutgoingVerificationMessage {
    /// The unique id of this message, used to mark it as sent.
    pub request_id: OwnedTransactionId,
    pub recipient: OwnedUserId,
    /// The device the message is for, `None` means all the devices of the
    /// recipient.
    pub recipient_device: Option<OwnedDeviceId>,
    pub carrier: CarrierKind,
    pub message: VerificationMessage,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct OutgoingQueue {
    inner: Arc<StdMutex<VecDeque<OutgoingVerificationMessage>>>,
}

impl OutgoingQueue {
    pub fn push(&self, message: OutgoingVerificationMessage) {
        trace!(
            recipient = ?message.recipient,
            flow_id = ?message.message.transaction_id,
            event_type = message.message.content.event_type(),
            "Queuing a verification message"
        );

        self.inner.lock().unwrap().push_back(message);
    }

    pub fn snapshot(&self) -> Vec<OutgoingVerificationMessage> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    pub fn remove(&self, request_id: &TransactionId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.len();
        inner.retain(|m| m.request_id != request_id);

        inner.len() != len
    }
}

#[derive(Clone, Debug)]
pub(crate) struct VerificationStore {
    pub own_device: Arc<Device>,
    pub trust: TrustStore,
    pub gossip: KeyGossipCoordinator,
}

impl VerificationStore {
    pub fn own_user_id(&self) -> &UserId {
        self.own_device.user_id()
    }

    pub fn own_device_id(&self) -> &DeviceId {
        self.own_device.device_id()
    }

    /// Get one of the devices we can verify, our own device is never
    /// returned.
    pub fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Device> {
        if self.own_device.is(user_id, device_id) {
            None
        } else {
            self.trust.get_device(user_id, device_id)
        }
    }

    /// Mark the device as verified and let the room key gossiping know about
    /// it.
    pub fn mark_device_as_verified(&self, user_id: &UserId, device_id: &DeviceId) {
        trace!(?user_id, ?device_id, "Marking device as verified");

        self.trust.set_local_trust(user_id, device_id, LocalTrust::Verified);
        self.gossip.on_device_trust_changed(user_id, device_id, true);
    }
}
