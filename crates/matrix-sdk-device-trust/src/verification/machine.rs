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

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock as StdRwLock},
    time::Duration,
};

use ruma::{
    DeviceId, MilliSecondsSinceUnixEpoch, OwnedTransactionId, OwnedUserId, TransactionId, UserId,
};
use tracing::{debug, info, instrument, trace, warn};

use super::{
    CarrierKind, OutgoingQueue, OutgoingVerificationMessage, VerificationStore,
    VerificationTransaction,
};
use crate::{
    config::VerificationSettings,
    error::{VerificationError, VerificationResult},
    gossiping::KeyGossipCoordinator,
    identities::Device,
    store::TrustStore,
    types::{
        CancelCode, CancelContent, RequestContent, VerificationContent, VerificationMessage,
    },
};

type TransactionMap = BTreeMap<OwnedUserId, BTreeMap<OwnedTransactionId, VerificationTransaction>>;

/// Keeps track of all the verifications of our device and dispatches incoming
/// verification messages to them.
#[derive(Clone, Debug)]
pub struct VerificationMachine {
    pub(crate) store: VerificationStore,
    settings: VerificationSettings,
    outgoing: OutgoingQueue,
    transactions: Arc<StdRwLock<TransactionMap>>,
}

impl VerificationMachine {
    pub fn new(
        own_device: Device,
        trust: TrustStore,
        gossip: KeyGossipCoordinator,
        settings: VerificationSettings,
    ) -> Self {
        Self {
            store: VerificationStore { own_device: Arc::new(own_device), trust, gossip },
            settings,
            outgoing: Default::default(),
            transactions: Default::default(),
        }
    }

    pub fn own_user_id(&self) -> &UserId {
        self.store.own_user_id()
    }

    pub fn own_device_id(&self) -> &DeviceId {
        self.store.own_device_id()
    }

    /// Request a verification with a device of the given user.
    ///
    /// If no device is given the request goes to all the devices of the user
    /// and the first one that answers is verified.
    #[instrument(skip(self))]
    pub fn request_verification(
        &self,
        user_id: &UserId,
        device_id: Option<&DeviceId>,
        carrier: CarrierKind,
    ) -> VerificationResult<VerificationTransaction> {
        if let Some(device_id) = device_id {
            if self.store.own_device.is(user_id, device_id) {
                return Err(VerificationError::InvalidState("verify our own device"));
            }

            if self.store.get_device(user_id, device_id).is_none() {
                return Err(VerificationError::UnknownDevice {
                    user_id: user_id.to_owned(),
                    device_id: device_id.to_owned(),
                });
            }
        }

        let mut transactions = self.transactions.write().unwrap();

        if transactions
            .get(user_id)
            .is_some_and(|t| t.values().any(|t| t.is_live_with(user_id, device_id)))
        {
            return Err(VerificationError::AlreadyInProgress {
                user_id: user_id.to_owned(),
                device_id: device_id.map(ToOwned::to_owned),
            });
        }

        let transaction = VerificationTransaction::new_outgoing(
            self.store.clone(),
            self.outgoing.clone(),
            &self.settings,
            user_id,
            device_id,
            carrier,
        );

        info!(flow_id = ?transaction.flow_id(), "Requesting a verification");

        transactions
            .entry(user_id.to_owned())
            .or_default()
            .insert(transaction.flow_id().to_owned(), transaction.clone());

        Ok(transaction)
    }

    /// Handle a verification message the given user sent us.
    #[instrument(skip_all, fields(
        ?sender,
        flow_id = ?message.transaction_id,
        event_type = message.content.event_type(),
    ))]
    pub fn receive_message(
        &self,
        carrier: CarrierKind,
        sender: &UserId,
        message: &VerificationMessage,
    ) {
        let flow_id = &message.transaction_id;

        match &message.content {
            VerificationContent::Request(request) => {
                self.receive_request(carrier, sender, flow_id, request)
            }
            content => match self.get_transaction(sender, flow_id) {
                Some(transaction) if transaction.carrier() == carrier => {
                    transaction.receive(content)
                }
                Some(_) => {
                    warn!("Received a verification message over the wrong carrier, ignoring");
                }
                None => {
                    if let VerificationContent::Cancel(_) = content {
                        trace!("Received a cancellation for an unknown verification, ignoring");
                        return;
                    }

                    warn!("Received a message for an unknown verification");

                    let recipient_device = match content {
                        VerificationContent::Ready(c) => Some(c.from_device.clone()),
                        VerificationContent::Start(c) => Some(c.from_device.clone()),
                        _ => None,
                    };

                    self.outgoing.push(OutgoingVerificationMessage {
                        request_id: TransactionId::new(),
                        recipient: sender.to_owned(),
                        recipient_device,
                        carrier,
                        message: VerificationMessage {
                            transaction_id: flow_id.clone(),
                            content: VerificationContent::Cancel(CancelContent::new(
                                CancelCode::UnknownTransaction,
                            )),
                        },
                    });
                }
            },
        }
    }

    fn receive_request(
        &self,
        carrier: CarrierKind,
        sender: &UserId,
        flow_id: &TransactionId,
        request: &RequestContent,
    ) {
        if !self.is_timestamp_valid(request.timestamp) {
            trace!("Received a verification request with an invalid timestamp, ignoring");
            return;
        }

        if self.store.own_device.is(sender, &request.from_device) {
            trace!("Received a verification request from our own device, ignoring");
            return;
        }

        let mut transactions = self.transactions.write().unwrap();
        let user_transactions = transactions.entry(sender.to_owned()).or_default();

        if user_transactions.contains_key(flow_id) {
            trace!("Received a duplicate verification request, ignoring");
            return;
        }

        let transaction = VerificationTransaction::from_request(
            self.store.clone(),
            self.outgoing.clone(),
            &self.settings,
            sender,
            flow_id,
            request,
            carrier,
        );

        let live = user_transactions
            .values()
            .filter(|t| t.is_live_with(sender, Some(&request.from_device)));

        for existing in live {
            if existing.we_started() {
                // Both sides sent a request at the same time, both sides pick
                // the request of the side with the smaller ids.
                let ours = (self.own_user_id(), self.own_device_id());
                let theirs: (&UserId, &DeviceId) = (sender, &request.from_device);

                if ours < theirs {
                    info!(kept = ?existing.flow_id(), "Verification glare, keeping our request");
                    transaction.cancel_with_code(CancelCode::Glare);
                    break;
                }

                info!(
                    cancelled = ?existing.flow_id(),
                    "Verification glare, keeping their request"
                );
                existing.cancel_with_code(CancelCode::Glare);
            } else {
                warn!(
                    existing = ?existing.flow_id(),
                    "The other side sent a second verification request, cancelling both"
                );

                existing.cancel_with_code(CancelCode::UnexpectedMessage);
                transaction.cancel_with_code(CancelCode::UnexpectedMessage);
            }
        }

        debug!(device_id = ?request.from_device, "Received a new verification request");

        user_transactions.insert(flow_id.to_owned(), transaction);
    }

    fn is_timestamp_valid(&self, timestamp: MilliSecondsSinceUnixEpoch) -> bool {
        let now = u64::from(MilliSecondsSinceUnixEpoch::now().get());
        let timestamp = u64::from(timestamp.get());

        let age = Duration::from_millis(now.saturating_sub(timestamp));
        let skew = Duration::from_millis(timestamp.saturating_sub(now));

        age <= self.settings.max_request_age && skew <= self.settings.max_future_skew
    }

    pub fn get_transaction(
        &self,
        user_id: &UserId,
        flow_id: &TransactionId,
    ) -> Option<VerificationTransaction> {
        self.transactions.read().unwrap().get(user_id)?.get(flow_id).cloned()
    }

    /// Get all the verifications with the given user.
    pub fn get_transactions(&self, user_id: &UserId) -> Vec<VerificationTransaction> {
        self.transactions
            .read()
            .unwrap()
            .get(user_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The verification messages that need to be sent out, in the order they
    /// were created.
    pub fn outgoing_messages(&self) -> Vec<OutgoingVerificationMessage> {
        self.outgoing.snapshot()
    }

    pub fn mark_message_as_sent(&self, request_id: &TransactionId) {
        if !self.outgoing.remove(request_id) {
            trace!(?request_id, "Tried to mark an unknown verification message as sent");
        }
    }

    /// Forget finished verifications and cancel the ones that timed out.
    ///
    /// Returns the verifications that got cancelled.
    pub fn garbage_collect(&self) -> Vec<VerificationTransaction> {
        let mut transactions = self.transactions.write().unwrap();

        for user_transactions in transactions.values_mut() {
            user_transactions.retain(|_, t| !t.state().is_terminal());
        }
        transactions.retain(|_, t| !t.is_empty());

        transactions
            .values()
            .flat_map(|t| t.values())
            .filter(|t| t.cancel_if_timed_out())
            .cloned()
            .collect()
    }
}
