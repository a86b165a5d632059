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
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
};

use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId,
    UserId,
};
use tracing::{debug, info, instrument, trace, warn};

use super::{KeyForward, KeyRequestOutcome, KeyShareRequest, KeyShareState, RoomKeySource};
use crate::{
    store::TrustStore,
    types::{KeyRequestAction, RoomKeyRequestContent},
};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SessionKey {
    room_id: OwnedRoomId,
    session_id: String,
}

/// All the requests for a single room key, keyed by their request id.
type SessionRequests = BTreeMap<OwnedTransactionId, KeyShareRequest>;

/// Decides which room key requests of our other devices get answered.
///
/// Every room key has its own lock, all decisions about requests for the same
/// key are linearized while requests for different keys don't contend.
#[derive(Clone, Debug)]
pub struct KeyGossipCoordinator {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    store: TrustStore,
    room_keys: Arc<dyn RoomKeySource>,
    sessions: Arc<StdRwLock<BTreeMap<SessionKey, Arc<StdMutex<SessionRequests>>>>>,
    request_ids: Arc<StdRwLock<BTreeMap<OwnedTransactionId, SessionKey>>>,
    outgoing_forwards: Arc<StdRwLock<BTreeMap<OwnedTransactionId, KeyForward>>>,
}

impl KeyGossipCoordinator {
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        store: TrustStore,
        room_keys: Arc<dyn RoomKeySource>,
    ) -> Self {
        Self {
            user_id,
            device_id,
            store,
            room_keys,
            sessions: Default::default(),
            request_ids: Default::default(),
            outgoing_forwards: Default::default(),
        }
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Our own device ID.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Record a request of the given device for a room key.
    ///
    /// If an identical request exists and wasn't withdrawn before it was
    /// granted, its id is returned and no new request is created. If the
    /// device is already verified the request is answered right away.
    pub fn request_keys(
        &self,
        room_id: &RoomId,
        session_id: &str,
        (user_id, device_id): (&UserId, &DeviceId),
    ) -> OwnedTransactionId {
        let (request_id, _) = self.record_request(room_id, session_id, user_id, device_id, None);
        request_id
    }

    /// Receive a `m.room_key_request` to-device message.
    #[instrument(skip_all, fields(
        sender = ?sender,
        device_id = ?content.requesting_device_id,
        request_id = ?content.request_id,
    ))]
    pub fn receive_key_request(
        &self,
        sender: &UserId,
        content: &RoomKeyRequestContent,
    ) -> KeyRequestOutcome {
        if sender == self.user_id() && content.requesting_device_id == self.device_id() {
            trace!("Received a room key request from ourselves, ignoring");
            return KeyRequestOutcome::Ignored;
        }

        match content.action {
            KeyRequestAction::Request => {
                let Some(info) = &content.body else {
                    warn!("Received a room key request without a body");
                    return KeyRequestOutcome::Ignored;
                };

                let (_, outcome) = self.record_request(
                    &info.room_id,
                    &info.session_id,
                    sender,
                    &content.requesting_device_id,
                    Some(content.request_id.clone()),
                );

                outcome
            }
            KeyRequestAction::RequestCancellation => {
                let Some(request) = self.get_request(&content.request_id) else {
                    trace!("Received a cancellation for an unknown room key request");
                    return KeyRequestOutcome::Ignored;
                };

                if request.user_id != sender || request.device_id != content.requesting_device_id
                {
                    warn!("A device tried to cancel a room key request of another device");
                    return KeyRequestOutcome::Ignored;
                }

                if self.cancel_request(&content.request_id) {
                    KeyRequestOutcome::Cancelled
                } else {
                    KeyRequestOutcome::Ignored
                }
            }
        }
    }

    /// Withdraw a room key request.
    ///
    /// No further grants will happen for this request. A grant that already
    /// happened stands, its forward stays queued. Returns false if the request
    /// is unknown or already withdrawn.
    pub fn cancel_request(&self, request_id: &TransactionId) -> bool {
        let Some(session) = self.session_for_request(request_id) else {
            trace!(?request_id, "Tried to cancel an unknown room key request");
            return false;
        };

        let mut requests = session.lock().unwrap();
        let Some(request) = requests.get_mut(request_id) else {
            return false;
        };

        let new_state = match request.state {
            KeyShareState::Pending | KeyShareState::Withheld => KeyShareState::Cancelled,
            KeyShareState::Granted => KeyShareState::CancelledAfterGrant,
            KeyShareState::Cancelled | KeyShareState::CancelledAfterGrant => return false,
        };

        info!(?request_id, from = ?request.state, to = ?new_state, "Room key request withdrawn");
        request.state = new_state;

        true
    }

    /// Re-evaluate all the requests of a device whose verification state
    /// changed.
    ///
    /// If the device is now trusted every pending request is granted exactly
    /// once, if the trust was revoked all pending requests are cancelled.
    /// Returns the ids of the requests that got granted.
    #[instrument(skip(self))]
    pub fn on_device_trust_changed(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trusted: bool,
    ) -> Vec<OwnedTransactionId> {
        let mut granted = Vec::new();

        for session in self.all_sessions() {
            let mut requests = session.lock().unwrap();

            for request in requests.values_mut().filter(|r| {
                r.user_id == user_id
                    && r.device_id == device_id
                    && r.state == KeyShareState::Pending
            }) {
                if trusted {
                    if self.try_grant(request) == KeyRequestOutcome::Granted {
                        granted.push(request.request_id.clone());
                    }
                } else {
                    debug!(
                        request_id = ?request.request_id,
                        "Trust revoked, cancelling the request"
                    );
                    request.state = KeyShareState::Cancelled;
                }
            }
        }

        granted
    }

    /// Retry all the pending requests of verified devices, used once new room
    /// keys become available.
    pub fn retry_pending(&self) -> Vec<OwnedTransactionId> {
        let mut granted = Vec::new();

        for session in self.all_sessions() {
            let mut requests = session.lock().unwrap();

            for request in requests.values_mut().filter(|r| r.state == KeyShareState::Pending) {
                if self.try_grant(request) == KeyRequestOutcome::Granted {
                    granted.push(request.request_id.clone());
                }
            }
        }

        granted
    }

    /// Get a snapshot of the request with the given id.
    pub fn get_request(&self, request_id: &TransactionId) -> Option<KeyShareRequest> {
        self.session_for_request(request_id)?.lock().unwrap().get(request_id).cloned()
    }

    /// The room keys that need to be sent out.
    pub fn outgoing_forwards(&self) -> Vec<KeyForward> {
        self.outgoing_forwards.read().unwrap().values().cloned().collect()
    }

    /// Mark the forward with the given id as sent.
    pub fn mark_forward_as_sent(&self, forward_id: &TransactionId) {
        if self.outgoing_forwards.write().unwrap().remove(forward_id).is_some() {
            trace!(?forward_id, "Room key forward sent");
        }
    }

    fn record_request(
        &self,
        room_id: &RoomId,
        session_id: &str,
        user_id: &UserId,
        device_id: &DeviceId,
        request_id: Option<OwnedTransactionId>,
    ) -> (OwnedTransactionId, KeyRequestOutcome) {
        let key = SessionKey { room_id: room_id.to_owned(), session_id: session_id.to_owned() };
        let session = self.session_entry(&key);
        let mut requests = session.lock().unwrap();

        if let Some(existing) = requests.values().find(|r| {
            r.user_id == user_id && r.device_id == device_id && r.state.answers_duplicates()
        }) {
            debug!(request_id = ?existing.request_id, "Received a duplicate room key request");

            let outcome = match existing.state {
                KeyShareState::Granted | KeyShareState::CancelledAfterGrant => {
                    KeyRequestOutcome::AlreadyGranted
                }
                KeyShareState::Withheld => KeyRequestOutcome::Withheld,
                _ => KeyRequestOutcome::Pending,
            };

            return (existing.request_id.clone(), outcome);
        }

        let request_id = request_id.unwrap_or_else(TransactionId::new);

        {
            let mut request_ids = self.request_ids.write().unwrap();

            if request_ids.contains_key(&request_id) {
                warn!(?request_id, "Received a room key request reusing a known request id");
                return (request_id, KeyRequestOutcome::Ignored);
            }

            request_ids.insert(request_id.clone(), key);
        }

        let mut request = KeyShareRequest {
            request_id: request_id.clone(),
            room_id: room_id.to_owned(),
            session_id: session_id.to_owned(),
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            state: KeyShareState::Pending,
        };

        let outcome = if user_id != self.user_id() {
            info!(?request_id, "Withholding a room key requested by another user");
            request.state = KeyShareState::Withheld;
            KeyRequestOutcome::Withheld
        } else {
            self.try_grant(&mut request)
        };

        requests.insert(request_id.clone(), request);

        (request_id, outcome)
    }

    /// Grant a pending request if the device is trusted and we have the key.
    ///
    /// Must be called with the lock of the session held.
    fn try_grant(&self, request: &mut KeyShareRequest) -> KeyRequestOutcome {
        if request.state != KeyShareState::Pending {
            return KeyRequestOutcome::Ignored;
        }

        if request.user_id != self.user_id
            || !self.store.is_trusted(&request.user_id, &request.device_id)
        {
            debug!(
                request_id = ?request.request_id,
                "The device isn't trusted, keeping the request"
            );
            return KeyRequestOutcome::Pending;
        }

        let Some(room_key) = self.room_keys.export_room_key(&request.room_id, &request.session_id)
        else {
            debug!(
                request_id = ?request.request_id,
                session_id = request.session_id.as_str(),
                "We don't have the requested room key, keeping the request"
            );
            return KeyRequestOutcome::Pending;
        };

        let forward = KeyForward {
            forward_id: TransactionId::new(),
            request_id: request.request_id.clone(),
            recipient_user: request.user_id.clone(),
            recipient_device: request.device_id.clone(),
            room_key,
        };

        info!(
            request_id = ?request.request_id,
            user_id = ?request.user_id,
            device_id = ?request.device_id,
            "Granting a room key request"
        );

        request.state = KeyShareState::Granted;
        self.outgoing_forwards.write().unwrap().insert(forward.forward_id.clone(), forward);

        KeyRequestOutcome::Granted
    }

    fn session_entry(&self, key: &SessionKey) -> Arc<StdMutex<SessionRequests>> {
        if let Some(session) = self.sessions.read().unwrap().get(key) {
            return session.clone();
        }

        self.sessions.write().unwrap().entry(key.clone()).or_default().clone()
    }

    fn session_for_request(
        &self,
        request_id: &TransactionId,
    ) -> Option<Arc<StdMutex<SessionRequests>>> {
        let key = self.request_ids.read().unwrap().get(request_id)?.clone();
        self.sessions.read().unwrap().get(&key).cloned()
    }

    fn all_sessions(&self) -> Vec<Arc<StdMutex<SessionRequests>>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }
}
