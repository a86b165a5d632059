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

//! Answering room key requests of our other devices.
//!
//! Our other devices ask for room keys they are missing. A key is only
//! forwarded once the requesting device is verified, requests from devices we
//! don't trust yet are kept around and granted once the device gets verified.

mod machine;

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock as StdRwLock},
};

pub use machine::KeyGossipCoordinator;
use ruma::{OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId};

use crate::{types::ExportedRoomKey, utilities::AsyncTraitDeps};

/// The state of a room key request one of our devices sent us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyShareState {
    /// The request waits for the device to get verified or for the key to
    /// become available.
    Pending,
    /// The request came from a device of another user, we never answer those.
    Withheld,
    /// The key was forwarded to the device.
    Granted,
    /// The request was withdrawn before the key was forwarded.
    Cancelled,
    /// The request was withdrawn after the key was forwarded, the key can't
    /// be recalled.
    CancelledAfterGrant,
}

impl KeyShareState {
    /// Should a duplicate of the request be answered with the existing
    /// request.
    ///
    /// Only a request that was withdrawn before it was granted makes room for
    /// a new one, a key is never granted twice.
    pub fn answers_duplicates(&self) -> bool {
        !matches!(self, KeyShareState::Cancelled)
    }
}

/// A room key request of another device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyShareRequest {
    pub request_id: OwnedTransactionId,
    pub room_id: OwnedRoomId,
    pub session_id: String,
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub state: KeyShareState,
}

/// What happened to an incoming room key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyRequestOutcome {
    /// The request was recorded and waits for the device to be verified.
    Pending,
    /// The request was recorded but it will never be granted.
    Withheld,
    /// The key was queued to be forwarded.
    Granted,
    /// An identical request was already answered.
    AlreadyGranted,
    /// The request was withdrawn.
    Cancelled,
    /// The request was ignored, e.g. it came from our own device or was
    /// malformed.
    Ignored,
}

/// A room key that should be sent to one of our devices.
#[derive(Clone, Debug)]
pub struct KeyForward {
    /// The unique id of this outgoing forward.
    pub forward_id: OwnedTransactionId,
    /// The request this forward answers.
    pub request_id: OwnedTransactionId,
    pub recipient_user: OwnedUserId,
    pub recipient_device: OwnedDeviceId,
    pub room_key: ExportedRoomKey,
}

/// Where the room keys we forward come from.
pub trait RoomKeySource: AsyncTraitDeps {
    /// Export the room key with the given session id, `None` if we don't have
    /// it.
    fn export_room_key(&self, room_id: &RoomId, session_id: &str) -> Option<ExportedRoomKey>;
}

/// A [`RoomKeySource`] keeping the room keys in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryRoomKeySource {
    keys: Arc<StdRwLock<BTreeMap<(OwnedRoomId, String), ExportedRoomKey>>>,
}

impl MemoryRoomKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_room_key(&self, room_key: ExportedRoomKey) {
        self.keys
            .write()
            .unwrap()
            .insert((room_key.room_id.clone(), room_key.session_id.clone()), room_key);
    }
}

impl RoomKeySource for MemoryRoomKeySource {
    fn export_room_key(&self, room_id: &RoomId, session_id: &str) -> Option<ExportedRoomKey> {
        self.keys.read().unwrap().get(&(room_id.to_owned(), session_id.to_owned())).cloned()
    }
}
