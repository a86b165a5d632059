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

use async_trait::async_trait;

use crate::{error::TransportError, utilities::AsyncTraitDeps};

/// A byte oriented, possibly relayed, pipe between two devices.
///
/// The transport only needs to move opaque messages, in order and without
/// coalescing them. Everything else, encryption and the pairing protocol, is
/// layered on top of it by the [`RendezvousChannel`].
///
/// [`RendezvousChannel`]: super::RendezvousChannel
#[async_trait]
pub trait RendezvousTransport: AsyncTraitDeps {
    /// Open the transport, a transport is opened at most once.
    async fn open(&self) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// An opened [`RendezvousTransport`].
#[async_trait]
pub trait TransportHandle: AsyncTraitDeps {
    /// Send a single message to the other side.
    async fn send(&mut self, message: Vec<u8>) -> Result<(), TransportError>;

    /// Wait for the next message of the other side.
    ///
    /// Returns `None` if the other side closed the transport.
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Release the resources of the transport.
    async fn close(&mut self);
}
