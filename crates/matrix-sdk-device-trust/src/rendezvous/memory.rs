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

//! An in-memory [`RendezvousTransport`], both sides of the pipe live in the
//! same process.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex as StdMutex,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{RendezvousTransport, TransportHandle};
use crate::error::TransportError;

type Endpoint = (mpsc::UnboundedSender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>);

/// Counters describing how a [`MemoryTransport`] was used.
#[derive(Debug, Default)]
pub struct MemoryTransportStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl MemoryTransportStats {
    /// How many times the transport was opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// How many times an opened transport was released.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One end of an in-memory pipe created with [`MemoryTransport::pair()`].
#[derive(Debug)]
pub struct MemoryTransport {
    endpoint: StdMutex<Option<Endpoint>>,
    stats: Arc<MemoryTransportStats>,
}

impl MemoryTransport {
    /// Create two transports that are connected to each other.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (first_sender, first_receiver) = mpsc::unbounded_channel();
        let (second_sender, second_receiver) = mpsc::unbounded_channel();

        (Self::new((first_sender, second_receiver)), Self::new((second_sender, first_receiver)))
    }

    fn new(endpoint: Endpoint) -> Self {
        Self { endpoint: StdMutex::new(Some(endpoint)), stats: Default::default() }
    }

    pub fn stats(&self) -> Arc<MemoryTransportStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl RendezvousTransport for MemoryTransport {
    async fn open(&self) -> Result<Box<dyn TransportHandle>, TransportError> {
        let (sender, receiver) =
            self.endpoint.lock().unwrap().take().ok_or(TransportError::AlreadyOpen)?;

        self.stats.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryHandle { sender: Some(sender), receiver, stats: self.stats.clone() }))
    }
}

#[derive(Debug)]
struct MemoryHandle {
    sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    stats: Arc<MemoryTransportStats>,
}

#[async_trait]
impl TransportHandle for MemoryHandle {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), TransportError> {
        let sender = self.sender.as_ref().ok_or(TransportError::NotConnected)?;
        sender.send(message).map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.sender.is_none() {
            return Err(TransportError::NotConnected);
        }

        Ok(self.receiver.recv().await)
    }

    async fn close(&mut self) {
        if self.sender.take().is_some() {
            trace!("Closing an in-memory rendezvous transport");
            self.receiver.close();
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
