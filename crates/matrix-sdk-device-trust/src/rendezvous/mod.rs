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

//! A confirmable secure pairing channel between two devices.
//!
//! The [`RendezvousChannel`] establishes an ECIES secure channel over any
//! [`RendezvousTransport`]. Both devices display the same
//! [`ConfirmationDigits`] which the users compare before they confirm the
//! channel. Once confirmed, the channel can carry a verification flow or any
//! other payload.
//!
//! ```no_run
//! # use std::time::Duration;
//! # use matrix_sdk_device_trust::rendezvous::{MemoryTransport, RendezvousChannel};
//! # async {
//! let (transport, _other_transport) = MemoryTransport::pair();
//! let mut channel = RendezvousChannel::initiate(transport, Default::default())?;
//!
//! // Show this as a QR code on the current device.
//! let code = channel.pairing_code().to_string();
//!
//! let digits = channel.connect().await?;
//! println!("Do the digits {digits} match the ones on the other device?");
//!
//! channel.confirm().await?;
//! channel.send(b"hello").await?;
//! let reply = channel.receive(Duration::from_secs(30)).await?;
//!
//! channel.close().await;
//! # anyhow::Ok(()) };
//! ```

mod channel;
mod crypto_channel;
mod memory;
mod transport;

pub use channel::{
    PairingCode, RendezvousAbortHandle, RendezvousChannel, RendezvousId, RendezvousRole,
    RendezvousState,
};
pub use crypto_channel::ConfirmationDigits;
pub use memory::{MemoryTransport, MemoryTransportStats};
pub use transport::{RendezvousTransport, TransportHandle};
