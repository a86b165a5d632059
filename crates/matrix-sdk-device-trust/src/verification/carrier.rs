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

use std::time::Duration;

use async_trait::async_trait;
use ruma::{DeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{CarrierKind, VerificationMachine};
use crate::{
    error::{ProtocolError, RendezvousError, RendezvousResult, TransportError},
    rendezvous::{RendezvousChannel, RendezvousState},
    types::VerificationMessage,
    utilities::AsyncTraitDeps,
};

/// The to-device messaging of the homeserver connection.
#[async_trait]
pub trait MessagingTransport: AsyncTraitDeps {
    /// Send a verification message to a device, or to all the devices of the
    /// user if no device is given.
    async fn send_to_device(
        &self,
        recipient: &UserId,
        recipient_device: Option<&DeviceId>,
        message: &VerificationMessage,
    ) -> Result<(), TransportError>;
}

/// Something that delivers the queued messages of a [`VerificationMachine`].
#[async_trait]
pub trait VerificationCarrier: Send {
    type Error;

    /// Which of the queued messages this carrier delivers.
    fn kind(&self) -> CarrierKind;

    /// Send out all the queued messages of this carrier, in the order they
    /// were queued.
    ///
    /// Stops at the first failure, the failed message and the ones after it
    /// stay queued. Returns the number of messages that were sent.
    async fn flush(&mut self, machine: &VerificationMachine) -> Result<usize, Self::Error>;
}

/// Carries verification messages as to-device messages.
#[derive(Debug)]
pub struct ToDeviceCarrier<T> {
    transport: T,
}

impl<T: MessagingTransport> ToDeviceCarrier<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Hand a verification message we received as a to-device message to the
    /// machine.
    pub fn receive(
        &self,
        machine: &VerificationMachine,
        sender: &UserId,
        message: &VerificationMessage,
    ) {
        machine.receive_message(CarrierKind::ToDevice, sender, message);
    }
}

#[async_trait]
impl<T: MessagingTransport> VerificationCarrier for ToDeviceCarrier<T> {
    type Error = TransportError;

    fn kind(&self) -> CarrierKind {
        CarrierKind::ToDevice
    }

    async fn flush(&mut self, machine: &VerificationMachine) -> Result<usize, TransportError> {
        let mut sent = 0;

        let kind = self.kind();

        for message in machine.outgoing_messages().into_iter().filter(|m| m.carrier == kind) {
            self.transport
                .send_to_device(
                    &message.recipient,
                    message.recipient_device.as_deref(),
                    &message.message,
                )
                .await?;

            machine.mark_message_as_sent(&message.request_id);
            sent += 1;
        }

        Ok(sent)
    }
}

/// The payload format of verification messages on a rendezvous channel.
#[derive(Debug, Serialize, Deserialize)]
struct RendezvousEnvelope {
    sender: OwnedUserId,
    message: VerificationMessage,
}

/// Carries verification messages over a confirmed [`RendezvousChannel`].
///
/// Only the transactions that were started or received over this very
/// channel travel over it, see [`VerificationCarrier::kind()`].
#[derive(Debug)]
pub struct RendezvousCarrier {
    channel: RendezvousChannel,
    own_user_id: OwnedUserId,
    peer_user_id: OwnedUserId,
}

impl RendezvousCarrier {
    /// Wrap a channel, the users need to have confirmed the channel already.
    ///
    /// Messages that claim to come from anyone but `peer_user_id` are
    /// dropped.
    pub fn new(
        channel: RendezvousChannel,
        own_user_id: OwnedUserId,
        peer_user_id: OwnedUserId,
    ) -> RendezvousResult<Self> {
        if *channel.state() != RendezvousState::Confirmed {
            return Err(RendezvousError::InvalidState("carry a verification"));
        }

        Ok(Self { channel, own_user_id, peer_user_id })
    }

    pub fn peer_user_id(&self) -> &UserId {
        &self.peer_user_id
    }

    /// Wait for the next verification message from the other side and hand
    /// it to the machine.
    ///
    /// Returns `false` if the other side closed the channel. Payloads that
    /// aren't verification messages are logged and dropped.
    #[instrument(skip_all, fields(channel = %self.channel.id()))]
    pub async fn receive(
        &mut self,
        machine: &VerificationMachine,
        timeout: Duration,
    ) -> RendezvousResult<bool> {
        let Some(payload) = self.channel.receive(timeout).await? else {
            debug!("The other side closed the rendezvous channel");
            return Ok(false);
        };

        match serde_json::from_slice::<RendezvousEnvelope>(&payload) {
            Ok(envelope) if envelope.sender != self.peer_user_id => warn!(
                sender = ?envelope.sender,
                expected = ?self.peer_user_id,
                "Dropping a verification message from an unexpected sender"
            ),
            Ok(envelope) => {
                machine.receive_message(self.kind(), &envelope.sender, &envelope.message)
            }
            Err(e) => warn!("Received a malformed verification message: {e}"),
        }

        Ok(true)
    }

    pub fn channel(&self) -> &RendezvousChannel {
        &self.channel
    }

    /// Give back the channel, e.g. to close it.
    pub fn into_channel(self) -> RendezvousChannel {
        self.channel
    }
}

#[async_trait]
impl VerificationCarrier for RendezvousCarrier {
    type Error = RendezvousError;

    fn kind(&self) -> CarrierKind {
        CarrierKind::Rendezvous(self.channel.id())
    }

    async fn flush(&mut self, machine: &VerificationMachine) -> RendezvousResult<usize> {
        let mut sent = 0;

        let kind = self.kind();

        for message in machine.outgoing_messages().into_iter().filter(|m| m.carrier == kind) {
            let envelope =
                RendezvousEnvelope { sender: self.own_user_id.clone(), message: message.message };
            let payload = serde_json::to_vec(&envelope).map_err(ProtocolError::from)?;

            self.channel.send(&payload).await?;

            machine.mark_message_as_sent(&message.request_id);
            sent += 1;
        }

        Ok(sent)
    }
}
