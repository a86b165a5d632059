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
    collections::VecDeque,
    fmt,
    future::Future,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::Curve25519PublicKey;

use super::{
    crypto_channel::{ConfirmationDigits, CryptoChannel, EstablishedCryptoChannel},
    RendezvousTransport, TransportHandle,
};
use crate::{
    config::RendezvousSettings,
    error::{
        EntropyError, PairingCodeError, ProtocolError, RendezvousError, RendezvousResult,
        TransportError,
    },
    secret::{PairingSecret, SharedSecretGenerator},
    types::{CancelCode, CancelInfo},
};

const INITIATE_MESSAGE: &str = "MATRIX_DEVICE_TRUST_INITIATE";
const OK_MESSAGE: &str = "MATRIX_DEVICE_TRUST_OK";

/// The data the initiating device shows, as a QR code or a link, so the
/// responding device can join the rendezvous.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingCode {
    public_key: Curve25519PublicKey,
    secret: PairingSecret,
}

impl PairingCode {
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.public_key
    }

    pub fn secret(&self) -> &PairingSecret {
        &self.secret
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            URL_SAFE_NO_PAD.encode(self.public_key.as_bytes()),
            self.secret.to_base64()
        )
    }
}

impl FromStr for PairingCode {
    type Err = PairingCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (public_key, secret) = s.split_once('.').ok_or(PairingCodeError::Malformed)?;

        let public_key = Curve25519PublicKey::from_slice(&URL_SAFE_NO_PAD.decode(public_key)?)?;
        let secret = PairingSecret::from_base64(secret)?;

        Ok(Self { public_key, secret })
    }
}

/// Tells the [`RendezvousChannel`]s of this process apart.
///
/// The id is local to the device, the other side of a channel has its own id
/// for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RendezvousId(u64);

impl RendezvousId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RendezvousId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rendezvous-{}", self.0)
    }
}

/// Which side of the rendezvous a channel is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendezvousRole {
    /// The device that generated the pairing code.
    Initiator,
    /// The device that scanned the pairing code.
    Responder,
}

/// The state of a [`RendezvousChannel`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RendezvousState {
    /// The channel was created but the transport isn't open yet.
    Created,
    /// The secure channel is established, the users should compare the
    /// confirmation digits.
    Connected,
    /// Both users confirmed that the digits match.
    Confirmed,
    /// The rendezvous was cancelled, the transport is released.
    Cancelled(CancelInfo),
    /// The channel was closed, the transport is released.
    Closed,
}

impl RendezvousState {
    fn name(&self) -> &'static str {
        match self {
            RendezvousState::Created => "created",
            RendezvousState::Connected => "connected",
            RendezvousState::Confirmed => "confirmed",
            RendezvousState::Cancelled(_) => "cancelled",
            RendezvousState::Closed => "closed",
        }
    }
}

/// A handle that aborts any operation a [`RendezvousChannel`] is suspended
/// in.
#[derive(Clone, Debug)]
pub struct RendezvousAbortHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl RendezvousAbortHandle {
    /// Abort the rendezvous.
    ///
    /// A suspended `connect()`, `confirm()` or `receive()` returns
    /// [`RendezvousError::Aborted`] and the channel gets cancelled.
    pub fn abort(&self) {
        self.sender.send_replace(true);
    }
}

/// The frames that are exchanged over the established secure channel.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Payload { data: String },
    Confirm,
    Cancel { code: CancelCode },
    Close,
}

enum Bounded<T> {
    Finished(T),
    TimedOut,
    Aborted,
}

async fn wait_for_abort(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|aborted| *aborted).await.is_err() {
        // All the abort handles are gone, nobody can abort us anymore.
        std::future::pending::<()>().await;
    }
}

async fn bounded<F: Future>(
    abort: &mut watch::Receiver<bool>,
    duration: Duration,
    future: F,
) -> Bounded<F::Output> {
    tokio::select! {
        biased;

        _ = wait_for_abort(abort) => Bounded::Aborted,
        result = tokio::time::timeout(duration, future) => match result {
            Ok(output) => Bounded::Finished(output),
            Err(_) => Bounded::TimedOut,
        },
    }
}

/// A confirmable, bidirectional and message oriented secure channel between
/// two devices.
///
/// The channel rides on top of an injected [`RendezvousTransport`], the same
/// state machine works over a relay server or any other byte pipe. Once
/// connected, both devices display the same [`ConfirmationDigits`]. After
/// both users confirmed the digits, the channel can be used to exchange
/// arbitrary payloads, which are delivered in the order they were sent.
pub struct RendezvousChannel {
    id: RendezvousId,
    role: RendezvousRole,
    transport: Box<dyn RendezvousTransport>,
    handle: Option<Box<dyn TransportHandle>>,
    /// Our ECIES key pair, only the initiator has one before connecting.
    pending_crypto: Option<CryptoChannel>,
    crypto: Option<EstablishedCryptoChannel>,
    initiator_key: Curve25519PublicKey,
    secret: PairingSecret,
    state: RendezvousState,
    settings: RendezvousSettings,
    abort: Arc<watch::Sender<bool>>,
    peer_confirmed: bool,
    /// Payloads the other side sent before we saw its confirmation.
    early_payloads: VecDeque<Vec<u8>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for RendezvousChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousChannel")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl RendezvousChannel {
    fn new(
        role: RendezvousRole,
        transport: Box<dyn RendezvousTransport>,
        pending_crypto: Option<CryptoChannel>,
        initiator_key: Curve25519PublicKey,
        secret: PairingSecret,
        settings: RendezvousSettings,
    ) -> Self {
        let (abort, _) = watch::channel(false);

        Self {
            id: RendezvousId::next(),
            role,
            transport,
            handle: None,
            pending_crypto,
            crypto: None,
            initiator_key,
            secret,
            state: RendezvousState::Created,
            settings,
            abort: Arc::new(abort),
            peer_confirmed: false,
            early_payloads: VecDeque::new(),
        }
    }

    /// Start a new rendezvous, the returned channel's [`PairingCode`] needs to
    /// be transferred to the other device.
    pub fn initiate(
        transport: impl RendezvousTransport + 'static,
        settings: RendezvousSettings,
    ) -> Result<Self, EntropyError> {
        let secret = SharedSecretGenerator::generate()?;
        let crypto = CryptoChannel::new();
        let initiator_key = crypto.public_key();

        Ok(Self::new(
            RendezvousRole::Initiator,
            Box::new(transport),
            Some(crypto),
            initiator_key,
            secret,
            settings,
        ))
    }

    /// Join a rendezvous using the [`PairingCode`] the initiating device
    /// showed us.
    pub fn join(
        transport: impl RendezvousTransport + 'static,
        code: PairingCode,
        settings: RendezvousSettings,
    ) -> Self {
        let PairingCode { public_key, secret } = code;

        Self::new(
            RendezvousRole::Responder,
            Box::new(transport),
            None,
            public_key,
            secret,
            settings,
        )
    }

    pub fn id(&self) -> RendezvousId {
        self.id
    }

    pub fn role(&self) -> RendezvousRole {
        self.role
    }

    pub fn state(&self) -> &RendezvousState {
        &self.state
    }

    /// The code that lets another device join this rendezvous.
    pub fn pairing_code(&self) -> PairingCode {
        PairingCode { public_key: self.initiator_key, secret: self.secret.clone() }
    }

    pub fn abort_handle(&self) -> RendezvousAbortHandle {
        RendezvousAbortHandle { sender: self.abort.clone() }
    }

    /// Open the transport and establish the secure channel.
    ///
    /// Returns the digits the users need to compare on both devices. If the
    /// other device doesn't show up in time, the channel is cancelled with a
    /// [`CancelCode::Timeout`].
    #[instrument(skip_all, fields(role = ?self.role))]
    pub async fn connect(&mut self) -> RendezvousResult<ConfirmationDigits> {
        if self.state != RendezvousState::Created {
            return Err(RendezvousError::InvalidState(self.state.name()));
        }

        let timeout = self.settings.connect_timeout;
        let mut abort = self.abort.subscribe();

        let outcome = bounded(&mut abort, timeout, self.handshake()).await;
        let digits = self.settle(outcome).await?;

        info!("The rendezvous channel has been established");
        self.state = RendezvousState::Connected;

        Ok(digits)
    }

    /// The local user confirmed that the digits match.
    ///
    /// Tells the other device about it and waits until the other device
    /// confirms as well.
    #[instrument(skip_all, fields(role = ?self.role))]
    pub async fn confirm(&mut self) -> RendezvousResult<()> {
        match self.state {
            RendezvousState::Connected => {}
            RendezvousState::Confirmed => return Ok(()),
            _ => return Err(RendezvousError::InvalidState(self.state.name())),
        }

        let timeout = self.settings.confirmation_timeout;
        let mut abort = self.abort.subscribe();

        let outcome = bounded(&mut abort, timeout, self.exchange_confirmations()).await;
        self.settle(outcome).await?;

        info!("Both sides confirmed the rendezvous");
        self.state = RendezvousState::Confirmed;

        Ok(())
    }

    /// Send a single payload to the other device.
    pub async fn send(&mut self, payload: &[u8]) -> RendezvousResult<()> {
        self.ensure_open()?;

        let frame = Frame::Payload { data: STANDARD_NO_PAD.encode(payload) };

        match self.send_frame(&frame).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Wait for the next payload of the other device.
    ///
    /// Returns `None` if the other device closed the channel. If no payload
    /// arrives within the given timeout the channel is cancelled.
    pub async fn receive(&mut self, timeout: Duration) -> RendezvousResult<Option<Vec<u8>>> {
        self.ensure_open()?;

        if let Some(payload) = self.early_payloads.pop_front() {
            return Ok(Some(payload));
        }

        let mut abort = self.abort.subscribe();

        let outcome = bounded(&mut abort, timeout, self.next_payload()).await;
        let payload = self.settle(outcome).await?;

        if payload.is_none() {
            debug!("The other side closed the rendezvous channel");
            self.release().await;
            self.state = RendezvousState::Closed;
        }

        Ok(payload)
    }

    /// Cancel the rendezvous, this is a no-op if the channel is already
    /// cancelled or closed.
    pub async fn cancel(&mut self, code: CancelCode) {
        if matches!(self.state, RendezvousState::Cancelled(_) | RendezvousState::Closed) {
            return;
        }

        self.terminate(CancelInfo::new(true, code)).await;
    }

    /// Close the channel and release the transport.
    ///
    /// Calling this multiple times is fine, the transport is released only
    /// once.
    pub async fn close(&mut self) {
        if self.state == RendezvousState::Closed {
            return;
        }

        if matches!(self.state, RendezvousState::Connected | RendezvousState::Confirmed) {
            self.send_best_effort(Frame::Close).await;
        }

        self.release().await;
        self.state = RendezvousState::Closed;
    }

    fn ensure_open(&self) -> RendezvousResult<()> {
        match self.state {
            RendezvousState::Connected | RendezvousState::Confirmed => Ok(()),
            _ => Err(TransportError::NotConnected.into()),
        }
    }

    async fn handshake(&mut self) -> RendezvousResult<ConfirmationDigits> {
        self.handle = Some(self.transport.open().await?);

        let established = if let Some(crypto) = self.pending_crypto.take() {
            let message = self.receive_raw().await?.ok_or(ProtocolError::PeerClosed)?;
            let (mut established, plaintext) = crypto.establish_inbound_channel(&message)?;

            if plaintext != INITIATE_MESSAGE.as_bytes() {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: INITIATE_MESSAGE,
                    received: String::from_utf8_lossy(&plaintext).into_owned(),
                }
                .into());
            }

            let reply = established.seal(OK_MESSAGE.as_bytes());
            self.send_raw(reply).await?;

            established
        } else {
            let (mut established, initial_message) = CryptoChannel::new()
                .establish_outbound_channel(self.initiator_key, INITIATE_MESSAGE.as_bytes())?;
            self.send_raw(initial_message).await?;

            let reply = self.receive_raw().await?.ok_or(ProtocolError::PeerClosed)?;
            let plaintext = established.open(&reply)?;

            if plaintext != OK_MESSAGE.as_bytes() {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: OK_MESSAGE,
                    received: String::from_utf8_lossy(&plaintext).into_owned(),
                }
                .into());
            }

            established
        };

        let digits =
            ConfirmationDigits::derive(&self.secret, established.check_code(), self.initiator_key)?;
        self.crypto = Some(established);

        Ok(digits)
    }

    async fn exchange_confirmations(&mut self) -> RendezvousResult<()> {
        self.send_frame(&Frame::Confirm).await?;

        while !self.peer_confirmed {
            match self.receive_frame().await? {
                Some(Frame::Confirm) => self.peer_confirmed = true,
                Some(Frame::Cancel { code }) => return Err(RendezvousError::Declined(code)),
                Some(Frame::Close) | None => {
                    return Err(RendezvousError::Declined(CancelCode::User));
                }
                Some(Frame::Payload { data }) => {
                    // The other side may already be confirmed and talking.
                    trace!("Buffering a payload that arrived before the confirmation");
                    let payload = STANDARD_NO_PAD.decode(data).map_err(ProtocolError::from)?;
                    self.early_payloads.push_back(payload);
                }
            }
        }

        Ok(())
    }

    async fn next_payload(&mut self) -> RendezvousResult<Option<Vec<u8>>> {
        loop {
            match self.receive_frame().await? {
                Some(Frame::Payload { data }) => {
                    return Ok(Some(STANDARD_NO_PAD.decode(data).map_err(ProtocolError::from)?));
                }
                Some(Frame::Confirm) => {
                    trace!("The other side confirmed the rendezvous");
                    self.peer_confirmed = true;
                }
                Some(Frame::Cancel { code }) => return Err(RendezvousError::Declined(code)),
                Some(Frame::Close) | None => return Ok(None),
            }
        }
    }

    async fn send_raw(&mut self, message: Vec<u8>) -> RendezvousResult<()> {
        let handle = self.handle.as_mut().ok_or(TransportError::NotConnected)?;
        Ok(handle.send(message).await?)
    }

    async fn receive_raw(&mut self) -> RendezvousResult<Option<Vec<u8>>> {
        let handle = self.handle.as_mut().ok_or(TransportError::NotConnected)?;
        Ok(handle.receive().await?)
    }

    async fn send_frame(&mut self, frame: &Frame) -> RendezvousResult<()> {
        let crypto = self.crypto.as_mut().ok_or(TransportError::NotConnected)?;
        let plaintext = serde_json::to_vec(frame).map_err(ProtocolError::from)?;
        let message = crypto.seal(&plaintext);

        self.send_raw(message).await
    }

    async fn receive_frame(&mut self) -> RendezvousResult<Option<Frame>> {
        let Some(message) = self.receive_raw().await? else {
            return Ok(None);
        };

        let crypto = self.crypto.as_mut().ok_or(TransportError::NotConnected)?;
        let plaintext = crypto.open(&message)?;

        Ok(Some(serde_json::from_slice(&plaintext).map_err(ProtocolError::from)?))
    }

    /// Try to tell the other side something before we give up on it.
    async fn send_best_effort(&mut self, frame: Frame) {
        if self.crypto.is_none() || self.handle.is_none() {
            return;
        }

        let timeout = self.settings.cancel_send_timeout;

        match tokio::time::timeout(timeout, self.send_frame(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(?frame, "Couldn't send a frame to the other side: {e}"),
            Err(_) => debug!(?frame, "Timed out sending a frame to the other side"),
        }
    }

    async fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            trace!("Releasing the rendezvous transport");
            handle.close().await;
        }
    }

    async fn terminate(&mut self, info: CancelInfo) {
        if info.cancelled_by_us() {
            self.send_best_effort(Frame::Cancel { code: info.cancel_code() }).await;
        }

        self.release().await;

        info!(
            code = %info.cancel_code(),
            cancelled_by_us = info.cancelled_by_us(),
            "The rendezvous was cancelled"
        );

        self.state = RendezvousState::Cancelled(info);
    }

    /// Move the channel into a terminal state matching the error.
    async fn fail(&mut self, error: RendezvousError) -> RendezvousError {
        match &error {
            RendezvousError::Protocol(e) => {
                warn!("The other side violated the rendezvous protocol: {e}");
                self.terminate(CancelInfo::new(true, e.cancel_code())).await;
            }
            RendezvousError::Declined(code) => {
                self.terminate(CancelInfo::new(false, *code)).await;
            }
            RendezvousError::Aborted => {
                self.terminate(CancelInfo::new(true, CancelCode::User)).await;
            }
            RendezvousError::Transport(e) => {
                warn!("The rendezvous transport failed: {e}");
                self.release().await;
                self.state = RendezvousState::Closed;
            }
            RendezvousError::InvalidState(_) | RendezvousError::Entropy(_) => {}
        }

        error
    }

    async fn settle<T>(&mut self, outcome: Bounded<RendezvousResult<T>>) -> RendezvousResult<T> {
        match outcome {
            Bounded::Finished(Ok(value)) => Ok(value),
            Bounded::Finished(Err(e)) => Err(self.fail(e).await),
            Bounded::TimedOut => {
                self.terminate(CancelInfo::new(true, CancelCode::Timeout)).await;
                Err(TransportError::Timeout.into())
            }
            Bounded::Aborted => Err(self.fail(RendezvousError::Aborted).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use similar_asserts::assert_eq;
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};

    use super::{PairingCode, RendezvousChannel, RendezvousRole, RendezvousState};
    use crate::{
        config::RendezvousSettings,
        error::{RendezvousError, TransportError},
        rendezvous::MemoryTransport,
        types::CancelCode,
    };

    const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

    fn channels() -> (RendezvousChannel, RendezvousChannel) {
        let (alice_transport, bob_transport) = MemoryTransport::pair();

        let alice = RendezvousChannel::initiate(alice_transport, RendezvousSettings::new())
            .expect("We should be able to generate a pairing secret");
        let bob = RendezvousChannel::join(bob_transport, alice.pairing_code(), Default::default());

        (alice, bob)
    }

    async fn connected_channels() -> (RendezvousChannel, RendezvousChannel) {
        let (mut alice, mut bob) = channels();

        let (alice_digits, bob_digits) = tokio::join!(alice.connect(), bob.connect());
        assert_eq!(alice_digits.unwrap(), bob_digits.unwrap());

        (alice, bob)
    }

    #[tokio::test]
    async fn both_sides_see_the_same_digits_and_confirm() {
        let (mut alice, mut bob) = connected_channels().await;

        assert_eq!(alice.role(), RendezvousRole::Initiator);
        assert_eq!(bob.role(), RendezvousRole::Responder);
        assert_eq!(alice.state(), &RendezvousState::Connected);

        let (alice_result, bob_result) = tokio::join!(alice.confirm(), bob.confirm());
        alice_result.unwrap();
        bob_result.unwrap();

        assert_eq!(alice.state(), &RendezvousState::Confirmed);
        assert_eq!(bob.state(), &RendezvousState::Confirmed);
    }

    #[tokio::test]
    async fn payloads_arrive_in_send_order() {
        let (mut alice, mut bob) = connected_channels().await;

        for payload in [b"m1", b"m2", b"m3"] {
            alice.send(payload).await.unwrap();
        }

        for expected in [b"m1", b"m2", b"m3"] {
            let payload = bob.receive(RECEIVE_TIMEOUT).await.unwrap();
            assert_eq!(payload.as_deref(), Some(expected.as_slice()));
        }
    }

    #[tokio::test]
    async fn payloads_sent_before_the_confirmation_are_kept() {
        let (mut alice, mut bob) = connected_channels().await;

        // Sending is fine as soon as the channel is connected, Bob sees the
        // payload while he waits for Alice's confirmation.
        alice.send(b"early").await.unwrap();

        let (alice_result, bob_result) = tokio::join!(alice.confirm(), bob.confirm());
        alice_result.unwrap();
        bob_result.unwrap();
        assert_eq!(bob.state(), &RendezvousState::Confirmed);

        alice.send(b"late").await.unwrap();

        for expected in [b"early".as_slice(), b"late".as_slice()] {
            let payload = bob.receive(RECEIVE_TIMEOUT).await.unwrap();
            assert_eq!(payload.as_deref(), Some(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_cancels_and_releases_once() {
        let (alice_transport, _bob_transport) = MemoryTransport::pair();
        let stats = alice_transport.stats();

        let mut alice = RendezvousChannel::initiate(
            alice_transport,
            RendezvousSettings::new().connect_timeout(Duration::from_secs(10)),
        )
        .unwrap();

        assert_matches!(
            alice.connect().await,
            Err(RendezvousError::Transport(TransportError::Timeout))
        );
        let info = assert_matches!(alice.state(), RendezvousState::Cancelled(info) => info);
        assert_eq!(info.cancel_code(), CancelCode::Timeout);
        assert_eq!(stats.closed(), 1);

        alice.close().await;
        alice.close().await;

        assert_eq!(alice.state(), &RendezvousState::Closed);
        assert_eq!(stats.opened(), 1);
        assert_eq!(stats.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_timeout_cancels_the_channel() {
        let (mut alice, _bob) = connected_channels().await;

        assert_matches!(
            alice.receive(Duration::from_secs(1)).await,
            Err(RendezvousError::Transport(TransportError::Timeout))
        );
        let info = assert_matches!(alice.state(), RendezvousState::Cancelled(info) => info);
        assert_eq!(info.cancel_code(), CancelCode::Timeout);
        assert!(info.cancelled_by_us());

        assert_matches!(
            alice.send(b"too late").await,
            Err(RendezvousError::Transport(TransportError::NotConnected))
        );
    }

    #[tokio::test]
    async fn peer_cancel_during_confirmation_is_a_decline() {
        let (mut alice, mut bob) = connected_channels().await;

        let (alice_result, ()) = tokio::join!(alice.confirm(), bob.cancel(CancelCode::User));

        assert_matches!(alice_result, Err(RendezvousError::Declined(CancelCode::User)));
        let info = assert_matches!(alice.state(), RendezvousState::Cancelled(info) => info);
        assert!(!info.cancelled_by_us());
        let info = assert_matches!(bob.state(), RendezvousState::Cancelled(info) => info);
        assert!(info.cancelled_by_us());
    }

    #[tokio::test]
    async fn orderly_close_ends_the_stream() {
        let (mut alice, mut bob) = connected_channels().await;

        alice.send(b"bye").await.unwrap();
        alice.close().await;

        assert_eq!(bob.receive(RECEIVE_TIMEOUT).await.unwrap().as_deref(), Some(b"bye".as_slice()));
        assert_eq!(bob.receive(RECEIVE_TIMEOUT).await.unwrap(), None);
        assert_eq!(bob.state(), &RendezvousState::Closed);
    }

    #[tokio::test]
    async fn aborting_a_suspended_receive() {
        let (mut alice, _bob) = connected_channels().await;
        let abort_handle = alice.abort_handle();

        let (result, ()) =
            tokio::join!(alice.receive(Duration::from_secs(60)), async { abort_handle.abort() });

        assert_matches!(result, Err(RendezvousError::Aborted));
        let info = assert_matches!(alice.state(), RendezvousState::Cancelled(info) => info);
        assert_eq!(info.cancel_code(), CancelCode::User);
    }

    #[tokio::test]
    async fn sending_before_connecting_fails() {
        let (mut alice, _bob) = channels();

        assert_matches!(
            alice.send(b"hello").await,
            Err(RendezvousError::Transport(TransportError::NotConnected))
        );
        assert_eq!(alice.state(), &RendezvousState::Created);
    }

    #[tokio::test]
    async fn wrong_public_key_fails_the_handshake() {
        let (alice_transport, bob_transport) = MemoryTransport::pair();
        let mut alice = RendezvousChannel::initiate(alice_transport, Default::default()).unwrap();

        let mut code = alice.pairing_code();
        code.public_key = Curve25519PublicKey::from(&Curve25519SecretKey::new());
        let mut bob = RendezvousChannel::join(bob_transport, code, Default::default());

        let (alice_result, bob_result) = tokio::join!(alice.connect(), bob.connect());

        assert_matches!(alice_result, Err(RendezvousError::Protocol(_)));
        assert_matches!(bob_result, Err(RendezvousError::Protocol(_)));
        let info = assert_matches!(alice.state(), RendezvousState::Cancelled(info) => info);
        assert_eq!(info.cancel_code(), CancelCode::InvalidMessage);
    }

    #[test]
    fn pairing_code_round_trip() {
        let (alice, _bob) = channels();
        let code = alice.pairing_code();

        let parsed: PairingCode = code.to_string().parse().unwrap();
        assert_eq!(parsed, code);

        "no-separator".parse::<PairingCode>().expect_err("A code needs two parts");
    }
}
