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
    fmt,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use as_variant::as_variant;
use ruma::{
    DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedTransactionId, OwnedUserId,
    TransactionId, UserId,
};
use tracing::{debug, info, instrument, trace, warn};

use super::{
    qrcode::{self, QrVerificationData},
    sas::{SasFlow, SasIds},
    CarrierKind, OutgoingQueue, OutgoingVerificationMessage, VerificationStore,
};
use crate::{
    config::VerificationSettings,
    error::{VerificationError, VerificationResult},
    identities::Device,
    types::{
        AcceptContent, CancelCode, CancelContent, CancelInfo, MacContent, ReadyContent,
        RequestContent, StartContent, StartMethod, VerificationContent, VerificationMessage,
        VerificationMethod, VerificationTxState,
    },
};

/// The method specific part of a transaction, picked once both sides are
/// ready.
enum MethodFlow {
    Sas(SasFlow),
    QrShown { data: QrVerificationData, scanned: bool },
    QrScanned,
}

struct InnerTransaction {
    other_device_id: Option<OwnedDeviceId>,
    state: VerificationTxState,
    their_methods: Vec<VerificationMethod>,
    flow: Option<MethodFlow>,
    /// Our user confirmed that the other side is who it claims to be.
    confirmed: bool,
    /// We checked the key of the other device.
    peer_verified: bool,
    done_sent: bool,
    done_received: bool,
}

/// An interactive verification with another device.
///
/// The transaction is cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct VerificationTransaction {
    store: VerificationStore,
    outgoing: OutgoingQueue,
    flow_id: OwnedTransactionId,
    other_user_id: OwnedUserId,
    we_started: bool,
    carrier: CarrierKind,
    our_methods: Arc<[VerificationMethod]>,
    timeout: Duration,
    creation_time: Instant,
    inner: Arc<StdMutex<InnerTransaction>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for VerificationTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationTransaction")
            .field("flow_id", &self.flow_id)
            .field("other_user_id", &self.other_user_id)
            .field("other_device_id", &self.other_device_id())
            .field("we_started", &self.we_started)
            .field("carrier", &self.carrier)
            .field("state", &self.state())
            .finish()
    }
}

fn has_common_method(ours: &[VerificationMethod], theirs: &[VerificationMethod]) -> bool {
    use VerificationMethod::*;

    let both = |ours_method, theirs_method| {
        ours.contains(&ours_method) && theirs.contains(&theirs_method)
    };

    both(SasV1, SasV1) || both(QrCodeShowV1, QrCodeScanV1) || both(QrCodeScanV1, QrCodeShowV1)
}

impl VerificationTransaction {
    #[allow(clippy::too_many_arguments)]
    fn new(
        store: VerificationStore,
        outgoing: OutgoingQueue,
        settings: &VerificationSettings,
        flow_id: OwnedTransactionId,
        other_user_id: OwnedUserId,
        other_device_id: Option<OwnedDeviceId>,
        we_started: bool,
        carrier: CarrierKind,
        their_methods: Vec<VerificationMethod>,
    ) -> Self {
        let inner = InnerTransaction {
            other_device_id,
            state: VerificationTxState::Requested,
            their_methods,
            flow: None,
            confirmed: false,
            peer_verified: false,
            done_sent: false,
            done_received: false,
        };

        Self {
            store,
            outgoing,
            flow_id,
            other_user_id,
            we_started,
            carrier,
            our_methods: settings.methods.clone().into(),
            timeout: settings.timeout,
            creation_time: Instant::now(),
            inner: Arc::new(StdMutex::new(inner)),
        }
    }

    /// Create a new transaction and queue the request for the other side.
    pub(crate) fn new_outgoing(
        store: VerificationStore,
        outgoing: OutgoingQueue,
        settings: &VerificationSettings,
        other_user_id: &UserId,
        other_device_id: Option<&DeviceId>,
        carrier: CarrierKind,
    ) -> Self {
        let transaction = Self::new(
            store,
            outgoing,
            settings,
            TransactionId::new(),
            other_user_id.to_owned(),
            other_device_id.map(ToOwned::to_owned),
            true,
            carrier,
            Vec::new(),
        );

        let content = VerificationContent::Request(RequestContent {
            from_device: transaction.store.own_device_id().to_owned(),
            methods: transaction.our_methods.to_vec(),
            timestamp: MilliSecondsSinceUnixEpoch::now(),
        });

        transaction.queue_to(other_device_id.map(ToOwned::to_owned), content);

        transaction
    }

    /// Create a transaction for a request the other side sent us.
    pub(crate) fn from_request(
        store: VerificationStore,
        outgoing: OutgoingQueue,
        settings: &VerificationSettings,
        sender: &UserId,
        flow_id: &TransactionId,
        content: &RequestContent,
        carrier: CarrierKind,
    ) -> Self {
        Self::new(
            store,
            outgoing,
            settings,
            flow_id.to_owned(),
            sender.to_owned(),
            Some(content.from_device.clone()),
            false,
            carrier,
            content.methods.clone(),
        )
    }

    /// The unique id of this verification flow.
    pub fn flow_id(&self) -> &TransactionId {
        &self.flow_id
    }

    /// The user we are verifying.
    pub fn other_user_id(&self) -> &UserId {
        &self.other_user_id
    }

    /// The device we are verifying, `None` if we sent a request to all the
    /// devices of the user and none of them answered yet.
    pub fn other_device_id(&self) -> Option<OwnedDeviceId> {
        self.inner.lock().unwrap().other_device_id.clone()
    }

    /// Did we send the request.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    pub fn carrier(&self) -> CarrierKind {
        self.carrier
    }

    /// Are we verifying one of our own devices.
    pub fn is_self_verification(&self) -> bool {
        self.other_user_id == self.store.own_user_id()
    }

    pub fn state(&self) -> VerificationTxState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn is_done(&self) -> bool {
        self.state() == VerificationTxState::Done
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), VerificationTxState::Cancelled(_))
    }

    /// Get info about the cancellation if the verification was cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        as_variant!(self.state(), VerificationTxState::Cancelled)
    }

    /// The methods the other side supports, empty until it told us.
    pub fn their_methods(&self) -> Vec<VerificationMethod> {
        self.inner.lock().unwrap().their_methods.clone()
    }

    /// Has the verification been around for longer than allowed.
    pub fn timed_out(&self) -> bool {
        self.creation_time.elapsed() > self.timeout
    }

    /// Accept a verification request the other side sent us.
    pub fn accept(&self) -> VerificationResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if self.we_started || inner.state != VerificationTxState::Requested {
            return Err(self.invalid_state(&inner, "accept the request"));
        }

        if !has_common_method(&self.our_methods, &inner.their_methods) {
            self.cancel_locked(&mut inner, CancelCode::UnknownMethod);
            return Err(VerificationError::Cancelled(CancelCode::UnknownMethod));
        }

        let content = VerificationContent::Ready(ReadyContent {
            from_device: self.store.own_device_id().to_owned(),
            methods: self.our_methods.to_vec(),
        });

        self.queue(&inner, content);
        inner.state = VerificationTxState::Ready;

        info!(flow_id = ?self.flow_id, "Accepted a verification request");

        Ok(())
    }

    /// Start a short authentication string comparison.
    pub fn start_sas(&self) -> VerificationResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.state != VerificationTxState::Ready || inner.flow.is_some() {
            return Err(self.invalid_state(&inner, "start a SAS verification"));
        }

        if !self.can(&inner, VerificationMethod::SasV1, VerificationMethod::SasV1) {
            return Err(VerificationError::InvalidState("start a SAS verification"));
        }

        let ids = self
            .sas_ids(&inner)
            .ok_or(VerificationError::InvalidState("start a SAS verification"))?;
        let (flow, public_key) = SasFlow::start(ids);

        let content = VerificationContent::Start(StartContent {
            from_device: self.store.own_device_id().to_owned(),
            method: StartMethod::SasV1 { public_key },
        });

        self.queue(&inner, content);
        inner.flow = Some(MethodFlow::Sas(flow));

        debug!(flow_id = ?self.flow_id, "Started a SAS verification");

        Ok(())
    }

    /// The short authentication string as three decimal numbers, available
    /// once both sides exchanged their keys.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        match &self.inner.lock().unwrap().flow {
            Some(MethodFlow::Sas(flow)) => flow.decimals(),
            _ => None,
        }
    }

    /// The short authentication string as seven indices into the emoji
    /// table.
    pub fn emoji_indices(&self) -> Option<[u8; 7]> {
        match &self.inner.lock().unwrap().flow {
            Some(MethodFlow::Sas(flow)) => flow.emoji_indices(),
            _ => None,
        }
    }

    /// Generate the data for a QR code the other device can scan.
    pub fn generate_qr_code(&self) -> VerificationResult<QrVerificationData> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(MethodFlow::QrShown { data, .. }) = &inner.flow {
            return Ok(data.clone());
        }

        if inner.state != VerificationTxState::Ready
            || inner.flow.is_some()
            || !self.can(&inner, VerificationMethod::QrCodeShowV1, VerificationMethod::QrCodeScanV1)
        {
            return Err(self.invalid_state(&inner, "show a QR code"));
        }

        let other_device = self.other_device(&inner)?;
        let data = qrcode::generate(self.flow_id.clone(), &self.store.own_device, &other_device)?;

        inner.flow = Some(MethodFlow::QrShown { data: data.clone(), scanned: false });

        Ok(data)
    }

    /// Check a QR code we scanned from the other device and tell it that we
    /// scanned it.
    pub fn scan_qr_code(&self, data: &QrVerificationData) -> VerificationResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.state != VerificationTxState::Ready
            || inner.flow.is_some()
            || !self.can(&inner, VerificationMethod::QrCodeScanV1, VerificationMethod::QrCodeShowV1)
        {
            return Err(self.invalid_state(&inner, "scan a QR code"));
        }

        let other_device = self.other_device(&inner)?;

        if let Err(code) =
            qrcode::check_scanned(data, &self.flow_id, &self.store.own_device, &other_device)
        {
            warn!(flow_id = ?self.flow_id, %code, "The scanned QR code doesn't match");
            self.cancel_locked(&mut inner, code);
            return Err(VerificationError::Cancelled(code));
        }

        let content = VerificationContent::Start(StartContent {
            from_device: self.store.own_device_id().to_owned(),
            method: StartMethod::ReciprocateV1 { secret: data.secret.clone() },
        });

        self.queue(&inner, content);

        inner.flow = Some(MethodFlow::QrScanned);
        inner.state = VerificationTxState::Accepted;
        inner.confirmed = true;
        inner.peer_verified = true;
        self.maybe_done(&mut inner);

        Ok(())
    }

    /// Confirm that the other side is who it claims to be.
    ///
    /// For a SAS verification this means the short authentication strings
    /// match, for a QR code we showed that the other device scanned it.
    pub fn confirm(&self) -> VerificationResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.state != VerificationTxState::Accepted {
            return Err(self.invalid_state(&inner, "confirm"));
        }

        if inner.confirmed {
            return Ok(());
        }

        let mac = match &inner.flow {
            Some(MethodFlow::Sas(flow)) => {
                Some(flow.mac_content(self.store.own_device.ed25519_key()).ok_or(
                    VerificationError::InvalidState("confirm the short authentication string"),
                )?)
            }
            Some(MethodFlow::QrShown { scanned: true, .. }) => None,
            _ => return Err(VerificationError::InvalidState("confirm")),
        };

        match mac {
            Some(mac) => self.queue(&inner, VerificationContent::Mac(mac)),
            // The other device proved that it scanned our code, its key was
            // part of it.
            None => inner.peer_verified = true,
        }

        info!(flow_id = ?self.flow_id, "The verification was confirmed by the user");

        inner.confirmed = true;
        self.maybe_done(&mut inner);

        Ok(())
    }

    /// Tell the other side that the short authentication strings don't match.
    pub fn mismatch(&self) {
        self.cancel_with_code(CancelCode::MismatchedSas);
    }

    /// Cancel the verification, this is a no-op if the verification already
    /// finished.
    pub fn cancel(&self) {
        self.cancel_with_code(CancelCode::User);
    }

    /// Cancel the verification with the given code.
    pub fn cancel_with_code(&self, code: CancelCode) {
        let mut inner = self.inner.lock().unwrap();
        self.cancel_locked(&mut inner, code);
    }

    /// Cancel the verification if it timed out, returns true if it did.
    pub(crate) fn cancel_if_timed_out(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if !inner.state.is_terminal() && self.timed_out() {
            debug!(flow_id = ?self.flow_id, "The verification timed out");
            self.cancel_locked(&mut inner, CancelCode::Timeout);
            true
        } else {
            false
        }
    }

    /// Is this a live verification with the given device, a request we sent
    /// to all the devices of a user matches any of them.
    pub(crate) fn is_live_with(&self, user_id: &UserId, device_id: Option<&DeviceId>) -> bool {
        let inner = self.inner.lock().unwrap();

        !inner.state.is_terminal()
            && self.other_user_id == user_id
            && match (inner.other_device_id.as_deref(), device_id) {
                (Some(ours), Some(theirs)) => ours == theirs,
                _ => true,
            }
    }

    #[instrument(skip_all, fields(
        flow_id = ?self.flow_id,
        event_type = content.event_type(),
    ))]
    pub(crate) fn receive(&self, content: &VerificationContent) {
        let mut inner = self.inner.lock().unwrap();

        if let VerificationContent::Cancel(cancel) = content {
            if inner.state.is_terminal() {
                trace!("Received a cancellation for a finished verification, ignoring");
            } else {
                info!(
                    code = %cancel.code,
                    reason = cancel.reason.as_str(),
                    "The other side cancelled the verification"
                );
                inner.state = VerificationTxState::Cancelled(CancelInfo::new(false, cancel.code));
            }

            return;
        }

        if inner.state.is_terminal() {
            if inner.state == VerificationTxState::Done && *content == VerificationContent::Done {
                trace!("Received a duplicate done message, ignoring");
            } else {
                warn!("Received a message for a finished verification");
                let cancel = CancelContent::new(CancelCode::UnexpectedMessage);
                self.queue(&inner, VerificationContent::Cancel(cancel));
            }

            return;
        }

        let result = match content {
            VerificationContent::Ready(c) => self.receive_ready(&mut inner, c),
            VerificationContent::Start(c) => self.receive_start(&mut inner, c),
            VerificationContent::Accept(c) => self.receive_accept(&mut inner, c),
            VerificationContent::Mac(c) => self.receive_mac(&mut inner, c),
            VerificationContent::Done => self.receive_done(&mut inner),
            VerificationContent::Request(_) | VerificationContent::Cancel(_) => {
                Err(CancelCode::UnexpectedMessage)
            }
        };

        if let Err(code) = result {
            warn!(%code, "Cancelling the verification");
            self.cancel_locked(&mut inner, code);
        }
    }

    fn receive_ready(
        &self,
        inner: &mut InnerTransaction,
        content: &ReadyContent,
    ) -> Result<(), CancelCode> {
        if !self.we_started {
            return Err(CancelCode::UnexpectedMessage);
        }

        if inner.state != VerificationTxState::Requested {
            if inner.other_device_id.as_ref() == Some(&content.from_device) {
                return Err(CancelCode::UnexpectedMessage);
            }

            debug!(
                device_id = ?content.from_device,
                "Another device answered our request too late"
            );
            self.queue_to(
                Some(content.from_device.clone()),
                VerificationContent::Cancel(CancelContent::new(CancelCode::Accepted)),
            );

            return Ok(());
        }

        if let Some(device_id) = &inner.other_device_id {
            if device_id != &content.from_device {
                warn!(
                    device_id = ?content.from_device,
                    "A device we didn't ask answered our request"
                );
                self.queue_to(
                    Some(content.from_device.clone()),
                    VerificationContent::Cancel(CancelContent::new(CancelCode::UnexpectedMessage)),
                );

                return Ok(());
            }
        } else {
            // We asked all the devices of the user, tell the rest that this
            // device took over.
            for device in self.store.trust.get_user_devices(&self.other_user_id) {
                if *device.device_id() != *content.from_device
                    && !device.is(self.store.own_user_id(), self.store.own_device_id())
                {
                    self.queue_to(
                        Some(device.device_id().to_owned()),
                        VerificationContent::Cancel(CancelContent::new(CancelCode::Accepted)),
                    );
                }
            }
        }

        if !has_common_method(&self.our_methods, &content.methods) {
            return Err(CancelCode::UnknownMethod);
        }

        inner.other_device_id = Some(content.from_device.clone());
        inner.their_methods = content.methods.clone();
        inner.state = VerificationTxState::Ready;

        info!(device_id = ?content.from_device, "The other side accepted our request");

        Ok(())
    }

    fn receive_start(
        &self,
        inner: &mut InnerTransaction,
        content: &StartContent,
    ) -> Result<(), CancelCode> {
        if inner.state != VerificationTxState::Ready
            || inner.other_device_id.as_ref() != Some(&content.from_device)
        {
            return Err(CancelCode::UnexpectedMessage);
        }

        match &content.method {
            StartMethod::SasV1 { public_key } => {
                if !self.can(inner, VerificationMethod::SasV1, VerificationMethod::SasV1) {
                    return Err(CancelCode::UnknownMethod);
                }

                match &inner.flow {
                    None => {}
                    Some(MethodFlow::Sas(flow))
                        if flow.started_by_us() && !flow.is_established() =>
                    {
                        // Both sides started at the same time, the start of
                        // the side with the smaller ids wins.
                        let ours = (self.store.own_user_id(), self.store.own_device_id());
                        let theirs: (&UserId, &DeviceId) =
                            (&self.other_user_id, &content.from_device);

                        if ours < theirs {
                            debug!("Both sides started a SAS verification, keeping ours");
                            return Ok(());
                        }

                        debug!("Both sides started a SAS verification, accepting theirs");
                    }
                    Some(_) => return Err(CancelCode::UnexpectedMessage),
                }

                let ids = self.sas_ids(inner).ok_or(CancelCode::UnexpectedMessage)?;
                let (flow, public_key) = SasFlow::accept(ids, public_key)?;

                self.queue(inner, VerificationContent::Accept(AcceptContent { public_key }));

                inner.flow = Some(MethodFlow::Sas(flow));
                inner.state = VerificationTxState::Accepted;

                Ok(())
            }
            StartMethod::ReciprocateV1 { secret } => match &mut inner.flow {
                Some(MethodFlow::QrShown { data, scanned }) if !*scanned => {
                    qrcode::check_reciprocation(data, secret)?;

                    *scanned = true;
                    inner.state = VerificationTxState::Accepted;

                    info!("The other device scanned our QR code");

                    Ok(())
                }
                _ => Err(CancelCode::UnexpectedMessage),
            },
            StartMethod::Unknown => Err(CancelCode::UnknownMethod),
        }
    }

    fn receive_accept(
        &self,
        inner: &mut InnerTransaction,
        content: &AcceptContent,
    ) -> Result<(), CancelCode> {
        match &mut inner.flow {
            Some(MethodFlow::Sas(flow))
                if inner.state == VerificationTxState::Ready
                    && flow.started_by_us()
                    && !flow.is_established() =>
            {
                flow.establish(&content.public_key)?;
                inner.state = VerificationTxState::Accepted;

                debug!("The other side accepted our SAS verification");

                Ok(())
            }
            _ => Err(CancelCode::UnexpectedMessage),
        }
    }

    fn receive_mac(
        &self,
        inner: &mut InnerTransaction,
        content: &MacContent,
    ) -> Result<(), CancelCode> {
        if inner.state != VerificationTxState::Accepted || inner.peer_verified {
            return Err(CancelCode::UnexpectedMessage);
        }

        let Some(MethodFlow::Sas(flow)) = &inner.flow else {
            return Err(CancelCode::UnexpectedMessage);
        };

        let device = self.other_device(inner).map_err(|_| CancelCode::KeyMismatch)?;
        flow.verify_mac(device.ed25519_key(), content)?;

        debug!("The MAC of the other side matches the key of its device");

        inner.peer_verified = true;
        self.maybe_done(inner);

        Ok(())
    }

    fn receive_done(&self, inner: &mut InnerTransaction) -> Result<(), CancelCode> {
        if inner.state != VerificationTxState::Accepted || inner.done_received {
            return Err(CancelCode::UnexpectedMessage);
        }

        inner.done_received = true;
        self.maybe_done(inner);

        Ok(())
    }

    /// Send our done message once we're sure about the other device and
    /// finish the verification once both sides sent one.
    fn maybe_done(&self, inner: &mut InnerTransaction) {
        if inner.confirmed && inner.peer_verified && !inner.done_sent {
            self.queue(inner, VerificationContent::Done);
            inner.done_sent = true;
        }

        if inner.done_sent && inner.done_received && inner.state != VerificationTxState::Done {
            inner.state = VerificationTxState::Done;

            if let Some(device_id) = &inner.other_device_id {
                info!(
                    user_id = ?self.other_user_id,
                    ?device_id,
                    "Successfully finished the verification"
                );

                self.store.mark_device_as_verified(&self.other_user_id, device_id);
            }
        }
    }

    fn cancel_locked(&self, inner: &mut InnerTransaction, code: CancelCode) {
        if inner.state.is_terminal() {
            trace!(flow_id = ?self.flow_id, "Tried to cancel a finished verification");
            return;
        }

        info!(flow_id = ?self.flow_id, %code, "Cancelling the verification");

        inner.state = VerificationTxState::Cancelled(CancelInfo::new(true, code));
        self.queue(inner, VerificationContent::Cancel(CancelContent::new(code)));
    }

    fn can(
        &self,
        inner: &InnerTransaction,
        ours: VerificationMethod,
        theirs: VerificationMethod,
    ) -> bool {
        self.our_methods.contains(&ours) && inner.their_methods.contains(&theirs)
    }

    fn other_device(&self, inner: &InnerTransaction) -> VerificationResult<Device> {
        let device_id = inner
            .other_device_id
            .as_ref()
            .ok_or(VerificationError::InvalidState("verify a device we don't know yet"))?;

        self.store.get_device(&self.other_user_id, device_id).ok_or_else(|| {
            VerificationError::UnknownDevice {
                user_id: self.other_user_id.clone(),
                device_id: device_id.clone(),
            }
        })
    }

    fn sas_ids(&self, inner: &InnerTransaction) -> Option<SasIds> {
        Some(SasIds {
            own_user_id: self.store.own_user_id().to_owned(),
            own_device_id: self.store.own_device_id().to_owned(),
            other_user_id: self.other_user_id.clone(),
            other_device_id: inner.other_device_id.clone()?,
            flow_id: self.flow_id.clone(),
        })
    }

    fn invalid_state(&self, inner: &InnerTransaction, action: &'static str) -> VerificationError {
        match &inner.state {
            VerificationTxState::Cancelled(info) => {
                VerificationError::Cancelled(info.cancel_code())
            }
            _ => VerificationError::InvalidState(action),
        }
    }

    fn queue(&self, inner: &InnerTransaction, content: VerificationContent) {
        self.queue_to(inner.other_device_id.clone(), content);
    }

    fn queue_to(&self, recipient_device: Option<OwnedDeviceId>, content: VerificationContent) {
        self.outgoing.push(OutgoingVerificationMessage {
            request_id: TransactionId::new(),
            recipient: self.other_user_id.clone(),
            recipient_device,
            carrier: self.carrier,
            message: VerificationMessage { transaction_id: self.flow_id.clone(), content },
        });
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, TransactionId};
    use similar_asserts::assert_eq;

    use super::VerificationTransaction;
    use crate::{
        config::VerificationSettings,
        error::VerificationError,
        store::tests::device,
        types::{CancelCode, VerificationContent, VerificationMethod, VerificationTxState},
        verification::{
            machine::tests::{
                alice_device_id, alice_id, bob_device_id, bob_id, exchange, machine, machines,
                settle,
            },
            CarrierKind, VerificationMachine,
        },
    };

    /// Alice requests a verification with Bob and Bob accepts it.
    fn ready_transactions(
        alice: &VerificationMachine,
        bob: &VerificationMachine,
    ) -> (VerificationTransaction, VerificationTransaction) {
        let alice_transaction = alice
            .request_verification(bob_id(), Some(bob_device_id()), CarrierKind::ToDevice)
            .unwrap();
        exchange(alice, bob);

        let bob_transaction = bob.get_transaction(alice_id(), alice_transaction.flow_id()).unwrap();
        bob_transaction.accept().unwrap();
        exchange(bob, alice);

        assert_eq!(alice_transaction.state(), VerificationTxState::Ready);
        assert_eq!(bob_transaction.state(), VerificationTxState::Ready);

        (alice_transaction, bob_transaction)
    }

    fn cancel_code(transaction: &VerificationTransaction) -> Option<CancelCode> {
        transaction.cancel_info().map(|i| i.cancel_code())
    }

    #[test]
    fn sas_verification() {
        let (alice, bob) = machines();
        let (alice_transaction, bob_transaction) = ready_transactions(&alice, &bob);

        assert_eq!(alice_transaction.decimals(), None);

        alice_transaction.start_sas().unwrap();
        exchange(&alice, &bob);
        assert_eq!(bob_transaction.state(), VerificationTxState::Accepted);

        exchange(&bob, &alice);
        assert_eq!(alice_transaction.state(), VerificationTxState::Accepted);

        assert!(alice_transaction.decimals().is_some());
        assert_eq!(alice_transaction.decimals(), bob_transaction.decimals());
        assert_eq!(alice_transaction.emoji_indices(), bob_transaction.emoji_indices());

        alice_transaction.confirm().unwrap();
        settle(&alice, &bob);
        assert!(!alice_transaction.is_done());

        bob_transaction.confirm().unwrap();
        settle(&alice, &bob);

        assert!(alice_transaction.is_done());
        assert!(bob_transaction.is_done());
        assert!(alice.store.trust.is_trusted(bob_id(), bob_device_id()));
        assert!(bob.store.trust.is_trusted(alice_id(), alice_device_id()));

        // Late cancellations don't change a finished verification.
        alice_transaction.cancel();
        assert!(alice_transaction.is_done());
        assert!(alice.outgoing_messages().is_empty());
    }

    #[test]
    fn mac_mismatch_cancels() {
        let alice_device = device(alice_id(), alice_device_id());
        let bob_device = device(bob_id(), bob_device_id());
        // Bob has a different key for Alice's device.
        let impostor = device(alice_id(), alice_device_id());

        let alice = machine(&alice_device, &[&bob_device], VerificationSettings::default());
        let bob = machine(&bob_device, &[&impostor], VerificationSettings::default());

        let (alice_transaction, bob_transaction) = ready_transactions(&alice, &bob);

        alice_transaction.start_sas().unwrap();
        settle(&alice, &bob);

        alice_transaction.confirm().unwrap();
        exchange(&alice, &bob);

        let info = bob_transaction.cancel_info().unwrap();
        assert!(info.cancelled_by_us());
        assert_eq!(info.cancel_code(), CancelCode::KeyMismatch);

        exchange(&bob, &alice);
        let info = alice_transaction.cancel_info().unwrap();
        assert!(!info.cancelled_by_us());
        assert_eq!(info.cancel_code(), CancelCode::KeyMismatch);

        assert!(!bob.store.trust.is_trusted(alice_id(), alice_device_id()));
        assert!(!alice.store.trust.is_trusted(bob_id(), bob_device_id()));
    }

    #[test]
    fn sas_mismatch() {
        let (alice, bob) = machines();
        let (alice_transaction, bob_transaction) = ready_transactions(&alice, &bob);

        alice_transaction.start_sas().unwrap();
        settle(&alice, &bob);

        bob_transaction.mismatch();
        settle(&alice, &bob);

        assert_eq!(cancel_code(&alice_transaction), Some(CancelCode::MismatchedSas));
        assert_matches!(alice_transaction.confirm(), Err(VerificationError::Cancelled(_)));
    }

    #[test]
    fn simultaneous_sas_starts() {
        let (alice, bob) = machines();
        let (alice_transaction, bob_transaction) = ready_transactions(&alice, &bob);

        alice_transaction.start_sas().unwrap();
        bob_transaction.start_sas().unwrap();
        settle(&alice, &bob);

        assert_eq!(alice_transaction.state(), VerificationTxState::Accepted);
        assert_eq!(bob_transaction.state(), VerificationTxState::Accepted);
        assert!(alice_transaction.decimals().is_some());
        assert_eq!(alice_transaction.decimals(), bob_transaction.decimals());

        alice_transaction.confirm().unwrap();
        bob_transaction.confirm().unwrap();
        settle(&alice, &bob);

        assert!(alice_transaction.is_done());
        assert!(bob_transaction.is_done());
    }

    #[test]
    fn qr_code_verification() {
        let (alice, bob) = machines();
        let (alice_transaction, bob_transaction) = ready_transactions(&alice, &bob);

        let data = alice_transaction.generate_qr_code().unwrap();
        assert_eq!(alice_transaction.generate_qr_code().unwrap(), data);

        bob_transaction.scan_qr_code(&data).unwrap();
        exchange(&bob, &alice);
        assert_eq!(alice_transaction.state(), VerificationTxState::Accepted);

        alice_transaction.confirm().unwrap();
        settle(&alice, &bob);

        assert!(alice_transaction.is_done());
        assert!(bob_transaction.is_done());
        assert!(alice.store.trust.is_trusted(bob_id(), bob_device_id()));
        assert!(bob.store.trust.is_trusted(alice_id(), alice_device_id()));
    }

    #[test]
    fn qr_code_with_a_wrong_secret() {
        let (alice, bob) = machines();
        let (alice_transaction, bob_transaction) = ready_transactions(&alice, &bob);

        let mut data = alice_transaction.generate_qr_code().unwrap();
        data.secret = "AAAAAAAAAAA".to_owned();

        bob_transaction.scan_qr_code(&data).unwrap();
        exchange(&bob, &alice);

        assert_eq!(cancel_code(&alice_transaction), Some(CancelCode::KeyMismatch));

        exchange(&alice, &bob);
        assert_eq!(cancel_code(&bob_transaction), Some(CancelCode::KeyMismatch));
        assert!(!bob.store.trust.is_trusted(alice_id(), alice_device_id()));
    }

    #[test]
    fn scanning_a_foreign_qr_code() {
        let (alice, bob) = machines();
        let (alice_transaction, bob_transaction) = ready_transactions(&alice, &bob);

        let mut data = alice_transaction.generate_qr_code().unwrap();
        data.device_key = device(alice_id(), alice_device_id()).ed25519_key().to_base64();

        assert_matches!(
            bob_transaction.scan_qr_code(&data),
            Err(VerificationError::Cancelled(CancelCode::KeyMismatch))
        );

        exchange(&bob, &alice);
        assert_eq!(cancel_code(&alice_transaction), Some(CancelCode::KeyMismatch));
    }

    #[test]
    fn no_common_method() {
        let alice_device = device(alice_id(), alice_device_id());
        let bob_device = device(bob_id(), bob_device_id());

        let alice = machine(
            &alice_device,
            &[&bob_device],
            VerificationSettings::new().methods(vec![VerificationMethod::SasV1]),
        );
        let bob = machine(
            &bob_device,
            &[&alice_device],
            VerificationSettings::new().methods(vec![VerificationMethod::QrCodeShowV1]),
        );

        let alice_transaction = alice
            .request_verification(bob_id(), Some(bob_device_id()), CarrierKind::ToDevice)
            .unwrap();
        exchange(&alice, &bob);

        let bob_transaction = bob.get_transaction(alice_id(), alice_transaction.flow_id()).unwrap();
        assert_matches!(
            bob_transaction.accept(),
            Err(VerificationError::Cancelled(CancelCode::UnknownMethod))
        );

        exchange(&bob, &alice);
        assert_eq!(cancel_code(&alice_transaction), Some(CancelCode::UnknownMethod));
    }

    #[test]
    fn out_of_order_messages_cancel() {
        let (alice, bob) = machines();
        let (alice_transaction, bob_transaction) = ready_transactions(&alice, &bob);

        // Confirming before anything was started isn't possible.
        assert_matches!(alice_transaction.confirm(), Err(VerificationError::InvalidState(_)));

        bob.receive_message(
            CarrierKind::ToDevice,
            alice_id(),
            &crate::types::VerificationMessage {
                transaction_id: alice_transaction.flow_id().to_owned(),
                content: VerificationContent::Done,
            },
        );

        assert_eq!(cancel_code(&bob_transaction), Some(CancelCode::UnexpectedMessage));
        assert!(bob.get_transaction(alice_id(), &TransactionId::new()).is_none());
    }

    #[test]
    fn other_devices_are_told_when_one_accepts() {
        let alice_device = device(alice_id(), alice_device_id());
        let second_device = device(alice_id(), device_id!("ALICEDEVICE2"));
        let third_device = device(alice_id(), device_id!("ALICEDEVICE3"));
        let devices = [&alice_device, &second_device, &third_device];

        let alice = machine(&alice_device, &devices, VerificationSettings::default());
        let second = machine(&second_device, &devices, VerificationSettings::default());

        let transaction =
            alice.request_verification(alice_id(), None, CarrierKind::ToDevice).unwrap();
        assert!(transaction.is_self_verification());
        exchange(&alice, &second);

        second.get_transaction(alice_id(), transaction.flow_id()).unwrap().accept().unwrap();
        exchange(&second, &alice);

        assert_eq!(transaction.state(), VerificationTxState::Ready);
        assert_eq!(transaction.other_device_id().as_deref(), Some(second_device.device_id()));

        let outgoing = alice.outgoing_messages();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].recipient_device.as_deref(), Some(third_device.device_id()));
        let cancel = assert_matches!(
            &outgoing[0].message.content,
            VerificationContent::Cancel(cancel) => cancel
        );
        assert_eq!(cancel.code, CancelCode::Accepted);
    }
}
