use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::common::error::TradewindError;
use crate::common::types::{NodeAddress, TradeRole};
use crate::common::utils::now_ms;
use crate::delivery::{InboundMessage, SendOutcome};
use crate::message::{TradeMessage, TradeMessageBody};
use crate::protocol::model::ProtocolModel;
use crate::protocol::roles::{self, TradeEvent};
use crate::sched::{ExecutorAccess, Timer};
use crate::task::{PipelineFailure, TaskRunner};
use crate::trade::data::TradeData;
use crate::trade::{CancelState, TradePhase};

/// State change notifications pushed to a registered observer.
#[derive(Clone, Debug)]
pub enum TradeNotif {
    PhaseChanged(TradePhase),
    CancelRequestedByPeer { reason: String },
    CancelAccepted,
    CancelRejected { reason: String },
    Failed { error: String },
}

/// Read-only view of a trade's current state.
#[derive(Clone, Debug)]
pub struct TradeSnapshot {
    pub id: String,
    pub role: TradeRole,
    pub phase: TradePhase,
    pub cancel_state: CancelState,
    pub deposit_tx_id: Option<String>,
    pub payout_tx_id: Option<String>,
    pub peer_address: Option<NodeAddress>,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct TradeProtocolAccess {
    tx: mpsc::Sender<ProtocolRequest>,
}

impl TradeProtocolAccess {
    pub(super) fn new(tx: mpsc::Sender<ProtocolRequest>) -> Self {
        Self { tx }
    }

    pub async fn take_offer(&self) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = ProtocolRequest::TakeOffer { rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub async fn confirm_fiat_sent(&self) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = ProtocolRequest::ConfirmFiatSent { rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub async fn confirm_payment_received(&self) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = ProtocolRequest::ConfirmPaymentReceived { rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub async fn request_cancel(&self, reason: impl Into<String>) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = ProtocolRequest::RequestCancel {
            reason: reason.into(),
            rsp_tx,
        };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub async fn respond_cancel(
        &self,
        accept: bool,
        reason: impl Into<String>,
    ) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = ProtocolRequest::RespondCancel {
            accept,
            reason: reason.into(),
            rsp_tx,
        };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub async fn query_state(&self) -> TradeSnapshot {
        let (rsp_tx, rsp_rx) = oneshot::channel::<TradeSnapshot>();
        let request = ProtocolRequest::QueryState { rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub async fn register_notif_tx(
        &self,
        tx: mpsc::Sender<TradeNotif>,
    ) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = ProtocolRequest::RegisterNotifTx { tx, rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub async fn unregister_notif_tx(&self) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = ProtocolRequest::UnregisterNotifTx { rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    /// Heartbeat hook: re-check the outstanding response deadline against
    /// wall-clock time, in case the timer substrate stalled.
    pub async fn revalidate_timeouts(&self) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = ProtocolRequest::RevalidateTimeouts { rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub async fn shutdown(&self) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = ProtocolRequest::Shutdown { rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }
}

pub(crate) struct TradeProtocol {
    tx: mpsc::Sender<ProtocolRequest>,
    pub task_handle: tokio::task::JoinHandle<()>,
}

impl TradeProtocol {
    const REQUEST_CHANNEL_SIZE: usize = 100;

    pub(crate) fn new(
        model: ProtocolModel,
        data: TradeData,
        msg_rx: mpsc::Receiver<InboundMessage>,
        executor: ExecutorAccess,
        step_timeout: Duration,
        resend_limit: u32,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<ProtocolRequest>(Self::REQUEST_CHANNEL_SIZE);
        let actor = ProtocolActor::new(rx, model, data, msg_rx, executor, step_timeout, resend_limit);
        let task_handle = tokio::spawn(async move { actor.run().await });
        Self { tx, task_handle }
    }

    pub(crate) fn new_accessor(&self) -> TradeProtocolAccess {
        TradeProtocolAccess::new(self.tx.clone())
    }
}

pub(super) enum ProtocolRequest {
    TakeOffer {
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    ConfirmFiatSent {
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    ConfirmPaymentReceived {
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    RequestCancel {
        reason: String,
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    RespondCancel {
        accept: bool,
        reason: String,
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    QueryState {
        rsp_tx: oneshot::Sender<TradeSnapshot>,
    },
    RegisterNotifTx {
        tx: mpsc::Sender<TradeNotif>,
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    UnregisterNotifTx {
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    RevalidateTimeouts {
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    Shutdown {
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
}

/// An armed response deadline. The id guards against a stale timer firing
/// after the expectation it belonged to was already satisfied or replaced.
struct Expectation {
    id: u64,
    deadline_ms: u64,
    resends_used: u32,
    timer: Timer,
}

struct ProtocolActor {
    rx: mpsc::Receiver<ProtocolRequest>,
    msg_rx: mpsc::Receiver<InboundMessage>,
    timeout_tx: mpsc::UnboundedSender<u64>,
    timeout_rx: mpsc::UnboundedReceiver<u64>,
    model: ProtocolModel,
    data: TradeData,
    executor: ExecutorAccess,
    step_timeout: Duration,
    resend_limit: u32,
    expectation: Option<Expectation>,
    next_expectation_id: u64,
    notif_tx: Option<mpsc::Sender<TradeNotif>>,
    detached: bool,
}

impl ProtocolActor {
    fn new(
        rx: mpsc::Receiver<ProtocolRequest>,
        model: ProtocolModel,
        data: TradeData,
        msg_rx: mpsc::Receiver<InboundMessage>,
        executor: ExecutorAccess,
        step_timeout: Duration,
        resend_limit: u32,
    ) -> Self {
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel::<u64>();
        ProtocolActor {
            rx,
            msg_rx,
            timeout_tx,
            timeout_rx,
            model,
            data,
            executor,
            step_timeout,
            resend_limit,
            expectation: None,
            next_expectation_id: 0,
            notif_tx: None,
            detached: false,
        }
    }

    async fn run(mut self) {
        // A restored trade may still owe a reply to its last outbound
        // message; re-arm the deadline so escalation survives the restart.
        if self.model.process.last_outbound.is_some() && !self.model.trade.phase().is_terminal() {
            self.arm_expectation(0);
        }

        // Request handling main event loop
        // !!! This function will end if no Sender remains for the Receiver
        loop {
            select! {
                Some(request) = self.rx.recv() => {
                    if self.handle_request(request).await {
                        break;
                    }
                },
                Some(inbound) = self.msg_rx.recv() => {
                    self.handle_inbound(inbound).await;
                },
                Some(expectation_id) = self.timeout_rx.recv() => {
                    self.handle_timeout(expectation_id).await;
                },
                else => break,
            }
        }

        self.disarm_expectation();
        info!("Trade protocol {} terminating", self.model.trade.id);
        if let Err(error) = self.data.terminate().await {
            error!("Trade data store failed to terminate - {}", error);
        }
    }

    async fn handle_request(&mut self, request: ProtocolRequest) -> bool {
        let mut terminate = false;

        match request {
            ProtocolRequest::TakeOffer { rsp_tx } => {
                let result = self.run_event(TradeEvent::TakeOffer).await;
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            ProtocolRequest::ConfirmFiatSent { rsp_tx } => {
                let result = self.run_event(TradeEvent::ConfirmFiatSent).await;
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            ProtocolRequest::ConfirmPaymentReceived { rsp_tx } => {
                let result = self.run_event(TradeEvent::ConfirmPaymentReceived).await;
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            ProtocolRequest::RequestCancel { reason, rsp_tx } => {
                let prior_reason = self.model.process.cancel_reason.replace(reason);
                let result = self.run_event(TradeEvent::RequestCancel).await;
                if result.is_err() {
                    // A refused request leaves no reason behind.
                    self.model.process.cancel_reason = prior_reason;
                }
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            ProtocolRequest::RespondCancel {
                accept,
                reason,
                rsp_tx,
            } => {
                let result = if self.model.trade.cancel_state() != CancelState::RequestedByPeer {
                    Err(TradewindError::InvalidPhase(format!(
                        "trade {} has no pending peer cancel request",
                        self.model.trade.id
                    )))
                } else {
                    if !accept {
                        self.model.process.cancel_reason = Some(reason);
                    }
                    self.run_event(TradeEvent::RespondCancel { accept }).await
                };
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            ProtocolRequest::QueryState { rsp_tx } => {
                rsp_tx.send(self.snapshot()).unwrap(); // oneshot should never fail
            }

            ProtocolRequest::RegisterNotifTx { tx, rsp_tx } => {
                let result = if self.notif_tx.is_some() {
                    Err(TradewindError::Simple(format!(
                        "trade {} already has a notif tx registered",
                        self.model.trade.id
                    )))
                } else {
                    self.notif_tx = Some(tx);
                    Ok(())
                };
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            ProtocolRequest::UnregisterNotifTx { rsp_tx } => {
                let mut result = Ok(());
                if self.notif_tx.is_none() {
                    result = Err(TradewindError::Simple(format!(
                        "trade {} has no notif tx registered",
                        self.model.trade.id
                    )));
                }
                self.notif_tx = None;
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            ProtocolRequest::RevalidateTimeouts { rsp_tx } => {
                self.revalidate_timeouts().await;
                rsp_tx.send(Ok(())).unwrap(); // oneshot should never fail
            }

            ProtocolRequest::Shutdown { rsp_tx } => {
                rsp_tx.send(Ok(())).unwrap(); // oneshot should never fail
                terminate = true;
            }
        }
        terminate
    }

    // UI/operator command path

    async fn run_event(&mut self, event: TradeEvent) -> Result<(), TradewindError> {
        let phase = self.model.trade.phase();
        let cancel_pending = matches!(
            self.model.trade.cancel_state(),
            CancelState::RequestedByMe | CancelState::RequestedByPeer
        );
        if cancel_pending && !event.is_cancel_related() {
            return Err(TradewindError::InvalidPhase(format!(
                "trade {} has a cancel request pending resolution",
                self.model.trade.id
            )));
        }

        let runner = roles::pipeline_for(self.model.trade.role, &event, phase).ok_or_else(|| {
            TradewindError::InvalidPhase(format!(
                "no {} handling for trade {} as {} in phase {}",
                event.name(),
                self.model.trade.id,
                self.model.trade.role,
                phase
            ))
        })?;
        self.run_pipeline(runner, event.is_cancel_related()).await
    }

    // Inbound message path

    async fn handle_inbound(&mut self, inbound: InboundMessage) {
        let message = inbound.message;
        let trade_id = self.model.trade.id.clone();

        if let Err(error) = message.validate_for(&trade_id) {
            warn!("Trade {} dropping inbound message - {}", trade_id, error);
            return;
        }

        // Duplicate redelivery is acknowledged as consumed, never re-applied.
        if self.model.process.already_applied(&message.uid) {
            debug!(
                "Trade {} already applied {} with uid {}",
                trade_id,
                message.kind(),
                message.uid
            );
            if inbound.via_mailbox {
                self.send_ack(&message.uid).await;
            }
            return;
        }

        if let TradeMessageBody::Ack { acked_uid } = &message.body {
            debug!(
                "Trade {} peer consumed mailbox message {}",
                trade_id, acked_uid
            );
            self.model.process.note_applied(message.uid.clone());
            return;
        }

        if !self.verify_sender(&inbound.sender_sig_pubkey, &inbound.sender_address, &message) {
            return;
        }

        // Simultaneous cancel race: the lexicographically lower address's
        // request stands, the higher one's is dropped.
        if matches!(message.body, TradeMessageBody::RequestCancelTrade { .. })
            && self.model.trade.cancel_state() == CancelState::RequestedByMe
        {
            if let Ok(peer_address) = self.model.peer_address() {
                if self.model.my_node_address < peer_address {
                    debug!(
                        "Trade {} dropping peer cancel request, ours wins the tie-break",
                        trade_id
                    );
                    self.model.process.note_applied(message.uid.clone());
                    self.persist().await;
                    if inbound.via_mailbox {
                        self.send_ack(&message.uid).await;
                    }
                    return;
                }
            }
            // Tie-break lost: the peer's request supersedes ours, so stop
            // waiting on a reply to our own.
            debug!(
                "Trade {} peer cancel request supersedes ours in the tie-break",
                trade_id
            );
            self.disarm_expectation();
            self.model.process.last_outbound = None;
        }

        // A message satisfying the outstanding expectation stops its timer
        // before any pipeline runs, so a late fire cannot double-apply.
        if let Some((_, outbound)) = &self.model.process.last_outbound {
            if reply_satisfies(&outbound.body, &message.body) {
                self.disarm_expectation();
                self.model.process.last_outbound = None;
            }
        }

        let event = TradeEvent::Inbound(message.body.clone());
        let phase = self.model.trade.phase();
        let runner = match roles::pipeline_for(self.model.trade.role, &event, phase) {
            Some(runner) => runner,
            None => {
                warn!(
                    "Trade {} dropping {} not valid in phase {}",
                    trade_id,
                    message.kind(),
                    phase
                );
                return;
            }
        };

        let uid = message.uid.clone();
        self.model.process.last_message = Some(message);
        let result = self.run_pipeline(runner, event.is_cancel_related()).await;
        self.model.process.last_message = None;

        if result.is_ok() {
            self.model.process.note_applied(uid.clone());
            self.persist().await;
            if inbound.via_mailbox {
                self.send_ack(&uid).await;
            }
        }
    }

    /// Once a contract is signed the peer's signing key and address are
    /// pinned; anything else is an impersonation attempt and is dropped.
    fn verify_sender(
        &mut self,
        sender_sig_pubkey: &secp256k1::XOnlyPublicKey,
        sender_address: &Option<NodeAddress>,
        message: &TradeMessage,
    ) -> bool {
        let trade_id = &self.model.trade.id;
        if let Some(contract) = self.model.trade.contract() {
            let peer = contract.peer_pub_key_ring(self.model.trade.role);
            if *sender_sig_pubkey != peer.sig_pubkey {
                warn!(
                    "Trade {} dropping {} signed by a key other than the contract peer's",
                    trade_id,
                    message.kind()
                );
                return false;
            }
            if let Some(address) = sender_address {
                if !contract.peer_address_matches(self.model.trade.role, address) {
                    warn!(
                        "Trade {} dropping {} from address {} not matching the contract",
                        trade_id,
                        message.kind(),
                        address
                    );
                    return false;
                }
            }
            true
        } else {
            if self.model.trade.role.is_taker()
                && *sender_sig_pubkey != self.model.offer.maker_pub_key_ring.sig_pubkey
            {
                warn!(
                    "Trade {} dropping {} not signed by the offer maker",
                    trade_id,
                    message.kind()
                );
                return false;
            }
            if let Some(address) = sender_address {
                self.model.process.temp_peer_address = Some(address.clone());
            }
            true
        }
    }

    // Pipeline execution and fault handling

    async fn run_pipeline(
        &mut self,
        runner: TaskRunner<ProtocolModel>,
        is_cancel: bool,
    ) -> Result<(), TradewindError> {
        let prior_phase = self.model.trade.phase();
        let prior_cancel = self.model.trade.cancel_state();
        let prior_outbound_uid = self
            .model
            .process
            .last_outbound
            .as_ref()
            .map(|(_, m)| m.uid.clone());

        match runner.run(&mut self.model).await {
            Ok(()) => {
                self.after_pipeline(prior_phase, prior_cancel, prior_outbound_uid)
                    .await;
                Ok(())
            }
            Err(failure) => {
                self.handle_pipeline_fault(failure, is_cancel, prior_cancel)
                    .await
            }
        }
    }

    async fn after_pipeline(
        &mut self,
        prior_phase: TradePhase,
        prior_cancel: CancelState,
        prior_outbound_uid: Option<String>,
    ) {
        let cancel_now = self.model.trade.cancel_state();
        if cancel_now != prior_cancel {
            match cancel_now {
                CancelState::RequestedByPeer => {
                    let reason = self.model.process.cancel_reason.clone().unwrap_or_default();
                    self.notify(TradeNotif::CancelRequestedByPeer { reason })
                        .await;
                }
                CancelState::Accepted => self.notify(TradeNotif::CancelAccepted).await,
                CancelState::Rejected => {
                    let reason = self.model.process.cancel_reason.clone().unwrap_or_default();
                    self.notify(TradeNotif::CancelRejected { reason }).await;
                    // Rejection resumes the normal flow.
                    if let Err(error) = self.model.trade.set_cancel_state(CancelState::None) {
                        warn!(
                            "Trade {} could not reset cancel state - {}",
                            self.model.trade.id, error
                        );
                    }
                    self.model.process.cancel_reason = None;
                }
                _ => {}
            }
        }

        let phase_now = self.model.trade.phase();
        if phase_now != prior_phase {
            info!(
                "Trade {} advanced from {} to {}",
                self.model.trade.id, prior_phase, phase_now
            );
            self.notify(TradeNotif::PhaseChanged(phase_now)).await;
        }

        self.persist().await;

        let outbound_uid = self
            .model
            .process
            .last_outbound
            .as_ref()
            .map(|(_, m)| m.uid.clone());
        if outbound_uid.is_some() && outbound_uid != prior_outbound_uid {
            self.arm_expectation(0);
        }

        if phase_now.is_terminal() {
            self.disarm_expectation();
            self.detach_delivery().await;
        }
    }

    /// The single fault path for every pipeline: log, mark the trade failed
    /// (or revert the cancel sub-state for cancel pipelines), persist. Never
    /// retries.
    async fn handle_pipeline_fault(
        &mut self,
        failure: PipelineFailure,
        is_cancel: bool,
        prior_cancel: CancelState,
    ) -> Result<(), TradewindError> {
        error!("Trade {} {}", self.model.trade.id, failure);

        if is_cancel {
            if let Err(error) = self.model.trade.set_cancel_state(prior_cancel) {
                warn!(
                    "Trade {} could not revert cancel state - {}",
                    self.model.trade.id, error
                );
            }
        } else {
            self.model.trade.fail(failure.to_string());
            self.disarm_expectation();
            self.notify(TradeNotif::Failed {
                error: failure.to_string(),
            })
            .await;
            self.detach_delivery().await;
        }

        self.persist().await;
        Err(TradewindError::Simple(failure.to_string()))
    }

    // Response timeouts

    fn arm_expectation(&mut self, resends_used: u32) {
        self.disarm_expectation();
        self.next_expectation_id += 1;
        let id = self.next_expectation_id;
        let tx = self.timeout_tx.clone();
        let timer = self.executor.run_after(self.step_timeout, move || {
            let _ = tx.send(id);
        });
        self.expectation = Some(Expectation {
            id,
            deadline_ms: now_ms() + self.step_timeout.as_millis() as u64,
            resends_used,
            timer,
        });
    }

    fn disarm_expectation(&mut self) {
        if let Some(expectation) = self.expectation.take() {
            expectation.timer.stop();
        }
    }

    async fn handle_timeout(&mut self, expectation_id: u64) {
        let (resends_used, carries) = match &self.expectation {
            Some(expectation) if expectation.id == expectation_id => (
                expectation.resends_used,
                self.model.process.last_outbound.clone(),
            ),
            // Stale fire from an already satisfied or replaced expectation.
            _ => return,
        };

        let Some((address, message)) = carries else {
            // The expectation outlived its outbound message; nothing left to
            // chase a reply for.
            self.disarm_expectation();
            return;
        };

        if resends_used < self.resend_limit {
            warn!(
                "Trade {} timed out waiting for a reply to {}; resending with the same uid",
                self.model.trade.id,
                message.kind()
            );
            let keys = match self.model.peer_pub_key_ring() {
                Ok(keys) => keys,
                Err(error) => {
                    self.fault_timeout(error.to_string()).await;
                    return;
                }
            };
            match self
                .model
                .delivery
                .send_message(address, keys, message, true)
                .await
            {
                Ok(SendOutcome::Failed(reason)) => self.fault_timeout(reason).await,
                Ok(_) => self.arm_expectation(resends_used + 1),
                Err(error) => self.fault_timeout(error.to_string()).await,
            }
            return;
        }

        self.fault_timeout(format!("no reply to {} after resend", message.kind()))
            .await;
    }

    async fn fault_timeout(&mut self, detail: String) {
        self.disarm_expectation();

        let was_cancel_request = matches!(
            self.model.process.last_outbound,
            Some((_, TradeMessage {
                body: TradeMessageBody::RequestCancelTrade { .. },
                ..
            }))
        );
        self.model.process.last_outbound = None;

        if was_cancel_request {
            // An unanswered cancel request reverts; the trade itself goes on.
            warn!(
                "Trade {} cancel request went unanswered - {}",
                self.model.trade.id, detail
            );
            if let Err(error) = self.model.trade.set_cancel_state(CancelState::None) {
                warn!(
                    "Trade {} could not reset cancel state - {}",
                    self.model.trade.id, error
                );
            }
            self.model.process.cancel_reason = None;
            self.notify(TradeNotif::CancelRejected {
                reason: format!("cancel request timed out - {}", detail),
            })
            .await;
        } else {
            let error = format!("trade {} timed out - {}", self.model.trade.id, detail);
            error!("{}", error);
            self.model.trade.fail(error.clone());
            self.notify(TradeNotif::Failed { error }).await;
            self.detach_delivery().await;
        }
        self.persist().await;
    }

    async fn revalidate_timeouts(&mut self) {
        let overdue = match &self.expectation {
            Some(expectation) => {
                // Allow a shared-tick interval of slack before declaring the
                // timer lost.
                let id = expectation.id;
                if now_ms() > expectation.deadline_ms + 1_000 {
                    Some(id)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(id) = overdue {
            warn!(
                "Trade {} response deadline passed without the timer firing",
                self.model.trade.id
            );
            self.handle_timeout(id).await;
        }
    }

    // Plumbing

    async fn send_ack(&mut self, acked_uid: &str) {
        let (address, keys) = match (self.model.peer_address(), self.model.peer_pub_key_ring()) {
            (Ok(address), Ok(keys)) => (address, keys),
            _ => return,
        };
        let ack = TradeMessage::new(
            self.model.trade.id.clone(),
            TradeMessageBody::Ack {
                acked_uid: acked_uid.to_string(),
            },
        );
        // Best effort; a lost ack only means one redundant redelivery.
        match self.model.delivery.send_message(address, keys, ack, false).await {
            Ok(SendOutcome::Arrived) => {}
            Ok(outcome) => debug!(
                "Trade {} ack for {} not delivered - {:?}",
                self.model.trade.id, acked_uid, outcome
            ),
            Err(error) => debug!(
                "Trade {} ack for {} not delivered - {}",
                self.model.trade.id, acked_uid, error
            ),
        }
    }

    async fn persist(&self) {
        self.data
            .update(
                &self.model.trade,
                &self.model.process.applied_uids,
                &self.model.process.last_outbound,
            )
            .await;
    }

    async fn notify(&mut self, notif: TradeNotif) {
        if let Some(tx) = &self.notif_tx {
            if tx.send(notif).await.is_err() {
                self.notif_tx = None;
            }
        }
    }

    async fn detach_delivery(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Err(error) = self
            .model
            .delivery
            .unregister_trade_message_tx(self.model.trade.id.clone())
            .await
        {
            warn!(
                "Trade {} could not leave the delivery router - {}",
                self.model.trade.id, error
            );
        }
    }

    fn snapshot(&self) -> TradeSnapshot {
        TradeSnapshot {
            id: self.model.trade.id.clone(),
            role: self.model.trade.role,
            phase: self.model.trade.phase(),
            cancel_state: self.model.trade.cancel_state(),
            deposit_tx_id: self.model.trade.deposit_tx_id.clone(),
            payout_tx_id: self.model.trade.payout_tx_id.clone(),
            peer_address: self.model.trade.peer_address.clone(),
            error_message: self.model.trade.error_message.clone(),
        }
    }
}

/// Which inbound message settles the wait opened by an outbound one.
fn reply_satisfies(outbound: &TradeMessageBody, inbound: &TradeMessageBody) -> bool {
    use TradeMessageBody::*;
    matches!(
        (outbound, inbound),
        (PayDepositRequest { .. }, RequestPublishDepositTx { .. })
            | (RequestPublishDepositTx { .. }, DepositTxPublished { .. })
            | (FiatTransferStarted { .. }, PayoutTxPublished { .. })
            | (RequestCancelTrade { .. }, CancelTradeAccepted { .. })
            | (RequestCancelTrade { .. }, CancelTradeRejected { .. })
    )
}
