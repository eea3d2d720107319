use std::sync::Arc;
use std::time::Duration;

use secp256k1::XOnlyPublicKey;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::common::error::TradewindError;
use crate::common::types::{local_capabilities, Capability, NodeAddress, TradeIdString};
use crate::delivery::router::Router;
use crate::delivery::transport::{RawInbound, SendOutcome, Transport};
use crate::envelope::{self, KeyRing, PubKeyRing};
use crate::message::TradeMessage;

/// A decrypted, signature-verified message ready for dispatch. Sender
/// identity is the envelope's signing pubkey, never the transport address.
pub struct InboundMessage {
    pub message: TradeMessage,
    pub sender_sig_pubkey: XOnlyPublicKey,
    pub sender_address: Option<NodeAddress>,
    pub via_mailbox: bool,
}

#[derive(Clone)]
pub(crate) struct DeliveryAccess {
    tx: mpsc::Sender<DeliveryRequest>,
}

impl DeliveryAccess {
    pub(super) fn new(tx: mpsc::Sender<DeliveryRequest>) -> Self {
        Self { tx }
    }

    pub(crate) async fn send_message(
        &self,
        recipient_address: NodeAddress,
        recipient_keys: PubKeyRing,
        message: TradeMessage,
        allow_mailbox: bool,
    ) -> Result<SendOutcome, TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<SendOutcome, TradewindError>>();
        let request = DeliveryRequest::SendMessage {
            recipient_address,
            recipient_keys,
            message,
            allow_mailbox,
            rsp_tx,
        };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub(crate) async fn register_trade_message_tx(
        &self,
        trade_id: TradeIdString,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = DeliveryRequest::RegisterTradeMessageTx {
            trade_id,
            tx,
            rsp_tx,
        };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub(crate) async fn unregister_trade_message_tx(
        &self,
        trade_id: TradeIdString,
    ) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = DeliveryRequest::UnregisterTradeMessageTx { trade_id, rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub(crate) async fn register_fallback_tx(
        &self,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = DeliveryRequest::RegisterFallbackTx { tx, rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }

    pub(crate) async fn shutdown(&self) -> Result<(), TradewindError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TradewindError>>();
        let request = DeliveryRequest::Shutdown { rsp_tx };
        self.tx.send(request).await.unwrap();
        rsp_rx.await.unwrap()
    }
}

pub(crate) struct DeliveryService {
    tx: mpsc::Sender<DeliveryRequest>,
    pub task_handle: tokio::task::JoinHandle<()>,
}

impl DeliveryService {
    const REQUEST_CHANNEL_SIZE: usize = 100;

    pub(crate) fn new(
        keyring: Arc<KeyRing>,
        transport: Arc<dyn Transport>,
        inbound_rx: mpsc::Receiver<RawInbound>,
        send_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<DeliveryRequest>(Self::REQUEST_CHANNEL_SIZE);
        let actor = DeliveryActor::new(rx, keyring, transport, inbound_rx, send_timeout);
        let task_handle = tokio::spawn(async move { actor.run().await });
        Self { tx, task_handle }
    }

    pub(crate) fn new_accessor(&self) -> DeliveryAccess {
        DeliveryAccess::new(self.tx.clone())
    }
}

pub(super) enum DeliveryRequest {
    SendMessage {
        recipient_address: NodeAddress,
        recipient_keys: PubKeyRing,
        message: TradeMessage,
        allow_mailbox: bool,
        rsp_tx: oneshot::Sender<Result<SendOutcome, TradewindError>>,
    },
    RegisterTradeMessageTx {
        trade_id: TradeIdString,
        tx: mpsc::Sender<InboundMessage>,
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    UnregisterTradeMessageTx {
        trade_id: TradeIdString,
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    RegisterFallbackTx {
        tx: mpsc::Sender<InboundMessage>,
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
    Shutdown {
        rsp_tx: oneshot::Sender<Result<(), TradewindError>>,
    },
}

pub(super) struct DeliveryActor {
    rx: mpsc::Receiver<DeliveryRequest>,
    keyring: Arc<KeyRing>,
    transport: Arc<dyn Transport>,
    inbound_rx: mpsc::Receiver<RawInbound>,
    router: Router,
    send_timeout: Duration,
}

impl DeliveryActor {
    pub(super) fn new(
        rx: mpsc::Receiver<DeliveryRequest>,
        keyring: Arc<KeyRing>,
        transport: Arc<dyn Transport>,
        inbound_rx: mpsc::Receiver<RawInbound>,
        send_timeout: Duration,
    ) -> Self {
        DeliveryActor {
            rx,
            keyring,
            transport,
            inbound_rx,
            router: Router::new(),
            send_timeout,
        }
    }

    async fn run(mut self) {
        // Request handling main event loop
        // !!! This function will end if no Sender remains for the Receiver
        loop {
            select! {
                Some(request) = self.rx.recv() => {
                    if self.handle_request(request).await {
                        break;
                    }
                },
                Some(raw) = self.inbound_rx.recv() => {
                    self.handle_raw_inbound(raw).await;
                },
                else => break,
            }
        }

        info!("Delivery service terminating");
    }

    async fn handle_request(&mut self, request: DeliveryRequest) -> bool {
        let mut terminate = false;

        match request {
            DeliveryRequest::SendMessage {
                recipient_address,
                recipient_keys,
                message,
                allow_mailbox,
                rsp_tx,
            } => {
                // Sealing and wire I/O happen off the actor so a slow peer
                // never stalls inbound routing.
                let keyring = self.keyring.clone();
                let transport = self.transport.clone();
                let send_timeout = self.send_timeout;
                tokio::spawn(async move {
                    let outcome = Self::deliver(
                        keyring,
                        transport,
                        send_timeout,
                        recipient_address,
                        recipient_keys,
                        message,
                        allow_mailbox,
                    )
                    .await;
                    rsp_tx.send(outcome).unwrap(); // oneshot should never fail
                });
            }

            DeliveryRequest::RegisterTradeMessageTx {
                trade_id,
                tx,
                rsp_tx,
            } => {
                let result = self.router.register_trade_message_tx(trade_id, tx);
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            DeliveryRequest::UnregisterTradeMessageTx { trade_id, rsp_tx } => {
                let result = self.router.unregister_trade_message_tx(&trade_id);
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            DeliveryRequest::RegisterFallbackTx { tx, rsp_tx } => {
                let result = self.router.register_fallback_tx(tx);
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            DeliveryRequest::Shutdown { rsp_tx } => {
                rsp_tx.send(Ok(())).unwrap(); // oneshot should never fail
                terminate = true;
            }
        }
        terminate
    }

    /// One direct attempt, then at most one mailbox store. Never retries; a
    /// `Failed` outcome is the caller's problem to escalate.
    async fn deliver(
        keyring: Arc<KeyRing>,
        transport: Arc<dyn Transport>,
        send_timeout: Duration,
        recipient_address: NodeAddress,
        recipient_keys: PubKeyRing,
        message: TradeMessage,
        allow_mailbox: bool,
    ) -> Result<SendOutcome, TradewindError> {
        let kind = message.kind();
        let envelope = envelope::seal(&message, &recipient_keys, &keyring, local_capabilities())?;

        let direct = tokio::time::timeout(
            send_timeout,
            transport.send(&recipient_address, envelope.clone()),
        )
        .await;
        match direct {
            Ok(Ok(())) => return Ok(SendOutcome::Arrived),
            Ok(Err(error)) => {
                debug!("Direct send of {} to {} failed - {}", kind, recipient_address, error)
            }
            Err(_) => debug!("Direct send of {} to {} timed out", kind, recipient_address),
        }

        if !allow_mailbox || !message.is_mailbox_capable() {
            return Ok(SendOutcome::Failed(format!(
                "peer {} unreachable and {} cannot go via mailbox",
                recipient_address, kind
            )));
        }

        // A mailbox only helps a peer that will understand the message once
        // it drains it.
        if let Some(caps) = transport.peer_capabilities(&recipient_address).await {
            if !caps.contains(&Capability::Mailbox) {
                return Ok(SendOutcome::Failed(format!(
                    "peer {} does not advertise mailbox support",
                    recipient_address
                )));
            }
        }

        let stored = tokio::time::timeout(
            send_timeout,
            transport.store_mailbox(&recipient_address, envelope),
        )
        .await;
        match stored {
            Ok(Ok(())) => Ok(SendOutcome::StoredInMailbox),
            Ok(Err(error)) => Ok(SendOutcome::Failed(format!(
                "mailbox store for {} failed - {}",
                recipient_address, error
            ))),
            Err(_) => Ok(SendOutcome::Failed(format!(
                "mailbox store for {} timed out",
                recipient_address
            ))),
        }
    }

    async fn handle_raw_inbound(&mut self, raw: RawInbound) {
        let opened = match envelope::open(&raw.envelope, &self.keyring) {
            Ok(opened) => opened,
            Err(error) => {
                warn!("Discarding inbound envelope that failed to open - {}", error);
                return;
            }
        };

        let trade_id = opened.message.trade_id.clone();
        if let Err(error) = opened.message.validate_for(&trade_id) {
            warn!("Discarding malformed inbound message - {}", error);
            return;
        }

        let required = opened.message.required_capability();
        if !local_capabilities().contains(&required) {
            warn!(
                "Discarding inbound {} requiring unsupported capability {:?}",
                opened.message.kind(),
                required
            );
            return;
        }

        let inbound = InboundMessage {
            message: opened.message,
            sender_sig_pubkey: opened.sender_sig_pubkey,
            sender_address: raw.sender_address,
            via_mailbox: raw.via_mailbox,
        };
        if let Err(error) = self.router.handle_inbound(inbound).await {
            error!("Inbound message for trade {} not routed - {}", trade_id, error);
        }
    }
}
