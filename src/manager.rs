use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::common::error::TradewindError;
use crate::common::types::{NodeAddress, TradeIdString};
use crate::delivery::{
    DeliveryAccess, DeliveryService, InboundMessage, RawInbound, Transport,
};
use crate::envelope::{KeyRing, PubKeyRing};
use crate::message::TradeMessageBody;
use crate::protocol::{ProtocolModel, TradeProtocol, TradeProtocolAccess};
use crate::sched::{Executor, ExecutorAccess, Heartbeat, HeartbeatEvent, TimerStrategy};
use crate::trade::data::TradeData;
use crate::trade::{OfferTerms, ProcessModel, Trade};
use crate::wallet::WalletService;

/// Engine-wide knobs. Everything beyond identity and data directory has a
/// usable default.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub data_dir: PathBuf,
    pub my_node_address: NodeAddress,
    pub account_fingerprint: String,
    /// How long to wait for the peer's answer to a protocol step before
    /// resending and, after the resend, failing the trade.
    pub step_timeout: Duration,
    /// Per-attempt transport deadline for one direct send or mailbox store.
    pub send_timeout: Duration,
    pub resend_limit: u32,
    pub timer_strategy: TimerStrategy,
}

impl EngineSettings {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        my_node_address: NodeAddress,
        account_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            my_node_address,
            account_fingerprint: account_fingerprint.into(),
            step_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(30),
            resend_limit: 1,
            timer_strategy: TimerStrategy::Cooperative,
        }
    }
}

/// Top-level handle owning the execution context, heartbeat, delivery
/// service and one protocol actor per live trade.
pub struct TradeManager {
    settings: EngineSettings,
    keyring: Arc<KeyRing>,
    wallet: Arc<dyn WalletService>,
    exec_access: ExecutorAccess,
    executor: Mutex<Option<Executor>>,
    heartbeat: Heartbeat,
    delivery: Mutex<Option<DeliveryService>>,
    delivery_access: DeliveryAccess,
    protocols: RwLock<HashMap<TradeIdString, TradeProtocol>>,
    accesses: RwLock<HashMap<TradeIdString, TradeProtocolAccess>>,
    open_offers: RwLock<HashMap<String, OfferTerms>>,
    janitor_handles: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TradeManager {
    const FALLBACK_CHANNEL_SIZE: usize = 100;
    const TRADE_MSG_CHANNEL_SIZE: usize = 100;

    pub async fn new(
        settings: EngineSettings,
        keyring: KeyRing,
        transport: Arc<dyn Transport>,
        wallet: Arc<dyn WalletService>,
        inbound_rx: mpsc::Receiver<RawInbound>,
    ) -> Result<Arc<TradeManager>, TradewindError> {
        tokio::fs::create_dir_all(&settings.data_dir).await?;
        let keyring = Arc::new(keyring);

        let executor = Executor::start(settings.timer_strategy);
        let exec_access = executor.new_accessor();
        let heartbeat = Heartbeat::new();
        heartbeat.start(&exec_access);

        let delivery = DeliveryService::new(
            keyring.clone(),
            transport,
            inbound_rx,
            settings.send_timeout,
        );
        let delivery_access = delivery.new_accessor();

        let (fallback_tx, fallback_rx) =
            mpsc::channel::<InboundMessage>(Self::FALLBACK_CHANNEL_SIZE);
        delivery_access.register_fallback_tx(fallback_tx).await?;
        let heartbeat_rx = heartbeat.add_listener();

        let manager = Arc::new(TradeManager {
            settings,
            keyring,
            wallet,
            exec_access,
            executor: Mutex::new(Some(executor)),
            heartbeat,
            delivery: Mutex::new(Some(delivery)),
            delivery_access,
            protocols: RwLock::new(HashMap::new()),
            accesses: RwLock::new(HashMap::new()),
            open_offers: RwLock::new(HashMap::new()),
            janitor_handles: StdMutex::new(Vec::new()),
        });

        let fallback_handle = tokio::spawn(Self::run_fallback(manager.clone(), fallback_rx));
        let revalidate_handle =
            tokio::spawn(Self::run_revalidation(manager.clone(), heartbeat_rx));
        manager
            .janitor_handles
            .lock()
            .unwrap()
            .extend([fallback_handle, revalidate_handle]);

        Ok(manager)
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        self.keyring.pub_key_ring()
    }

    // Offer management (maker side)

    /// Register an offer of ours as open for taking. The first valid
    /// PayDepositRequest naming it starts the maker-side trade.
    pub async fn make_offer(&self, offer: OfferTerms) -> Result<(), TradewindError> {
        if offer.maker_node_address != self.settings.my_node_address
            || offer.maker_pub_key_ring != self.keyring.pub_key_ring()
        {
            return Err(TradewindError::Validation(format!(
                "offer {} does not carry our own maker identity",
                offer.offer_id
            )));
        }
        if self.protocols.read().await.contains_key(&offer.offer_id) {
            return Err(TradewindError::Validation(format!(
                "offer {} already has a running trade",
                offer.offer_id
            )));
        }
        let mut open_offers = self.open_offers.write().await;
        if open_offers.contains_key(&offer.offer_id) {
            return Err(TradewindError::Validation(format!(
                "offer {} is already open",
                offer.offer_id
            )));
        }
        info!("Offer {} open for taking", offer.offer_id);
        open_offers.insert(offer.offer_id.clone(), offer);
        Ok(())
    }

    pub async fn remove_offer(&self, offer_id: &str) -> Result<(), TradewindError> {
        match self.open_offers.write().await.remove(offer_id) {
            Some(_) => Ok(()),
            None => Err(TradewindError::Simple(format!(
                "offer {} is not open",
                offer_id
            ))),
        }
    }

    pub async fn open_offer_ids(&self) -> Vec<String> {
        self.open_offers.read().await.keys().cloned().collect()
    }

    // Trade lifecycle

    /// Take a peer's published offer. Starts the taker-side protocol actor
    /// and kicks off the deposit negotiation before returning its handle.
    pub async fn take_offer(
        &self,
        offer: OfferTerms,
    ) -> Result<TradeProtocolAccess, TradewindError> {
        let role = offer.taker_role();
        let trade = Trade::new(
            offer.offer_id.clone(),
            role,
            Some(offer.maker_node_address.clone()),
        );
        info!("Taking offer {} as {}", offer.offer_id, role);
        let data = TradeData::new(&self.settings.data_dir, trade.clone(), offer.clone());
        let access = self
            .spawn_protocol(trade, ProcessModel::new(), offer, data, None)
            .await?;
        access.take_offer().await?;
        Ok(access)
    }

    pub async fn trade_access(&self, trade_id: &str) -> Option<TradeProtocolAccess> {
        self.accesses.read().await.get(trade_id).cloned()
    }

    pub async fn trade_ids(&self) -> Vec<TradeIdString> {
        self.accesses.read().await.keys().cloned().collect()
    }

    /// Rebuild protocol actors for every non-terminal trade persisted under
    /// the data directory. Returns how many actors were restored.
    pub async fn restore_all(&self) -> Result<usize, TradewindError> {
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(&self.settings.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if !name.ends_with("-trade.json") {
                continue;
            }
            match TradeData::restore(&path) {
                Ok((trade_id, data)) => {
                    let (trade, offer, applied_uids, last_outbound) = data.snapshot().await;
                    if trade.phase().is_terminal() {
                        debug!("Trade {} already terminal, no actor restored", trade_id);
                        if let Err(error) = data.terminate().await {
                            warn!("Trade {} data store close failed - {}", trade_id, error);
                        }
                        continue;
                    }
                    let mut process = ProcessModel::with_applied_uids(applied_uids);
                    process.last_outbound = last_outbound;
                    self.spawn_protocol(trade, process, offer, data, None).await?;
                    info!("Trade {} restored", trade_id);
                    count += 1;
                }
                Err(error) => {
                    warn!("Could not restore trade from {} - {}", path.display(), error)
                }
            }
        }
        Ok(count)
    }

    /// Tear down a terminal trade's actor and archive its data file.
    pub async fn close_trade(&self, trade_id: &str) -> Result<(), TradewindError> {
        let access = self.trade_access(trade_id).await.ok_or_else(|| {
            TradewindError::Simple(format!("no running trade {}", trade_id))
        })?;
        let snapshot = access.query_state().await;
        if !snapshot.phase.is_terminal() {
            return Err(TradewindError::InvalidPhase(format!(
                "trade {} is still active in phase {}",
                trade_id, snapshot.phase
            )));
        }

        self.accesses.write().await.remove(trade_id);
        let protocol = self.protocols.write().await.remove(trade_id);
        if let Some(protocol) = protocol {
            access.shutdown().await?;
            protocol.task_handle.await?;
        }

        let from = TradeData::data_path(&self.settings.data_dir, trade_id);
        let archive_dir = self.settings.data_dir.join("archive");
        tokio::fs::create_dir_all(&archive_dir).await?;
        tokio::fs::rename(&from, archive_dir.join(format!("{}-trade.json", trade_id))).await?;
        info!("Trade {} closed and archived", trade_id);
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), TradewindError> {
        for handle in self.janitor_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.heartbeat.stop();

        let protocols: Vec<(TradeIdString, TradeProtocol)> =
            self.protocols.write().await.drain().collect();
        self.accesses.write().await.clear();
        for (trade_id, protocol) in protocols {
            let access = protocol.new_accessor();
            if let Err(error) = access.shutdown().await {
                warn!("Trade {} shutdown failed - {}", trade_id, error);
            }
            if let Err(error) = protocol.task_handle.await {
                warn!("Trade {} actor join failed - {}", trade_id, error);
            }
        }

        if let Some(delivery) = self.delivery.lock().await.take() {
            let access = delivery.new_accessor();
            access.shutdown().await?;
            delivery.task_handle.await?;
        }
        if let Some(executor) = self.executor.lock().await.take() {
            executor.shutdown().await?;
        }
        info!("Trade manager shut down");
        Ok(())
    }

    // Private Functions

    /// Fallback messages are ones no running trade claimed; the only
    /// legitimate case is a taker opening one of our open offers.
    async fn run_fallback(manager: Arc<TradeManager>, mut rx: mpsc::Receiver<InboundMessage>) {
        while let Some(inbound) = rx.recv().await {
            if let Err(error) = manager.accept_take(inbound).await {
                warn!("Unmatched inbound message dropped - {}", error);
            }
        }
    }

    async fn accept_take(&self, inbound: InboundMessage) -> Result<(), TradewindError> {
        let trade_id = inbound.message.trade_id.clone();
        if !matches!(
            inbound.message.body,
            TradeMessageBody::PayDepositRequest { .. }
        ) {
            return Err(TradewindError::Simple(format!(
                "{} for unknown trade {}",
                inbound.message.kind(),
                trade_id
            )));
        }
        let offer = self
            .open_offers
            .write()
            .await
            .remove(&trade_id)
            .ok_or_else(|| {
                TradewindError::Simple(format!(
                    "PayDepositRequest for {} matches no open offer",
                    trade_id
                ))
            })?;

        let role = offer.maker_role();
        info!("Offer {} taken; starting trade as {}", trade_id, role);
        let trade = Trade::new(trade_id, role, None);
        let data = TradeData::new(&self.settings.data_dir, trade.clone(), offer.clone());
        self.spawn_protocol(trade, ProcessModel::new(), offer, data, Some(inbound))
            .await?;
        Ok(())
    }

    async fn run_revalidation(
        manager: Arc<TradeManager>,
        mut rx: mpsc::UnboundedReceiver<HeartbeatEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            if matches!(
                event,
                HeartbeatEvent::MinuteTick { .. } | HeartbeatEvent::MissedSecondTick { .. }
            ) {
                let accesses: Vec<TradeProtocolAccess> =
                    manager.accesses.read().await.values().cloned().collect();
                for access in accesses {
                    if let Err(error) = access.revalidate_timeouts().await {
                        warn!("Timeout revalidation failed - {}", error);
                    }
                }
            }
        }
    }

    async fn spawn_protocol(
        &self,
        trade: Trade,
        process: ProcessModel,
        offer: OfferTerms,
        data: TradeData,
        seed: Option<InboundMessage>,
    ) -> Result<TradeProtocolAccess, TradewindError> {
        let trade_id = trade.id.clone();
        if self.protocols.read().await.contains_key(&trade_id) {
            return Err(TradewindError::Simple(format!(
                "trade {} is already running",
                trade_id
            )));
        }

        let (msg_tx, msg_rx) = mpsc::channel::<InboundMessage>(Self::TRADE_MSG_CHANNEL_SIZE);
        self.delivery_access
            .register_trade_message_tx(trade_id.clone(), msg_tx.clone())
            .await?;

        let model = ProtocolModel {
            trade,
            process,
            offer,
            my_node_address: self.settings.my_node_address.clone(),
            my_account_fingerprint: self.settings.account_fingerprint.clone(),
            keyring: self.keyring.clone(),
            wallet: self.wallet.clone(),
            delivery: self.delivery_access.clone(),
        };
        let protocol = TradeProtocol::new(
            model,
            data,
            msg_rx,
            self.exec_access.clone(),
            self.settings.step_timeout,
            self.settings.resend_limit,
        );
        let access = protocol.new_accessor();
        self.protocols.write().await.insert(trade_id.clone(), protocol);
        self.accesses.write().await.insert(trade_id, access.clone());

        if let Some(seed) = seed {
            msg_tx.send(seed).await?;
        }
        Ok(access)
    }
}
