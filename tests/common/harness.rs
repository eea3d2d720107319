use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::sleep;

use tradewind::common::error::TradewindError;
use tradewind::common::types::{local_capabilities, CapabilitySet, NodeAddress};
use tradewind::delivery::{RawInbound, Transport};
use tradewind::envelope::{KeyRing, SealedEnvelope};
use tradewind::manager::{EngineSettings, TradeManager};
use tradewind::protocol::{TradeNotif, TradeProtocolAccess};
use tradewind::trade::{OfferDirection, OfferTerms, TradePhase};
use tradewind::wallet::WalletService;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const POLL_ATTEMPTS: usize = 200;

struct HubState {
    inboxes: HashMap<NodeAddress, mpsc::Sender<RawInbound>>,
    mailboxes: HashMap<NodeAddress, Vec<SealedEnvelope>>,
    offline: HashSet<NodeAddress>,
    // Every direct delivery, kept so tests can replay traffic verbatim.
    history: Vec<(NodeAddress, NodeAddress, SealedEnvelope)>,
}

/// In-memory network connecting test peers. Direct sends land on the
/// destination's inbound channel unless the destination is marked offline, in
/// which case senders fall back to the hub-held mailbox.
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                inboxes: HashMap::new(),
                mailboxes: HashMap::new(),
                offline: HashSet::new(),
                history: Vec::new(),
            })),
        }
    }

    /// Wire a node in. Returns its transport end and the inbound receiver its
    /// manager consumes. Attaching an already-known address replaces the old
    /// inbound channel, which is what a restart does.
    pub fn attach(
        &self,
        address: &NodeAddress,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<RawInbound>) {
        let (tx, rx) = mpsc::channel::<RawInbound>(100);
        self.state
            .lock()
            .unwrap()
            .inboxes
            .insert(address.clone(), tx);
        let transport = Arc::new(MemoryTransport {
            from: address.clone(),
            hub: self.clone(),
        });
        (transport, rx)
    }

    pub fn set_offline(&self, address: &NodeAddress, offline: bool) {
        let mut state = self.state.lock().unwrap();
        if offline {
            state.offline.insert(address.clone());
        } else {
            state.offline.remove(address);
        }
    }

    pub fn mailbox_len(&self, address: &NodeAddress) -> usize {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .get(address)
            .map_or(0, Vec::len)
    }

    /// Redeliver everything stored for `address`, flagged as mailbox traffic.
    pub async fn drain_mailbox(&self, address: &NodeAddress) {
        let (tx, stored) = {
            let mut state = self.state.lock().unwrap();
            let stored = state.mailboxes.remove(address).unwrap_or_default();
            (state.inboxes.get(address).cloned(), stored)
        };
        let tx = tx.expect("draining a mailbox for an unattached address");
        for envelope in stored {
            tx.send(RawInbound {
                sender_address: None,
                envelope,
                via_mailbox: true,
            })
            .await
            .unwrap();
        }
    }

    /// Replay every direct delivery `address` has ever received, in order.
    /// Receivers are expected to treat all of it as duplicates.
    pub async fn replay_direct(&self, address: &NodeAddress) {
        let (tx, replays) = {
            let state = self.state.lock().unwrap();
            let replays: Vec<(NodeAddress, SealedEnvelope)> = state
                .history
                .iter()
                .filter(|(to, _, _)| to == address)
                .map(|(_, from, envelope)| (from.clone(), envelope.clone()))
                .collect();
            (state.inboxes.get(address).cloned(), replays)
        };
        let tx = tx.expect("replaying traffic for an unattached address");
        for (from, envelope) in replays {
            tx.send(RawInbound {
                sender_address: Some(from),
                envelope,
                via_mailbox: false,
            })
            .await
            .unwrap();
        }
    }
}

pub struct MemoryTransport {
    from: NodeAddress,
    hub: MemoryHub,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        address: &NodeAddress,
        envelope: SealedEnvelope,
    ) -> Result<(), TradewindError> {
        let tx = {
            let mut state = self.hub.state.lock().unwrap();
            if state.offline.contains(address) {
                None
            } else {
                let tx = state.inboxes.get(address).cloned();
                if tx.is_some() {
                    state
                        .history
                        .push((address.clone(), self.from.clone(), envelope.clone()));
                }
                tx
            }
        };
        let tx = tx.ok_or_else(|| {
            TradewindError::Transport(format!("no connection to {}", address))
        })?;
        tx.send(RawInbound {
            sender_address: Some(self.from.clone()),
            envelope,
            via_mailbox: false,
        })
        .await
        .map_err(|_| TradewindError::Transport(format!("connection to {} dropped", address)))
    }

    async fn store_mailbox(
        &self,
        address: &NodeAddress,
        envelope: SealedEnvelope,
    ) -> Result<(), TradewindError> {
        self.hub
            .state
            .lock()
            .unwrap()
            .mailboxes
            .entry(address.clone())
            .or_default()
            .push(envelope);
        Ok(())
    }

    async fn confirmed_connections(&self) -> Vec<NodeAddress> {
        let state = self.hub.state.lock().unwrap();
        state
            .inboxes
            .keys()
            .filter(|address| **address != self.from && !state.offline.contains(address))
            .cloned()
            .collect()
    }

    async fn peer_capabilities(&self, address: &NodeAddress) -> Option<CapabilitySet> {
        let state = self.hub.state.lock().unwrap();
        state
            .inboxes
            .contains_key(address)
            .then(local_capabilities)
    }
}

/// Wallet fake with fully deterministic outputs. Payout transactions depend
/// only on the deposit tx id and amount, so both sides of a trade rebuild the
/// identical unsigned payout the way real wallets would.
pub struct ScriptedWallet {
    tag: String,
}

impl ScriptedWallet {
    pub fn new(tag: &str) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
        })
    }
}

#[async_trait]
impl WalletService for ScriptedWallet {
    async fn create_deposit_inputs(&self, amount_sat: u64) -> Result<Vec<String>, TradewindError> {
        Ok(vec![format!("{}-input-{}", self.tag, amount_sat)])
    }

    async fn create_deposit_tx(
        &self,
        my_inputs: &[String],
        peer_inputs: &[String],
        amount_sat: u64,
    ) -> Result<String, TradewindError> {
        let mut inputs: Vec<String> = my_inputs.iter().chain(peer_inputs).cloned().collect();
        inputs.sort();
        Ok(format!("deposit({};{})", inputs.join("+"), amount_sat))
    }

    async fn sign_and_publish(&self, tx: &str) -> Result<String, TradewindError> {
        Ok(format!("txid({})", tx))
    }

    async fn create_payout_tx(
        &self,
        deposit_tx_id: &str,
        amount_sat: u64,
    ) -> Result<String, TradewindError> {
        Ok(format!("payout({};{})", deposit_tx_id, amount_sat))
    }

    async fn get_balance(&self) -> Result<u64, TradewindError> {
        Ok(100_000_000)
    }
}

/// One engine instance on the in-memory network, with its own identity and
/// data directory.
pub struct TestPeer {
    pub address: NodeAddress,
    pub fingerprint: String,
    pub manager: Arc<TradeManager>,
    settings: EngineSettings,
    keyring: KeyRing,
    _data_dir: TempDir,
}

impl TestPeer {
    pub async fn start(hub: &MemoryHub, host: &str, step_timeout: Duration) -> TestPeer {
        let address = NodeAddress::new(host, 9999);
        let fingerprint = format!("{}-payment-account", host);
        let data_dir = tempfile::tempdir().unwrap();
        let mut settings =
            EngineSettings::new(data_dir.path(), address.clone(), fingerprint.clone());
        settings.step_timeout = step_timeout;
        settings.send_timeout = Duration::from_secs(2);

        let keyring = KeyRing::generate().unwrap();
        let (transport, inbound_rx) = hub.attach(&address);
        let manager = TradeManager::new(
            settings.clone(),
            keyring.clone(),
            transport,
            ScriptedWallet::new(host),
            inbound_rx,
        )
        .await
        .unwrap();

        TestPeer {
            address,
            fingerprint,
            manager,
            settings,
            keyring,
            _data_dir: data_dir,
        }
    }

    /// Bring a fresh manager up on the same identity and data directory, as a
    /// process restart would. The old manager must be shut down first.
    pub async fn restart(&mut self, hub: &MemoryHub) {
        let (transport, inbound_rx) = hub.attach(&self.address);
        self.manager = TradeManager::new(
            self.settings.clone(),
            self.keyring.clone(),
            transport,
            ScriptedWallet::new(&self.address.host),
            inbound_rx,
        )
        .await
        .unwrap();
    }

    pub fn new_offer(&self, offer_id: &str, direction: OfferDirection) -> OfferTerms {
        OfferTerms {
            offer_id: offer_id.to_string(),
            direction,
            amount_sat: 1_000_000,
            price_minor: 5_800_000,
            maker_node_address: self.address.clone(),
            maker_pub_key_ring: self.keyring.pub_key_ring(),
            maker_account_fingerprint: self.fingerprint.clone(),
        }
    }
}

/// The maker side only spins a trade actor up once the take request arrives,
/// so tests poll for it.
pub async fn wait_for_trade(manager: &TradeManager, trade_id: &str) -> TradeProtocolAccess {
    for _ in 0..POLL_ATTEMPTS {
        if let Some(access) = manager.trade_access(trade_id).await {
            return access;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("trade {} never appeared", trade_id);
}

pub async fn wait_until_phase(access: &TradeProtocolAccess, want: TradePhase) {
    let mut last = None;
    for _ in 0..POLL_ATTEMPTS {
        let phase = access.query_state().await.phase;
        if phase == want {
            return;
        }
        last = Some(phase);
        sleep(POLL_INTERVAL).await;
    }
    panic!("never reached phase {}; stuck at {:?}", want, last);
}

/// Next notification matching `pred`, skipping any others in between.
pub async fn next_notif_matching(
    rx: &mut mpsc::Receiver<TradeNotif>,
    pred: impl Fn(&TradeNotif) -> bool,
) -> TradeNotif {
    for _ in 0..POLL_ATTEMPTS {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(notif)) if pred(&notif) => return notif,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("notification channel closed"),
            Err(_) => panic!("timed out waiting for a notification"),
        }
    }
    panic!("notification never arrived");
}
