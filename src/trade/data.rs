use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, trace};

use crate::common::error::TradewindError;
use crate::common::types::{MsgUidString, NodeAddress, TradeIdString};
use crate::common::utils;
use crate::message::TradeMessage;
use crate::trade::offer::OfferTerms;
use crate::trade::trade::Trade;

#[derive(Clone, Serialize, Deserialize)]
struct TradeDataStore {
    trade: Trade,
    offer: OfferTerms,
    applied_uids: HashSet<MsgUidString>,
    /// Outbound message still awaiting a peer response, so the wait can be
    /// re-armed after a restart.
    last_outbound: Option<(NodeAddress, TradeMessage)>,
}

impl TradeDataStore {
    fn persist(&self, dir_path: impl AsRef<Path>) -> Result<(), TradewindError> {
        let json = serde_json::to_string(&self)?;
        let data_path = TradeData::data_path(dir_path, &self.trade.id);
        utils::persist(json, data_path)
    }

    fn restore(data_path: impl AsRef<Path>) -> Result<Self, TradewindError> {
        let json = utils::restore(data_path)?;
        let store: Self = serde_json::from_str(&json)?;
        Ok(store)
    }
}

enum TradeDataMsg {
    Persist,
    Close,
}

/// Persisted store for one trade, written after every state transition via a
/// debounced background task.
pub(crate) struct TradeData {
    pub(crate) trade_id: TradeIdString,
    persist_tx: mpsc::Sender<TradeDataMsg>,
    store: Arc<RwLock<TradeDataStore>>,
    task_handle: tokio::task::JoinHandle<()>,
}

impl TradeData {
    pub(crate) fn data_path(dir_path: impl AsRef<Path>, trade_id: &str) -> PathBuf {
        dir_path.as_ref().join(format!("{}-trade.json", trade_id))
    }

    pub(crate) fn new(dir_path: impl AsRef<Path>, trade: Trade, offer: OfferTerms) -> Self {
        let trade_id = trade.id.clone();
        let store = TradeDataStore {
            trade,
            offer,
            applied_uids: HashSet::new(),
            last_outbound: None,
        };
        let store = Arc::new(RwLock::new(store));
        let (persist_tx, task_handle) =
            Self::setup_persistence(store.clone(), trade_id.clone(), &dir_path);
        let data = Self {
            trade_id,
            persist_tx,
            store,
            task_handle,
        };
        data.queue_persistence();
        data
    }

    pub(crate) fn restore(
        data_path: impl AsRef<Path>,
    ) -> Result<(TradeIdString, Self), TradewindError> {
        let store = TradeDataStore::restore(&data_path)?;
        let trade_id = store.trade.id.clone();
        let dir_path = data_path
            .as_ref()
            .parent()
            .ok_or_else(|| {
                TradewindError::Simple(format!(
                    "Trade data path {} has no parent directory",
                    data_path.as_ref().display()
                ))
            })?
            .to_path_buf();

        let store = Arc::new(RwLock::new(store));
        let (persist_tx, task_handle) =
            Self::setup_persistence(store.clone(), trade_id.clone(), dir_path);

        let data = Self {
            trade_id: trade_id.clone(),
            persist_tx,
            store,
            task_handle,
        };
        Ok((trade_id, data))
    }

    fn setup_persistence(
        store: Arc<RwLock<TradeDataStore>>,
        trade_id: TradeIdString,
        dir_path: impl AsRef<Path>,
    ) -> (mpsc::Sender<TradeDataMsg>, tokio::task::JoinHandle<()>) {
        // Size-1 channel is the debounce: at most one pending persist.
        let (persist_tx, mut persist_rx) = mpsc::channel(1);
        let dir_path_buf = dir_path.as_ref().to_path_buf();

        let task_handle = tokio::spawn(async move {
            loop {
                match persist_rx.recv().await {
                    Some(TradeDataMsg::Persist) => {
                        let snapshot = store.read().await.clone();
                        if let Some(err) = snapshot.persist(&dir_path_buf).err() {
                            error!(
                                "Trade {} - Error persisting data: {}",
                                trade_id, err
                            );
                        }
                    }
                    Some(TradeDataMsg::Close) | None => break,
                }
            }
        });
        (persist_tx, task_handle)
    }

    fn queue_persistence(&self) {
        match self.persist_tx.try_send(TradeDataMsg::Persist) {
            Ok(_) => {}
            Err(error) => match error {
                mpsc::error::TrySendError::Full(_) => {
                    trace!("Trade {} - Persistence channel full", self.trade_id)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    error!("Trade {} - Persistence channel closed", self.trade_id)
                }
            },
        }
    }

    pub(crate) async fn update(
        &self,
        trade: &Trade,
        applied_uids: &HashSet<MsgUidString>,
        last_outbound: &Option<(NodeAddress, TradeMessage)>,
    ) {
        {
            let mut store = self.store.write().await;
            store.trade = trade.clone();
            store.applied_uids = applied_uids.clone();
            store.last_outbound = last_outbound.clone();
        }
        self.queue_persistence();
    }

    pub(crate) async fn snapshot(
        &self,
    ) -> (
        Trade,
        OfferTerms,
        HashSet<MsgUidString>,
        Option<(NodeAddress, TradeMessage)>,
    ) {
        let store = self.store.read().await;
        (
            store.trade.clone(),
            store.offer.clone(),
            store.applied_uids.clone(),
            store.last_outbound.clone(),
        )
    }

    pub(crate) async fn terminate(self) -> Result<(), TradewindError> {
        self.persist_tx.send(TradeDataMsg::Close).await?;
        self.task_handle.await?;
        Ok(())
    }
}
