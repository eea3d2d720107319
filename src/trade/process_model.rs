use std::collections::HashSet;

use crate::common::types::{MsgUidString, NodeAddress};
use crate::envelope::keyring::PubKeyRing;
use crate::message::TradeMessage;
use crate::trade::contract::ContractTerms;

/// Transient working memory for one trade's protocol execution. Rebuilt on
/// load; only `applied_uids` is carried through the trade's persisted store
/// so dedup survives a restart.
#[derive(Debug, Default)]
pub struct ProcessModel {
    /// The message currently being processed by a pipeline.
    pub last_message: Option<TradeMessage>,
    /// Peer address before the contract pins the canonical one.
    pub temp_peer_address: Option<NodeAddress>,
    pub peer_pub_key_ring: Option<PubKeyRing>,
    /// Uids of messages already applied to this trade.
    pub applied_uids: HashSet<MsgUidString>,
    pub my_deposit_inputs: Vec<String>,
    pub peer_deposit_inputs: Vec<String>,
    pub contract_terms: Option<ContractTerms>,
    pub my_contract_sig: Option<Vec<u8>>,
    pub peer_contract_sig: Option<Vec<u8>>,
    /// Reason attached to an in-flight cancel request, ours or the peer's.
    pub cancel_reason: Option<String>,
    pub unsigned_payout_tx: Option<String>,
    pub buyer_payout_tx_sig: Option<Vec<u8>>,
    /// Last message sent that awaits a peer response; re-sent (same uid) on
    /// timeout escalation before the trade is failed.
    pub last_outbound: Option<(NodeAddress, TradeMessage)>,
}

impl ProcessModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_applied_uids(applied_uids: HashSet<MsgUidString>) -> Self {
        Self {
            applied_uids,
            ..Self::default()
        }
    }

    pub fn already_applied(&self, uid: &str) -> bool {
        self.applied_uids.contains(uid)
    }

    pub fn note_applied(&mut self, uid: impl Into<MsgUidString>) {
        self.applied_uids.insert(uid.into());
    }
}
