use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};

use crate::common::error::TradewindError;
use crate::common::types::{NodeAddress, TradeIdString, TradeRole};
use crate::trade::contract::Contract;

/// Main lifecycle phase of a trade.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr,
)]
pub enum TradePhase {
    Init,
    DepositRequested,
    DepositPublished,
    FiatSent,
    PayoutPublished,
    Completed,
    /// Cancel sub-protocol accepted; funds returned via the cancel payout.
    Canceled,
    Failed,
}

impl TradePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradePhase::Completed | TradePhase::Canceled | TradePhase::Failed
        )
    }

    /// The cancel sub-protocol is only valid in this window.
    pub fn at_or_before_fiat_sent(self) -> bool {
        matches!(
            self,
            TradePhase::Init
                | TradePhase::DepositRequested
                | TradePhase::DepositPublished
                | TradePhase::FiatSent
        )
    }

    pub fn can_advance_to(self, next: TradePhase) -> bool {
        use TradePhase::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (from, Canceled) => from.at_or_before_fiat_sent(),
            (Init, DepositRequested)
            | (DepositRequested, DepositPublished)
            | (DepositPublished, FiatSent)
            | (FiatSent, PayoutPublished)
            | (PayoutPublished, Completed) => true,
            _ => false,
        }
    }
}

/// Cancel sub-state machine, independent of the main phase.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr,
)]
pub enum CancelState {
    None,
    RequestedByMe,
    RequestedByPeer,
    Accepted,
    Rejected,
}

/// Persisted state of a single trade. Owned exclusively by its protocol
/// actor; mutated only on that actor's context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeIdString,
    pub role: TradeRole,
    phase: TradePhase,
    cancel_state: CancelState,
    pub deposit_tx_id: Option<String>,
    pub payout_tx_id: Option<String>,
    pub peer_address: Option<NodeAddress>,
    contract: Option<Contract>,
    pub error_message: Option<String>,
}

impl Trade {
    pub fn new(
        id: impl Into<TradeIdString>,
        role: TradeRole,
        peer_address: Option<NodeAddress>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            phase: TradePhase::Init,
            cancel_state: CancelState::None,
            deposit_tx_id: None,
            payout_tx_id: None,
            peer_address,
            contract: None,
            error_message: None,
        }
    }

    pub fn phase(&self) -> TradePhase {
        self.phase
    }

    pub fn cancel_state(&self) -> CancelState {
        self.cancel_state
    }

    pub fn contract(&self) -> Option<&Contract> {
        self.contract.as_ref()
    }

    pub fn set_contract(&mut self, contract: Contract) -> Result<(), TradewindError> {
        if self.contract.is_some() {
            return Err(TradewindError::Validation(format!(
                "Trade {} already carries a signed contract; contracts are immutable",
                self.id
            )));
        }
        self.contract = Some(contract);
        Ok(())
    }

    pub fn advance_phase(&mut self, next: TradePhase) -> Result<(), TradewindError> {
        if !self.phase.can_advance_to(next) {
            return Err(TradewindError::InvalidPhase(format!(
                "Trade {} cannot advance from {} to {}",
                self.id, self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// The single place a trade is marked failed.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.phase.is_terminal() {
            self.phase = TradePhase::Failed;
        }
        self.error_message = Some(message);
    }

    pub fn set_cancel_state(&mut self, next: CancelState) -> Result<(), TradewindError> {
        use CancelState::*;
        let valid = match (self.cancel_state, next) {
            (_, None) => true, // reset is always allowed
            (None, RequestedByMe) | (None, RequestedByPeer) => {
                self.phase.at_or_before_fiat_sent()
            }
            // Tie-break loser: our own request is superseded by the peer's.
            (RequestedByMe, RequestedByPeer) => true,
            (RequestedByMe, Accepted)
            | (RequestedByPeer, Accepted)
            | (RequestedByMe, Rejected)
            | (RequestedByPeer, Rejected) => true,
            _ => false,
        };
        if !valid {
            return Err(TradewindError::InvalidPhase(format!(
                "Trade {} cancel state cannot move from {} to {} while in phase {}",
                self.id, self.cancel_state, next, self.phase
            )));
        }
        self.cancel_state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade() -> Trade {
        Trade::new("offer-1", TradeRole::BuyerAsTaker, None)
    }

    #[test]
    fn happy_path_phase_order_is_legal() {
        let mut t = trade();
        for next in [
            TradePhase::DepositRequested,
            TradePhase::DepositPublished,
            TradePhase::FiatSent,
            TradePhase::PayoutPublished,
            TradePhase::Completed,
        ] {
            t.advance_phase(next).unwrap();
        }
        assert!(t.phase().is_terminal());
    }

    #[test]
    fn skipping_a_phase_is_rejected() {
        let mut t = trade();
        assert!(t.advance_phase(TradePhase::FiatSent).is_err());
        assert_eq!(t.phase(), TradePhase::Init);
    }

    #[test]
    fn failure_is_reachable_from_any_non_terminal_phase() {
        let mut t = trade();
        t.advance_phase(TradePhase::DepositRequested).unwrap();
        t.fail("peer unreachable");
        assert_eq!(t.phase(), TradePhase::Failed);
        assert!(t.error_message.is_some());

        // ... but a completed trade stays completed.
        let mut done = trade();
        for next in [
            TradePhase::DepositRequested,
            TradePhase::DepositPublished,
            TradePhase::FiatSent,
            TradePhase::PayoutPublished,
            TradePhase::Completed,
        ] {
            done.advance_phase(next).unwrap();
        }
        done.fail("late fault");
        assert_eq!(done.phase(), TradePhase::Completed);
    }

    #[test]
    fn cancel_is_only_valid_at_or_before_fiat_sent() {
        let mut t = trade();
        for next in [
            TradePhase::DepositRequested,
            TradePhase::DepositPublished,
            TradePhase::FiatSent,
            TradePhase::PayoutPublished,
        ] {
            t.advance_phase(next).unwrap();
        }
        assert!(t.set_cancel_state(CancelState::RequestedByMe).is_err());
        assert!(t.advance_phase(TradePhase::Canceled).is_err());
    }

    #[test]
    fn cancel_reject_resets_to_pre_request_state() {
        let mut t = trade();
        t.advance_phase(TradePhase::DepositRequested).unwrap();
        t.advance_phase(TradePhase::DepositPublished).unwrap();
        t.advance_phase(TradePhase::FiatSent).unwrap();
        t.set_cancel_state(CancelState::RequestedByMe).unwrap();
        t.set_cancel_state(CancelState::Rejected).unwrap();
        t.set_cancel_state(CancelState::None).unwrap();
        assert_eq!(t.phase(), TradePhase::FiatSent);
    }

    #[test]
    fn contract_is_write_once() {
        use crate::envelope::KeyRing;
        use crate::trade::contract::{Contract, ContractTerms};
        let maker = KeyRing::generate().unwrap();
        let taker = KeyRing::generate().unwrap();
        let terms = ContractTerms {
            offer_id: "offer-1".to_string(),
            amount_sat: 100_000,
            price_minor: 1_000,
            maker_node_address: crate::common::types::NodeAddress::new("maker.onion", 9999),
            taker_node_address: crate::common::types::NodeAddress::new("taker.onion", 9999),
            maker_pub_key_ring: maker.pub_key_ring(),
            taker_pub_key_ring: taker.pub_key_ring(),
            maker_account_fingerprint: "maker-acct".to_string(),
            taker_account_fingerprint: "taker-acct".to_string(),
        };
        let mut t = trade();
        t.set_contract(Contract::new(terms.clone(), vec![1], vec![2]))
            .unwrap();
        assert!(t
            .set_contract(Contract::new(terms, vec![3], vec![4]))
            .is_err());
    }
}
