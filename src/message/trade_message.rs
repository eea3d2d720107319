use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};
use uuid::Uuid;

use crate::common::error::TradewindError;
use crate::common::types::{Capability, MsgUidString, TradeIdString};
use crate::trade::contract::ContractTerms;

/// One protocol message. `trade_id` must match the receiving trade; `uid` is
/// the per-message random token used to detect and ignore duplicate
/// redelivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeMessage {
    pub trade_id: TradeIdString,
    pub uid: MsgUidString,
    pub body: TradeMessageBody,
}

/// Closed set of protocol steps. Exhaustive matching everywhere — adding a
/// variant forces every dispatch site to decide what to do with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Display, IntoStaticStr)]
#[serde(tag = "type")]
pub enum TradeMessageBody {
    /// Taker -> maker: deposit inputs prepared, contract terms drafted and
    /// taker-signed; asks the maker to respond with its own half.
    PayDepositRequest {
        taker_deposit_inputs: Vec<String>,
        contract_terms: ContractTerms,
        taker_contract_sig: Vec<u8>,
    },
    /// Maker -> taker: maker's inputs and contract countersignature; asks the
    /// taker to sign and publish the deposit tx.
    RequestPublishDepositTx {
        maker_deposit_inputs: Vec<String>,
        contract_terms: ContractTerms,
        maker_contract_sig: Vec<u8>,
    },
    /// Taker -> maker: the escrow deposit tx is on the network.
    DepositTxPublished { deposit_tx_id: String },
    /// Buyer -> seller: fiat payment initiated; carries the buyer's signature
    /// over the prepared payout tx.
    FiatTransferStarted { buyer_payout_tx_sig: Vec<u8> },
    /// Seller -> buyer: payout tx broadcast, trade funds released.
    PayoutTxPublished { payout_tx_id: String },
    RequestCancelTrade { reason: String },
    CancelTradeAccepted { payout_tx_id: String },
    CancelTradeRejected { reason: String },
    /// Consumption receipt for a mailbox-delivered message.
    Ack { acked_uid: MsgUidString },
}

impl TradeMessage {
    pub fn new(trade_id: impl Into<TradeIdString>, body: TradeMessageBody) -> Self {
        Self {
            trade_id: trade_id.into(),
            uid: Uuid::new_v4().to_string(),
            body,
        }
    }

    pub fn kind(&self) -> &'static str {
        (&self.body).into()
    }

    /// Structural validation before any dispatch: trade id match and
    /// required-field presence. No state is touched on failure.
    pub fn validate_for(&self, trade_id: &str) -> Result<(), TradewindError> {
        if self.trade_id != trade_id {
            return Err(TradewindError::Validation(format!(
                "message {} carries trade id {} but was dispatched to trade {}",
                self.kind(),
                self.trade_id,
                trade_id
            )));
        }
        if self.uid.is_empty() {
            return Err(TradewindError::Validation(format!(
                "message {} has an empty uid",
                self.kind()
            )));
        }
        let missing = match &self.body {
            TradeMessageBody::PayDepositRequest {
                taker_deposit_inputs,
                taker_contract_sig,
                ..
            } => taker_deposit_inputs.is_empty() || taker_contract_sig.is_empty(),
            TradeMessageBody::RequestPublishDepositTx {
                maker_deposit_inputs,
                maker_contract_sig,
                ..
            } => maker_deposit_inputs.is_empty() || maker_contract_sig.is_empty(),
            TradeMessageBody::DepositTxPublished { deposit_tx_id } => deposit_tx_id.is_empty(),
            TradeMessageBody::FiatTransferStarted { buyer_payout_tx_sig } => {
                buyer_payout_tx_sig.is_empty()
            }
            TradeMessageBody::PayoutTxPublished { payout_tx_id } => payout_tx_id.is_empty(),
            TradeMessageBody::Ack { acked_uid } => acked_uid.is_empty(),
            // Cancel acceptance before the deposit is funded carries no
            // payout tx, so its id stays optional.
            TradeMessageBody::RequestCancelTrade { .. }
            | TradeMessageBody::CancelTradeAccepted { .. }
            | TradeMessageBody::CancelTradeRejected { .. } => false,
        };
        if missing {
            return Err(TradewindError::Validation(format!(
                "message {} is missing a required field",
                self.kind()
            )));
        }
        Ok(())
    }

    /// Whether this message may be durably queued for an unreachable peer.
    pub fn is_mailbox_capable(&self) -> bool {
        !matches!(self.body, TradeMessageBody::Ack { .. })
    }

    /// The capability a receiver must advertise to understand this message.
    pub fn required_capability(&self) -> Capability {
        match self.body {
            TradeMessageBody::RequestCancelTrade { .. }
            | TradeMessageBody::CancelTradeAccepted { .. }
            | TradeMessageBody::CancelTradeRejected { .. } => Capability::TradeCancellation,
            TradeMessageBody::Ack { .. } => Capability::Ack,
            _ => Capability::TradeProtocol,
        }
    }
}
