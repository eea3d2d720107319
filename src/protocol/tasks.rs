//! Shared task vocabulary the role wirings compose their pipelines from.
//! Every task reads and writes only through the [`ProtocolModel`] handed to
//! it, so a task is reusable by any role whose wiring includes it.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::common::error::TradewindError;
use crate::envelope::keyring::sha256;
use crate::message::TradeMessageBody;
use crate::protocol::model::ProtocolModel;
use crate::task::Task;
use crate::trade::contract::{Contract, ContractTerms};
use crate::trade::{CancelState, TradePhase};

pub(crate) struct CreateDepositInputs;

#[async_trait]
impl Task<ProtocolModel> for CreateDepositInputs {
    fn name(&self) -> &'static str {
        "CreateDepositInputs"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let inputs = model
            .wallet
            .create_deposit_inputs(model.offer.amount_sat)
            .await?;
        if inputs.is_empty() {
            return Err(TradewindError::Wallet(format!(
                "wallet returned no deposit inputs for trade {}",
                model.trade.id
            )));
        }
        model.process.my_deposit_inputs = inputs;
        Ok(())
    }
}

/// Taker drafts the contract terms from the offer plus its own identity,
/// signs them and opens the deposit negotiation.
pub(crate) struct SendPayDepositRequest;

#[async_trait]
impl Task<ProtocolModel> for SendPayDepositRequest {
    fn name(&self) -> &'static str {
        "SendPayDepositRequest"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let terms = ContractTerms {
            offer_id: model.offer.offer_id.clone(),
            amount_sat: model.offer.amount_sat,
            price_minor: model.offer.price_minor,
            maker_node_address: model.offer.maker_node_address.clone(),
            taker_node_address: model.my_node_address.clone(),
            maker_pub_key_ring: model.offer.maker_pub_key_ring.clone(),
            taker_pub_key_ring: model.keyring.pub_key_ring(),
            maker_account_fingerprint: model.offer.maker_account_fingerprint.clone(),
            taker_account_fingerprint: model.my_account_fingerprint.clone(),
        };
        let signature = model.keyring.sign_digest(&terms.digest()?)?;

        model.process.contract_terms = Some(terms.clone());
        model.process.my_contract_sig = Some(signature.clone());
        model.trade.advance_phase(TradePhase::DepositRequested)?;

        model
            .send_to_peer(
                TradeMessageBody::PayDepositRequest {
                    taker_deposit_inputs: model.process.my_deposit_inputs.clone(),
                    contract_terms: terms,
                    taker_contract_sig: signature,
                },
                true,
            )
            .await
    }
}

/// Maker validates the taker's drafted terms against its own published offer
/// and stashes the taker's half of the negotiation.
pub(crate) struct ProcessDepositRequest;

#[async_trait]
impl Task<ProtocolModel> for ProcessDepositRequest {
    fn name(&self) -> &'static str {
        "ProcessDepositRequest"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let (inputs, terms, signature) = match &model.current_message()?.body {
            TradeMessageBody::PayDepositRequest {
                taker_deposit_inputs,
                contract_terms,
                taker_contract_sig,
            } => (
                taker_deposit_inputs.clone(),
                contract_terms.clone(),
                taker_contract_sig.clone(),
            ),
            body => {
                return Err(TradewindError::Validation(format!(
                    "expected PayDepositRequest, got {}",
                    body
                )))
            }
        };

        if terms.offer_id != model.offer.offer_id
            || terms.amount_sat != model.offer.amount_sat
            || terms.price_minor != model.offer.price_minor
        {
            return Err(TradewindError::Validation(format!(
                "contract terms for trade {} do not match the published offer",
                model.trade.id
            )));
        }
        if terms.maker_node_address != model.my_node_address
            || terms.maker_pub_key_ring != model.keyring.pub_key_ring()
            || terms.maker_account_fingerprint != model.my_account_fingerprint
        {
            return Err(TradewindError::Validation(format!(
                "contract terms for trade {} misstate the maker's identity",
                model.trade.id
            )));
        }

        model.trade.peer_address = Some(terms.taker_node_address.clone());
        model.process.peer_pub_key_ring = Some(terms.taker_pub_key_ring.clone());
        model.process.peer_deposit_inputs = inputs;
        model.process.contract_terms = Some(terms);
        model.process.peer_contract_sig = Some(signature);
        Ok(())
    }
}

pub(crate) struct VerifyPeerAccount;

#[async_trait]
impl Task<ProtocolModel> for VerifyPeerAccount {
    fn name(&self) -> &'static str {
        "VerifyPeerAccount"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let terms = model.process.contract_terms.as_ref().ok_or_else(|| {
            TradewindError::Simple("no contract terms staged for account check".to_string())
        })?;
        let peer_fingerprint = if model.trade.role.is_maker() {
            &terms.taker_account_fingerprint
        } else {
            &terms.maker_account_fingerprint
        };
        if peer_fingerprint.is_empty() {
            return Err(TradewindError::Validation(format!(
                "peer of trade {} presented no payment account fingerprint",
                model.trade.id
            )));
        }
        if *peer_fingerprint == model.my_account_fingerprint {
            return Err(TradewindError::Validation(format!(
                "peer of trade {} presented our own payment account",
                model.trade.id
            )));
        }
        Ok(())
    }
}

/// Maker verifies the taker's signature over the terms, countersigns and
/// pins the resulting contract on the trade.
pub(crate) struct VerifyAndSignContract;

#[async_trait]
impl Task<ProtocolModel> for VerifyAndSignContract {
    fn name(&self) -> &'static str {
        "VerifyAndSignContract"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let terms = model.process.contract_terms.clone().ok_or_else(|| {
            TradewindError::Simple("no contract terms staged for signing".to_string())
        })?;
        let taker_sig = model.process.peer_contract_sig.clone().ok_or_else(|| {
            TradewindError::Simple("no taker contract signature staged".to_string())
        })?;

        let digest = terms.digest()?;
        model
            .keyring
            .verify_digest(&digest, &taker_sig, &terms.taker_pub_key_ring.sig_pubkey)?;

        let maker_sig = model.keyring.sign_digest(&digest)?;
        model.process.my_contract_sig = Some(maker_sig.clone());
        model
            .trade
            .set_contract(Contract::new(terms, maker_sig, taker_sig))?;
        info!("Trade {} contract signed by both parties", model.trade.id);
        Ok(())
    }
}

pub(crate) struct SendPublishDepositTxRequest;

#[async_trait]
impl Task<ProtocolModel> for SendPublishDepositTxRequest {
    fn name(&self) -> &'static str {
        "SendPublishDepositTxRequest"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let terms = model.process.contract_terms.clone().ok_or_else(|| {
            TradewindError::Simple("no contract terms to send back".to_string())
        })?;
        let signature = model.process.my_contract_sig.clone().ok_or_else(|| {
            TradewindError::Simple("maker contract signature missing".to_string())
        })?;

        model.trade.advance_phase(TradePhase::DepositRequested)?;
        model
            .send_to_peer(
                TradeMessageBody::RequestPublishDepositTx {
                    maker_deposit_inputs: model.process.my_deposit_inputs.clone(),
                    contract_terms: terms,
                    maker_contract_sig: signature,
                },
                true,
            )
            .await
    }
}

/// Taker checks the maker sent back the exact terms it drafted, verifies the
/// countersignature and pins the contract.
pub(crate) struct ProcessPublishDepositTxRequest;

#[async_trait]
impl Task<ProtocolModel> for ProcessPublishDepositTxRequest {
    fn name(&self) -> &'static str {
        "ProcessPublishDepositTxRequest"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let (inputs, terms, maker_sig) = match &model.current_message()?.body {
            TradeMessageBody::RequestPublishDepositTx {
                maker_deposit_inputs,
                contract_terms,
                maker_contract_sig,
            } => (
                maker_deposit_inputs.clone(),
                contract_terms.clone(),
                maker_contract_sig.clone(),
            ),
            body => {
                return Err(TradewindError::Validation(format!(
                    "expected RequestPublishDepositTx, got {}",
                    body
                )))
            }
        };

        if Some(&terms) != model.process.contract_terms.as_ref() {
            return Err(TradewindError::Validation(format!(
                "maker of trade {} altered the drafted contract terms",
                model.trade.id
            )));
        }
        let taker_sig = model.process.my_contract_sig.clone().ok_or_else(|| {
            TradewindError::Simple("taker contract signature missing".to_string())
        })?;

        let digest = terms.digest()?;
        model
            .keyring
            .verify_digest(&digest, &maker_sig, &terms.maker_pub_key_ring.sig_pubkey)?;

        model.process.peer_deposit_inputs = inputs;
        model.process.peer_contract_sig = Some(maker_sig.clone());
        model
            .trade
            .set_contract(Contract::new(terms, maker_sig, taker_sig))?;
        info!("Trade {} contract signed by both parties", model.trade.id);
        Ok(())
    }
}

pub(crate) struct SignAndPublishDepositTx;

#[async_trait]
impl Task<ProtocolModel> for SignAndPublishDepositTx {
    fn name(&self) -> &'static str {
        "SignAndPublishDepositTx"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let tx = model
            .wallet
            .create_deposit_tx(
                &model.process.my_deposit_inputs,
                &model.process.peer_deposit_inputs,
                model.offer.amount_sat,
            )
            .await?;
        let tx_id = model.wallet.sign_and_publish(&tx).await?;
        info!("Trade {} deposit tx {} published", model.trade.id, tx_id);
        model.trade.deposit_tx_id = Some(tx_id);
        model.trade.advance_phase(TradePhase::DepositPublished)?;
        Ok(())
    }
}

pub(crate) struct SendDepositPublishedMessage;

#[async_trait]
impl Task<ProtocolModel> for SendDepositPublishedMessage {
    fn name(&self) -> &'static str {
        "SendDepositPublishedMessage"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let deposit_tx_id = model.trade.deposit_tx_id.clone().ok_or_else(|| {
            TradewindError::Simple("no deposit tx id to announce".to_string())
        })?;
        model
            .send_to_peer(
                TradeMessageBody::DepositTxPublished { deposit_tx_id },
                false,
            )
            .await
    }
}

pub(crate) struct ProcessDepositPublished;

#[async_trait]
impl Task<ProtocolModel> for ProcessDepositPublished {
    fn name(&self) -> &'static str {
        "ProcessDepositPublished"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let deposit_tx_id = match &model.current_message()?.body {
            TradeMessageBody::DepositTxPublished { deposit_tx_id } => deposit_tx_id.clone(),
            body => {
                return Err(TradewindError::Validation(format!(
                    "expected DepositTxPublished, got {}",
                    body
                )))
            }
        };
        model.trade.deposit_tx_id = Some(deposit_tx_id);
        model.trade.advance_phase(TradePhase::DepositPublished)?;
        Ok(())
    }
}

pub(crate) struct VerifyFeePayment;

#[async_trait]
impl Task<ProtocolModel> for VerifyFeePayment {
    fn name(&self) -> &'static str {
        "VerifyFeePayment"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        match &model.trade.deposit_tx_id {
            Some(tx_id) if !tx_id.is_empty() => {
                debug!("Trade {} deposit tx {} accepted", model.trade.id, tx_id);
                Ok(())
            }
            _ => Err(TradewindError::Validation(format!(
                "trade {} has no funded deposit tx",
                model.trade.id
            ))),
        }
    }
}

/// Buyer prepares the payout tx and signs it ahead of starting the fiat
/// transfer; the seller gets the signature, not the tx.
pub(crate) struct CreateAndSignPayoutTx;

#[async_trait]
impl Task<ProtocolModel> for CreateAndSignPayoutTx {
    fn name(&self) -> &'static str {
        "CreateAndSignPayoutTx"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let deposit_tx_id = model.trade.deposit_tx_id.clone().ok_or_else(|| {
            TradewindError::Simple("no deposit tx to pay out from".to_string())
        })?;
        let unsigned = model
            .wallet
            .create_payout_tx(&deposit_tx_id, model.offer.amount_sat)
            .await?;
        let signature = model.keyring.sign_digest(&sha256(unsigned.as_bytes()))?;
        model.process.unsigned_payout_tx = Some(unsigned);
        model.process.buyer_payout_tx_sig = Some(signature);
        Ok(())
    }
}

pub(crate) struct SendFiatTransferStartedMessage;

#[async_trait]
impl Task<ProtocolModel> for SendFiatTransferStartedMessage {
    fn name(&self) -> &'static str {
        "SendFiatTransferStartedMessage"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let signature = model.process.buyer_payout_tx_sig.clone().ok_or_else(|| {
            TradewindError::Simple("no payout tx signature prepared".to_string())
        })?;
        model.trade.advance_phase(TradePhase::FiatSent)?;
        model
            .send_to_peer(
                TradeMessageBody::FiatTransferStarted {
                    buyer_payout_tx_sig: signature,
                },
                true,
            )
            .await
    }
}

/// Seller recreates the payout tx from the shared deposit and checks the
/// buyer's signature actually covers it.
pub(crate) struct ProcessFiatTransferStarted;

#[async_trait]
impl Task<ProtocolModel> for ProcessFiatTransferStarted {
    fn name(&self) -> &'static str {
        "ProcessFiatTransferStarted"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let buyer_sig = match &model.current_message()?.body {
            TradeMessageBody::FiatTransferStarted { buyer_payout_tx_sig } => {
                buyer_payout_tx_sig.clone()
            }
            body => {
                return Err(TradewindError::Validation(format!(
                    "expected FiatTransferStarted, got {}",
                    body
                )))
            }
        };
        let deposit_tx_id = model.trade.deposit_tx_id.clone().ok_or_else(|| {
            TradewindError::Simple("no deposit tx to pay out from".to_string())
        })?;

        let unsigned = model
            .wallet
            .create_payout_tx(&deposit_tx_id, model.offer.amount_sat)
            .await?;
        let peer = model.peer_pub_key_ring()?;
        model.keyring.verify_digest(
            &sha256(unsigned.as_bytes()),
            &buyer_sig,
            &peer.sig_pubkey,
        )?;

        model.process.unsigned_payout_tx = Some(unsigned);
        model.process.buyer_payout_tx_sig = Some(buyer_sig);
        model.trade.advance_phase(TradePhase::FiatSent)?;
        Ok(())
    }
}

pub(crate) struct SignAndPublishPayoutTx;

#[async_trait]
impl Task<ProtocolModel> for SignAndPublishPayoutTx {
    fn name(&self) -> &'static str {
        "SignAndPublishPayoutTx"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let unsigned = model.process.unsigned_payout_tx.clone().ok_or_else(|| {
            TradewindError::Simple("no payout tx prepared for publishing".to_string())
        })?;
        let tx_id = model.wallet.sign_and_publish(&unsigned).await?;
        info!("Trade {} payout tx {} published", model.trade.id, tx_id);
        model.trade.payout_tx_id = Some(tx_id);
        model.trade.advance_phase(TradePhase::PayoutPublished)?;
        Ok(())
    }
}

pub(crate) struct SendPayoutPublishedMessage;

#[async_trait]
impl Task<ProtocolModel> for SendPayoutPublishedMessage {
    fn name(&self) -> &'static str {
        "SendPayoutPublishedMessage"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let payout_tx_id = model.trade.payout_tx_id.clone().ok_or_else(|| {
            TradewindError::Simple("no payout tx id to announce".to_string())
        })?;
        model
            .send_to_peer(TradeMessageBody::PayoutTxPublished { payout_tx_id }, false)
            .await?;
        model.trade.advance_phase(TradePhase::Completed)?;
        Ok(())
    }
}

pub(crate) struct ProcessPayoutPublished;

#[async_trait]
impl Task<ProtocolModel> for ProcessPayoutPublished {
    fn name(&self) -> &'static str {
        "ProcessPayoutPublished"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let payout_tx_id = match &model.current_message()?.body {
            TradeMessageBody::PayoutTxPublished { payout_tx_id } => payout_tx_id.clone(),
            body => {
                return Err(TradewindError::Validation(format!(
                    "expected PayoutTxPublished, got {}",
                    body
                )))
            }
        };
        model.trade.payout_tx_id = Some(payout_tx_id);
        model.trade.advance_phase(TradePhase::PayoutPublished)?;
        model.trade.advance_phase(TradePhase::Completed)?;
        Ok(())
    }
}

pub(crate) struct SendCancelRequest;

#[async_trait]
impl Task<ProtocolModel> for SendCancelRequest {
    fn name(&self) -> &'static str {
        "SendCancelRequest"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let reason = model.process.cancel_reason.clone().unwrap_or_default();
        model.trade.set_cancel_state(CancelState::RequestedByMe)?;
        model
            .send_to_peer(TradeMessageBody::RequestCancelTrade { reason }, true)
            .await
    }
}

pub(crate) struct ProcessCancelRequest;

#[async_trait]
impl Task<ProtocolModel> for ProcessCancelRequest {
    fn name(&self) -> &'static str {
        "ProcessCancelRequest"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let reason = match &model.current_message()?.body {
            TradeMessageBody::RequestCancelTrade { reason } => reason.clone(),
            body => {
                return Err(TradewindError::Validation(format!(
                    "expected RequestCancelTrade, got {}",
                    body
                )))
            }
        };
        model.process.cancel_reason = Some(reason);
        model.trade.set_cancel_state(CancelState::RequestedByPeer)?;
        Ok(())
    }
}

/// Accepting a cancel settles the trade: publish the refund payout when the
/// deposit was funded, then answer the peer.
pub(crate) struct AcceptCancel;

#[async_trait]
impl Task<ProtocolModel> for AcceptCancel {
    fn name(&self) -> &'static str {
        "AcceptCancel"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let payout_tx_id = match model.trade.deposit_tx_id.clone() {
            Some(deposit_tx_id) => {
                let unsigned = model
                    .wallet
                    .create_payout_tx(&deposit_tx_id, model.offer.amount_sat)
                    .await?;
                let tx_id = model.wallet.sign_and_publish(&unsigned).await?;
                model.trade.payout_tx_id = Some(tx_id.clone());
                tx_id
            }
            // Nothing was funded yet; the cancel settles without a payout.
            None => String::new(),
        };

        model.trade.set_cancel_state(CancelState::Accepted)?;
        model.trade.advance_phase(TradePhase::Canceled)?;
        model
            .send_to_peer(TradeMessageBody::CancelTradeAccepted { payout_tx_id }, false)
            .await
    }
}

pub(crate) struct RejectCancel;

#[async_trait]
impl Task<ProtocolModel> for RejectCancel {
    fn name(&self) -> &'static str {
        "RejectCancel"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let reason = model.process.cancel_reason.clone().unwrap_or_default();
        model.trade.set_cancel_state(CancelState::Rejected)?;
        model
            .send_to_peer(TradeMessageBody::CancelTradeRejected { reason }, false)
            .await
    }
}

pub(crate) struct ProcessCancelAccepted;

#[async_trait]
impl Task<ProtocolModel> for ProcessCancelAccepted {
    fn name(&self) -> &'static str {
        "ProcessCancelAccepted"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let payout_tx_id = match &model.current_message()?.body {
            TradeMessageBody::CancelTradeAccepted { payout_tx_id } => payout_tx_id.clone(),
            body => {
                return Err(TradewindError::Validation(format!(
                    "expected CancelTradeAccepted, got {}",
                    body
                )))
            }
        };
        if !payout_tx_id.is_empty() {
            model.trade.payout_tx_id = Some(payout_tx_id);
        }
        model.trade.set_cancel_state(CancelState::Accepted)?;
        model.trade.advance_phase(TradePhase::Canceled)?;
        Ok(())
    }
}

pub(crate) struct ProcessCancelRejected;

#[async_trait]
impl Task<ProtocolModel> for ProcessCancelRejected {
    fn name(&self) -> &'static str {
        "ProcessCancelRejected"
    }

    async fn run(&mut self, model: &mut ProtocolModel) -> Result<(), TradewindError> {
        let reason = match &model.current_message()?.body {
            TradeMessageBody::CancelTradeRejected { reason } => reason.clone(),
            body => {
                return Err(TradewindError::Validation(format!(
                    "expected CancelTradeRejected, got {}",
                    body
                )))
            }
        };
        info!(
            "Trade {} cancel request rejected by peer - {}",
            model.trade.id, reason
        );
        model.process.cancel_reason = Some(reason);
        model.trade.set_cancel_state(CancelState::Rejected)?;
        Ok(())
    }
}
