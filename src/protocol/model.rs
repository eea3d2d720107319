use std::sync::Arc;

use crate::common::error::TradewindError;
use crate::common::types::NodeAddress;
use crate::delivery::{DeliveryAccess, SendOutcome};
use crate::envelope::{KeyRing, PubKeyRing};
use crate::message::{TradeMessage, TradeMessageBody};
use crate::trade::{OfferTerms, ProcessModel, Trade};
use crate::wallet::WalletService;

/// Everything a pipeline task may read or mutate for one trade. Owned by the
/// trade's protocol actor; tasks get exclusive access for their duration.
pub(crate) struct ProtocolModel {
    pub trade: Trade,
    pub process: ProcessModel,
    pub offer: OfferTerms,
    pub my_node_address: NodeAddress,
    pub my_account_fingerprint: String,
    pub keyring: Arc<KeyRing>,
    pub wallet: Arc<dyn WalletService>,
    pub delivery: DeliveryAccess,
}

impl ProtocolModel {
    /// Best-known peer address: the signed contract pins it; before a
    /// contract exists we fall back to what the negotiation has revealed.
    pub(crate) fn peer_address(&self) -> Result<NodeAddress, TradewindError> {
        if let Some(contract) = self.trade.contract() {
            return Ok(contract.peer_node_address(self.trade.role).clone());
        }
        if let Some(address) = &self.trade.peer_address {
            return Ok(address.clone());
        }
        if let Some(address) = &self.process.temp_peer_address {
            return Ok(address.clone());
        }
        if self.trade.role.is_taker() {
            return Ok(self.offer.maker_node_address.clone());
        }
        Err(TradewindError::Simple(format!(
            "peer address unknown for trade {}",
            self.trade.id
        )))
    }

    pub(crate) fn peer_pub_key_ring(&self) -> Result<PubKeyRing, TradewindError> {
        if let Some(contract) = self.trade.contract() {
            return Ok(contract.peer_pub_key_ring(self.trade.role).clone());
        }
        if let Some(ring) = &self.process.peer_pub_key_ring {
            return Ok(ring.clone());
        }
        if self.trade.role.is_taker() {
            return Ok(self.offer.maker_pub_key_ring.clone());
        }
        Err(TradewindError::Simple(format!(
            "peer pub key ring unknown for trade {}",
            self.trade.id
        )))
    }

    /// The inbound message staged for the running pipeline.
    pub(crate) fn current_message(&self) -> Result<&TradeMessage, TradewindError> {
        self.process.last_message.as_ref().ok_or_else(|| {
            TradewindError::Simple(format!(
                "no message staged for processing on trade {}",
                self.trade.id
            ))
        })
    }

    /// Seal and send `body` to the peer, mailbox fallback allowed. With
    /// `expect_reply` the sent message is remembered so the actor can arm a
    /// response timeout and resend it once with the same uid.
    pub(crate) async fn send_to_peer(
        &mut self,
        body: TradeMessageBody,
        expect_reply: bool,
    ) -> Result<(), TradewindError> {
        let address = self.peer_address()?;
        let keys = self.peer_pub_key_ring()?;
        let message = TradeMessage::new(self.trade.id.clone(), body);

        let outcome = self
            .delivery
            .send_message(address.clone(), keys, message.clone(), true)
            .await?;
        if let SendOutcome::Failed(reason) = outcome {
            return Err(TradewindError::Transport(reason));
        }

        self.process.last_outbound = if expect_reply {
            Some((address, message))
        } else {
            None
        };
        Ok(())
    }
}
