use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::common::error::TradewindError;
use crate::common::types::TradeIdString;
use crate::delivery::InboundMessage;

pub(super) struct Router {
    trade_message_tx_map: HashMap<TradeIdString, mpsc::Sender<InboundMessage>>,
    trade_message_fallback_tx: Option<mpsc::Sender<InboundMessage>>,
}

impl Router {
    pub(super) fn new() -> Self {
        Router {
            trade_message_tx_map: HashMap::new(),
            trade_message_fallback_tx: None,
        }
    }

    pub(super) fn register_trade_message_tx(
        &mut self,
        trade_id: TradeIdString,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(), TradewindError> {
        debug!("register_trade_message_tx() for {}", trade_id);
        if self
            .trade_message_tx_map
            .insert(trade_id.clone(), tx)
            .is_some()
        {
            let error = TradewindError::Simple(format!(
                "register_trade_message_tx() for {} already registered",
                trade_id
            ));
            Err(error)
        } else {
            Ok(())
        }
    }

    pub(super) fn unregister_trade_message_tx(
        &mut self,
        trade_id: &str,
    ) -> Result<(), TradewindError> {
        debug!("unregister_trade_message_tx() for {}", trade_id);
        if self.trade_message_tx_map.remove(trade_id).is_none() {
            let error = TradewindError::Simple(format!(
                "unregister_trade_message_tx() {} expected to already be registered",
                trade_id
            ));
            Err(error)
        } else {
            Ok(())
        }
    }

    pub(super) fn register_fallback_tx(
        &mut self,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(), TradewindError> {
        debug!("register_fallback_tx()");

        let mut result = Ok(());
        if self.trade_message_fallback_tx.is_some() {
            let error =
                TradewindError::Simple("register_fallback_tx() already registered".to_string());
            result = Err(error);
        }
        self.trade_message_fallback_tx = Some(tx);
        result
    }

    pub(super) async fn handle_inbound(
        &mut self,
        inbound: InboundMessage,
    ) -> Result<(), TradewindError> {
        if let Some(tx) = self.trade_message_tx_map.get(&inbound.message.trade_id) {
            tx.send(inbound).await?;
            return Ok(());
        }

        if let Some(tx) = &self.trade_message_fallback_tx {
            tx.send(inbound).await?;
            return Ok(());
        }

        Err(TradewindError::Simple(
            "No channel Tx registered for trade message routing".to_string(),
        ))
    }
}
