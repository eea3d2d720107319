use async_trait::async_trait;

use crate::common::error::TradewindError;

/// Funding-wallet operations the engine depends on. The engine treats
/// transactions and inputs as opaque strings; constructing and relaying them
/// is entirely the implementor's concern.
#[async_trait]
pub trait WalletService: Send + Sync {
    /// Reserve and return inputs covering `amount_sat` plus this side's
    /// deposit contribution.
    async fn create_deposit_inputs(&self, amount_sat: u64) -> Result<Vec<String>, TradewindError>;

    /// Build the unsigned 2-of-2 deposit transaction from both sides' inputs.
    async fn create_deposit_tx(
        &self,
        my_inputs: &[String],
        peer_inputs: &[String],
        amount_sat: u64,
    ) -> Result<String, TradewindError>;

    /// Sign with our key and broadcast; returns the transaction id.
    async fn sign_and_publish(&self, tx: &str) -> Result<String, TradewindError>;

    /// Build the unsigned payout transaction spending the deposit output.
    async fn create_payout_tx(
        &self,
        deposit_tx_id: &str,
        amount_sat: u64,
    ) -> Result<String, TradewindError>;

    async fn get_balance(&self) -> Result<u64, TradewindError>;
}
