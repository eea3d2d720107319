use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};

use crate::common::types::{NodeAddress, TradeRole};
use crate::envelope::keyring::PubKeyRing;

/// The maker's side of the offered trade: `Buy` means the maker buys BTC for
/// fiat, so the taker sells.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, IntoStaticStr,
)]
pub enum OfferDirection {
    Buy,
    Sell,
}

/// The published offer a trade is negotiated from. The offer id doubles as
/// the trade id once taken.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfferTerms {
    pub offer_id: String,
    pub direction: OfferDirection,
    pub amount_sat: u64,
    pub price_minor: u64,
    pub maker_node_address: NodeAddress,
    pub maker_pub_key_ring: PubKeyRing,
    pub maker_account_fingerprint: String,
}

impl OfferTerms {
    pub fn taker_role(&self) -> TradeRole {
        match self.direction {
            OfferDirection::Buy => TradeRole::SellerAsTaker,
            OfferDirection::Sell => TradeRole::BuyerAsTaker,
        }
    }

    pub fn maker_role(&self) -> TradeRole {
        self.taker_role().counterpart()
    }
}
