use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};

pub type TradeIdString = String;
pub type MsgUidString = String;

/// Network identity of a peer. `Ord` is derived on (host, port) — the cancel
/// sub-protocol uses this ordering as its deterministic tie-break.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Feature-support flag a peer advertises. A receiver that lacks the
/// capability a message kind requires ignores that message instead of
/// crashing on it.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
pub enum Capability {
    TradeProtocol,
    TradeCancellation,
    Mailbox,
    Ack,
}

pub type CapabilitySet = HashSet<Capability>;

/// Everything this node supports.
pub fn local_capabilities() -> CapabilitySet {
    HashSet::from([
        Capability::TradeProtocol,
        Capability::TradeCancellation,
        Capability::Mailbox,
        Capability::Ack,
    ])
}

/// The four role combinations a trade can be driven under. Which side creates
/// the deposit tx and which side initiates the payout signing differs per
/// role, never the task logic itself.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr,
)]
pub enum TradeRole {
    BuyerAsMaker,
    BuyerAsTaker,
    SellerAsMaker,
    SellerAsTaker,
}

impl TradeRole {
    pub fn is_buyer(&self) -> bool {
        matches!(self, TradeRole::BuyerAsMaker | TradeRole::BuyerAsTaker)
    }

    pub fn is_seller(&self) -> bool {
        !self.is_buyer()
    }

    pub fn is_maker(&self) -> bool {
        matches!(self, TradeRole::BuyerAsMaker | TradeRole::SellerAsMaker)
    }

    pub fn is_taker(&self) -> bool {
        !self.is_maker()
    }

    /// The role the peer on the other side of this trade holds.
    pub fn counterpart(&self) -> TradeRole {
        match self {
            TradeRole::BuyerAsMaker => TradeRole::SellerAsTaker,
            TradeRole::BuyerAsTaker => TradeRole::SellerAsMaker,
            TradeRole::SellerAsMaker => TradeRole::BuyerAsTaker,
            TradeRole::SellerAsTaker => TradeRole::BuyerAsMaker,
        }
    }
}
