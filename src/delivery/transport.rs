use async_trait::async_trait;

use crate::common::types::{CapabilitySet, NodeAddress};
use crate::envelope::SealedEnvelope;

/// Where a sent message ended up.
#[derive(Clone, Debug, PartialEq)]
pub enum SendOutcome {
    /// The peer's node accepted the envelope over a live connection.
    Arrived,
    /// The peer was unreachable; the envelope sits in its mailbox until the
    /// peer comes online and drains it.
    StoredInMailbox,
    Failed(String),
}

/// An envelope received off the wire, before any decryption. `sender_address`
/// is the transport-level origin when known; mailbox redeliveries have none.
pub struct RawInbound {
    pub sender_address: Option<NodeAddress>,
    pub envelope: SealedEnvelope,
    pub via_mailbox: bool,
}

/// Network transport the engine sends through. Implementations own
/// connections, dialing and mailbox storage; the engine only hands over
/// sealed envelopes and addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver directly to a live connection with `address`. Errors when no
    /// connection can be established or the peer rejects the envelope.
    async fn send(
        &self,
        address: &NodeAddress,
        envelope: SealedEnvelope,
    ) -> Result<(), crate::common::error::TradewindError>;

    /// Durably queue for an offline peer.
    async fn store_mailbox(
        &self,
        address: &NodeAddress,
        envelope: SealedEnvelope,
    ) -> Result<(), crate::common::error::TradewindError>;

    async fn confirmed_connections(&self) -> Vec<NodeAddress>;

    /// Last-advertised capability set of `address`, if the peer is known.
    async fn peer_capabilities(&self, address: &NodeAddress) -> Option<CapabilitySet>;
}
