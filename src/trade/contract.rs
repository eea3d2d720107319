use serde::{Deserialize, Serialize};

use crate::common::error::TradewindError;
use crate::common::types::{NodeAddress, TradeRole};
use crate::envelope::keyring::{sha256, PubKeyRing};

/// The terms both parties sign. Drafted by the taker, countersigned by the
/// maker; the digest both signatures cover is the canonical JSON encoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractTerms {
    pub offer_id: String,
    pub amount_sat: u64,
    pub price_minor: u64,
    pub maker_node_address: NodeAddress,
    pub taker_node_address: NodeAddress,
    pub maker_pub_key_ring: PubKeyRing,
    pub taker_pub_key_ring: PubKeyRing,
    pub maker_account_fingerprint: String,
    pub taker_account_fingerprint: String,
}

impl ContractTerms {
    pub fn digest(&self) -> Result<[u8; 32], TradewindError> {
        let json = serde_json::to_string(self)?;
        Ok(sha256(json.as_bytes()))
    }
}

/// Signed terms. Immutable once constructed — fields are private and there
/// are no setters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    terms: ContractTerms,
    maker_signature: Vec<u8>,
    taker_signature: Vec<u8>,
}

impl Contract {
    pub fn new(terms: ContractTerms, maker_signature: Vec<u8>, taker_signature: Vec<u8>) -> Self {
        Self {
            terms,
            maker_signature,
            taker_signature,
        }
    }

    pub fn terms(&self) -> &ContractTerms {
        &self.terms
    }

    pub fn maker_signature(&self) -> &[u8] {
        &self.maker_signature
    }

    pub fn taker_signature(&self) -> &[u8] {
        &self.taker_signature
    }

    pub fn peer_pub_key_ring(&self, my_role: TradeRole) -> &PubKeyRing {
        if my_role.is_maker() {
            &self.terms.taker_pub_key_ring
        } else {
            &self.terms.maker_pub_key_ring
        }
    }

    pub fn peer_node_address(&self, my_role: TradeRole) -> &NodeAddress {
        if my_role.is_maker() {
            &self.terms.taker_node_address
        } else {
            &self.terms.maker_node_address
        }
    }

    /// A peer contacting us from an address other than the one recorded in
    /// the signed contract is detected, never silently accepted.
    pub fn peer_address_matches(&self, my_role: TradeRole, address: &NodeAddress) -> bool {
        self.peer_node_address(my_role) == address
    }
}
