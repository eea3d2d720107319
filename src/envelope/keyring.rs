use secp256k1::rand::rngs::OsRng;
use secp256k1::schnorr::Signature;
use secp256k1::{All, KeyPair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::common::error::TradewindError;

/// Public half of a [`KeyRing`]: the Schnorr signature key peers verify
/// against and the X25519 key messages are sealed to. Carried in contracts
/// and offers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PubKeyRing {
    pub sig_pubkey: XOnlyPublicKey,
    pub enc_pubkey: PublicKey,
}

/// A node's long-lived identity: signing keypair plus encryption keypair.
#[derive(Clone)]
pub struct KeyRing {
    secp: Secp256k1<All>,
    sig_keypair: KeyPair,
    enc_secret: StaticSecret,
}

impl KeyRing {
    pub fn generate() -> Result<Self, TradewindError> {
        let secp = Secp256k1::new();
        let sig_keypair = KeyPair::new(&secp, &mut OsRng);
        let mut enc_bytes = [0u8; 32];
        getrandom::getrandom(&mut enc_bytes)?;
        let enc_secret = StaticSecret::from(enc_bytes);
        Ok(Self {
            secp,
            sig_keypair,
            enc_secret,
        })
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        let (sig_pubkey, _parity) = XOnlyPublicKey::from_keypair(&self.sig_keypair);
        PubKeyRing {
            sig_pubkey,
            enc_pubkey: PublicKey::from(&self.enc_secret),
        }
    }

    pub fn sig_pubkey(&self) -> XOnlyPublicKey {
        XOnlyPublicKey::from_keypair(&self.sig_keypair).0
    }

    /// Schnorr-sign a 32-byte digest. Returns the 64-byte signature.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<Vec<u8>, TradewindError> {
        let message = Message::from_slice(digest)?;
        let signature = self.secp.sign_schnorr(&message, &self.sig_keypair);
        Ok(signature.as_ref().to_vec())
    }

    pub fn verify_digest(
        &self,
        digest: &[u8; 32],
        signature: &[u8],
        pubkey: &XOnlyPublicKey,
    ) -> Result<(), TradewindError> {
        let message = Message::from_slice(digest)?;
        let signature = Signature::from_slice(signature)?;
        self.secp
            .verify_schnorr(&signature, &message, pubkey)
            .map_err(|_| TradewindError::Crypto("signature verification failed".to_string()))
    }

    /// X25519 shared secret with `peer`, hashed down to a symmetric key.
    pub(crate) fn shared_key(&self, peer: &PublicKey) -> [u8; 32] {
        let shared = self.enc_secret.diffie_hellman(peer);
        sha256(shared.as_bytes())
    }
}

pub(crate) fn sha256(bytes: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}
