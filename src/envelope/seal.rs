use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::common::error::TradewindError;
use crate::common::types::CapabilitySet;
use crate::envelope::keyring::{sha256, KeyRing, PubKeyRing};
use crate::message::TradeMessage;

const NONCE_LEN: usize = 12;
const SYM_KEY_LEN: usize = 32;

/// What actually crosses the wire: a per-message symmetric key sealed to the
/// recipient, the signed message encrypted under that key, the sender's
/// signature pubkey, and the sender's capability set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub ephemeral_pub: PublicKey,
    pub sealed_key: Vec<u8>,
    pub key_nonce: Vec<u8>,
    pub payload: Vec<u8>,
    pub payload_nonce: Vec<u8>,
    pub sender_sig_pubkey: XOnlyPublicKey,
    pub capabilities: CapabilitySet,
}

#[derive(Serialize, Deserialize)]
struct SignedPayload {
    message_json: String,
    signature: Vec<u8>,
}

/// Successfully opened envelope. Only this ever reaches the dispatcher.
#[derive(Clone, Debug)]
pub struct OpenedMessage {
    pub message: TradeMessage,
    pub sender_sig_pubkey: XOnlyPublicKey,
    pub capabilities: CapabilitySet,
}

fn random_bytes<const N: usize>() -> Result<[u8; N], TradewindError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes)?;
    Ok(bytes)
}

fn encrypt(key: &[u8; 32], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, TradewindError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| TradewindError::Crypto("envelope encryption failed".to_string()))
}

fn decrypt(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, TradewindError> {
    if nonce.len() != NONCE_LEN {
        return Err(TradewindError::Crypto(
            "envelope nonce has the wrong length".to_string(),
        ));
    }
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TradewindError::Crypto("envelope decryption failed".to_string()))
}

/// Sign-then-encrypt with a fresh symmetric key per message.
pub fn seal(
    message: &TradeMessage,
    recipient: &PubKeyRing,
    keyring: &KeyRing,
    capabilities: CapabilitySet,
) -> Result<SealedEnvelope, TradewindError> {
    let message_json = serde_json::to_string(message)?;
    let signature = keyring.sign_digest(&sha256(message_json.as_bytes()))?;
    let signed_json = serde_json::to_vec(&SignedPayload {
        message_json,
        signature,
    })?;

    let sym_key = random_bytes::<SYM_KEY_LEN>()?;
    let payload_nonce = random_bytes::<NONCE_LEN>()?;
    let payload = encrypt(&sym_key, &payload_nonce, &signed_json)?;

    // Seal the symmetric key to the recipient with an ephemeral ECDH key.
    let ephemeral_secret = StaticSecret::from(random_bytes::<32>()?);
    let ephemeral_pub = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(&recipient.enc_pubkey);
    let key_encryption_key = sha256(shared.as_bytes());
    let key_nonce = random_bytes::<NONCE_LEN>()?;
    let sealed_key = encrypt(&key_encryption_key, &key_nonce, &sym_key)?;

    Ok(SealedEnvelope {
        ephemeral_pub,
        sealed_key,
        key_nonce: key_nonce.to_vec(),
        payload,
        payload_nonce: payload_nonce.to_vec(),
        sender_sig_pubkey: keyring.sig_pubkey(),
        capabilities,
    })
}

/// Decrypt and verify. Any failure at any step is a hard reject — the
/// message is discarded and never reaches protocol logic.
pub fn open(
    envelope: &SealedEnvelope,
    keyring: &KeyRing,
) -> Result<OpenedMessage, TradewindError> {
    let key_encryption_key = keyring.shared_key(&envelope.ephemeral_pub);
    let sym_key_bytes = decrypt(&key_encryption_key, &envelope.key_nonce, &envelope.sealed_key)?;
    let sym_key: [u8; SYM_KEY_LEN] = sym_key_bytes.try_into().map_err(|_| {
        TradewindError::Crypto("unsealed symmetric key has the wrong length".to_string())
    })?;

    let signed_json = decrypt(&sym_key, &envelope.payload_nonce, &envelope.payload)?;
    let signed: SignedPayload = serde_json::from_slice(&signed_json)
        .map_err(|_| TradewindError::Crypto("envelope payload is not valid JSON".to_string()))?;

    keyring.verify_digest(
        &sha256(signed.message_json.as_bytes()),
        &signed.signature,
        &envelope.sender_sig_pubkey,
    )?;

    let message: TradeMessage = serde_json::from_str(&signed.message_json)
        .map_err(|_| TradewindError::Crypto("signed payload is not a trade message".to_string()))?;

    Ok(OpenedMessage {
        message,
        sender_sig_pubkey: envelope.sender_sig_pubkey,
        capabilities: envelope.capabilities.clone(),
    })
}
