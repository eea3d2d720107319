pub mod keyring;
pub mod seal;

pub use keyring::{KeyRing, PubKeyRing};
pub use seal::{open, seal, OpenedMessage, SealedEnvelope};
