pub mod contract;
pub mod data;
pub mod offer;
pub mod process_model;
pub mod trade;

pub use contract::{Contract, ContractTerms};
pub use offer::{OfferDirection, OfferTerms};
pub use process_model::ProcessModel;
pub use trade::{CancelState, Trade, TradePhase};
