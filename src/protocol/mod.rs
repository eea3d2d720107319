pub(crate) mod model;
pub mod protocol;
pub(crate) mod roles;
pub(crate) mod tasks;

pub(crate) use model::ProtocolModel;
pub(crate) use protocol::TradeProtocol;
pub use protocol::{TradeNotif, TradeProtocolAccess, TradeSnapshot};
