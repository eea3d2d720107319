pub mod delivery;
mod router;
pub mod transport;

pub(crate) use delivery::DeliveryAccess;
pub(crate) use delivery::DeliveryService;
pub use delivery::InboundMessage;
pub use transport::{RawInbound, SendOutcome, Transport};
