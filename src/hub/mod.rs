mod dispatcher;
mod message_hub;
mod transport;

pub use dispatcher::HubDispatcher;
pub use message_hub::{DispatchReport, HubStatus, MessageHub, PublishOutcome, RejectReason};
pub use transport::{DeliveryError, DeliveryTransport, HttpDeliveryTransport};
