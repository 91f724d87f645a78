//! Domain events and the in-process bus that delivers them

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventHandler, LoggingHandler};
pub use event::{DomainEvent, EventKind, EventType};
