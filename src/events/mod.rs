//! Lifecycle notifications for observers.
//!
//! The bus is a notification mechanism with a short replay window, not a
//! durable log. Durable delivery of work belongs to [`crate::queue`].

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventBusConfig, EventBusError, EventBusStats, EventSink, Subscription};
pub use event::{event_types, Event, SSE_KEEPALIVE};
