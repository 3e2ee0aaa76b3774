//! Message transport: the broker contract the runner consumes from and
//! publishes to, an HTTP queue-gateway client, and an in-memory broker.

mod broker;
mod memory;

pub use broker::{Broker, BrokerError, Delivery};
pub use memory::MemoryBroker;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpBroker;
