pub mod broker;
pub mod error;
pub mod memory;
pub mod partition;
pub mod sql;

pub use broker::{Ack, Broker, BrokerMessage};
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use partition::partition_for;
pub use sql::SqlBroker;
