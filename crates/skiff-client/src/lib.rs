pub mod instance;
pub mod member;
pub mod registry;

pub use instance::ClientInstance;
pub use member::{HeartbeatSink, ManagedAdmin, ManagedConsumer, ManagedProducer};
pub use registry::Registry;
