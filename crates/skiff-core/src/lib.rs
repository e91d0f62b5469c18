pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;
pub mod types;

pub use config::*;
pub use error::ConsumerError;
pub use types::*;
