pub mod collab;
pub mod consume_service;
pub mod diff;
pub mod offset_policy;
pub mod process_queue;
pub mod pull_service;
pub mod puller;
pub mod push;
pub mod quota;
pub mod scheduler;
pub mod subscription;

pub use consume_service::{ConsumeService, ConsumeServiceConfig};
pub use process_queue::ProcessQueue;
pub use pull_service::{MessagePuller, PullNext, PullRequest, PullService};
pub use push::{ConsumerState, PushConsumer, PushConsumerBuilder, RebalanceOutcome, RunningInfo};
pub use puller::PullExecutor;
pub use scheduler::Scheduler;
