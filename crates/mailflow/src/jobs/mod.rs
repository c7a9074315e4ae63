pub mod maintenance;
pub mod memory;
pub mod model;
pub mod queue;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod worker;

pub use memory::MemoryQueue;
pub use model::{
    FailedJob, JobOptions, LeasedJob, QueueCounts, QueueJob, QueueName, RunQueueJob,
    SendQueueJob, SubmitOutcome, TriggerSource, PRIORITY_HIGH, PRIORITY_NORMAL,
};
pub use queue::JobQueue;
pub use repo::PgQueue;
pub use retry::RetryConfig;
pub use runner::JobRunner;
pub use worker::{Consumer, ConsumerConfig, JobError, JobHandler};
