pub mod ids;
pub mod job;
pub mod events;
pub mod stats;

pub use ids::JobId;
pub use job::{Job, DeadLetterJob, Payload};
pub use events::JobEvent;
pub use stats::{QueueStats, FailedJob, CleanStatus};
