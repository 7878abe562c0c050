//! Data model shared by the store, the batcher and the worker loop.

mod batch;
mod retry;
mod stats;
mod task;

pub use batch::{batch_key, batch_owner, BatchJob, BatchStatus, RecordOutcome};
pub use retry::RetryPolicy;
pub use stats::QueueStats;
pub use task::{
    parse_open_index_key, task_key, NewTask, Task, TaskKind, TaskStatus, BATCH_OWNER_PREFIX,
    OPEN_INDEX_PREFIX,
};
