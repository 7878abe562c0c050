//! Durable task store.
//!
//! ## Layout
//!
//! ```text
//! tasks/{id}.json                               task record (source of truth)
//! open/{priority}/{created_micros}/{id}         ordering index of non-terminal tasks
//! idempotency/{sha256(key)}.json                idempotency key -> task id
//! batches/{id}.json                             batch job record
//! ```
//!
//! The task record is authoritative. Index entries are hints maintained
//! best-effort and repaired by the sweeper.

mod batch;
mod config;
mod error;
mod idempotency;
mod lease;
mod store;
mod transitions;

pub use batch::{BatchGroup, BatchReport, ClaimedBatch};
pub use config::StoreConfig;
pub use error::StoreError;
pub use idempotency::{derive_idempotency_key, idempotency_record_key, IdempotencyRecord};
pub use lease::LeaseFilter;
pub use store::TaskStore;
