//! crmq - coordination core for CRM worker swarms
//!
//! Many stateless worker processes share one object store and, through it,
//! a durable task queue with leases, a global CRM call budget and one OAuth
//! credential. Every shared mutation is a conditional write, so workers need
//! no coordinator, no database and no message broker.

pub mod admission;
pub mod auth;
pub mod cli;
pub mod config;
pub mod crm;
pub mod models;
pub mod queue;
pub mod scaling;
pub mod storage;
pub mod worker;

pub use admission::{Admission, AdmissionConfig, AdmissionController, AdmissionError, Permit};
pub use auth::{AccessToken, AuthError, CredentialCache, CredentialConfig, TokenProvider};
pub use crm::{CrmClient, CrmOperation, ErrorCategory, ExecutionError};
pub use models::{NewTask, QueueStats, RetryPolicy, Task, TaskKind, TaskStatus};
pub use queue::{StoreConfig, StoreError, TaskStore};
pub use scaling::{ScaleHint, ScalePolicy};
pub use worker::{Batcher, Sweeper, Worker, WorkerConfig, WorkerError};
