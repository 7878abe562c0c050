//! Integration tests for crmq.
//!
//! Everything except `s3_backend` runs against the in-memory store.
//! The S3 tests need a running S3-compatible endpoint:
//! Run: docker-compose up -d
//! Then: cargo test --test integration --features integration

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod admission;
mod batching;
mod common;
mod crash_recovery;
mod credentials;
mod idempotency;
mod lease_protocol;
mod retry_exhaustion;
mod s3_backend;
mod worker_loop;
