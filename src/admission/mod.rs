//! Global admission control against the CRM's call budget.
//!
//! Every external call, single or bulk, must hold a permit. The budget is
//! first-come-first-served across all workers; nothing is pre-allocated.

mod controller;
mod window;

use thiserror::Error;

use crate::storage::StorageError;

pub use controller::{
    Admission, AdmissionConfig, AdmissionController, BudgetUsage, Denial, DenialReason, Permit,
};
pub use window::{BudgetWindow, WINDOW_KEY};

/// Failure to consult the budget. A denial is not an error.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AdmissionError {
    #[must_use]
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Storage(err) => err.suggestion(),
        }
    }
}
