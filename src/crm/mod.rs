//! The external CRM as seen by workers and the batcher.

mod bulk;
mod error;
mod rest;

use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::auth::AccessToken;
use crate::models::{RecordOutcome, Task, TaskKind};

pub use bulk::{BulkJobConfig, JobState};
pub use error::{ErrorCategory, ExecutionError, RetryClass};
pub use rest::{RestCrmClient, COLLECTION_LIMIT, DEFAULT_API_VERSION};

/// One single-record CRM call, decoded from a task payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CrmOperation {
    Create {
        object_type: String,
        fields: Map<String, Value>,
    },
    Update {
        object_type: String,
        id: String,
        fields: Map<String, Value>,
    },
    Delete {
        object_type: String,
        id: String,
    },
    Query {
        soql: String,
    },
}

impl CrmOperation {
    /// Decodes a task payload.
    ///
    /// - create: an object of fields
    /// - update: an object of fields including `Id`
    /// - delete: `{"Id": ...}` or the id as a string
    /// - query: the SOQL as a string, or `{"query": ...}`
    ///
    /// Bulk kinds decode like their single-record counterparts.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for payloads of the wrong shape. It is permanent.
    pub fn from_task(task: &Task) -> Result<Self, ExecutionError> {
        let object_type = task.object_type.clone();
        match task.kind {
            TaskKind::Create | TaskKind::BulkCreate => Ok(Self::Create {
                object_type,
                fields: fields(&task.payload)?,
            }),
            TaskKind::Update | TaskKind::BulkUpdate => {
                let mut fields = fields(&task.payload)?;
                let id = take_id(&mut fields)?;
                Ok(Self::Update {
                    object_type,
                    id,
                    fields,
                })
            }
            TaskKind::Delete => {
                let id = match &task.payload {
                    Value::String(id) => id.clone(),
                    other => take_id(&mut fields(other)?)?,
                };
                Ok(Self::Delete { object_type, id })
            }
            TaskKind::Query => {
                let soql = match &task.payload {
                    Value::String(soql) => Some(soql.clone()),
                    Value::Object(map) => map
                        .get("query")
                        .or_else(|| map.get("soql"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                };
                soql.filter(|q| !q.trim().is_empty())
                    .map(|soql| Self::Query { soql })
                    .ok_or_else(|| malformed("query payload must be a SOQL string"))
            }
        }
    }
}

fn fields(payload: &Value) -> Result<Map<String, Value>, ExecutionError> {
    payload
        .as_object()
        .cloned()
        .ok_or_else(|| malformed("payload must be a JSON object of fields"))
}

fn take_id(fields: &mut Map<String, Value>) -> Result<String, ExecutionError> {
    match fields.remove("Id").or_else(|| fields.remove("id")) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id),
        _ => Err(malformed("payload is missing a string \"Id\"")),
    }
}

fn malformed(message: &str) -> ExecutionError {
    ExecutionError::new(ErrorCategory::Malformed, message)
}

/// The CRM API.
#[async_trait]
pub trait CrmClient: Debug + Send + Sync {
    /// Performs one single-record operation.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ExecutionError`].
    async fn execute(
        &self,
        token: &AccessToken,
        operation: &CrmOperation,
    ) -> Result<Value, ExecutionError>;

    /// Performs one bulk call over `records`.
    ///
    /// The returned outcomes are in `records` order. An `Err` means the call
    /// as a whole failed and no record was applied.
    async fn execute_bulk(
        &self,
        token: &AccessToken,
        object_type: &str,
        kind: TaskKind,
        records: &[Value],
    ) -> Result<Vec<RecordOutcome>, ExecutionError>;
}
