//! Bulk API 2.0 ingest jobs for batches too large for one collections request.
//!
//! A job is created, the records are uploaded as CSV, the job is closed and
//! then polled until the CRM finishes it. Result rows come back in no
//! particular order, so each one is matched to its record by the field values
//! it echoes.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use metrics::counter;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::rest::{check, RestCrmClient, COLLECTION_LIMIT};
use super::{ErrorCategory, ExecutionError};
use crate::auth::AccessToken;
use crate::models::{RecordOutcome, TaskKind};
use crate::worker::PollingStrategy;

/// Null marker understood by the ingest API.
const CSV_NULL: &str = "#N/A";

/// When and how ingest jobs are used.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkJobConfig {
    /// Batches with more records than this go through an ingest job.
    pub threshold: usize,
    /// Cadence of job status checks.
    pub polling: PollingStrategy,
    /// The job is aborted if it has not finished by then.
    pub poll_timeout: Duration,
}

impl Default for BulkJobConfig {
    fn default() -> Self {
        Self {
            threshold: COLLECTION_LIMIT,
            polling: PollingStrategy::adaptive(1_000, 30_000),
            poll_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum JobState {
    Open,
    UploadComplete,
    InProgress,
    Aborted,
    JobComplete,
    Failed,
}

impl JobState {
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Aborted | Self::JobComplete | Self::Failed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::UploadComplete => "upload_complete",
            Self::InProgress => "in_progress",
            Self::Aborted => "aborted",
            Self::JobComplete => "job_complete",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobInfo {
    id: String,
    state: JobState,
    #[serde(default)]
    error_message: Option<String>,
}

fn operation(kind: TaskKind) -> Result<&'static str, ExecutionError> {
    match kind {
        TaskKind::BulkCreate => Ok("insert"),
        TaskKind::BulkUpdate => Ok("update"),
        other => Err(ExecutionError::new(
            ErrorCategory::Malformed,
            format!("{other} is not a bulk operation"),
        )),
    }
}

fn csv_error(err: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::new(ErrorCategory::Malformed, format!("csv: {err}"))
}

/// Records flattened into CSV cells under one shared header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CsvTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CsvTable {
    /// The header is every field name, sorted. A field a record
    /// lacks is left empty; an explicit `null` becomes the ingest null marker.
    pub(crate) fn from_records(records: &[Value]) -> Result<Self, ExecutionError> {
        let mut header: Vec<String> = Vec::new();
        let mut objects = Vec::with_capacity(records.len());
        for record in records {
            let object = record.as_object().ok_or_else(|| {
                ExecutionError::new(ErrorCategory::Malformed, "bulk record must be a JSON object")
            })?;
            for name in object.keys() {
                if !header.contains(name) {
                    header.push(name.clone());
                }
            }
            objects.push(object);
        }
        header.sort();

        let rows = objects
            .into_iter()
            .map(|object| header.iter().map(|name| cell(object.get(name))).collect())
            .collect();
        Ok(Self { header, rows })
    }

    pub(crate) fn to_csv(&self) -> Result<String, ExecutionError> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer.write_record(&self.header).map_err(csv_error)?;
        for row in &self.rows {
            writer.write_record(row).map_err(csv_error)?;
        }
        let bytes = writer.into_inner().map_err(csv_error)?;
        String::from_utf8(bytes).map_err(csv_error)
    }

    /// Cells of a result row in header order, for matching against `rows`.
    fn key_of(&self, result: &HashMap<String, String>) -> Vec<String> {
        self.header
            .iter()
            .map(|name| result.get(name).cloned().unwrap_or_default())
            .collect()
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::Null) => CSV_NULL.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other @ (Value::Bool(_) | Value::Number(_))) => other.to_string(),
        Some(nested) => nested.to_string(),
    }
}

fn parse_results(text: &str) -> Result<Vec<HashMap<String, String>>, ExecutionError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let headers = reader.headers().map_err(csv_error)?.clone();
    reader
        .records()
        .map(|record| {
            record.map_err(csv_error).map(|record| {
                headers
                    .iter()
                    .zip(record.iter())
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect()
            })
        })
        .collect()
}

/// Outcome for a `failedResults` row; `sf__Error` reads `CODE:message`.
fn failed_outcome(error: &str) -> RecordOutcome {
    let code = error.split(':').next().unwrap_or_default().trim();
    let category = ErrorCategory::from_error_code(code).unwrap_or(ErrorCategory::Validation);
    RecordOutcome::failed(category, error)
}

/// Matches result rows to uploaded rows and returns outcomes in upload order.
///
/// Records absent from both result sets were never processed and are
/// reported as retryable.
pub(crate) fn demux(
    table: &CsvTable,
    successful: &str,
    failed: &str,
) -> Result<Vec<RecordOutcome>, ExecutionError> {
    let mut positions: HashMap<Vec<String>, VecDeque<usize>> = HashMap::new();
    for (i, row) in table.rows.iter().enumerate() {
        positions.entry(row.clone()).or_default().push_back(i);
    }
    let mut outcomes: Vec<Option<RecordOutcome>> = (0..table.rows.len()).map(|_| None).collect();

    let mut place = |row: &HashMap<String, String>, outcome: RecordOutcome| {
        let position = positions
            .get_mut(&table.key_of(row))
            .and_then(VecDeque::pop_front);
        match position {
            Some(i) => outcomes[i] = Some(outcome),
            None => tracing::warn!("Bulk result row matches no uploaded record"),
        }
    };

    for row in parse_results(successful)? {
        let outcome = RecordOutcome::Succeeded {
            result: json!({
                "id": row.get("sf__Id"),
                "created": row.get("sf__Created").is_some_and(|v| v == "true"),
            }),
        };
        place(&row, outcome);
    }
    for row in parse_results(failed)? {
        let outcome = failed_outcome(row.get("sf__Error").map_or("", String::as_str));
        place(&row, outcome);
    }

    Ok(outcomes
        .into_iter()
        .map(|outcome| {
            outcome.unwrap_or_else(|| {
                RecordOutcome::failed(
                    ErrorCategory::ServerError,
                    "record was not processed by the bulk job",
                )
            })
        })
        .collect())
}

impl RestCrmClient {
    /// Runs one ingest job over `records`; outcomes are in `records` order.
    ///
    /// Failures before the job is closed abort it and fail the whole call,
    /// since nothing has been applied yet. After that, every record gets its
    /// own outcome.
    pub(super) async fn run_ingest_job(
        &self,
        token: &AccessToken,
        object_type: &str,
        kind: TaskKind,
        records: &[Value],
    ) -> Result<Vec<RecordOutcome>, ExecutionError> {
        let operation = operation(kind)?;
        let table = CsvTable::from_records(records)?;
        let body = table.to_csv()?;

        let jobs = format!("{}/jobs/ingest", self.base_url(token));
        let response = self
            .request(token, Method::POST, &jobs)
            .json(&json!({
                "object": object_type,
                "operation": operation,
                "contentType": "CSV",
                "lineEnding": "LF",
            }))
            .send()
            .await?;
        let job: JobInfo = check(response).await?.json().await?;
        let job_url = format!("{jobs}/{}", job.id);
        tracing::info!(job_id = %job.id, object_type, operation, records = records.len(), "Created bulk ingest job");

        if let Err(e) = self.upload_and_close(token, &job_url, body).await {
            self.abort_job(token, &job_url).await;
            return Err(e);
        }

        let state = match self.await_job(token, &job_url).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Bulk ingest job did not finish; aborting");
                self.abort_job(token, &job_url).await;
                JobState::Aborted
            }
        };
        counter!("crmq.crm.bulk_job", "state" => state.as_str()).increment(1);

        match self.fetch_outcomes(token, &job_url, &table).await {
            Ok(outcomes) => {
                tracing::info!(
                    job_id = %job.id,
                    state = state.as_str(),
                    succeeded = outcomes.iter().filter(|o| o.is_success()).count(),
                    records = outcomes.len(),
                    "Bulk ingest job finished"
                );
                Ok(outcomes)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Bulk ingest results unavailable");
                let message = format!("results of bulk job {} unavailable: {e}", job.id);
                Ok(records
                    .iter()
                    .map(|_| RecordOutcome::failed(ErrorCategory::ServerError, message.clone()))
                    .collect())
            }
        }
    }

    async fn upload_and_close(
        &self,
        token: &AccessToken,
        job_url: &str,
        body: String,
    ) -> Result<(), ExecutionError> {
        let response = self
            .request(token, Method::PUT, &format!("{job_url}/batches"))
            .header(CONTENT_TYPE, "text/csv")
            .body(body)
            .send()
            .await?;
        check(response).await?;

        let response = self
            .request(token, Method::PATCH, job_url)
            .json(&json!({ "state": "UploadComplete" }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn await_job(&self, token: &AccessToken, job_url: &str) -> Result<JobState, ExecutionError> {
        let deadline = Instant::now() + self.bulk.poll_timeout;
        let mut interval = self.bulk.polling.initial_interval();
        loop {
            let response = self.request(token, Method::GET, job_url).send().await?;
            let job: JobInfo = check(response).await?.json().await?;
            if job.state.is_finished() {
                if let Some(error_message) = job.error_message.filter(|m| !m.is_empty()) {
                    tracing::warn!(job_id = %job.id, state = job.state.as_str(), error_message, "Bulk ingest job reported an error");
                }
                return Ok(job.state);
            }
            if Instant::now() + interval > deadline {
                return Err(ExecutionError::new(
                    ErrorCategory::Timeout,
                    format!(
                        "bulk job {} still {} after {:?}",
                        job.id,
                        job.state.as_str(),
                        self.bulk.poll_timeout
                    ),
                ));
            }
            tokio::time::sleep(interval).await;
            interval = self.bulk.polling.next_interval(interval, false);
        }
    }

    async fn abort_job(&self, token: &AccessToken, job_url: &str) {
        let aborted = self
            .request(token, Method::PATCH, job_url)
            .json(&json!({ "state": "Aborted" }))
            .send()
            .await;
        let checked = match aborted {
            Ok(response) => check(response).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = checked {
            tracing::warn!(job_url, error = %e, "Failed to abort bulk ingest job");
        }
    }

    async fn fetch_outcomes(
        &self,
        token: &AccessToken,
        job_url: &str,
        table: &CsvTable,
    ) -> Result<Vec<RecordOutcome>, ExecutionError> {
        let successful = self.result_set(token, job_url, "successfulResults").await?;
        let failed = self.result_set(token, job_url, "failedResults").await?;
        demux(table, &successful, &failed)
    }

    async fn result_set(
        &self,
        token: &AccessToken,
        job_url: &str,
        set: &str,
    ) -> Result<String, ExecutionError> {
        let response = self
            .request(token, Method::GET, &format!("{job_url}/{set}"))
            .header(ACCEPT, "text/csv")
            .send()
            .await?;
        Ok(check(response).await?.text().await?)
    }
}
