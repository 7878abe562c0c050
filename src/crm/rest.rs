use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::bulk::BulkJobConfig;
use super::{CrmClient, CrmOperation, ErrorCategory, ExecutionError};
use crate::auth::AccessToken;
use crate::models::{RecordOutcome, TaskKind};

pub const DEFAULT_API_VERSION: &str = "v59.0";

/// Most records the collections endpoint takes in one request.
pub const COLLECTION_LIMIT: usize = 200;

/// REST client for a Salesforce-style CRM API.
///
/// Bulk calls up to `bulk.threshold` records use sObject collections; larger
/// ones run as ingest jobs.
#[derive(Debug, Clone)]
pub struct RestCrmClient {
    http: reqwest::Client,
    api_version: String,
    pub(super) bulk: BulkJobConfig,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default, alias = "errorCode", alias = "statusCode")]
    error_code: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default)]
    next_records_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CollectionResult {
    #[serde(default)]
    id: Option<String>,
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
}

impl RestCrmClient {
    #[must_use]
    pub fn new(api_version: impl Into<String>, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_version: api_version.into(),
            bulk: BulkJobConfig::default(),
        }
    }

    #[must_use]
    pub fn with_bulk_jobs(mut self, bulk: BulkJobConfig) -> Self {
        self.bulk = bulk;
        self
    }

    pub(super) fn base_url(&self, token: &AccessToken) -> String {
        format!(
            "{}/services/data/{}",
            token.instance_url.trim_end_matches('/'),
            self.api_version
        )
    }

    pub(super) fn request(&self, token: &AccessToken, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&token.token)
    }

    async fn query(&self, token: &AccessToken, soql: &str) -> Result<Value, ExecutionError> {
        let url = format!("{}/query", self.base_url(token));
        let response = self
            .request(token, Method::GET, &url)
            .query(&[("q", soql)])
            .send()
            .await?;
        let mut page: QueryPage = check(response).await?.json().await?;

        let total_size = page.total_size;
        let mut records = std::mem::take(&mut page.records);
        while let Some(next) = page.next_records_url.take() {
            let url = format!("{}{next}", token.instance_url.trim_end_matches('/'));
            let response = self.request(token, Method::GET, &url).send().await?;
            page = check(response).await?.json().await?;
            records.append(&mut page.records);
        }

        Ok(json!({ "totalSize": total_size, "records": records }))
    }

    async fn send_collection(
        &self,
        token: &AccessToken,
        method: Method,
        object_type: &str,
        records: &[Value],
    ) -> Result<Vec<RecordOutcome>, ExecutionError> {
        let url = format!("{}/composite/sobjects", self.base_url(token));
        let body = json!({
            "allOrNone": false,
            "records": records
                .iter()
                .map(|record| with_type(record, object_type))
                .collect::<Vec<_>>(),
        });
        let response = self.request(token, method, &url).json(&body).send().await?;
        let results: Vec<CollectionResult> = check(response).await?.json().await?;

        if results.len() != records.len() {
            tracing::warn!(
                object_type,
                sent = records.len(),
                received = results.len(),
                "Collection response size mismatch"
            );
        }
        Ok(results.into_iter().map(outcome).collect())
    }
}

#[async_trait]
impl CrmClient for RestCrmClient {
    async fn execute(
        &self,
        token: &AccessToken,
        operation: &CrmOperation,
    ) -> Result<Value, ExecutionError> {
        let base = self.base_url(token);
        match operation {
            CrmOperation::Create {
                object_type,
                fields,
            } => {
                let url = format!("{base}/sobjects/{object_type}/");
                let response = self
                    .request(token, Method::POST, &url)
                    .json(fields)
                    .send()
                    .await?;
                Ok(check(response).await?.json().await?)
            }
            CrmOperation::Update {
                object_type,
                id,
                fields,
            } => {
                let url = format!("{base}/sobjects/{object_type}/{id}");
                let response = self
                    .request(token, Method::PATCH, &url)
                    .json(fields)
                    .send()
                    .await?;
                check(response).await?;
                Ok(json!({ "id": id }))
            }
            CrmOperation::Delete { object_type, id } => {
                let url = format!("{base}/sobjects/{object_type}/{id}");
                let response = self.request(token, Method::DELETE, &url).send().await?;
                check(response).await?;
                Ok(json!({ "id": id }))
            }
            CrmOperation::Query { soql } => self.query(token, soql).await,
        }
    }

    async fn execute_bulk(
        &self,
        token: &AccessToken,
        object_type: &str,
        kind: TaskKind,
        records: &[Value],
    ) -> Result<Vec<RecordOutcome>, ExecutionError> {
        let method = match kind {
            TaskKind::BulkCreate => Method::POST,
            TaskKind::BulkUpdate => Method::PATCH,
            other => {
                return Err(ExecutionError::new(
                    ErrorCategory::Malformed,
                    format!("{other} is not a bulk operation"),
                ))
            }
        };

        if records.len() > self.bulk.threshold {
            return self
                .run_ingest_job(token, object_type, kind, records)
                .await;
        }

        let mut outcomes = Vec::with_capacity(records.len());
        for (i, chunk) in records.chunks(COLLECTION_LIMIT).enumerate() {
            match self
                .send_collection(token, method.clone(), object_type, chunk)
                .await
            {
                Ok(mut chunk_outcomes) => {
                    chunk_outcomes.resize_with(chunk.len(), || {
                        RecordOutcome::failed(
                            ErrorCategory::ServerError,
                            "no result returned for record",
                        )
                    });
                    outcomes.append(&mut chunk_outcomes);
                }
                // Nothing was applied yet, so the whole call failed.
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!(object_type, chunk = i, error = %e, "Collection chunk failed");
                    outcomes.extend(
                        chunk
                            .iter()
                            .map(|_| RecordOutcome::failed(e.category, e.to_string())),
                    );
                }
            }
        }
        Ok(outcomes)
    }
}

/// Passes 2xx responses through and classifies everything else.
pub(super) async fn check(response: Response) -> Result<Response, ExecutionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let first = serde_json::from_str::<Vec<ApiError>>(&body)
        .ok()
        .and_then(|errors| errors.into_iter().next());
    let (code, message) = match first {
        Some(e) => (e.error_code, e.message),
        None => (None, body),
    };
    let category = ErrorCategory::classify(status.as_u16(), code.as_deref());
    let message = match code {
        Some(code) => format!("{} {code}: {message}", status.as_u16()),
        None => format!("{}: {message}", status.as_u16()),
    };
    Err(ExecutionError::new(category, message))
}

fn with_type(record: &Value, object_type: &str) -> Value {
    let mut fields = record.as_object().cloned().unwrap_or_else(Map::new);
    fields.insert("attributes".to_string(), json!({ "type": object_type }));
    Value::Object(fields)
}

fn outcome(result: CollectionResult) -> RecordOutcome {
    if result.success {
        return RecordOutcome::Succeeded {
            result: json!({ "id": result.id }),
        };
    }
    let first = result.errors.into_iter().next();
    let category = first
        .as_ref()
        .and_then(|e| e.error_code.as_deref())
        .and_then(ErrorCategory::from_error_code)
        .unwrap_or(ErrorCategory::Validation);
    let message = first.map_or_else(
        || "record rejected".to_string(),
        |e| match e.error_code {
            Some(code) => format!("{code}: {}", e.message),
            None => e.message,
        },
    );
    RecordOutcome::failed(category, message)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_outcomes_are_classified() {
        let results: Vec<CollectionResult> = serde_json::from_str(
            r#"[
                {"id": "001A", "success": true, "errors": []},
                {"success": false, "errors": [{"statusCode": "UNABLE_TO_LOCK_ROW", "message": "locked", "fields": []}]},
                {"success": false, "errors": [{"statusCode": "REQUIRED_FIELD_MISSING", "message": "Name", "fields": ["Name"]}]}
            ]"#,
        )
        .unwrap();
        let outcomes: Vec<RecordOutcome> = results.into_iter().map(outcome).collect();

        assert_eq!(
            outcomes[0],
            RecordOutcome::Succeeded {
                result: json!({"id": "001A"})
            }
        );
        assert_eq!(
            outcomes[1],
            RecordOutcome::failed(ErrorCategory::RecordLocked, "UNABLE_TO_LOCK_ROW: locked")
        );
        assert!(outcomes[1].is_retryable());
        assert!(!outcomes[2].is_retryable());
    }

    #[test]
    fn test_with_type_tags_record() {
        let tagged = with_type(&json!({"Name": "Acme"}), "Account");
        assert_eq!(tagged["attributes"]["type"], "Account");
        assert_eq!(tagged["Name"], "Acme");
    }

    #[test]
    fn test_base_url() {
        let client = RestCrmClient::new(DEFAULT_API_VERSION, Duration::from_secs(5));
        let token = AccessToken {
            token: "t".into(),
            instance_url: "https://na1.salesforce.com/".into(),
            expires_at: chrono::Utc::now(),
        };
        assert_eq!(
            client.base_url(&token),
            "https://na1.salesforce.com/services/data/v59.0"
        );
    }
}
