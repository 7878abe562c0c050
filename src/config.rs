//! Configuration file support for crmq.
//!
//! Load settings from `.crmq.toml` or `~/.config/crmq/config.toml`.
//!
//! ## Config Resolution Order
//!
//! 1. CLI flags (highest priority)
//! 2. Environment variables (`S3_BUCKET`, `S3_ENDPOINT`, `S3_REGION`, `CRMQ_*`)
//! 3. Custom file given with `--config`
//! 4. Project-level `.crmq.toml`
//! 5. User-level `~/.config/crmq/config.toml`
//! 6. Built-in defaults (lowest priority)
//!
//! Files are merged table by table, so a project file that only sets
//! `[worker] lease_batch_size` keeps every other value from the user file.

use std::env;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionConfig;
use crate::auth::CredentialConfig;
use crate::crm::{BulkJobConfig, DEFAULT_API_VERSION};
use crate::models::RetryPolicy;
use crate::queue::StoreConfig;
use crate::scaling::ScalePolicy;
use crate::worker::{default_worker_id, BatcherConfig, PollingStrategy, WorkerConfig};

/// Lease duration should exceed the CRM request timeout by at least this factor.
pub const LEASE_SAFETY_FACTOR: u64 = 2;

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CrmqConfig {
    pub storage: StorageSection,
    pub queue: QueueSection,
    pub admission: AdmissionSection,
    pub auth: AuthSection,
    pub crm: CrmSection,
    pub worker: WorkerSection,
    pub batcher: BatcherSection,
    pub scaling: ScalePolicy,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Shared bucket; required for more than one process.
    #[default]
    S3,
    /// In-process store; state is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageSection {
    pub backend: Backend,
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: Backend::S3,
            bucket: String::new(),
            endpoint: None,
            region: "us-east-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QueueSection {
    pub lease_duration_secs: u64,
    pub default_max_attempts: u32,
    /// Ordering-index entries fetched per listing page.
    pub scan_limit: i32,
    pub cas_retries: u32,
    pub orphan_grace_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for QueueSection {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            lease_duration_secs: 120,
            default_max_attempts: store.default_max_attempts,
            scan_limit: store.scan_limit,
            cas_retries: store.cas_retries,
            orphan_grace_secs: store.orphan_grace.as_secs(),
            retry: store.default_retry_policy,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdmissionSection {
    pub window_limit: u64,
    pub window_duration_secs: u64,
    pub cas_retries: u32,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        let admission = AdmissionConfig::default();
        Self {
            window_limit: admission.window_limit,
            window_duration_secs: admission.window_duration.as_secs(),
            cas_retries: admission.cas_retries,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthSection {
    /// Identity provider base URL; the token endpoint is `/services/oauth2/token` under it.
    pub login_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Used until a credential has been stored.
    pub refresh_token: Option<String>,
    pub safety_margin_secs: u64,
    pub grace_period_secs: u64,
    pub refresh_timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub default_lifetime_secs: u64,
    /// How often a process waiting on another's refresh rereads the stored credential.
    pub refresh_poll_ms: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        let credential = CredentialConfig::default();
        Self {
            login_url: "https://login.salesforce.com".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: None,
            safety_margin_secs: credential.safety_margin.as_secs(),
            grace_period_secs: credential.grace_period.as_secs(),
            refresh_timeout_secs: credential.refresh_timeout.as_secs(),
            retry_interval_secs: credential.retry_interval.as_secs(),
            default_lifetime_secs: credential.default_lifetime.as_secs(),
            refresh_poll_ms: u64::try_from(credential.poll_interval.as_millis()).unwrap_or(250),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrmSection {
    pub api_version: String,
    pub request_timeout_secs: u64,
    /// Bulk calls with more records than this run as ingest jobs.
    pub bulk_job_threshold: usize,
    pub bulk_poll_timeout_secs: u64,
}

impl Default for CrmSection {
    fn default() -> Self {
        let bulk = BulkJobConfig::default();
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout_secs: 30,
            bulk_job_threshold: bulk.threshold,
            bulk_poll_timeout_secs: bulk.poll_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkerSection {
    pub lease_batch_size: usize,
    pub polling: PollingStrategy,
    pub max_pause_secs: u64,
    pub auth_retry_delay_secs: u64,
    /// Let workers take bulk kinds one record at a time.
    pub include_bulk: bool,
    /// Sweeper cadence when running `crmq worker --sweep`.
    pub sweep_interval_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            lease_batch_size: 5,
            polling: PollingStrategy::default(),
            max_pause_secs: 60,
            auth_retry_delay_secs: 5,
            include_bulk: false,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatcherSection {
    pub interval_ms: u64,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub max_wait_secs: u64,
    pub high_priority_threshold: u16,
    pub high_priority_max_wait_secs: u64,
    pub lease_duration_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for BatcherSection {
    fn default() -> Self {
        let batcher = BatcherConfig::default();
        Self {
            interval_ms: u64::try_from(batcher.interval.as_millis()).unwrap_or(u64::MAX),
            min_batch_size: batcher.min_batch_size,
            max_batch_size: batcher.max_batch_size,
            max_wait_secs: batcher.max_wait.as_secs(),
            high_priority_threshold: batcher.high_priority_threshold,
            high_priority_max_wait_secs: batcher.high_priority_max_wait.as_secs(),
            lease_duration_secs: batcher.lease_duration.as_secs(),
            request_timeout_secs: batcher.request_timeout.as_secs(),
        }
    }
}

impl CrmqConfig {
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            default_max_attempts: self.queue.default_max_attempts,
            default_retry_policy: self.queue.retry.clone(),
            scan_limit: self.queue.scan_limit,
            cas_retries: self.queue.cas_retries,
            orphan_grace: Duration::from_secs(self.queue.orphan_grace_secs),
            ..StoreConfig::default()
        }
    }

    #[must_use]
    pub const fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            window_limit: self.admission.window_limit,
            window_duration: Duration::from_secs(self.admission.window_duration_secs),
            cas_retries: self.admission.cas_retries,
        }
    }

    #[must_use]
    pub fn bulk_job_config(&self) -> BulkJobConfig {
        BulkJobConfig {
            threshold: self.crm.bulk_job_threshold,
            poll_timeout: Duration::from_secs(self.crm.bulk_poll_timeout_secs),
            ..BulkJobConfig::default()
        }
    }

    #[must_use]
    pub fn credential_config(&self) -> CredentialConfig {
        CredentialConfig {
            safety_margin: Duration::from_secs(self.auth.safety_margin_secs),
            grace_period: Duration::from_secs(self.auth.grace_period_secs),
            refresh_timeout: Duration::from_secs(self.auth.refresh_timeout_secs),
            retry_interval: Duration::from_secs(self.auth.retry_interval_secs),
            default_lifetime: Duration::from_secs(self.auth.default_lifetime_secs),
            poll_interval: Duration::from_millis(self.auth.refresh_poll_ms),
            bootstrap_refresh_token: self.auth.refresh_token.clone(),
        }
    }

    /// Worker settings; a random id is generated when `worker_id` is `None`.
    #[must_use]
    pub fn worker_config(&self, worker_id: Option<String>) -> WorkerConfig {
        WorkerConfig {
            worker_id: worker_id.unwrap_or_else(default_worker_id),
            lease_batch_size: self.worker.lease_batch_size,
            lease_duration: Duration::from_secs(self.queue.lease_duration_secs),
            request_timeout: Duration::from_secs(self.crm.request_timeout_secs),
            polling: self.worker.polling.clone(),
            max_pause: Duration::from_secs(self.worker.max_pause_secs),
            auth_retry_delay: Duration::from_secs(self.worker.auth_retry_delay_secs),
            include_bulk: self.worker.include_bulk,
        }
    }

    #[must_use]
    pub const fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            min_batch_size: self.batcher.min_batch_size,
            max_batch_size: self.batcher.max_batch_size,
            max_wait: Duration::from_secs(self.batcher.max_wait_secs),
            high_priority_threshold: self.batcher.high_priority_threshold,
            high_priority_max_wait: Duration::from_secs(self.batcher.high_priority_max_wait_secs),
            lease_duration: Duration::from_secs(self.batcher.lease_duration_secs),
            request_timeout: Duration::from_secs(self.batcher.request_timeout_secs),
            interval: Duration::from_millis(self.batcher.interval_ms),
            max_pause: Duration::from_secs(self.worker.max_pause_secs),
            auth_retry_delay: Duration::from_secs(self.worker.auth_retry_delay_secs),
        }
    }
}

/// Where configuration was looked for.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub user_config: Option<PathBuf>,
    pub user_config_exists: bool,
    pub project_config: Option<PathBuf>,
    pub project_config_exists: bool,
    pub custom_config: Option<PathBuf>,
    pub custom_config_exists: bool,
}

impl ConfigSources {
    #[must_use]
    pub fn discover() -> Self {
        let user_config = get_user_config_path();
        let user_config_exists = user_config.as_ref().is_some_and(|p| p.exists());
        let project_config = get_project_config_path();
        let project_config_exists = project_config.exists();

        Self {
            user_config,
            user_config_exists,
            project_config: Some(project_config),
            project_config_exists,
            custom_config: None,
            custom_config_exists: false,
        }
    }

    #[must_use]
    pub fn with_custom_config(mut self, path: Option<PathBuf>) -> Self {
        if let Some(p) = path {
            self.custom_config_exists = p.exists();
            self.custom_config = Some(p);
        }
        self
    }
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}

/// `~/.config/crmq/config.toml`, or the platform equivalent.
#[must_use]
pub fn get_user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("crmq").join("config.toml"))
}

#[must_use]
pub fn get_project_config_path() -> PathBuf {
    PathBuf::from(".crmq.toml")
}

/// Parses a config from TOML. Missing keys take their defaults.
///
/// # Errors
/// Returns `ConfigError::TomlParse` if the TOML is invalid.
pub fn load_from_str(toml_content: &str) -> Result<CrmqConfig, ConfigError> {
    Ok(toml::from_str(toml_content)?)
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Loads and merges every config file, then applies environment overrides.
///
/// # Errors
/// Returns an error if a config file exists but cannot be read or parsed.
pub fn load_config(custom_config: Option<&PathBuf>) -> Result<CrmqConfig, ConfigError> {
    let mut merged = toml::Table::new();

    if let Some(user_path) = get_user_config_path() {
        if user_path.exists() {
            merge_tables(&mut merged, read_table(&user_path)?);
        }
    }

    let project_path = get_project_config_path();
    if project_path.exists() {
        merge_tables(&mut merged, read_table(&project_path)?);
    }

    if let Some(custom_path) = custom_config {
        merge_tables(&mut merged, read_table(custom_path)?);
    }

    let mut config: CrmqConfig = toml::Value::Table(merged).try_into()?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Merges `overlay` into `base`; nested tables merge key by key.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn apply_env_overrides(config: &mut CrmqConfig) {
    if let Ok(bucket) = env::var("S3_BUCKET") {
        config.storage.bucket = bucket;
    }
    if let Ok(endpoint) = env::var("S3_ENDPOINT") {
        config.storage.endpoint = Some(endpoint).filter(|e| !e.is_empty());
    }
    if let Ok(region) = env::var("S3_REGION") {
        config.storage.region = region;
    }
    if let Ok(backend) = env::var("CRMQ_BACKEND") {
        match backend.to_ascii_lowercase().as_str() {
            "memory" => config.storage.backend = Backend::Memory,
            "s3" => config.storage.backend = Backend::S3,
            other => tracing::warn!(backend = other, "Ignoring unknown CRMQ_BACKEND"),
        }
    }

    if let Ok(url) = env::var("CRMQ_AUTH_LOGIN_URL") {
        config.auth.login_url = url;
    }
    if let Ok(id) = env::var("CRMQ_AUTH_CLIENT_ID") {
        config.auth.client_id = id;
    }
    if let Ok(secret) = env::var("CRMQ_AUTH_CLIENT_SECRET") {
        config.auth.client_secret = secret;
    }
    if let Ok(token) = env::var("CRMQ_AUTH_REFRESH_TOKEN") {
        config.auth.refresh_token = Some(token).filter(|t| !t.is_empty());
    }

    if let Some(limit) = env_parse("CRMQ_WINDOW_LIMIT") {
        config.admission.window_limit = limit;
    }
    if let Some(secs) = env_parse("CRMQ_WINDOW_DURATION_SECS") {
        config.admission.window_duration_secs = secs;
    }
    if let Some(secs) = env_parse("CRMQ_LEASE_DURATION_SECS") {
        config.queue.lease_duration_secs = secs;
    }
    if let Some(n) = env_parse("CRMQ_LEASE_BATCH_SIZE") {
        config.worker.lease_batch_size = n;
    }
    if let Some(secs) = env_parse("CRMQ_REQUEST_TIMEOUT_SECS") {
        config.crm.request_timeout_secs = secs;
    }
}

/// Checks the configuration for mistakes.
///
/// Returns human-readable problems (empty if valid).
#[must_use]
pub fn validate_config(config: &CrmqConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.storage.backend == Backend::S3 {
        if config.storage.bucket.is_empty() {
            errors.push(
                "storage.bucket: not configured (set S3_BUCKET or add to config file)".to_string(),
            );
        }
        if config.storage.region.is_empty() {
            errors.push("storage.region: not configured (set S3_REGION)".to_string());
        }
    }

    if config.auth.client_id.is_empty() || config.auth.client_secret.is_empty() {
        errors.push(
            "auth: client_id and client_secret are required to refresh the CRM token".to_string(),
        );
    }

    if config.admission.window_limit == 0 {
        errors.push("admission.window_limit: must be at least 1".to_string());
    }
    if config.admission.window_duration_secs == 0 {
        errors.push("admission.window_duration_secs: must be at least 1".to_string());
    }

    let timeout = config.crm.request_timeout_secs;
    if config.queue.lease_duration_secs <= timeout.saturating_mul(LEASE_SAFETY_FACTOR) {
        errors.push(format!(
            "queue.lease_duration_secs: {} should exceed crm.request_timeout_secs ({timeout}) x {LEASE_SAFETY_FACTOR}, \
             or in-flight calls may be reclaimed",
            config.queue.lease_duration_secs
        ));
    }
    let bulk_timeout = config.batcher.request_timeout_secs;
    if config.batcher.lease_duration_secs <= bulk_timeout.saturating_mul(LEASE_SAFETY_FACTOR) {
        errors.push(format!(
            "batcher.lease_duration_secs: {} should exceed batcher.request_timeout_secs ({bulk_timeout}) x {LEASE_SAFETY_FACTOR}",
            config.batcher.lease_duration_secs
        ));
    }

    if config.crm.bulk_poll_timeout_secs >= bulk_timeout {
        errors.push(format!(
            "crm.bulk_poll_timeout_secs: {} should be below batcher.request_timeout_secs ({bulk_timeout}), \
             or ingest jobs are cut off before they can be aborted",
            config.crm.bulk_poll_timeout_secs
        ));
    }

    if config.worker.lease_batch_size == 0 {
        errors.push("worker.lease_batch_size: must be at least 1".to_string());
    }
    if let PollingStrategy::Adaptive {
        min_interval_ms,
        max_interval_ms,
        backoff_multiplier,
    } = config.worker.polling
    {
        if min_interval_ms > max_interval_ms {
            errors.push(format!(
                "worker.polling: min_interval_ms ({min_interval_ms}) exceeds max_interval_ms ({max_interval_ms})"
            ));
        }
        if backoff_multiplier <= 1.0 {
            errors.push(format!(
                "worker.polling.backoff_multiplier: must be > 1.0, got {backoff_multiplier}"
            ));
        }
    }

    if config.batcher.max_batch_size == 0 {
        errors.push("batcher.max_batch_size: must be at least 1".to_string());
    }
    if config.batcher.min_batch_size > config.batcher.max_batch_size {
        errors.push(format!(
            "batcher.min_batch_size ({}) exceeds batcher.max_batch_size ({})",
            config.batcher.min_batch_size, config.batcher.max_batch_size
        ));
    }
    if config.batcher.max_batch_size as u64 > config.admission.window_limit {
        errors.push(format!(
            "batcher.max_batch_size ({}) exceeds admission.window_limit ({}); batches are capped at the window",
            config.batcher.max_batch_size, config.admission.window_limit
        ));
    }

    if config.scaling.min_workers > config.scaling.max_workers {
        errors.push(format!(
            "scaling.min_workers ({}) exceeds scaling.max_workers ({})",
            config.scaling.min_workers, config.scaling.max_workers
        ));
    }

    errors
}

/// Renders the resolved configuration as TOML, with secrets masked.
#[must_use]
pub fn format_config(config: &CrmqConfig) -> String {
    let mut shown = config.clone();
    if !shown.auth.client_secret.is_empty() {
        shown.auth.client_secret = "(set)".to_string();
    }
    if shown.auth.refresh_token.is_some() {
        shown.auth.refresh_token = Some("(set)".to_string());
    }

    let mut output = String::from("# Resolved Configuration\n\n");
    match toml::to_string_pretty(&shown) {
        Ok(body) => output.push_str(&body),
        Err(e) => {
            let _ = writeln!(output, "# could not render: {e}");
        }
    }
    output
}

#[must_use]
pub fn format_config_paths(sources: &ConfigSources) -> String {
    fn line(output: &mut String, label: &str, path: Option<&PathBuf>, exists: bool) {
        if let Some(path) = path {
            let _ = writeln!(
                output,
                "{label:<16}{} {}",
                path.display(),
                if exists { "(exists)" } else { "(not found)" }
            );
        }
    }

    let mut output = String::from("Configuration file locations:\n\n");
    if sources.user_config.is_none() {
        output.push_str("User config:    (could not determine config directory)\n");
    }
    line(
        &mut output,
        "User config:",
        sources.user_config.as_ref(),
        sources.user_config_exists,
    );
    line(
        &mut output,
        "Project config:",
        sources.project_config.as_ref(),
        sources.project_config_exists,
    );
    line(
        &mut output,
        "Custom config:",
        sources.custom_config.as_ref(),
        sources.custom_config_exists,
    );

    output.push_str("\nPriority order (highest first):\n");
    output.push_str("  1. CLI flags (--worker-id, etc.)\n");
    output.push_str("  2. Environment variables (S3_BUCKET, CRMQ_*, etc.)\n");
    output.push_str("  3. Custom config (if --config specified)\n");
    output.push_str("  4. Project config (.crmq.toml)\n");
    output.push_str("  5. User config (~/.config/crmq/config.toml)\n");
    output.push_str("  6. Built-in defaults\n");
    output
}
