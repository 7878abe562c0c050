//! crmq - coordination core for CRM worker swarms

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::CommandFactory;
use clap_complete::generate;
use crmq::admission::{AdmissionController, AdmissionError};
use crmq::auth::{AuthError, CredentialCache, OAuthTokenProvider};
use crmq::cli::{Cli, Commands, ConfigCommands};
use crmq::config::{
    format_config, format_config_paths, load_config, validate_config, Backend, ConfigSources,
    CrmqConfig,
};
use crmq::crm::RestCrmClient;
use crmq::models::NewTask;
use crmq::queue::{StoreError, TaskStore};
use crmq::storage::{MemoryStore, S3Client, S3Config, SharedStore, StorageError};
use crmq::worker::{
    shutdown_signal, wait_for_shutdown_signal, Batcher, Sweeper, Worker, WorkerError,
};
use tracing_subscriber::EnvFilter;

/// Prints an error with its suggestion when the error type has one.
fn display_error(err: &anyhow::Error) {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<WorkerError>() {
            eprintln!("{}", e.display_rich());
            return;
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            eprintln!("{}", e.display_rich());
            return;
        }
        if let Some(e) = cause.downcast_ref::<AuthError>() {
            eprintln!("{}", e.display_rich());
            return;
        }
        if let Some(e) = cause.downcast_ref::<AdmissionError>() {
            eprintln!("Error: {e}\n\nSuggestion:\n  {}", e.suggestion());
            return;
        }
        if let Some(e) = cause.downcast_ref::<StorageError>() {
            eprintln!("Error: {err}\n");
            eprintln!("Caused by: {}", e.display_rich());
            return;
        }
    }
    eprintln!("Error: {err:#}");
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.log_json);

    if let Err(e) = run(cli).await {
        display_error(&e);
        std::process::exit(1);
    }
}

async fn open_store(config: &CrmqConfig) -> Result<SharedStore> {
    match config.storage.backend {
        Backend::Memory => {
            tracing::warn!("Using the in-memory backend; state is lost on exit and not shared");
            Ok(Arc::new(MemoryStore::new()))
        }
        Backend::S3 => {
            if config.storage.bucket.is_empty() {
                return Err(anyhow!(
                    "bucket not configured. Set S3_BUCKET environment variable or add storage.bucket to the config file."
                ));
            }
            let s3 = S3Config::new(
                config.storage.endpoint.clone(),
                config.storage.bucket.clone(),
                config.storage.region.clone(),
            );
            Ok(Arc::new(S3Client::new(s3).await?))
        }
    }
}

/// Everything a worker or batcher needs, built from one config.
struct Components {
    store: TaskStore,
    admission: Arc<AdmissionController>,
    credentials: Arc<CredentialCache>,
    crm: Arc<RestCrmClient>,
}

impl Components {
    fn new(objects: SharedStore, config: &CrmqConfig) -> Self {
        let provider = OAuthTokenProvider::new(
            &config.auth.login_url,
            config.auth.client_id.clone(),
            config.auth.client_secret.clone(),
            Duration::from_secs(config.auth.refresh_timeout_secs),
        );
        Self {
            store: TaskStore::with_config(objects.clone(), config.store_config()),
            admission: Arc::new(AdmissionController::new(
                objects.clone(),
                config.admission_config(),
            )),
            credentials: Arc::new(CredentialCache::new(
                objects,
                Arc::new(provider),
                config.credential_config(),
            )),
            crm: Arc::new(
                RestCrmClient::new(
                    config.crm.api_version.clone(),
                    Duration::from_secs(config.crm.request_timeout_secs),
                )
                .with_bulk_jobs(config.bulk_job_config()),
            ),
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "crmq", &mut io::stdout());
        return Ok(());
    }

    let mut config = load_config(cli.config.as_ref())?;

    if let Commands::Config { command } = &cli.command {
        match command {
            ConfigCommands::Show => print!("{}", format_config(&config)),
            ConfigCommands::Validate => {
                let errors = validate_config(&config);
                if errors.is_empty() {
                    println!("Configuration is valid.");
                } else {
                    eprintln!("Configuration problems:");
                    for error in &errors {
                        eprintln!("  - {error}");
                    }
                    std::process::exit(1);
                }
            }
            ConfigCommands::Paths => {
                let sources = ConfigSources::discover().with_custom_config(cli.config.clone());
                print!("{}", format_config_paths(&sources));
            }
        }
        return Ok(());
    }

    for warning in validate_config(&config) {
        tracing::warn!("{warning}");
    }

    let objects = open_store(&config).await?;
    let parts = Components::new(objects, &config);

    match cli.command {
        Commands::Completions { .. } | Commands::Config { .. } => unreachable!(),

        Commands::Enqueue {
            kind,
            object_type,
            payload,
            priority,
            idempotency_key,
            max_attempts,
            json,
        } => {
            // Anything that is not JSON is taken as a bare string (SOQL, a record id).
            let payload = serde_json::from_str(&payload)
                .unwrap_or_else(|_| serde_json::Value::String(payload));
            let mut new_task = NewTask::new(kind, object_type, payload).priority(priority);
            if let Some(key) = idempotency_key {
                new_task = new_task.idempotency_key(key);
            }
            if let Some(n) = max_attempts {
                new_task = new_task.max_attempts(n);
            }
            let task = parts.store.enqueue(new_task).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&task)?);
            } else {
                println!("Task enqueued: {}", task.id);
            }
        }

        Commands::Status { task_id, json } => {
            let task = parts
                .store
                .get(task_id)
                .await?
                .with_context(|| format!("Task not found: {task_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&task)?);
            } else {
                let now = parts.store.now().await?;
                println!("Task: {}", task.id);
                println!("  Kind: {} {}", task.kind, task.object_type);
                println!("  Status: {}", task.effective_status(now));
                println!("  Priority: {}", task.priority);
                println!("  Attempt: {}/{}", task.attempt, task.max_attempts);
                println!("  Deferrals: {}", task.deferrals);
                if let Some(owner) = &task.lease_owner {
                    println!("  Lease: {owner} until {:?}", task.lease_expires_at);
                }
                if task.available_at > now {
                    println!("  Available at: {}", task.available_at);
                }
                if let Some(error) = &task.error {
                    println!("  Error: {error}");
                }
                if let Some(result) = &task.result {
                    println!("  Result: {result}");
                }
            }
        }

        Commands::Stats { json } => {
            let stats = parts.store.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("pending:          {}", stats.pending);
                println!("leased:           {}", stats.leased);
                println!("processing:       {}", stats.processing);
                println!("succeeded:        {}", stats.succeeded);
                println!("failed_retryable: {}", stats.failed_retryable);
                println!("dead_lettered:    {}", stats.dead_lettered);
            }
        }

        Commands::Budget { json } => {
            let usage = parts.admission.usage().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&usage)?);
            } else {
                println!(
                    "{}/{} calls used, {} remaining, resets at {}",
                    usage.consumed, usage.limit, usage.remaining, usage.resets_at
                );
            }
        }

        Commands::ScaleHint { json } => {
            let stats = parts.store.stats().await?;
            let hint = config.scaling.hint(&stats);
            if json {
                println!("{}", serde_json::to_string_pretty(&hint)?);
            } else {
                println!(
                    "desired_workers={} backlog={} in_flight={} dead_lettered={}",
                    hint.desired_workers, hint.backlog, hint.in_flight, hint.dead_lettered
                );
            }
        }

        Commands::Worker {
            worker_id,
            batch_size,
            include_bulk,
            sweep,
            once,
        } => {
            if let Some(n) = batch_size {
                config.worker.lease_batch_size = n;
            }
            config.worker.include_bulk |= include_bulk;
            let worker = Worker::new(
                parts.store.clone(),
                parts.admission,
                parts.credentials,
                parts.crm,
                config.worker_config(worker_id),
            );

            if once {
                let report = worker.run_cycle().await?;
                println!("{report:?}");
                return Ok(());
            }

            let (shutdown_tx, shutdown_rx) = shutdown_signal();
            tokio::spawn(wait_for_shutdown_signal(shutdown_tx));
            if sweep {
                let sweeper = Sweeper::new(parts.store);
                let interval = Duration::from_secs(config.worker.sweep_interval_secs.max(1));
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { sweeper.run(interval, rx).await });
            }
            worker.run(shutdown_rx).await?;
        }

        Commands::Batcher { once } => {
            let batcher = Batcher::new(
                parts.store,
                parts.admission,
                parts.credentials,
                parts.crm,
                config.batcher_config(),
            );
            if once {
                let report = batcher.run_once().await?;
                println!("{report:?}");
                return Ok(());
            }
            let (shutdown_tx, shutdown_rx) = shutdown_signal();
            tokio::spawn(wait_for_shutdown_signal(shutdown_tx));
            batcher.run(shutdown_rx).await?;
        }

        Commands::Sweep { every } => {
            let sweeper = Sweeper::new(parts.store);
            match every {
                None => {
                    let report = sweeper.sweep_once().await?;
                    println!("{report:?}");
                }
                Some(secs) => {
                    let (shutdown_tx, shutdown_rx) = shutdown_signal();
                    tokio::spawn(wait_for_shutdown_signal(shutdown_tx));
                    sweeper
                        .run(Duration::from_secs(secs.max(1)), shutdown_rx)
                        .await;
                }
            }
        }
    }

    Ok(())
}
