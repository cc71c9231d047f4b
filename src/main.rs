//! CLI entry point: `send-jobs` drives delta discovery once per invocation;
//! `work` drains a single queue message and migrates whatever it names.
//! Both subcommands are designed to run as one short-lived invocation
//! (e.g. triggered on a schedule or by a queue event), not as a daemon.

use clap::{Parser, Subcommand};
use s3_replicator::config::{Config, StoredCredentials};
use s3_replicator::delta::DeltaFinder;
use s3_replicator::event::EventProcessor;
use s3_replicator::job_sender::JobSender;
use s3_replicator::migrator::Migrator;
use s3_replicator::queue::{Queue, QueueMessage, SqsQueue};
use s3_replicator::state_store::{DynamoDbStateStore, StateStore};
use s3_replicator::storage::{ClientFactory, ClientPair, DownloadCapability, UploadCapability};
use s3_replicator::types::{Credentials, JobInfo};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "s3-replicator", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug-level logging regardless of RUST_LOG.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover the delta between source and destination, and enqueue it.
    /// A no-op if the queue is not currently empty.
    SendJobs,
    /// Receive and migrate a single queue message, then exit.
    Work,
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "s3_replicator=debug"
        } else {
            "s3_replicator=info"
        })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::SendJobs => run_send_jobs(config).await,
        Command::Work => run_work(config).await,
    }
}

/// Fetch and decode externally-stored credentials, if `SSM_PARAMETER_CREDENTIALS`
/// names one. The parameter store itself is an external collaborator
/// (spec.md §1); this only shapes its JSON response.
async fn load_credentials(config: &Config) -> Result<Option<Credentials>, Box<dyn std::error::Error>> {
    let Some(ref parameter_name) = config.ssm_parameter_credentials else {
        return Ok(None);
    };

    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
    let client = aws_sdk_ssm::Client::new(&sdk_config);
    let response = client
        .get_parameter()
        .name(parameter_name)
        .with_decryption(true)
        .send()
        .await?;
    let value = response
        .parameter
        .and_then(|p| p.value)
        .ok_or_else(|| format!("SSM parameter {parameter_name} has no value"))?;
    let stored: StoredCredentials = serde_json::from_str(&value)?;
    Ok(Some(stored.into_credentials(&config.region_name)))
}

/// Build the source and destination client pairs. `JOB_TYPE` decides which
/// side holds the explicit credentials fetched from SSM: `GET` means this
/// process authenticates to the (foreign) source and writes to a
/// same-account destination; `PUT` is the mirror image.
async fn build_clients(
    config: &Config,
    credentials: Option<&Credentials>,
) -> Result<(ClientPair, ClientPair), Box<dyn std::error::Error>> {
    use s3_replicator::config::JobType;
    use s3_replicator::types::SourceType;

    let (source_creds, dest_creds) = match config.job_type {
        JobType::Get => (credentials, None),
        JobType::Put => (None, credentials),
    };

    let source = ClientFactory::build(
        config.source_type,
        &config.src_bucket_name,
        &config.region_name,
        source_creds,
        false,
        false,
    )
    .await?;

    let destination = ClientFactory::build(
        SourceType::AmazonS3,
        &config.des_bucket_name,
        &config.region_name,
        dest_creds,
        false,
        false,
    )
    .await?;

    Ok((source, destination))
}

async fn run_send_jobs(config: Config) -> ExitCode {
    let credentials = match load_credentials(&config).await {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load credentials: {e}");
            return ExitCode::FAILURE;
        }
    };
    let (source, destination) = match build_clients(&config, credentials.as_ref()).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("failed to build storage clients: {e}");
            return ExitCode::FAILURE;
        }
    };
    let queue = match SqsQueue::connect(&config.sqs_queue_name).await {
        Ok(q) => Arc::new(q) as Arc<dyn Queue>,
        Err(e) => {
            error!("failed to connect to queue {}: {e}", config.sqs_queue_name);
            return ExitCode::FAILURE;
        }
    };

    let finder = DeltaFinder::new(
        source.download,
        destination.download,
        config.des_bucket_prefix.clone(),
        config.job.include_version,
    );
    let sender = JobSender::new(finder, queue);

    match sender.run_if_queue_empty(&config.src_bucket_prefix).await {
        Ok(sent) => {
            info!("enqueued {sent} delta records");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("delta discovery failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_work(config: Config) -> ExitCode {
    let credentials = match load_credentials(&config).await {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load credentials: {e}");
            return ExitCode::FAILURE;
        }
    };
    let (source, destination) = match build_clients(&config, credentials.as_ref()).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("failed to build storage clients: {e}");
            return ExitCode::FAILURE;
        }
    };
    let queue = match SqsQueue::connect(&config.sqs_queue_name).await {
        Ok(q) => q,
        Err(e) => {
            error!("failed to connect to queue {}: {e}", config.sqs_queue_name);
            return ExitCode::FAILURE;
        }
    };
    let state_store: Arc<dyn StateStore> =
        Arc::new(DynamoDbStateStore::connect(config.job_table_name.clone(), config.event_table_name.clone()).await);

    let messages = match queue.receive(1).await {
        Ok(m) => m,
        Err(e) => {
            error!("failed to receive from queue: {e}");
            return ExitCode::FAILURE;
        }
    };
    let Some(message) = messages.into_iter().next() else {
        info!("no messages available");
        return ExitCode::SUCCESS;
    };

    let migrator = Migrator::new(
        source.download,
        destination.upload.clone(),
        state_store.clone(),
        config.src_bucket_name.clone(),
        config.src_bucket_prefix.clone(),
        config.des_bucket_name.clone(),
        config.des_bucket_prefix.clone(),
        config.job.clone(),
    );

    match handle_message(&message, &migrator, &state_store, destination.upload.as_ref()).await {
        Ok(()) => {
            if let Err(e) = queue.delete_message(&message.receipt_handle).await {
                warn!("migration succeeded but failed to delete queue message: {e}");
            }
            ExitCode::SUCCESS
        }
        Err(WorkError::InvalidPayload(detail)) => {
            error!("invalid queue payload, leaving message for redelivery: {detail}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug)]
enum WorkError {
    InvalidPayload(String),
}

/// Dispatch one queue message by its payload shape (spec.md §4.3): a
/// direct job record, a change-notification batch, or a test ping.
async fn handle_message(
    message: &QueueMessage,
    migrator: &Migrator,
    state_store: &Arc<dyn StateStore>,
    destination: &dyn UploadCapability,
) -> Result<(), WorkError> {
    if message.body.get("Event").and_then(|v| v.as_str()) == Some("s3:TestEvent") {
        info!("skipping test ping message");
        return Ok(());
    }

    if message.body.get("Records").is_some() {
        let processor = EventProcessor::new(state_store.clone());
        let batch = processor
            .process(&message.body)
            .await
            .map_err(|e| WorkError::InvalidPayload(e.to_string()))?;

        for job in &batch.transfer {
            if let Err(e) = migrator.run(job).await {
                warn!("migration failed for {}: {e}", job.key);
            }
        }
        for key in &batch.delete {
            if let Err(e) = destination.delete_object(key).await {
                warn!("failed to delete {key} on destination: {e}");
            }
        }
        return Ok(());
    }

    let job: JobInfo =
        serde_json::from_value(message.body.clone()).map_err(|e| WorkError::InvalidPayload(e.to_string()))?;
    if let Err(e) = migrator.run(&job).await {
        warn!("migration failed for {}: {e}", job.key);
    }
    Ok(())
}
