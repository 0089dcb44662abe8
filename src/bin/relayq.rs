//! relayq CLI: run the dispatch loop and operate on the queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use relayq::config::Config;
use relayq::db::Db;
use relayq::engine::{DispatchLoop, Queue};
use relayq::model::queue::{EnqueueResult, NewRecord, Payload, Priority, QueueRecord, Status};
use relayq::sink::{ErrorChannel, LogErrorChannel, WebhookSink};
use relayq::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use tracing::info;

#[derive(Parser)]
#[command(name = "relayq", about = "Durable notification queue and dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch loop until interrupted
    Serve,
    #[command(flatten)]
    Queue(QueueCommand),
}

/// One-shot operations against the queue.
#[derive(Subcommand)]
enum QueueCommand {
    /// Queue an item for delivery
    Enqueue {
        /// Source platform (e.g. "hn", "github")
        platform: String,
        /// Item title
        title: String,
        /// Item URL
        url: String,
        /// Platform-native item id; the record id becomes `platform_id`.
        /// Without it the record is keyed by a hash of the URL.
        #[arg(long)]
        source_id: Option<String>,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// low, normal, high, urgent, or a number
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// Hold the record until this RFC 3339 timestamp
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Show record counts per status
    Status,
    /// Requeue failed records that have retries left
    Retry {
        /// Retry budget (defaults to RELAYQ_MAX_RETRIES)
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Cancel a record that has not finished
    Cancel {
        id: String,
    },
    /// Show a record
    Show {
        id: String,
    },
    /// List records in claim order
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<Status>,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List failed records whose retries are spent
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Queue(command) => cmd_queue(config, command).await,
    }
}

/// One-shot queue operations.
async fn cmd_queue(config: Config, command: QueueCommand) -> anyhow::Result<()> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let queue = Queue::new(db);

    match command {
        QueueCommand::Enqueue {
            platform,
            title,
            url,
            source_id,
            summary,
            category,
            priority,
            at,
        } => {
            let mut payload = Payload::new(platform, title, url);
            if let Some(summary) = summary {
                payload = payload.summary(summary);
            }
            if let Some(category) = category {
                payload = payload.category(category);
            }
            let mut new = match source_id {
                Some(ref id) => NewRecord::from_source(id, payload),
                None => NewRecord::from_url(payload),
            }
            .priority(priority);
            if let Some(at) = at {
                new = new.scheduled_at(at);
            }

            let id = new.id().to_string();
            match queue.enqueue(new).await? {
                EnqueueResult::Queued => println!("Queued: {id}"),
                EnqueueResult::Duplicate => println!("Duplicate: {id} (already queued)"),
            }
            Ok(())
        }
        QueueCommand::Status => {
            let counts = queue.status_counts().await?;
            for status in Status::ALL {
                println!("{:<12} {}", status, counts.get(status));
            }
            println!("{:<12} {}", "total", counts.total);
            Ok(())
        }
        QueueCommand::Retry { max_retries } => {
            let max_retries = max_retries.unwrap_or(config.max_retries);
            let requeued = queue.retry_eligible(max_retries).await?;
            println!("Requeued {requeued} record(s) (max retries: {max_retries})");
            Ok(())
        }
        QueueCommand::Cancel { id } => {
            if queue.cancel(&id).await? {
                println!("Cancelled: {id}");
            } else {
                let record = queue.get(&id).await?;
                anyhow::bail!("cannot cancel {id}: record is {}", record.status);
            }
            Ok(())
        }
        QueueCommand::Show { id } => {
            let record = queue.get(&id).await?;
            print_record(&record)?;
            Ok(())
        }
        QueueCommand::List { status, limit } => {
            let records = queue.list(status, limit).await?;
            print_table(&records);
            Ok(())
        }
        QueueCommand::DeadLetters { limit } => {
            let records = queue.dead_letters(config.max_retries, limit).await?;
            print_table(&records);
            Ok(())
        }
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "relayq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let sink_url = config
        .sink_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("RELAYQ_SINK_URL must be set to serve"))?;
    let sink = WebhookSink::new(sink_url, config.delivery_timeout)?;
    let errors: Arc<dyn ErrorChannel> = match config.error_url.clone() {
        Some(url) => Arc::new(WebhookSink::new(url, config.delivery_timeout)?),
        None => Arc::new(LogErrorChannel),
    };

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.health_check().await?;

    let dispatch = DispatchLoop::with_error_channel(
        Arc::new(Queue::new(db)),
        Arc::new(sink),
        errors,
        config.dispatch(),
    );
    dispatch.start().await?;
    info!(consumer_id = dispatch.consumer_id(), "relayq serving");

    shutdown_signal().await;
    dispatch.stop().await;
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_table(records: &[QueueRecord]) {
    if records.is_empty() {
        println!("No records found.");
        return;
    }

    println!(
        "{:<24}  {:<10}  {:<11}  {:<4}  {:<5}  {:<40}  CREATED",
        "ID", "PLATFORM", "STATUS", "PRI", "TRIES", "TITLE"
    );
    println!("{}", "-".repeat(120));

    for record in records {
        println!(
            "{:<24}  {:<10}  {:<11}  {:<4}  {:<5}  {:<40}  {}",
            truncate(&record.id, 24),
            truncate(&record.payload.platform, 10),
            record.status,
            record.priority,
            record.retry_count,
            truncate(&record.payload.title, 40),
            record.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} record(s)", records.len());
}

fn print_record(record: &QueueRecord) -> anyhow::Result<()> {
    println!("ID:         {}", record.id);
    println!("Status:     {}", record.status);
    println!("Priority:   {}", record.priority);
    println!("Retries:    {}", record.retry_count);
    if let Some(at) = record.scheduled_at {
        println!("Scheduled:  {at}");
    }
    println!("Created:    {}", record.created_at);
    println!("Updated:    {}", record.updated_at);
    if let Some(at) = record.processed_at {
        println!("Processed:  {at}");
    }
    if let Some(ref error) = record.error_message {
        println!("Error:      {error}");
    }
    println!(
        "Payload:    {}",
        serde_json::to_string_pretty(&record.payload)?
    );
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max - 1).collect();
        out.push('~');
        out
    }
}
