//! wal2kafka
//!
//! Exports a snapshot of a PostgreSQL database, followed by a stream of
//! changes, and sends the data to a Kafka cluster. Attaches to the server as
//! a logical-replication client; every committed row change becomes a keyed,
//! schema-tagged message on the table's topic, and the replication slot is
//! only advanced once Kafka has acknowledged the data (at-least-once
//! delivery).

mod broker;
mod checkpoint;
mod config;
mod encoder;
mod errors;
mod mapper;
mod pidfile;
mod registry;
mod source;
mod supervisor;
mod tracker;
mod types;


use crate::config::{
    BridgeConfig, DEFAULT_BROKER_LIST, DEFAULT_PUBLICATION, DEFAULT_REPLICATION_SLOT,
};
use crate::pidfile::PidFile;
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "wal2kafka",
    about = "Exports a snapshot of a PostgreSQL database, followed by a stream of changes, \
             and sends the data to a Kafka cluster",
    version
)]
struct Args {
    /// Connection string or URI of the PostgreSQL server
    #[arg(short = 'd', long = "postgres")]
    postgres: String,

    /// Name of the replication slot (created on first use)
    #[arg(short = 's', long = "slot", default_value = DEFAULT_REPLICATION_SLOT)]
    slot: String,

    /// Name of the publication the stream is filtered by
    #[arg(long = "publication", default_value = DEFAULT_PUBLICATION)]
    publication: String,

    /// Comma-separated list of Kafka broker hosts/ports
    #[arg(short = 'b', long = "broker", default_value = DEFAULT_BROKER_LIST)]
    broker: String,

    /// URL of the service where schemas are registered.
    /// Used only for --output-format=binary; omit for json
    #[arg(short = 'r', long = "schema-registry")]
    schema_registry: Option<String>,

    /// How to encode the messages for writing to Kafka (binary or json)
    #[arg(short = 'f', long = "output-format", default_value = "binary")]
    output_format: String,

    /// Allow export of tables that don't have a primary key.
    /// Disallowed by default, because updates and deletes need a
    /// primary key to identify their row
    #[arg(short = 'u', long = "allow-unkeyed")]
    allow_unkeyed: bool,

    /// String to prepend to all topic names, e.g. with --topic-prefix=pg,
    /// updates from table 'users' are written to topic 'pg.users'
    #[arg(short = 'p', long = "topic-prefix")]
    topic_prefix: Option<String>,

    /// What to do in case of a transient error, such as failure to publish
    /// to Kafka (log or exit)
    #[arg(short = 'e', long = "on-error", default_value = "exit")]
    on_error: String,

    /// Skip taking a consistent snapshot of the existing database contents
    /// and just start streaming any new updates.
    /// (Ignored if the replication slot already exists.)
    #[arg(short = 'x', long = "skip-snapshot")]
    skip_snapshot: bool,

    /// Set a global configuration property for the Kafka producer
    /// (property=value, repeatable)
    #[arg(short = 'C', long = "kafka-config")]
    kafka_config: Vec<String>,

    /// Set a topic configuration property for the Kafka producer
    /// (property=value, repeatable)
    #[arg(short = 'T', long = "topic-config")]
    topic_config: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = BridgeConfig::new(
        args.postgres,
        args.slot,
        args.publication,
        args.broker,
        args.schema_registry,
        &args.output_format,
        args.allow_unkeyed,
        args.topic_prefix,
        &args.on_error,
        args.skip_snapshot,
        &args.kafka_config,
        &args.topic_config,
    )?;

    let _pidfile = PidFile::create(&config.slot_name)?;

    // Signal handlers only publish into this flag; the supervisor samples it
    // at its cooperative poll points.
    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(Arc::clone(&shutdown));

    let worker_shutdown = Arc::clone(&shutdown);
    let result =
        tokio::task::spawn_blocking(move || supervisor::run_bridge(config, worker_shutdown))
            .await?;

    match result {
        Ok(()) => {
            info!("replication bridge shut down cleanly");
            Ok(())
        }
        Err(e) => {
            error!("replication bridge failed: {e}");
            Err(e.into())
        }
    }
}

fn spawn_signal_listener(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down..."),
            _ = sigterm.recv() => info!("SIGTERM received, shutting down..."),
        }
        shutdown.store(true, Ordering::SeqCst);
    });
}
