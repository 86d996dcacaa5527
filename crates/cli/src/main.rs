//! Administrative CLI for a depot blob store.

mod config;
mod marks;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use depot_core::Digest;
use depot_signer::ResponseHeaders;
use depot_store::{BinaryStore, StoreError};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "depotctl")]
#[command(about = "Administrative CLI for a depot blob store")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = config::CONFIG_ENV, default_value = "depot.toml")]
    config: PathBuf,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file and print its digest
    Put {
        /// File to store
        file: PathBuf,
    },
    /// Fetch a blob, verifying its content
    Get {
        digest: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a signed direct download link
    Url {
        digest: String,

        /// File name offered to the downloading client
        #[arg(long)]
        filename: Option<String>,

        /// Content type returned with the download
        #[arg(long)]
        content_type: Option<String>,

        /// Link lifetime in seconds (defaults to the configured value)
        #[arg(long)]
        expires: Option<u64>,
    },
    /// Remove blobs, continuing past individual failures
    Rm {
        #[arg(required = true)]
        digests: Vec<String>,
    },
    /// Run a garbage collection cycle
    Gc {
        /// File listing live digests, one per line ("-" for stdin)
        #[arg(long)]
        marks: String,

        /// Report what would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,
    },
    /// Check that the storage backend is reachable
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    depot_store::metrics::register_metrics();

    let store = BinaryStore::from_config(&config)
        .await
        .context("failed to open blob store")?;

    let result = run(&store, cli.command, config.gc.dry_run).await;

    if cli.print_metrics {
        match depot_store::metrics::render_metrics() {
            Ok(text) => eprint!("{text}"),
            Err(e) => tracing::warn!(error = %e, "Failed to render metrics"),
        }
    }

    result
}

async fn run(store: &BinaryStore, command: Commands, config_dry_run: bool) -> Result<()> {
    match command {
        Commands::Put { file } => {
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let (digest, outcome) = store.store_content(Bytes::from(content)).await?;
            println!("{digest} {}", outcome.as_str());
        }
        Commands::Get { digest, output } => {
            let digest = parse_digest(&digest)?;
            let content = store.fetch(&digest).await?;
            write_output(output.as_deref(), &content).await?;
        }
        Commands::Url {
            digest,
            filename,
            content_type,
            expires,
        } => {
            let digest = parse_digest(&digest)?;
            let headers = match (filename, content_type) {
                (Some(name), content_type) => {
                    ResponseHeaders::attachment(&name, content_type.as_deref())
                }
                (None, Some(content_type)) => {
                    ResponseHeaders::new().with_content_type(content_type)
                }
                (None, None) => ResponseHeaders::new(),
            };
            let url = store
                .direct_url(&digest, &headers, expires)
                .map_err(|e| match e {
                    StoreError::DirectDownloadDisabled => anyhow::anyhow!(
                        "direct download is disabled; set direct_download.enabled with S3 storage"
                    ),
                    other => other.into(),
                })?;
            println!("{url}");
        }
        Commands::Rm { digests } => {
            let digests = digests
                .iter()
                .map(|d| parse_digest(d))
                .collect::<Result<Vec<_>>>()?;
            let summary = store.remove_all(&digests).await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.failed > 0 {
                anyhow::bail!("{} blob(s) could not be removed", summary.failed);
            }
        }
        Commands::Gc { marks, dry_run } => {
            let phase = store.begin_mark_phase()?;
            let marked = if marks == "-" {
                marks::read_marks(BufReader::new(tokio::io::stdin()), &phase).await?
            } else {
                let file = tokio::fs::File::open(&marks)
                    .await
                    .with_context(|| format!("failed to open marks file {marks}"))?;
                marks::read_marks(BufReader::new(file), &phase).await?
            };
            tracing::info!(marked, "Mark phase complete");

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling sweep");
                    on_signal.cancel();
                }
            });

            let report = store
                .collect_garbage(phase, &cancel, dry_run || config_dry_run)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Health => {
            store
                .health_check()
                .await
                .context("storage backend is unhealthy")?;
            println!("ok ({})", store.backend().backend_name());
        }
    }
    Ok(())
}

fn parse_digest(value: &str) -> Result<Digest> {
    Digest::parse(value).with_context(|| format!("invalid digest {value:?}"))
}

async fn write_output(path: Option<&Path>, content: &[u8]) -> Result<()> {
    match path {
        Some(path) => tokio::fs::write(path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(content).await?;
            stdout.flush().await?;
            Ok(())
        }
    }
}
