//! Submits a photo to the worker and waits for the styled result.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use animeyourself_worker::client::{mime_type_for, WorkerClient};

#[derive(Parser, Debug)]
#[command(name = "anime-submit", version, about = "Turn a photo into an anime-styled image")]
struct Cli {
    /// Image file to upload
    image: PathBuf,

    /// Worker base URL
    #[arg(long, default_value = "http://localhost:8000")]
    server: String,

    /// Style identifier (see GET /v1/styles)
    #[arg(long, default_value = "anime-default-001")]
    style: String,

    /// User identifier the upload is filed under
    #[arg(long)]
    user: String,

    /// Seconds between status polls
    #[arg(long, default_value_t = 2)]
    poll_interval: u64,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Where to write the result (defaults to <requestId>.png)
    #[arg(long, short)]
    out: Option<PathBuf>,

    /// Reuse an earlier submission with the same key
    #[arg(long)]
    idempotency_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let image = tokio::fs::read(&cli.image)
        .await
        .with_context(|| format!("failed to read {}", cli.image.display()))?;
    let mime_type = mime_type_for(&cli.image);

    let client = WorkerClient::new(&cli.server)?;
    let accepted = client
        .submit(
            &image,
            mime_type,
            &cli.style,
            &cli.user,
            cli.idempotency_key.as_deref(),
        )
        .await?;
    println!("queued {}", accepted.request_id);

    let status = client
        .wait(
            &accepted.request_id,
            Duration::from_secs(cli.poll_interval.max(1)),
            Duration::from_secs(cli.timeout),
        )
        .await?;
    println!("{} after {} attempt(s)", status.status, status.attempts);

    let result = client.result(&accepted.request_id).await?;
    let out = cli
        .out
        .unwrap_or_else(|| PathBuf::from(format!("{}.png", accepted.request_id)));
    tokio::fs::write(&out, &result)
        .await
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("saved {} ({} bytes)", out.display(), result.len());
    Ok(())
}
