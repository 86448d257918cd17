use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use squash_core::{
    DispatcherBuilder, EngineConfig, EventKind, ExportMode, RegistrySnapshot, TaskEvent,
    TaskState,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Compress a batch of images concurrently.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration (JSON). Built-in defaults apply when omitted.
    #[arg(short, long, env = "SQUASH_CONFIG")]
    config: Option<PathBuf>,

    /// Print every event as a JSON line instead of human-readable text.
    #[arg(long)]
    json: bool,

    /// Directory to collect the compressed outputs in once all tasks are done.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Pack the outputs into one zip archive inside --out instead of copying them.
    #[arg(long, requires = "out")]
    archive: bool,

    /// Images to compress (jpg, jpeg, png, webp by default).
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let dispatcher = DispatcherBuilder::new(config)
        .build()
        .context("starting dispatcher")?;
    let mut events = dispatcher.subscribe();

    let report = dispatcher.submit(&cli.files).await;
    for rejected in &report.rejected {
        warn!(path = %rejected.path.display(), error = %rejected.error, "skipped");
    }
    for duplicate in &report.duplicates {
        info!(task_id = %duplicate, "already queued");
    }
    if report.accepted.is_empty() {
        dispatcher.shutdown().await;
        bail!("nothing to compress");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut remaining = report.accepted.len();
    while remaining > 0 {
        tokio::select! {
            _ = &mut ctrl_c => {
                let cancelled = dispatcher.clear_all().await;
                warn!(cancelled, "interrupted, all tasks cleared");
                dispatcher.shutdown().await;
                return Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                render(&event, cli.json)?;
                if event.kind.is_terminal() {
                    remaining -= 1;
                }
            }
        }
    }

    let snapshot = dispatcher.snapshot().await;
    if !cli.json {
        print_summary(&snapshot);
    }

    if let Some(out) = &cli.out {
        if dispatcher.batch_ready() {
            let mode = if cli.archive {
                ExportMode::Archive
            } else {
                ExportMode::Copy
            };
            tokio::fs::create_dir_all(out)
                .await
                .with_context(|| format!("creating {}", out.display()))?;
            let exported = dispatcher
                .export_batch(out, mode, |percent| debug!(percent, "exporting"))
                .await
                .context("batch export")?;
            if cli.json {
                println!("{}", serde_json::to_string(&exported)?);
            } else {
                println!(
                    "exported {} file(s) to {}",
                    exported.items,
                    exported.destination.display()
                );
            }
        } else {
            warn!("no completed outputs, nothing to export");
        }
    }

    dispatcher.shutdown().await;
    Ok(())
}

fn render(event: &TaskEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let name = event
        .task_id
        .as_path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| event.task_id.to_string());
    let c = &event.counts;
    match &event.kind {
        EventKind::Started => println!("{name}: started"),
        EventKind::Progress { percent } if percent % 25 == 0 => println!(
            "{name}: {percent:>3}%  [pending {} | processing {} | done {} | failed {}]",
            c.pending, c.processing, c.completed, c.failed
        ),
        EventKind::Progress { .. } => {}
        EventKind::Completed { outcome } => println!(
            "{name}: {} -> {} bytes ({:.2}% saved, {}) -> {}",
            outcome.original_size,
            outcome.compressed_size,
            outcome.compression_ratio,
            outcome.format,
            outcome.output_path.display()
        ),
        EventKind::Failed { reason, .. } => println!("{name}: failed: {reason}"),
    }
    Ok(())
}

fn print_summary(snapshot: &RegistrySnapshot) {
    let saved: i64 = snapshot
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Completed)
        .filter_map(|t| t.outcome.as_ref())
        .map(|o| o.saved_bytes())
        .sum();
    let c = &snapshot.counts;
    println!(
        "{} completed, {} failed of {}; {} bytes saved",
        c.completed, c.failed, c.total, saved
    );
}
