//! Retrieval of completed outputs: one at a time, or as a batch.
//!
//! Batch export either copies every output into a directory or packs them
//! into a single deflate-compressed archive. Progress is reported after each
//! item as a percentage of the outcomes processed. On failure the partial
//! result is left as-is and the error carries how many items were done.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{error, info};
use zip::ZipWriter;
use zip::write::FileOptions;

use crate::domain::{CompressionOutcome, SquashError, SquashResult};
use crate::ports::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// Copy each output into the destination directory (collisions overwrite).
    Copy,
    /// Pack all outputs into one `.zip` inside the destination directory.
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReport {
    pub mode: ExportMode,
    pub items: usize,
    /// The directory (copy) or the archive file (archive).
    pub destination: PathBuf,
}

/// `compressed_images_<YYYYmmdd_HHMMSS>.zip`, in local time.
pub fn archive_name(clock: &dyn Clock) -> String {
    let stamp = clock.now().with_timezone(&Local).format("%Y%m%d_%H%M%S");
    format!("compressed_images_{stamp}.zip")
}

/// Copy one output to `destination` (a file path chosen by the caller).
pub async fn export_one(outcome: &CompressionOutcome, destination: &Path) -> SquashResult<PathBuf> {
    tokio::fs::copy(&outcome.output_path, destination)
        .await
        .map_err(|e| {
            error!(
                source = %outcome.output_path.display(),
                destination = %destination.display(),
                error = %e,
                "export failed"
            );
            SquashError::io(0, e)
        })?;
    Ok(destination.to_path_buf())
}

/// Export every outcome into `dest_dir`.
///
/// `progress` is called with `(i + 1) / n * 100` after each item.
pub async fn export_batch<F>(
    outcomes: Vec<CompressionOutcome>,
    dest_dir: &Path,
    mode: ExportMode,
    clock: &dyn Clock,
    mut progress: F,
) -> SquashResult<ExportReport>
where
    F: FnMut(f64) + Send + 'static,
{
    if outcomes.is_empty() {
        return Err(SquashError::NotFound("no completed outputs to export".into()));
    }
    let total = outcomes.len();
    info!(items = total, mode = ?mode, destination = %dest_dir.display(), "batch export started");

    let result = match mode {
        ExportMode::Copy => copy_all(&outcomes, dest_dir, &mut progress).await,
        ExportMode::Archive => {
            let archive = dest_dir.join(archive_name(clock));
            let target = archive.clone();
            let joined =
                task::spawn_blocking(move || write_archive(&outcomes, &target, &mut progress)).await;
            match joined {
                Ok(written) => written.map(|()| archive),
                Err(e) => Err(SquashError::io(0, io::Error::other(e))),
            }
        }
    };

    match result {
        Ok(destination) => {
            info!(items = total, destination = %destination.display(), "batch export finished");
            Ok(ExportReport {
                mode,
                items: total,
                destination,
            })
        }
        Err(err) => {
            error!(error = %err, "batch export failed");
            Err(err)
        }
    }
}

async fn copy_all<F>(
    outcomes: &[CompressionOutcome],
    dest_dir: &Path,
    progress: &mut F,
) -> SquashResult<PathBuf>
where
    F: FnMut(f64) + Send,
{
    for (i, outcome) in outcomes.iter().enumerate() {
        let target = dest_dir.join(entry_name(&outcome.output_path));
        tokio::fs::copy(&outcome.output_path, &target)
            .await
            .map_err(|e| SquashError::io(i, e))?;
        progress(percent(i + 1, outcomes.len()));
    }
    Ok(dest_dir.to_path_buf())
}

fn write_archive(
    outcomes: &[CompressionOutcome],
    archive: &Path,
    progress: &mut impl FnMut(f64),
) -> SquashResult<()> {
    let file = File::create(archive).map_err(|e| SquashError::io(0, e))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut used = HashSet::new();
    for (i, outcome) in outcomes.iter().enumerate() {
        let name = unique_name(entry_name(&outcome.output_path), &mut used);
        zip.start_file(name, options)
            .map_err(|e| SquashError::io(i, io::Error::other(e)))?;
        let mut source = File::open(&outcome.output_path).map_err(|e| SquashError::io(i, e))?;
        io::copy(&mut source, &mut zip).map_err(|e| SquashError::io(i, e))?;
        progress(percent(i + 1, outcomes.len()));
    }
    zip.finish()
        .map_err(|e| SquashError::io(outcomes.len(), io::Error::other(e)))?;
    Ok(())
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Archive entry names must be distinct: `a.png`, `a (2).png`, ...
fn unique_name(name: String, used: &mut HashSet<String>) -> String {
    if used.insert(name.clone()) {
        return name;
    }
    let path = Path::new(&name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 2;
    loop {
        let candidate = format!("{stem} ({n}){ext}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn percent(done: usize, total: usize) -> f64 {
    done as f64 / total as f64 * 100.0
}
