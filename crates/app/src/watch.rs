use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pipeline::{ImportRequest, Pipeline};
use fincon_storage::WriteMode;

pub const PROCESSED_DIR: &str = "processed";
pub const FAILED_DIR: &str = "failed";

/// Forwards files created in (or moved into) `watch_dir` to `tx`.
pub fn spawn_intake_watcher(watch_dir: &Path, tx: mpsc::Sender<PathBuf>) -> notify::Result<impl notify::Watcher> {
    use notify::event::{ModifyKind, RenameMode};
    use notify::{EventKind, RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let Ok(ev) = event else { return };
        let arrived = matches!(
            ev.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
        );
        if arrived {
            for path in ev.paths {
                let _ = tx.try_send(path);
            }
        }
    })?;

    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Skips directories, hidden files and partial downloads.
pub fn is_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let partial = [".part", ".crdownload", ".tmp"].iter().any(|ext| name.ends_with(ext));
    path.is_file() && !name.starts_with('.') && !name.starts_with("~$") && !partial
}

/// Files already waiting in `dir`, oldest name first.
pub fn pending_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_candidate(p))
        .collect();
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, Copy)]
pub struct IntakeOptions {
    pub mode: WriteMode,
    pub ai_enabled: bool,
    /// Wait before reading a new file so the writer can finish.
    pub settle: Duration,
}

impl Default for IntakeOptions {
    fn default() -> Self {
        Self { mode: WriteMode::Append, ai_enabled: false, settle: Duration::from_millis(500) }
    }
}

/// Imports each received file, then moves it to `processed/` or `failed/`
/// next to it. Returns when the channel closes or `cancel` fires.
pub async fn run_intake(
    pipeline: Arc<Pipeline>,
    mut rx: mpsc::Receiver<PathBuf>,
    options: IntakeOptions,
    cancel: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(path) => path,
                None => break,
            },
        };
        if !options.settle.is_zero() {
            tokio::time::sleep(options.settle).await;
        }
        if !is_candidate(&path) {
            continue;
        }

        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot read {}: {e}", path.display());
                continue;
            }
        };
        info!("Importing {}", path.display());

        let request = ImportRequest {
            bytes,
            filename,
            mode: options.mode,
            ai_enabled: options.ai_enabled,
            ..Default::default()
        };
        let outcome = match pipeline.spawn_import(request, cancel.child_token()).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Import task for {} panicked: {e}", path.display());
                continue;
            }
        };

        let target = match outcome {
            Ok(report) => {
                for line in &report.log {
                    info!("{line}");
                }
                PROCESSED_DIR
            }
            Err(e) => {
                warn!("Import of {} failed: {e}", path.display());
                FAILED_DIR
            }
        };
        if let Err(e) = archive(&path, target).await {
            warn!("Cannot move {} to {target}/: {e}", path.display());
        }
    }
}

async fn archive(path: &Path, subdir: &str) -> std::io::Result<()> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(());
    };
    let dir = parent.join(subdir);
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::rename(path, dir.join(name)).await
}
