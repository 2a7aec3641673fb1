//! cutout – entry point.
//!
//! Startup order:
//! 1. Parse flags and overlay them on environment configuration.
//! 2. Initialise structured tracing (JSON when requested, pretty otherwise).
//! 3. Build the HTTP segmentation client and the queue.
//! 4. Read and submit every file, then follow progress until the queue is
//!    idle or a shutdown signal arrives.
//! 5. Write cutouts to disk, optionally download the ZIP export.

mod cli;
mod config;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::Parser;
use cutout_core::{
    HttpSegmentClient, InputFile, Queue, QueueError, SegmentResult, Task, TaskId, TaskStatus,
};
use tracing::{debug, info, warn};

use crate::cli::Args;
use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let args = Args::parse();
    let cfg = Config::from_env().with_args(&args);

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: CUTOUT_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), server = %cfg.server, "cutout starting");

    // ── 3. Client and queue ────────────────────────────────────────────────────
    let client = HttpSegmentClient::new(&cfg.server)
        .with_context(|| format!("failed to build client for {}", cfg.server))?;
    let queue = Queue::new(cfg.queue_config(args.params()), Arc::new(client));

    // ── 4. Submit and follow ───────────────────────────────────────────────────
    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let file = InputFile::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        files.push(file);
    }
    let ids = queue.submit(files);
    info!(files = ids.len(), concurrency = queue.concurrency(), "batch submitted");

    let progress = tokio::spawn(follow_progress(queue.clone()));

    tokio::select! {
        _ = queue.wait_idle() => {}
        _ = shutdown_signal() => {
            let canceled = queue.cancel_pending();
            warn!(canceled, "interrupted; pending files canceled");
        }
    }
    progress.abort();

    // ── 5. Outputs ─────────────────────────────────────────────────────────────
    tokio::fs::create_dir_all(&args.out_dir)
        .await
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;

    let state = queue.snapshot();
    for task in state.tasks.iter().filter(|t| t.status == TaskStatus::Done) {
        write_cutout(task, &args.out_dir, args.full).await?;
    }

    if let Some(zip_path) = &args.zip {
        match queue.export(&ids).await {
            Ok(archive) => {
                tokio::fs::write(zip_path, &archive)
                    .await
                    .with_context(|| format!("failed to write {}", zip_path.display()))?;
                info!(path = %zip_path.display(), bytes = archive.len(), "export written");
            }
            Err(QueueError::NothingToExport) => warn!("no finished cutouts to export"),
            Err(e) => warn!(error = %e, "export failed"),
        }
    }

    let counts = state.counts();
    for task in state.tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
        warn!(
            task_id = task.id,
            file = %task.file.name,
            error = task.error.as_deref().unwrap_or_default(),
            "file failed"
        );
    }
    info!(
        done = counts.done,
        failed = counts.failed,
        canceled = counts.canceled,
        "cutout finished"
    );

    if counts.done == 0 && !state.tasks.is_empty() {
        anyhow::bail!("no file was processed successfully");
    }
    Ok(())
}

/// Log each task's status changes until aborted.
async fn follow_progress(queue: Queue) {
    let mut rx = queue.subscribe();
    let mut seen: HashMap<TaskId, (TaskStatus, u8)> = HashMap::new();
    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        for task in &state.tasks {
            let now = (task.status, task.progress);
            if seen.insert(task.id, now) == Some(now) {
                continue;
            }
            if task.status.is_terminal() {
                info!(task_id = task.id, file = %task.file.name, status = %task.status, "file finished");
            } else {
                debug!(
                    task_id = task.id,
                    file = %task.file.name,
                    status = %task.status,
                    progress = task.progress,
                    "progress"
                );
            }
        }
    }
}

async fn write_cutout(task: &Task, out_dir: &Path, full: bool) -> anyhow::Result<()> {
    let Some(result) = &task.result else {
        return Ok(());
    };
    let encoded = pick_cutout(result, full);
    if full && result.cutout_full_base64.as_deref().is_none_or(str::is_empty) {
        warn!(
            task_id = task.id,
            file = %task.file.name,
            "server sent no full-resolution cutout; writing the standard one"
        );
    }
    if encoded.is_empty() {
        warn!(task_id = task.id, file = %task.file.name, "server returned no cutout");
        return Ok(());
    }
    let payload = encoded
        .split_once("base64,")
        .map_or(encoded, |(_, data)| data);
    let png = STANDARD
        .decode(payload)
        .with_context(|| format!("invalid cutout data for {}", task.file.name))?;

    let path = out_dir.join(format!("{}_cutout.png", task.file.stem()));
    tokio::fs::write(&path, &png)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(task_id = task.id, path = %path.display(), bytes = png.len(), "cutout written");
    Ok(())
}

/// The full-resolution cutout when requested and present, else the standard one.
fn pick_cutout(result: &SegmentResult, full: bool) -> &str {
    match &result.cutout_full_base64 {
        Some(full_png) if full && !full_png.is_empty() => full_png,
        _ => &result.cutout_png_base64,
    }
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; canceling pending work");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(full: Option<&str>) -> SegmentResult {
        SegmentResult {
            cutout_png_base64: "c3RhbmRhcmQ=".to_owned(),
            cutout_full_base64: full.map(str::to_owned),
            ..Default::default()
        }
    }

    #[test]
    fn full_cutout_is_used_only_when_requested_and_present() {
        assert_eq!(pick_cutout(&result(Some("ZnVsbA==")), true), "ZnVsbA==");
        assert_eq!(pick_cutout(&result(Some("ZnVsbA==")), false), "c3RhbmRhcmQ=");
    }

    #[test]
    fn missing_full_cutout_falls_back_to_standard() {
        assert_eq!(pick_cutout(&result(None), true), "c3RhbmRhcmQ=");
        assert_eq!(pick_cutout(&result(Some("")), true), "c3RhbmRhcmQ=");
    }
}
