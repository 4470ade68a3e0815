// src/watcher.rs
//
// The Case Watcher (§4.2): watches the configured
// directory for new case subdirectories and registers each as a fresh
// `submitted` case once its contents have stopped changing for a
// quiescence period (a case directory typically arrives via a
// multi-file copy/rsync, and registering mid-copy would hand the
// workflow a case missing files it expects). Built on the `notify`
// crate's recommended watcher instead of a manual poll loop.

use crate::model::CasePriority;
use crate::store::Store;
use crate::{log_error, log_info, log_warn};
use crate::logging::LogContext;
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub struct CaseWatcher {
    store: Arc<Store>,
    watch_dir: PathBuf,
    quiescence: Duration,
}

impl CaseWatcher {
    pub fn new(store: Arc<Store>, watch_dir: impl Into<PathBuf>, quiescence_period_seconds: u64) -> Self {
        Self {
            store,
            watch_dir: watch_dir.into(),
            quiescence: Duration::from_secs(quiescence_period_seconds),
        }
    }

    /// Runs the startup pass followed by the live watch loop. Returns
    /// only on an unrecoverable watcher setup failure (§4.2); per-event
    /// and per-registration failures are logged and skipped.
    pub async fn run(&self) -> Result<()> {
        self.startup_scan().await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .context("failed to create filesystem watcher")?;

        watcher
            .watch(&self.watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch directory {:?}", self.watch_dir))?;

        let pending: Arc<Mutex<HashMap<PathBuf, Instant>>> = Arc::new(Mutex::new(HashMap::new()));
        let sweep_pending = pending.clone();
        let sweep_store = self.store.clone();
        let sweep_quiescence = self.quiescence;

        let sweeper = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let ready: Vec<PathBuf> = {
                    let mut guard = sweep_pending.lock().unwrap();
                    let now = Instant::now();
                    let ready: Vec<PathBuf> = guard
                        .iter()
                        .filter(|(_, seen)| now.duration_since(**seen) >= sweep_quiescence)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in &ready {
                        guard.remove(path);
                    }
                    ready
                };
                for path in ready {
                    register(&sweep_store, &path);
                }
            }
        });

        while let Some(event) = rx.recv().await {
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            for path in event.paths {
                if path.is_dir() {
                    pending.lock().unwrap().insert(path, Instant::now());
                }
            }
        }

        sweeper.abort();
        Ok(())
    }

    /// Registers every pre-existing subdirectory not already known to
    /// the store (§4.2 "startup pass"). These directories necessarily
    /// predate this process, so no quiescence wait applies.
    async fn startup_scan(&self) -> Result<()> {
        let ctx = LogContext::new("case_watcher_startup");
        let entries = match std::fs::read_dir(&self.watch_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log_error!(ctx, "failed to read watch directory: {e}");
                return Err(e).context("failed to read watch directory");
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                register(&self.store, &path);
            }
        }
        Ok(())
    }
}

/// Registers a single case directory. Duplicate paths are silently
/// ignored (§4.2); any other registration failure is logged and
/// skipped, never fatal to the watcher.
fn register(store: &Store, path: &Path) {
    let ctx = LogContext::new("case_watcher_register");
    let path_str = path.to_string_lossy().to_string();

    match store.get_case_by_path(&path_str) {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(e) => {
            log_warn!(ctx, "failed to check existing case for {path_str}: {e}");
            return;
        }
    }

    match store.add_case(&path_str, CasePriority::Normal) {
        Ok(id) => log_info!(ctx.case(id), "registered new case at {path_str}"),
        Err(e) => log_warn!(ctx, "failed to register case at {path_str}: {e}"),
    }
}
