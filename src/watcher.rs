//! Optional event-driven feeder: watches a backup root and turns file
//! create/write events into one-shot upload items. Removals are ignored on
//! purpose, this is a backup tool and not a mirror.

use crate::scanner::{ScanContext, Scanner};
use anyhow::{Context, Result};
use notify_debouncer_full::notify::event::{EventKind, ModifyKind};
use notify_debouncer_full::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache,
    new_debouncer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct BackupWatcher {
    scanner: Arc<Scanner>,
    // Dropping the debouncer stops the underlying watcher.
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl BackupWatcher {
    /// Recursively watch `root` and feed the upload queue. The watcher stays
    /// alive for as long as the returned value is held.
    pub fn start(
        root: &Path,
        ctx: ScanContext,
        parent: &CancellationToken,
        debounce: Duration,
    ) -> Result<Self> {
        let scanner = Arc::new(
            Scanner::new(root, parent)
                .with_context(|| format!("failed to prepare watcher for {}", root.display()))?,
        );

        let (event_tx, event_rx) = mpsc::channel::<DebounceEventResult>(64);
        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            // Runs on the watcher thread; the consumer lives on the runtime.
            let _ = event_tx.blocking_send(result);
        })
        .context("failed to create filesystem watcher")?;

        debouncer
            .watch(scanner.root(), RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", scanner.root().display()))?;

        let consumer_scanner = Arc::clone(&scanner);
        let token = parent.child_token();
        tokio::spawn(async move {
            consume_events(consumer_scanner, ctx, token, event_rx).await;
        });

        debug!(target: "watcher", root = %scanner.root().display(), "watch started");
        Ok(Self {
            scanner,
            _debouncer: debouncer,
        })
    }

    pub fn root(&self) -> &Path {
        self.scanner.root()
    }
}

async fn consume_events(
    scanner: Arc<Scanner>,
    ctx: ScanContext,
    token: CancellationToken,
    mut event_rx: mpsc::Receiver<DebounceEventResult>,
) {
    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = event_rx.recv() => match result {
                Some(result) => result,
                None => break,
            },
        };

        match result {
            Ok(events) => {
                for event in events {
                    handle_event(&scanner, &ctx, &event).await;
                }
            }
            Err(errors) => {
                for err in errors {
                    warn!(target: "watcher", root = %scanner.root().display(), error = %err, "watch error");
                }
            }
        }
    }
    debug!(target: "watcher", root = %scanner.root().display(), "watch consumer exited");
}

async fn handle_event(scanner: &Arc<Scanner>, ctx: &ScanContext, event: &DebouncedEvent) {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
    );
    if !relevant {
        return;
    }

    for path in &event.paths {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            // The path may already be gone again; nothing to back up.
            Err(_) => continue,
        };

        if meta.is_dir() {
            if matches!(event.kind, EventKind::Create(_)) {
                debug!(target: "watcher", dir = %path.display(), "new directory, scanning subtree");
                scanner.scan_subtree(path.clone(), ctx).await;
            }
        } else if meta.is_file() {
            debug!(target: "watcher", path = %path.display(), "file event, scheduling upload");
            let server_path = scanner.server_path_for(path);
            ctx.queue.enqueue(path.clone(), server_path).await;
        }
    }
}
