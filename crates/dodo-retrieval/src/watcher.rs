// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Filesystem watcher feeding the indexing queue.
//!
//! Events are debounced for a quiet window (default 500 ms) before paths
//! are re-scanned into the pending queue.  Structural changes
//! (create/delete/rename) additionally fire `on_structural` so the cached
//! workspace context can be invalidated.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, RetrievalError};
use crate::scan;
use crate::store::Store;

/// One batched change notification.
struct Change {
    paths: Vec<PathBuf>,
    structural: bool,
}

fn is_structural(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(notify::event::ModifyKind::Name(_))
    )
}

/// Spawn the watcher task.  The returned handle lives until `cancel` fires;
/// dropping it does not stop the watcher.
pub fn spawn_watcher(
    store: Arc<Store>,
    root: PathBuf,
    repo: String,
    max_file_size_kb: u64,
    debounce: Duration,
    on_structural: Arc<dyn Fn() + Send + Sync>,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Change>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let change = Change {
                structural: is_structural(&event.kind),
                paths: event.paths,
            };
            let _ = tx.send(change);
        }
        Err(e) => warn!("watch error: {e}"),
    })
    .map_err(|e| RetrievalError::Io {
        path: root.clone(),
        cause: e.to_string(),
    })?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| RetrievalError::Io {
            path: root.clone(),
            cause: e.to_string(),
        })?;

    let handle = tokio::spawn(async move {
        // Keep the watcher alive for the lifetime of the task.
        let _watcher = watcher;
        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                change = rx.recv() => match change {
                    Some(c) => c,
                    None => return,
                },
            };

            let mut pending: HashSet<PathBuf> = first.paths.into_iter().collect();
            let mut structural = first.structural;

            // Debounce: keep absorbing events until the quiet window passes.
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    change = rx.recv() => match change {
                        Some(c) => {
                            structural |= c.structural;
                            pending.extend(c.paths);
                        }
                        None => break,
                    },
                    _ = tokio::time::sleep(debounce) => break,
                }
            }

            if structural {
                on_structural();
            }
            for abs in pending {
                let Ok(rel) = abs.strip_prefix(&root) else {
                    continue;
                };
                let rel = rel.to_string_lossy().replace('\\', "/");
                if rel.is_empty() {
                    continue;
                }
                match scan::scan_single(&store, &root, &repo, &rel, max_file_size_kb).await {
                    Ok(true) => debug!(path = %rel, "watcher queued change"),
                    Ok(false) => {}
                    Err(e) => warn!(path = %rel, "watcher scan failed: {e}"),
                }
            }
        }
    });
    Ok(handle)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndexStatus;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn create_and_remove_are_structural() {
        use notify::event::{CreateKind, ModifyKind, RemoveKind};
        assert!(is_structural(&EventKind::Create(CreateKind::File)));
        assert!(is_structural(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_structural(&EventKind::Modify(ModifyKind::Data(
            notify::event::DataChange::Content
        ))));
    }

    #[tokio::test]
    async fn watcher_queues_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("db/index.db")).unwrap());
        let cancel = CancellationToken::new();
        let structural_seen = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&structural_seen);

        let _handle = spawn_watcher(
            Arc::clone(&store),
            dir.path().to_path_buf(),
            "r".into(),
            512,
            Duration::from_millis(50),
            Arc::new(move || seen.store(true, Ordering::SeqCst)),
            cancel.clone(),
        )
        .unwrap();

        // Give the watcher a beat to arm before producing the event.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("fresh.rs"), "fn fresh() {}").unwrap();

        // Wait out the debounce window plus slack for the backend.
        let mut queued = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(rec) = store.get_file("r", "fresh.rs").await.unwrap() {
                queued = rec.status == IndexStatus::Pending;
                if queued {
                    break;
                }
            }
        }
        cancel.cancel();
        assert!(queued, "watcher should queue the new file as pending");
        assert!(structural_seen.load(Ordering::SeqCst), "create is structural");
    }
}
