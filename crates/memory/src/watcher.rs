//! Change watcher (§4.6, Component F): a debounced filesystem watcher plus
//! an optional MongoDB change-stream subscriber, both of which mark the
//! manager dirty and arm a coalescing sync.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::stream::StreamExt;
use mongodb::{bson::doc, Collection};
use notify_debouncer_full::{new_debouncer, notify::RecursiveMode, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A coalesced batch of filesystem change events (§4.6.1).
#[derive(Debug, Clone)]
pub struct FsChangeBatch {
    pub paths: Vec<PathBuf>,
}

/// Watches `paths` for add/change/unlink events, debounced by
/// `debounce_ms`. Emitted batches arrive on the returned channel; the
/// manager is responsible for marking itself dirty and scheduling a sync
/// on receipt.
pub struct FileWatcher {
    _debouncer: Debouncer<notify_debouncer_full::notify::RecommendedWatcher, RecommendedCache>,
}

impl FileWatcher {
    pub fn start(paths: &[PathBuf], debounce_ms: u64) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<FsChangeBatch>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(
            Duration::from_millis(debounce_ms),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let paths: Vec<PathBuf> = events.into_iter().flat_map(|e| e.paths.clone()).collect();
                    if !paths.is_empty() && tx.send(FsChangeBatch { paths }).is_err() {
                        debug!("file watcher receiver dropped, ignoring further events");
                    }
                },
                Err(errors) => {
                    for error in errors {
                        warn!(error = %error, "file watcher error");
                    }
                },
            },
        )?;

        for path in paths {
            if path.exists() {
                debouncer.watch(path, RecursiveMode::Recursive)?;
            }
        }

        Ok((Self { _debouncer: debouncer }, rx))
    }
}

/// `{operationType, paths, timestamp}` as delivered to the manager after
/// debouncing (§4.6.2, §6).
#[derive(Debug, Clone)]
pub struct ChangeStreamBatch {
    pub operation_type: String,
    pub paths: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Subscribes to the chunks collection's change stream and batches events
/// on a debounce window. `start()` returns `false` without throwing when
/// the deployment doesn't support change streams (standalone, no replica
/// set) — the manager treats that as a capability gap, not a failure.
pub struct ChangeStreamWatcher {
    closed: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl ChangeStreamWatcher {
    pub fn new() -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Starts the subscriber. Returns `Ok(true)` if the stream was opened,
    /// `Ok(false)` if the server doesn't support it.
    pub async fn start(
        &mut self,
        chunks: Collection<mongodb::bson::Document>,
        debounce_ms: u64,
        on_batch: impl Fn(ChangeStreamBatch) + Send + Sync + 'static,
    ) -> anyhow::Result<bool> {
        let mut stream = match chunks.watch().await {
            Ok(s) => s,
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                if msg.contains("replica set") || msg.contains("unsupported") {
                    debug!(error = %e, "change streams unsupported on this deployment");
                    return Ok(false);
                }
                return Err(e.into());
            },
        };

        let closed = self.closed.clone();
        let handle = tokio::spawn(async move {
            let mut pending: Vec<(String, String)> = Vec::new();
            let mut op = "update".to_string();
            loop {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                let next = tokio::time::timeout(Duration::from_millis(debounce_ms), stream.next()).await;
                match next {
                    Ok(Some(Ok(event))) => {
                        op = format!("{:?}", event.operation_type).to_lowercase();
                        if let Some(doc) = event.full_document {
                            if let Ok(path) = doc.get_str("path") {
                                pending.push((path.to_string(), op.clone()));
                            }
                        } else if let Some(key) = event.document_key {
                            if let Ok(id) = key.get_str("_id") {
                                if let Some(path) = id.split(':').next() {
                                    pending.push((path.to_string(), op.clone()));
                                }
                            }
                        }
                    },
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "change stream error");
                        break;
                    },
                    Ok(None) => break,
                    Err(_timeout) => {
                        if !pending.is_empty() {
                            let paths: Vec<String> = {
                                let mut seen = std::collections::HashSet::new();
                                pending
                                    .drain(..)
                                    .filter_map(|(p, _)| seen.insert(p.clone()).then_some(p))
                                    .collect()
                            };
                            on_batch(ChangeStreamBatch {
                                operation_type: op.clone(),
                                paths,
                                timestamp: chrono::Utc::now(),
                            });
                        }
                    },
                }
            }
        });
        self.handle = Some(handle);
        Ok(true)
    }

    /// Idempotent: calling `close()` more than once is a no-op.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Default for ChangeStreamWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChangeStreamWatcher {
    fn drop(&mut self) {
        self.close();
    }
}
