//! Sharded classification pool
//!
//! Records are routed to one of N bounded queues by a hash of their routing
//! path, and each queue has exactly one worker. Same-path records therefore
//! stay in watcher order while different paths classify in parallel. A full
//! queue makes `deliver` wait, which pushes back on the watcher; nothing is
//! dropped.
//!
//! A rename touches two paths. When they hash to different shards, a barrier
//! is queued on the source shard alongside the rename on the destination
//! shard: the source worker parks at the barrier until the rename has been
//! classified, and the rename waits until the source worker reaches the
//! barrier. Records on either path keep their order relative to the rename.
//! Pairs are enqueued under one lock so barriers never interleave crosswise.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::watcher::{RecordSink, WatchRecord};

use super::EventClassifier;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    /// Total queued records across all shards
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

/// Unit of work on a shard queue
enum ShardItem {
    Record {
        record: WatchRecord,
        gate: Option<RenameGate>,
    },
    /// Holds the source shard of a cross-shard rename
    Barrier {
        reached: oneshot::Sender<()>,
        released: oneshot::Receiver<()>,
    },
}

/// Destination half of a cross-shard rename
struct RenameGate {
    reached: oneshot::Receiver<()>,
    released: oneshot::Sender<()>,
}

/// Counters exposed for status reporting
#[derive(Debug, Default)]
struct DispatchStats {
    delivered: AtomicU64,
    classified: AtomicU64,
}

pub struct Dispatcher {
    shards: RwLock<Vec<mpsc::Sender<ShardItem>>>,
    /// Serializes the two enqueues of a cross-shard rename
    pairs: AsyncMutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Start the workers
    pub fn spawn(classifier: Arc<EventClassifier>, config: DispatcherConfig) -> Self {
        let workers = config.workers.max(1);
        let per_shard = (config.queue_capacity / workers).max(1);
        let stats = Arc::new(DispatchStats::default());

        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(per_shard);
            shards.push(tx);
            handles.push(tokio::spawn(run_worker(
                shard,
                rx,
                classifier.clone(),
                stats.clone(),
            )));
        }

        info!("Classifier pool started: {} workers, {} slots each", workers, per_shard);

        Self {
            shards: RwLock::new(shards),
            pairs: AsyncMutex::new(()),
            workers: Mutex::new(handles),
            stats,
        }
    }

    pub(crate) fn shard_for(path: &Path, shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        (hasher.finish() % shards as u64) as usize
    }

    /// Queue a record, waiting while its shard is full
    pub async fn dispatch(&self, record: WatchRecord) -> bool {
        let (target, source) = {
            let shards = self.shards.read();
            if shards.is_empty() {
                return false;
            }
            let to = Self::shard_for(record.routing_path(), shards.len());
            let from = match &record {
                WatchRecord::Rename { from, .. } => Some(Self::shard_for(&from.path, shards.len())),
                WatchRecord::Change(_) => None,
            }
            .filter(|from| *from != to);
            (shards[to].clone(), from.map(|from| shards[from].clone()))
        };

        let sent = match source {
            None => target.send(ShardItem::Record { record, gate: None }).await.is_ok(),
            Some(source) => {
                let (reached_tx, reached_rx) = oneshot::channel();
                let (released_tx, released_rx) = oneshot::channel();
                let _pair = self.pairs.lock().await;
                // A rename that cannot be queued drops its gate, which releases the barrier
                source
                    .send(ShardItem::Barrier {
                        reached: reached_tx,
                        released: released_rx,
                    })
                    .await
                    .is_ok()
                    && target
                        .send(ShardItem::Record {
                            record,
                            gate: Some(RenameGate {
                                reached: reached_rx,
                                released: released_tx,
                            }),
                        })
                        .await
                        .is_ok()
            }
        };
        if sent {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    pub fn delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    pub fn classified(&self) -> u64 {
        self.stats.classified.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shards.read().is_empty()
    }

    /// Stop accepting records, let the workers drain their queues, then join
    ///
    /// Workers still running after `timeout` are aborted; whatever they had
    /// queued is lost and logged.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shards.write().clear();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();

        let deadline = tokio::time::Instant::now() + timeout;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Classifier worker ended abnormally: {}", e),
                Err(_) => {
                    warn!("Classifier worker did not drain in time, aborting");
                    handle.abort();
                }
            }
        }

        let lost = self.delivered().saturating_sub(self.classified());
        if lost > 0 {
            warn!("{} watch records were not classified before shutdown", lost);
        }
        debug!("Classifier pool stopped");
    }
}

#[async_trait]
impl RecordSink for Dispatcher {
    async fn deliver(&self, record: WatchRecord) -> bool {
        self.dispatch(record).await
    }
}

async fn run_worker(
    shard: usize,
    mut rx: mpsc::Receiver<ShardItem>,
    classifier: Arc<EventClassifier>,
    stats: Arc<DispatchStats>,
) {
    while let Some(item) = rx.recv().await {
        let (record, gate) = match item {
            ShardItem::Record { record, gate } => (record, gate),
            ShardItem::Barrier { reached, released } => {
                let _ = reached.send(());
                // Err means the rename side went away; nothing left to wait for
                let _ = released.await;
                continue;
            }
        };
        let released = match gate {
            Some(RenameGate { reached, released }) => {
                let _ = reached.await;
                Some(released)
            }
            None => None,
        };

        let path = record.routing_path().to_path_buf();
        // A panic while classifying one record must not take the shard down
        if let Err(panic) = AssertUnwindSafe(classifier.handle(record))
            .catch_unwind()
            .await
        {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(shard, path = %path.display(), "Classification panicked: {}", reason);
        }
        if let Some(released) = released {
            let _ = released.send(());
        }
        stats.classified.fetch_add(1, Ordering::Relaxed);
    }
    debug!(shard, "Classifier worker drained");
}
