//! Asynchronous event sink.
//!
//! A bounded queue with a small pool of writer workers bridges the proxy's
//! flow hooks and the event store. Enqueue never blocks: a full queue drops
//! the event and counts it. Workers retry transient append failures with
//! exponential backoff and count permanent failures. Forwarding is never
//! throttled for accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use tokentap_core::Event;

use crate::store::EventStore;

/// Sink tuning knobs.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Queue capacity; events beyond it are dropped with a counter.
    pub capacity: usize,
    /// Writer worker count. Zero is valid (tests): nothing consumes.
    pub workers: usize,
    /// First retry delay.
    pub retry_base: Duration,
    /// Retry delay cap.
    pub retry_cap: Duration,
    /// Attempts before an event is counted failed and discarded.
    pub max_attempts: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            workers: 2,
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// Sink counters surfaced by the status endpoint.
#[derive(Debug, Default)]
pub struct SinkCounters {
    /// Events rejected because the queue was full.
    pub dropped: AtomicU64,
    /// Events discarded after exhausting retries (or at shutdown).
    pub failed: AtomicU64,
    /// Events successfully appended.
    pub written: AtomicU64,
}

impl SinkCounters {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// The bounded queue + worker pool.
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    rx: Arc<Mutex<mpsc::Receiver<Event>>>,
    counters: Arc<SinkCounters>,
    workers: Vec<JoinHandle<()>>,
}

impl EventSink {
    /// Spawns the sink over the given store.
    pub fn spawn(store: Arc<dyn EventStore>, config: SinkConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(SinkCounters::default());

        let workers = (0..config.workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let store = store.clone();
                let counters = counters.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, rx, store, counters, config).await;
                })
            })
            .collect();

        Self {
            tx,
            rx,
            counters,
            workers,
        }
    }

    /// Spawns with default settings.
    pub fn with_defaults(store: Arc<dyn EventStore>) -> Self {
        Self::spawn(store, SinkConfig::default())
    }

    /// Non-blocking enqueue. A full (or closed) queue drops the event and
    /// increments `dropped`; the caller is never delayed.
    pub fn enqueue(&self, event: Event) {
        if let Err(err) = self.tx.try_send(event) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                dropped = self.counters.dropped(),
                "event sink saturated, dropping event: {}",
                match err {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "queue closed",
                }
            );
        }
    }

    /// A cloneable handle for enqueueing from flow hooks.
    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            tx: self.tx.clone(),
            counters: self.counters.clone(),
        }
    }

    /// Shared counters.
    pub fn counters(&self) -> Arc<SinkCounters> {
        self.counters.clone()
    }

    /// Drains the queue: closes intake, waits up to `grace` for workers to
    /// empty it, then force-fails whatever remains.
    pub async fn drain(self, grace: Duration) {
        let Self {
            tx,
            rx,
            counters,
            workers,
        } = self;
        drop(tx);

        let deadline = tokio::time::Instant::now() + grace;
        let mut timed_out = false;
        for mut worker in workers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, &mut worker).await {
                Ok(_) => {}
                Err(_) => {
                    worker.abort();
                    timed_out = true;
                }
            }
        }

        if timed_out {
            tracing::warn!("sink drain deadline exceeded, failing remaining events");
        }

        // Anything still queued is counted failed.
        let locked = timeout(Duration::from_millis(100), rx.lock()).await;
        if let Ok(mut guard) = locked {
            while guard.try_recv().is_ok() {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Cheap handle handed to flow hooks.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<Event>,
    counters: Arc<SinkCounters>,
}

impl SinkHandle {
    /// Non-blocking enqueue (same semantics as [`EventSink::enqueue`]).
    pub fn enqueue(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counters(&self) -> Arc<SinkCounters> {
        self.counters.clone()
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("dropped", &self.counters.dropped())
            .field("failed", &self.counters.failed())
            .finish()
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Event>>>,
    store: Arc<dyn EventStore>,
    counters: Arc<SinkCounters>,
    config: SinkConfig,
) {
    loop {
        // Hold the lock only for the dequeue itself.
        let event = { rx.lock().await.recv().await };
        let Some(event) = event else {
            tracing::debug!(worker_id, "sink worker exiting, queue closed");
            break;
        };

        let mut attempt = 0u32;
        let mut delay = config.retry_base;
        loop {
            match store.append(&event) {
                Ok(()) => {
                    counters.written.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= config.max_attempts {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            worker_id,
                            attempts = attempt,
                            event = %event.digest_line(),
                            "dropping event after repeated store failures: {err}"
                        );
                        break;
                    }
                    tracing::debug!(worker_id, attempt, "store append failed, retrying: {err}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(config.retry_cap);
                }
            }
        }
    }
}
