//! Bounded intake queue and the batch consumer loop.
//!
//! Producers call [`MessageBatcher::enqueue`], which never waits. A single
//! consumer drains up to `max_batch_size` messages per window, groups them by
//! target, and hands each group to a [`FrameSink`] as one frame.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use herald_core::{Envelope, Message, QueueError, Target};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::{BATCH_FRAMES_TOTAL, BATCH_SIZE, QUEUE_DROPPED_TOTAL, QUEUE_REJECTIONS_TOTAL};
use crate::websocket::broadcast::FrameSink;

/// Batching parameters.
#[derive(Clone, Copy, Debug)]
pub struct BatcherConfig {
    /// Intake queue capacity.
    pub queue_max_size: usize,
    /// Most messages drained into one window.
    pub max_batch_size: usize,
    /// How long the consumer waits for a first message before looping.
    pub poll_interval: Duration,
    /// Pause after a delivery panic.
    pub error_backoff: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            queue_max_size: 1000,
            max_batch_size: 50,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Intake queue plus batch consumer.
pub struct MessageBatcher {
    config: BatcherConfig,
    tx: mpsc::Sender<Message>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    sink: Arc<dyn FrameSink>,
}

impl MessageBatcher {
    /// Create a batcher. The consumer starts with [`run`](Self::run).
    pub fn new(config: BatcherConfig, sink: Arc<dyn FrameSink>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_max_size.max(1));
        Self {
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            sink,
        }
    }

    /// Add a message to the queue, failing immediately when it is full.
    pub fn enqueue(&self, message: Message) -> Result<(), QueueError> {
        self.tx.try_send(message).map_err(|e| {
            counter!(QUEUE_REJECTIONS_TOTAL).increment(1);
            match e {
                TrySendError::Full(m) => {
                    warn!(target = %m.target, capacity = self.config.queue_max_size, "message queue full");
                    QueueError::Full {
                        capacity: self.config.queue_max_size,
                    }
                }
                TrySendError::Closed(_) => QueueError::Closed,
            }
        })
    }

    /// Messages waiting in the queue.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.config.queue_max_size
    }

    /// Consume the queue until `cancel` fires.
    ///
    /// Only one consumer may run; a second call returns immediately. On exit
    /// the queue is closed and anything still in it is dropped.
    #[instrument(skip_all, name = "batch_consumer")]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("batch consumer already running");
            return;
        };
        info!(
            max_batch_size = self.config.max_batch_size,
            queue_max_size = self.config.queue_max_size,
            "batch consumer started"
        );

        loop {
            let first = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = tokio::time::timeout(self.config.poll_interval, rx.recv()) => match next {
                    Err(_) => continue,
                    Ok(None) => break,
                    Ok(Some(message)) => message,
                },
            };

            let mut window = Vec::with_capacity(self.config.max_batch_size);
            window.push(first);
            while window.len() < self.config.max_batch_size {
                match rx.try_recv() {
                    Ok(message) => window.push(message),
                    Err(_) => break,
                }
            }

            let delivered =
                std::panic::catch_unwind(AssertUnwindSafe(|| self.flush(window)));
            if delivered.is_err() {
                error!("batch delivery panicked, backing off");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.error_backoff) => {}
                }
            }
        }

        rx.close();
        let mut dropped: u64 = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            counter!(QUEUE_DROPPED_TOTAL).increment(dropped);
            warn!(dropped, "dropping queued messages on shutdown");
        }
        info!("batch consumer stopped");
    }

    /// Group one window by target and deliver each group as a single frame.
    #[allow(clippy::cast_precision_loss)]
    fn flush(&self, window: Vec<Message>) {
        histogram!(BATCH_SIZE).record(window.len() as f64);
        for (target, messages) in group_by_target(window) {
            let frame = into_frame(messages);
            let items = frame.item_count();
            let report = self.sink.deliver(&target, frame);
            counter!(BATCH_FRAMES_TOTAL).increment(1);
            debug!(%target, items, delivered = report.delivered, "flushed batch");
        }
    }
}

/// Group messages by target, keeping enqueue order inside each group and
/// first-appearance order across groups.
pub fn group_by_target(messages: Vec<Message>) -> Vec<(Target, Vec<Message>)> {
    let mut slots: HashMap<Target, usize> = HashMap::new();
    let mut groups: Vec<(Target, Vec<Message>)> = Vec::new();
    for message in messages {
        let slot = *slots.entry(message.target.clone()).or_insert_with(|| {
            groups.push((message.target.clone(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(message);
    }
    groups
}

/// One message goes out as-is; several are wrapped in a `batch` frame whose
/// items keep their own type and timestamp.
pub fn into_frame(mut messages: Vec<Message>) -> Envelope {
    if messages.len() == 1 {
        if let Some(only) = messages.pop() {
            return only.envelope;
        }
    }
    let items = messages
        .into_iter()
        .map(|m| {
            let at = m.envelope.timestamp.unwrap_or(m.enqueued_at);
            m.envelope.stamped(at)
        })
        .collect();
    Envelope::batch(items)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
