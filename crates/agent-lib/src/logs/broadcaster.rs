//! Fan-out of captured log lines to live subscribers

use super::framing::encode_chunk;
use crate::models::LogRecord;
use crate::observability::AgentMetrics;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Encoded frame shared by every subscriber of an app
type Frame = Arc<Vec<u8>>;

struct Subscriber {
    frames: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

/// Central log broadcaster
///
/// Log pumps send records to [`LogBroadcaster::inbound`]; a single loop
/// ([`LogBroadcaster::run`]) encodes each record once and hands it to every
/// subscriber of the record's app without blocking.
pub struct LogBroadcaster {
    subscribers: DashMap<String, HashMap<Uuid, Subscriber>>,
    inbound_tx: mpsc::Sender<LogRecord>,
    inbound_rx: Mutex<Option<mpsc::Receiver<LogRecord>>>,
    frame_buffer: usize,
    metrics: AgentMetrics,
}

impl LogBroadcaster {
    /// `inbound_capacity` bounds queued records, `frame_buffer` bounds each subscriber
    pub fn new(inbound_capacity: usize, frame_buffer: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        Self {
            subscribers: DashMap::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            frame_buffer: frame_buffer.max(1),
            metrics: AgentMetrics::new(),
        }
    }

    /// Channel log pumps feed
    pub fn inbound(&self) -> mpsc::Sender<LogRecord> {
        self.inbound_tx.clone()
    }

    pub fn subscriber_count(&self, app: &str) -> usize {
        self.subscribers.get(app).map(|s| s.len()).unwrap_or(0)
    }

    fn total_subscribers(&self) -> usize {
        self.subscribers.iter().map(|e| e.value().len()).sum()
    }

    /// Consume the inbound channel until `token` is cancelled. Only the first call runs
    pub async fn run(&self, token: CancellationToken) {
        let Some(mut inbound) = self.inbound_rx.lock().await.take() else {
            warn!("Log broadcaster is already running");
            return;
        };
        info!("Log broadcaster started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                record = inbound.recv() => match record {
                    Some(record) => self.broadcast(&record),
                    None => break,
                },
            }
        }

        info!("Log broadcaster stopped");
    }

    /// Hand `record` to every subscriber of its app.
    ///
    /// A subscriber that cannot take the frame immediately is cancelled and
    /// removed; the others are unaffected.
    pub fn broadcast(&self, record: &LogRecord) {
        let Some(mut subscribers) = self.subscribers.get_mut(&record.name) else {
            return;
        };
        if subscribers.is_empty() {
            return;
        }

        let frame: Frame = match encode_chunk(record) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!(workload_id = %record.id, error = %e, "Failed to encode log record");
                return;
            }
        };

        let mut dropped = 0;
        subscribers.retain(|id, sub| match sub.frames.try_send(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(e) => {
                debug!(app = %record.name, subscriber = %id, error = %e, "Dropping slow subscriber");
                sub.cancel.cancel();
                dropped += 1;
                false
            }
        });
        drop(subscribers);

        if dropped > 0 {
            self.metrics.set_log_subscribers(self.total_subscribers() as i64);
        }
    }

    /// Stream frames for `app` into `writer` until `token` is cancelled, the
    /// subscriber is dropped for lagging, or a write fails.
    pub async fn subscribe<W>(&self, app: &str, mut writer: W, token: CancellationToken)
    where
        W: AsyncWrite + Unpin + Send,
    {
        let id = Uuid::new_v4();
        let cancel = token.child_token();
        let (frames_tx, mut frames_rx) = mpsc::channel::<Frame>(self.frame_buffer);

        self.subscribers.entry(app.to_string()).or_default().insert(
            id,
            Subscriber {
                frames: frames_tx,
                cancel: cancel.clone(),
            },
        );
        self.metrics.set_log_subscribers(self.total_subscribers() as i64);
        info!(app = %app, subscriber = %id, "Log subscriber attached");

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            // A stalled peer must not outlive the subscription.
            let written = tokio::select! {
                _ = cancel.cancelled() => break,
                written = write_frame(&mut writer, &frame) => written,
            };
            if let Err(e) = written {
                debug!(app = %app, subscriber = %id, error = %e, "Subscriber write failed");
                break;
            }
        }

        if let Some(mut subs) = self.subscribers.get_mut(app) {
            subs.remove(&id);
        }
        self.subscribers.remove_if(app, |_, subs| subs.is_empty());
        self.metrics.set_log_subscribers(self.total_subscribers() as i64);
        info!(app = %app, subscriber = %id, "Log subscriber detached");
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
