//! Per-job log fan-out.
//!
//! Each job gets a bounded history ring (for late joiners and snapshot
//! queries) and a broadcast channel (for live subscribers). Appending never
//! blocks on consumers: a subscriber that falls behind its bounded buffer
//! observes a dropped-oldest gap, surfaced as a `missed` count, but always
//! sees the surviving lines in append order with no duplicates.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;
pub const DEFAULT_RETENTION: usize = 1000;

/// One log line, keyed by job id externally and sequence number internally.
/// Sequence numbers increase monotonically per job with no gaps on the
/// producer side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub seq: u64,
    pub line: String,
}

struct ChannelInner {
    /// None once the stream is closed; history stays queryable.
    tx: Option<broadcast::Sender<LogLine>>,
    history: VecDeque<LogLine>,
    next_seq: u64,
}

struct Channel {
    inner: Mutex<ChannelInner>,
}

pub struct LogBroadcaster {
    channels: DashMap<String, Arc<Channel>>,
    subscriber_buffer: usize,
    retention: usize,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_RETENTION)
    }
}

impl LogBroadcaster {
    pub fn new(subscriber_buffer: usize, retention: usize) -> Self {
        Self {
            channels: DashMap::new(),
            subscriber_buffer: subscriber_buffer.max(1),
            retention: retention.max(1),
        }
    }

    fn channel(&self, job_id: &str) -> Arc<Channel> {
        self.channels
            .entry(job_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.subscriber_buffer);
                Arc::new(Channel {
                    inner: Mutex::new(ChannelInner {
                        tx: Some(tx),
                        history: VecDeque::new(),
                        next_seq: 0,
                    }),
                })
            })
            .clone()
    }

    fn lock(channel: &Channel) -> std::sync::MutexGuard<'_, ChannelInner> {
        channel
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a line to a job's stream. Non-blocking; appends after `close`
    /// are dropped.
    pub fn append(&self, job_id: &str, line: impl Into<String>) {
        let channel = self.channel(job_id);
        let mut inner = Self::lock(&channel);
        let Some(tx) = inner.tx.clone() else {
            return;
        };

        let entry = LogLine {
            seq: inner.next_seq,
            line: line.into(),
        };
        inner.next_seq += 1;
        inner.history.push_back(entry.clone());
        while inner.history.len() > self.retention {
            inner.history.pop_front();
        }
        // No receivers is fine; history still accumulated.
        let _ = tx.send(entry);
    }

    /// Subscribe to a job's stream, returning the retained history and a live
    /// subscription in one step: every line is in exactly one of the two.
    pub fn subscribe(&self, job_id: &str) -> (Vec<LogLine>, LogSubscription) {
        let channel = self.channel(job_id);
        let inner = Self::lock(&channel);
        let history = inner.history.iter().cloned().collect();
        let rx = inner.tx.as_ref().map(|tx| tx.subscribe());
        (history, LogSubscription { rx, missed: 0 })
    }

    /// Ordered lines retained so far, bounded by the retention window.
    pub fn snapshot(&self, job_id: &str) -> Vec<LogLine> {
        match self.channels.get(job_id) {
            Some(channel) => Self::lock(&channel).history.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// End a job's live stream. Subscribers drain buffered lines and then see
    /// end-of-stream; the history remains until `remove`.
    pub fn close(&self, job_id: &str) {
        if let Some(channel) = self.channels.get(job_id) {
            Self::lock(&channel).tx = None;
        }
    }

    /// Drop all state for a job (history included).
    pub fn remove(&self, job_id: &str) {
        self.channels.remove(job_id);
    }
}

/// Live handle onto one job's log stream. Dropping it releases the
/// subscriber's buffer without affecting the producer or other subscribers.
pub struct LogSubscription {
    rx: Option<broadcast::Receiver<LogLine>>,
    missed: u64,
}

impl LogSubscription {
    /// Next line in append order, or None once the stream is closed and
    /// drained. A subscriber that lagged past its buffer skips the
    /// overwritten lines and keeps going; the skip is tallied in `missed`.
    pub async fn next(&mut self) -> Option<LogLine> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(line) => return Some(line),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.missed += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Lines dropped from this subscriber's buffer because it fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
