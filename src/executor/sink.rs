// ABOUTME: Log sinks that receive build output line by line while a script runs.
// ABOUTME: The channel sink is bounded and drops the oldest lines rather than stall producers.

use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

use crate::types::RunId;

/// Consumer of live run output. Implementations must not block.
pub trait LogSink: Send + Sync {
    fn append(&self, run: &RunId, line: &str);

    /// Lines discarded so far because the consumer fell behind.
    fn dropped(&self) -> u64 {
        0
    }
}

/// Writes every line to tracing under the `rollout::build` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn append(&self, run: &RunId, line: &str) {
        tracing::info!(target: "rollout::build", run = %run, "{}", line);
    }
}

/// A line delivered through a [`LogChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub run: RunId,
    pub line: String,
}

struct Shared {
    queue: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

/// Producer half of a bounded drop-oldest log buffer.
#[derive(Clone)]
pub struct LogChannel {
    shared: Arc<Shared>,
}

/// Single consumer half of a [`LogChannel`].
pub struct LogReceiver {
    shared: Arc<Shared>,
}

impl LogChannel {
    pub fn bounded(capacity: usize) -> (LogChannel, LogReceiver) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        (
            LogChannel {
                shared: Arc::clone(&shared),
            },
            LogReceiver { shared },
        )
    }

    /// Stop accepting lines; the receiver drains what is buffered then ends.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

impl LogSink for LogChannel {
    fn append(&self, run: &RunId, line: &str) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(LogRecord {
                run: run.clone(),
                line: line.to_string(),
            });
        }
        self.shared.notify.notify_one();
    }

    fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl LogReceiver {
    /// Records as a stream that ends once the channel is closed and drained.
    pub fn into_stream(self) -> impl Stream<Item = LogRecord> {
        futures::stream::unfold(self, |mut logs| async move {
            logs.recv().await.map(|record| (record, logs))
        })
    }

    /// Next buffered line, waiting if none is ready. None once closed and drained.
    pub async fn recv(&mut self) -> Option<LogRecord> {
        loop {
            if let Some(record) = self.shared.queue.lock().pop_front() {
                return Some(record);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<LogRecord> {
        self.shared.queue.lock().pop_front()
    }
}

/// The last N lines of output, kept for failure diagnostics.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    limit: usize,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.limit == 0 {
            return;
        }
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Splits a byte stream into lines on `\n` or `\r`, holding back a partial last line.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Whatever is left after the stream ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            Some(line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_handles_partial_lines_and_carriage_returns() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.feed(b"one\ntw"), vec!["one"]);
        assert_eq!(splitter.feed(b"o\r\nprogress 50%\rprogress 100%\n"), vec![
            "two",
            "progress 50%",
            "progress 100%"
        ]);
        assert_eq!(splitter.feed(b"tail"), Vec::<String>::new());
        assert_eq!(splitter.finish(), Some("tail".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn tail_keeps_last_lines() {
        let mut tail = OutputTail::new(2);
        for line in ["a", "b", "c"] {
            tail.push(line);
        }
        assert_eq!(tail.into_lines(), vec!["b", "c"]);
    }

    #[test]
    fn zero_sized_tail_keeps_nothing() {
        let mut tail = OutputTail::new(0);
        tail.push("a");
        assert!(tail.into_lines().is_empty());
    }
}
