//! Bounded log ring buffer for a sandbox's stdout/stderr (`getLogs(id,
//! after?)`). Capacity-bounded so a runaway process can't grow memory
//! unbounded; oldest entries are dropped first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonically increasing within a single [`LogStream`]; never reused,
    /// even once older entries are evicted.
    pub index: u64,
    pub source: LogSource,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    next_index: u64,
    capacity: usize,
}

/// A bounded, thread-safe ring buffer of a sandbox's log lines.
pub struct LogStream {
    inner: Mutex<Inner>,
}

impl Default for LogStream {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LogStream {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                next_index: 0,
                capacity,
            }),
        }
    }

    pub fn push(&self, source: LogSource, line: String) {
        let mut inner = self.inner.lock();
        let index = inner.next_index;
        inner.next_index += 1;
        if inner.entries.len() >= inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LogEntry {
            index,
            source,
            timestamp: Utc::now(),
            line,
        });
    }

    /// Entries with `index > after`, oldest first. `after = None` returns
    /// everything still retained.
    pub fn tail(&self, after: Option<u64>) -> Vec<LogEntry> {
        let inner = self.inner.lock();
        match after {
            None => inner.entries.iter().cloned().collect(),
            Some(cursor) => inner
                .entries
                .iter()
                .filter(|e| e.index > cursor)
                .cloned()
                .collect(),
        }
    }

    pub fn last_index(&self) -> Option<u64> {
        self.inner.lock().entries.back().map(|e| e.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_entries_after_cursor() {
        let log = LogStream::with_capacity(10);
        log.push(LogSource::Stdout, "one".into());
        log.push(LogSource::Stdout, "two".into());
        log.push(LogSource::Stderr, "three".into());

        let all = log.tail(None);
        assert_eq!(all.len(), 3);

        let after_first = log.tail(Some(all[0].index));
        assert_eq!(after_first.len(), 2);
        assert_eq!(after_first[0].line, "two");
    }

    #[test]
    fn ring_buffer_evicts_oldest_entries() {
        let log = LogStream::with_capacity(2);
        log.push(LogSource::Stdout, "a".into());
        log.push(LogSource::Stdout, "b".into());
        log.push(LogSource::Stdout, "c".into());

        let entries = log.tail(None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].line, "b");
        assert_eq!(entries[1].line, "c");
    }
}
