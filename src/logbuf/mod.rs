//! User-facing log ring
//!
//! A fixed-capacity buffer of [`LogEntry`] records that the GUI and CLI poll
//! incrementally with [`LogBuffer::get_since`]. Separate from `tracing`,
//! which is for operators. Ids start at 1 and are never reused, not even
//! across [`LogBuffer::clear`].

mod entry;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

pub use entry::{format_bytes, LogEntry, LogLevel};

use crate::model::Rule;

/// Default ring depth
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Callback invoked after each insertion, outside the ring lock
pub type LogCallback = Arc<dyn Fn(&LogEntry) + Send + Sync>;

struct Ring {
    entries: VecDeque<LogEntry>,
    next_id: u64,
}

/// Bounded circular buffer of log entries
pub struct LogBuffer {
    ring: RwLock<Ring>,
    capacity: usize,
    on_change: RwLock<Option<LogCallback>>,
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.ring.read();
        f.debug_struct("LogBuffer")
            .field("len", &ring.entries.len())
            .field("next_id", &ring.next_id)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    /// Create a ring; a zero capacity falls back to the default
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_LOG_CAPACITY
        } else {
            capacity
        };
        Self {
            ring: RwLock::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                next_id: 1,
            }),
            capacity,
            on_change: RwLock::new(None),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.read().entries.is_empty()
    }

    pub fn set_on_change(&self, callback: LogCallback) {
        *self.on_change.write() = Some(callback);
    }

    /// Append an entry, evicting the oldest at capacity. Returns the new id.
    pub fn add(
        &self,
        level: LogLevel,
        rule_id: &str,
        rule_name: &str,
        message: impl Into<String>,
        details: Option<String>,
    ) -> u64 {
        let entry = {
            let mut ring = self.ring.write();
            let entry = LogEntry {
                id: ring.next_id,
                timestamp: Utc::now().to_rfc3339(),
                level,
                rule_id: rule_id.to_string(),
                rule_name: rule_name.to_string(),
                message: message.into(),
                details,
            };
            ring.next_id += 1;

            if ring.entries.len() >= self.capacity {
                ring.entries.pop_front();
            }
            ring.entries.push_back(entry.clone());
            entry
        };

        let callback = self.on_change.read().clone();
        if let Some(callback) = callback {
            callback(&entry);
        }
        entry.id
    }

    pub fn info(&self, rule_id: &str, rule_name: &str, message: impl Into<String>) -> u64 {
        self.add(LogLevel::Info, rule_id, rule_name, message, None)
    }

    pub fn log_service_start(&self, rule: &Rule, listen_addr: &str) -> u64 {
        self.info(
            &rule.id,
            &rule.name,
            format!("Service started: listening on {listen_addr}"),
        )
    }

    pub fn log_service_stop(&self, rule: &Rule) -> u64 {
        self.info(&rule.id, &rule.name, "Service stopped")
    }

    pub fn log_error(&self, rule: &Rule, err: &dyn std::error::Error) -> u64 {
        self.add(
            LogLevel::Error,
            &rule.id,
            &rule.name,
            "Error",
            Some(err.to_string()),
        )
    }

    pub fn log_connection(&self, rule_id: &str, rule_name: &str, client: &str, target: &str) -> u64 {
        self.info(
            rule_id,
            rule_name,
            format!("New connection: {client} -> {target}"),
        )
    }

    pub fn log_disconnection(
        &self,
        rule_id: &str,
        rule_name: &str,
        client: &str,
        bytes_in: u64,
        bytes_out: u64,
    ) -> u64 {
        self.info(
            rule_id,
            rule_name,
            format!(
                "Connection closed: {client} (received: {}, sent: {})",
                format_bytes(bytes_in),
                format_bytes(bytes_out)
            ),
        )
    }

    #[must_use]
    pub fn get_all(&self) -> Vec<LogEntry> {
        self.ring.read().entries.iter().cloned().collect()
    }

    /// The most recent `n` entries, oldest first; `0` means all
    #[must_use]
    pub fn get_recent(&self, n: usize) -> Vec<LogEntry> {
        let ring = self.ring.read();
        let len = ring.entries.len();
        let skip = if n == 0 || n >= len { 0 } else { len - n };
        ring.entries.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn get_by_rule(&self, rule_id: &str) -> Vec<LogEntry> {
        self.ring
            .read()
            .entries
            .iter()
            .filter(|e| e.rule_id == rule_id)
            .cloned()
            .collect()
    }

    /// Entries with id strictly greater than `since_id`, in insertion order
    #[must_use]
    pub fn get_since(&self, since_id: u64) -> Vec<LogEntry> {
        let ring = self.ring.read();
        // ids are sorted, so the first match starts the tail
        let start = ring.entries.partition_point(|e| e.id <= since_id);
        ring.entries.range(start..).cloned().collect()
    }

    /// Drop all entries; the id sequence continues
    pub fn clear(&self) {
        self.ring.write().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let logs = LogBuffer::new(10);
        assert_eq!(logs.info("", "", "a"), 1);
        assert_eq!(logs.add(LogLevel::Warn, "", "", "b", None), 2);
        assert_eq!(logs.add(LogLevel::Error, "", "", "c", Some("why".into())), 3);
        let ids: Vec<u64> = logs.get_all().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let logs = LogBuffer::new(3);
        for i in 0..4 {
            logs.info("", "", format!("m{i}"));
        }
        let all = logs.get_all();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, 2);
        assert_eq!(all[2].id, 4);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn test_get_since_is_strict() {
        let logs = LogBuffer::new(100);
        for i in 0..10 {
            logs.info("", "", format!("m{i}"));
        }
        let since = logs.get_since(4);
        assert_eq!(since.len(), 6);
        assert_eq!(since[0].id, 5);
        assert!(since.iter().all(|e| e.id > 4));

        assert!(logs.get_since(10).is_empty());
        assert_eq!(logs.get_since(0).len(), 10);
    }

    #[test]
    fn test_get_since_after_eviction() {
        let logs = LogBuffer::new(5);
        for _ in 0..12 {
            logs.info("", "", "x");
        }
        let since = logs.get_since(3);
        let ids: Vec<u64> = since.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_get_recent_and_by_rule() {
        let logs = LogBuffer::new(10);
        logs.info("r1", "one", "a");
        logs.info("r2", "two", "b");
        logs.info("r1", "one", "c");

        let recent = logs.get_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "b");
        assert_eq!(logs.get_recent(0).len(), 3);
        assert_eq!(logs.get_recent(50).len(), 3);

        let r1 = logs.get_by_rule("r1");
        assert_eq!(r1.len(), 2);
        assert!(r1.iter().all(|e| e.rule_name == "one"));
    }

    #[test]
    fn test_clear_does_not_reset_ids() {
        let logs = LogBuffer::new(10);
        logs.info("", "", "a");
        logs.info("", "", "b");
        logs.clear();
        assert!(logs.is_empty());
        assert_eq!(logs.info("", "", "c"), 3);
    }

    #[test]
    fn test_callback_runs_outside_lock() {
        let logs = Arc::new(LogBuffer::new(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&logs);
        let counter = Arc::clone(&calls);
        logs.set_on_change(Arc::new(move |entry| {
            counter.fetch_add(1, Ordering::SeqCst);
            // reading the ring from the callback must not deadlock
            assert_eq!(inner.get_since(entry.id - 1).len(), 1);
        }));

        logs.info("", "", "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_helpers_format_messages() {
        let logs = LogBuffer::new(10);
        logs.log_disconnection("r1", "web", "1.2.3.4:5", 2048, 10);
        let entry = &logs.get_all()[0];
        assert_eq!(entry.level, LogLevel::Info);
        assert!(entry.message.contains("2.00 KB"));
        assert!(entry.message.contains("10 B"));

        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let rule = crate::model::Rule::new("web", crate::model::RuleType::Forward);
        logs.log_error(&rule, &err);
        let entry = logs.get_recent(1).pop().unwrap();
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.details.as_deref(), Some("boom"));
    }
}
