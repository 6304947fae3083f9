//! Per-rule traffic statistics
//!
//! One [`RuleStatsEntry`] per rule id with atomic counters. The table lock
//! only guards membership; counter updates take a read lock and an atomic
//! operation, so the traffic-accounting path never contends on a write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::observer::ServiceStats;

/// Atomic counters for one rule
#[derive(Debug, Default)]
pub struct RuleStatsEntry {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    connections: AtomicU64,
    active_conns: AtomicI64,
    errors: AtomicU64,
    /// Unix millis
    last_activity_ms: AtomicI64,
}

impl RuleStatsEntry {
    fn new() -> Self {
        let entry = Self::default();
        entry.touch();
        entry
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self, rule_id: &str) -> RuleStats {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        RuleStats {
            rule_id: rule_id.to_string(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed).max(0) as u64,
            errors: self.errors.load(Ordering::Relaxed),
            last_activity: Utc
                .timestamp_millis_opt(last)
                .single()
                .filter(|_| last > 0)
                .map(|t| t.to_rfc3339()),
        }
    }

    fn reset(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.connections.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of one rule's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStats {
    pub rule_id: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Total connections accepted
    pub connections: u64,
    pub active_conns: u64,
    pub errors: u64,
    /// RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
}

impl RuleStats {
    /// Get total bytes transferred (both directions)
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_in + self.bytes_out
    }
}

/// Aggregated per-rule statistics table
#[derive(Debug, Default)]
pub struct StatsTracker {
    entries: RwLock<HashMap<String, Arc<RuleStatsEntry>>>,
}

impl StatsTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, rule_id: &str) -> Option<Arc<RuleStatsEntry>> {
        self.entries.read().get(rule_id).cloned()
    }

    /// Create a zeroed entry, replacing any previous one
    pub fn init_rule(&self, rule_id: &str) {
        self.entries
            .write()
            .insert(rule_id.to_string(), Arc::new(RuleStatsEntry::new()));
    }

    /// Drop a rule's entry entirely
    pub fn remove_rule(&self, rule_id: &str) {
        self.entries.write().remove(rule_id);
    }

    #[must_use]
    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.entries.read().contains_key(rule_id)
    }

    pub fn add_bytes_in(&self, rule_id: &str, n: u64) {
        if let Some(entry) = self.entry(rule_id) {
            entry.bytes_in.fetch_add(n, Ordering::Relaxed);
            entry.touch();
        }
    }

    pub fn add_bytes_out(&self, rule_id: &str, n: u64) {
        if let Some(entry) = self.entry(rule_id) {
            entry.bytes_out.fetch_add(n, Ordering::Relaxed);
            entry.touch();
        }
    }

    pub fn increment_connections(&self, rule_id: &str) {
        if let Some(entry) = self.entry(rule_id) {
            entry.connections.fetch_add(1, Ordering::Relaxed);
            entry.active_conns.fetch_add(1, Ordering::Relaxed);
            entry.touch();
        }
    }

    pub fn decrement_active_connections(&self, rule_id: &str) {
        if let Some(entry) = self.entry(rule_id) {
            entry.active_conns.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn increment_errors(&self, rule_id: &str) {
        if let Some(entry) = self.entry(rule_id) {
            entry.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot for one rule; zeros if the rule has no entry
    #[must_use]
    pub fn get_stats(&self, rule_id: &str) -> RuleStats {
        match self.entry(rule_id) {
            Some(entry) => entry.snapshot(rule_id),
            None => RuleStats {
                rule_id: rule_id.to_string(),
                ..RuleStats::default()
            },
        }
    }

    #[must_use]
    pub fn get_all_stats(&self) -> HashMap<String, RuleStats> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.snapshot(id)))
            .collect()
    }

    /// Zero the cumulative counters of one rule; active connections are kept
    pub fn reset_stats(&self, rule_id: &str) {
        if let Some(entry) = self.entry(rule_id) {
            entry.reset();
        }
    }

    pub fn reset_all_stats(&self) {
        for entry in self.entries.read().values() {
            entry.reset();
        }
    }

    /// Apply cumulative values from the observer
    ///
    /// Cumulative counters only move forward, so a snapshot that arrives
    /// after a newer one is absorbed. Updates for rules without an entry
    /// (never started, or deleted) are dropped.
    pub fn update_from_observer(&self, rule_id: &str, stats: &ServiceStats) {
        let Some(entry) = self.entry(rule_id) else {
            return;
        };

        entry.bytes_in.fetch_max(stats.input_bytes, Ordering::Relaxed);
        entry.bytes_out.fetch_max(stats.output_bytes, Ordering::Relaxed);
        entry.connections.fetch_max(stats.total_conns, Ordering::Relaxed);
        entry.errors.fetch_max(stats.total_errs, Ordering::Relaxed);
        entry.active_conns.store(
            i64::try_from(stats.current_conns).unwrap_or(i64::MAX),
            Ordering::Relaxed,
        );
        entry.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_only_apply_to_known_rules() {
        let tracker = StatsTracker::new();
        tracker.add_bytes_in("ghost", 10);
        assert!(!tracker.has_rule("ghost"));

        tracker.init_rule("r1");
        tracker.add_bytes_in("r1", 100);
        tracker.add_bytes_out("r1", 40);
        tracker.increment_connections("r1");
        tracker.increment_connections("r1");
        tracker.decrement_active_connections("r1");
        tracker.increment_errors("r1");

        let stats = tracker.get_stats("r1");
        assert_eq!(stats.bytes_in, 100);
        assert_eq!(stats.bytes_out, 40);
        assert_eq!(stats.total_bytes(), 140);
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.active_conns, 1);
        assert_eq!(stats.errors, 1);
        assert!(stats.last_activity.is_some());
    }

    #[test]
    fn test_missing_rule_yields_zeroed_snapshot() {
        let tracker = StatsTracker::new();
        let stats = tracker.get_stats("nope");
        assert_eq!(stats.rule_id, "nope");
        assert_eq!(stats.bytes_in, 0);
        assert!(tracker.get_all_stats().is_empty());
    }

    #[test]
    fn test_reset_keeps_entry_and_active() {
        let tracker = StatsTracker::new();
        tracker.init_rule("r1");
        tracker.add_bytes_in("r1", 5);
        tracker.increment_connections("r1");

        tracker.reset_stats("r1");
        let stats = tracker.get_stats("r1");
        assert!(tracker.has_rule("r1"));
        assert_eq!(stats.bytes_in, 0);
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.active_conns, 1);
    }

    fn observed(bytes: u64, conns: u64, current: u64) -> ServiceStats {
        ServiceStats {
            total_conns: conns,
            current_conns: current,
            input_bytes: bytes,
            output_bytes: bytes * 2,
            total_errs: 0,
        }
    }

    #[test]
    fn test_update_from_observer_applies_cumulative() {
        let tracker = StatsTracker::new();
        tracker.init_rule("r1");
        tracker.add_bytes_in("r1", 999);

        tracker.update_from_observer("r1", &observed(1024, 3, 1));

        let stats = tracker.get_stats("r1");
        assert_eq!(stats.bytes_in, 1024);
        assert_eq!(stats.bytes_out, 2048);
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.active_conns, 1);
    }

    #[test]
    fn test_older_snapshot_does_not_move_counters_back() {
        let tracker = StatsTracker::new();
        tracker.init_rule("r");

        tracker.update_from_observer("r", &observed(500, 5, 2));
        tracker.update_from_observer("r", &observed(300, 3, 1));

        let stats = tracker.get_stats("r");
        assert_eq!(stats.bytes_in, 500);
        assert_eq!(stats.bytes_out, 1000);
        assert_eq!(stats.connections, 5);
        assert_eq!(stats.active_conns, 1);
    }

    #[test]
    fn test_updates_for_unknown_or_removed_rules_are_dropped() {
        let tracker = StatsTracker::new();
        tracker.update_from_observer("late", &observed(10, 1, 0));
        assert!(!tracker.has_rule("late"));

        tracker.init_rule("gone");
        tracker.remove_rule("gone");
        tracker.update_from_observer("gone", &observed(10, 1, 0));
        assert!(!tracker.has_rule("gone"));
        assert!(tracker.get_all_stats().is_empty());
    }

    #[test]
    fn test_reset_then_fresh_snapshot_counts_from_zero() {
        let tracker = StatsTracker::new();
        tracker.init_rule("r");
        tracker.update_from_observer("r", &observed(500, 5, 0));

        tracker.reset_stats("r");
        tracker.update_from_observer("r", &observed(20, 1, 0));

        let stats = tracker.get_stats("r");
        assert_eq!(stats.bytes_in, 20);
        assert_eq!(stats.connections, 1);
    }

    #[test]
    fn test_stats_json_shape() {
        let stats = RuleStats {
            rule_id: "r1".into(),
            active_conns: 2,
            ..RuleStats::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["ruleId"], "r1");
        assert_eq!(json["activeConns"], 2);
    }
}
