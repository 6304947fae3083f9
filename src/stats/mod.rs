//! Traffic statistics pipeline
//!
//! Running services push cumulative [`ServiceStats`] snapshots into the
//! [`StatsObserver`]; the engine wires the observer's update callback into
//! the [`StatsTracker`], which is what the controller reads from.

mod observer;
mod tracker;

pub use observer::{ServiceStats, StatsObserver, UpdateCallback};
pub use tracker::{RuleStats, RuleStatsEntry, StatsTracker};
