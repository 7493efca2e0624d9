//! # Congestion management
//!
//! A [`CongestionManager`] looks at the statistics of a FIFO and decides how
//! aggressively new work should be shed:
//!
//! | posture                   | effect                                                     |
//! |---------------------------|------------------------------------------------------------|
//! | `Normal`                  | everything accepted                                        |
//! | `RejectingNewWork`        | new requests answered with 503, responses still processed  |
//! | `RejectingNonEssential`   | also retransmission timers are stretched instead of firing |
//!
//! [`GeneralCongestionManager`] measures each FIFO by one of three metrics
//! against a per-FIFO tolerance: depth (`Size`), age of the oldest entry
//! (`TimeDepth`) or expected wait for a new entry (`WaitTime`). Under 80% of
//! tolerance is normal, under 100% rejects new work, beyond that rejects
//! everything non-essential.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RejectionBehavior {
    #[default]
    Normal,
    RejectingNewWork,
    RejectingNonEssential,
}

impl RejectionBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionBehavior::Normal => "NORMAL",
            RejectionBehavior::RejectingNewWork => "REJECTING_NEW_WORK",
            RejectionBehavior::RejectingNonEssential => "REJECTING_NON_ESSENTIAL",
        }
    }
}

/// What a tolerance is measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    /// Number of queued entries
    Size,
    /// Age of the oldest entry, in milliseconds
    TimeDepth,
    /// Expected wait for a new entry, in milliseconds
    WaitTime,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Size => "SIZE",
            MetricType::TimeDepth => "TIME_DEPTH",
            MetricType::WaitTime => "WAIT_TIME",
        }
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SIZE" => Ok(MetricType::Size),
            "TIME_DEPTH" => Ok(MetricType::TimeDepth),
            "WAIT_TIME" => Ok(MetricType::WaitTime),
            other => Err(format!(
                "invalid metric '{}': must be SIZE, TIME_DEPTH or WAIT_TIME",
                other
            )),
        }
    }
}

/// Statistics a FIFO exposes to congestion management
pub trait FifoStats: Send + Sync {
    fn description(&self) -> &str;
    fn size(&self) -> usize;
    /// Age of the oldest queued entry
    fn time_depth(&self) -> Duration;
    /// Estimated time until a newly added entry is taken off
    fn expected_wait(&self) -> Duration;
}

pub trait CongestionManager: Send + Sync {
    /// Makes `fifo` visible to [`CongestionManager::encode_current_state`]
    fn register_fifo(&self, fifo: Weak<dyn FifoStats>);

    fn rejection_behavior(&self, fifo: &dyn FifoStats) -> RejectionBehavior;

    /// Human readable dump of every registered FIFO
    fn encode_current_state(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionTolerance {
    pub metric: MetricType,
    pub max_tolerance: u64,
}

/// Tolerance-per-FIFO congestion manager
#[derive(Default)]
pub struct GeneralCongestionManager {
    tolerances: RwLock<HashMap<String, CongestionTolerance>>,
    fifos: Mutex<Vec<Weak<dyn FifoStats>>>,
}

impl GeneralCongestionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(GeneralCongestionManager::default())
    }

    /// Sets (or replaces) the tolerance of the FIFO with this description
    pub fn set_tolerance(&self, description: &str, metric: MetricType, max_tolerance: u64) {
        info!(
            fifo = description,
            metric = metric.as_str(),
            max_tolerance,
            "congestion tolerance updated"
        );
        self.tolerances.write().insert(
            description.to_string(),
            CongestionTolerance {
                metric,
                max_tolerance,
            },
        );
    }

    pub fn tolerance(&self, description: &str) -> Option<CongestionTolerance> {
        self.tolerances.read().get(description).copied()
    }

    fn metric_value(metric: MetricType, fifo: &dyn FifoStats) -> u64 {
        match metric {
            MetricType::Size => fifo.size() as u64,
            MetricType::TimeDepth => fifo.time_depth().as_millis() as u64,
            MetricType::WaitTime => fifo.expected_wait().as_millis() as u64,
        }
    }

    /// Percentage of tolerance currently used
    pub fn percent_used(&self, fifo: &dyn FifoStats) -> Option<u64> {
        let tolerance = self.tolerance(fifo.description())?;
        if tolerance.max_tolerance == 0 {
            return None;
        }
        Some(Self::metric_value(tolerance.metric, fifo) * 100 / tolerance.max_tolerance)
    }
}

impl CongestionManager for GeneralCongestionManager {
    fn register_fifo(&self, fifo: Weak<dyn FifoStats>) {
        let mut fifos = self.fifos.lock();
        fifos.retain(|f| f.strong_count() > 0);
        fifos.push(fifo);
    }

    fn rejection_behavior(&self, fifo: &dyn FifoStats) -> RejectionBehavior {
        match self.percent_used(fifo) {
            None => RejectionBehavior::Normal,
            Some(p) if p < 80 => RejectionBehavior::Normal,
            Some(p) if p < 100 => RejectionBehavior::RejectingNewWork,
            Some(_) => RejectionBehavior::RejectingNonEssential,
        }
    }

    fn encode_current_state(&self) -> String {
        let mut out = String::new();
        for fifo in self.fifos.lock().iter().filter_map(Weak::upgrade) {
            let tolerance = self.tolerance(fifo.description());
            let _ = writeln!(
                out,
                "{}: size={} time_depth_ms={} expected_wait_ms={} tolerance={} behavior={}",
                fifo.description(),
                fifo.size(),
                fifo.time_depth().as_millis(),
                fifo.expected_wait().as_millis(),
                tolerance
                    .map(|t| format!("{}<={}", t.metric.as_str(), t.max_tolerance))
                    .unwrap_or_else(|| "none".to_string()),
                self.rejection_behavior(fifo.as_ref()).as_str(),
            );
        }
        out
    }
}
