use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::session::Termination;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TurnReport {
    pub duration: Duration,
    pub backend_calls: usize,
    pub tool_calls: usize,
    pub tool_failures: usize,
    pub iterations: usize,
    /// `None` when the turn ended with an error.
    pub termination: Option<Termination>,
}

impl TurnReport {
    /// Share of tool calls that came back as error entries across reports.
    pub fn failure_rate(reports: &[Self]) -> f32 {
        let calls: usize = reports.iter().map(|r| r.tool_calls).sum();
        if calls == 0 {
            return 0.0;
        }
        let failures: usize = reports.iter().map(|r| r.tool_failures).sum();
        failures as f32 / calls as f32
    }
}

#[derive(Default, Clone)]
pub struct MetricsTracker {
    reports: Arc<Mutex<Vec<TurnReport>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricsTracker {
    pub fn start_turn(&self) -> TurnGuard {
        TurnGuard {
            start: Instant::now(),
            backend_calls: 0,
            tool_calls: 0,
            tool_failures: 0,
            metrics: self.clone(),
        }
    }

    pub fn reports(&self) -> Vec<TurnReport> {
        locked(&self.reports).clone()
    }
}

impl std::fmt::Debug for MetricsTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsTracker")
            .field("reports", &locked(&self.reports).len())
            .finish()
    }
}

pub struct TurnGuard {
    start: Instant,
    backend_calls: usize,
    tool_calls: usize,
    tool_failures: usize,
    metrics: MetricsTracker,
}

impl TurnGuard {
    pub fn record_backend_call(&mut self) {
        self.backend_calls += 1;
    }

    pub fn record_tool_call(&mut self, failed: bool) {
        self.tool_calls += 1;
        if failed {
            self.tool_failures += 1;
        }
    }

    pub fn finish(self, iterations: usize, termination: Option<Termination>) -> TurnReport {
        let report = TurnReport {
            duration: self.start.elapsed(),
            backend_calls: self.backend_calls,
            tool_calls: self.tool_calls,
            tool_failures: self.tool_failures,
            iterations,
            termination,
        };
        locked(&self.metrics.reports).push(report.clone());
        report
    }
}
