//! Log subscriber setup and an in-memory event recorder for sessions.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber. `RUST_LOG` overrides the default
/// `hq_agent_sdk=info` filter. Returns `false` when a subscriber was already set.
pub fn init_tracing(service_name: &str, json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hq_agent_sdk=info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .is_ok()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init().is_ok()
    };
    if installed {
        tracing::debug!(service = service_name, "tracing initialised");
    }
    installed
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryLabels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

impl TelemetryLabels {
    pub fn session(session_id: impl ToString) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            tool: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: String,
    pub timestamp: SystemTime,
    pub detail: serde_json::Value,
    #[serde(default)]
    pub labels: TelemetryLabels,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub context: String,
    pub error: String,
    #[serde(default)]
    pub labels: TelemetryLabels,
}

#[derive(Default, Clone)]
pub struct TelemetryCollector {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
    failures: Arc<Mutex<Vec<FailureRecord>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TelemetryCollector {
    pub fn record(
        &self,
        kind: impl Into<String>,
        detail: serde_json::Value,
        labels: TelemetryLabels,
    ) {
        locked(&self.events).push(TelemetryEvent {
            kind: kind.into(),
            timestamp: SystemTime::now(),
            detail,
            labels,
        });
    }

    pub fn record_failure(
        &self,
        context: impl Into<String>,
        error: impl Into<String>,
        labels: TelemetryLabels,
    ) {
        locked(&self.failures).push(FailureRecord {
            context: context.into(),
            error: error.into(),
            labels,
        });
    }

    pub fn event_kinds(&self) -> Vec<String> {
        locked(&self.events).iter().map(|e| e.kind.clone()).collect()
    }

    pub fn drain(&self) -> (Vec<TelemetryEvent>, Vec<FailureRecord>) {
        let mut events = locked(&self.events);
        let mut failures = locked(&self.failures);
        (std::mem::take(&mut *events), std::mem::take(&mut *failures))
    }
}

impl std::fmt::Debug for TelemetryCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryCollector")
            .field("events", &locked(&self.events).len())
            .field("failures", &locked(&self.failures).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_and_drains_with_labels() {
        let telemetry = TelemetryCollector::default();
        let labels = TelemetryLabels::session("s-1").with_tool("add");
        telemetry.record("tool_call", json!({"call_id": "c1"}), labels.clone());
        telemetry.record_failure("tool_failure", "boom", labels);

        assert_eq!(telemetry.event_kinds(), vec!["tool_call"]);
        let (events, failures) = telemetry.drain();
        assert_eq!(events[0].labels.tool.as_deref(), Some("add"));
        assert_eq!(failures[0].labels.session_id.as_deref(), Some("s-1"));
        assert!(telemetry.drain().0.is_empty());
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing("hq-agent-sdk-test", false);
        assert!(!init_tracing("hq-agent-sdk-test", true));
    }
}
