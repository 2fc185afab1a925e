//! Per-call timing and success telemetry.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEntry {
    pub agent_id: String,
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, entry: TelemetryEntry);
}

/// Running totals for one tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStats {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
    pub failures_by_kind: BTreeMap<ErrorKind, u64>,
}

impl ToolStats {
    pub fn mean_duration_ms(&self) -> u64 {
        self.total_duration_ms.checked_div(self.calls).unwrap_or(0)
    }
}

/// Aggregates entries per tool name; [`flush`](Self::flush) logs and resets.
#[derive(Debug, Default)]
pub struct AggregatingTelemetrySink {
    stats: Mutex<BTreeMap<String, ToolStats>>,
}

impl AggregatingTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ToolStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Emit one `info!` event per tool and reset the totals.
    pub fn flush(&self) -> BTreeMap<String, ToolStats> {
        let drained = std::mem::take(&mut *self.stats.lock().unwrap_or_else(PoisonError::into_inner));
        for (tool, stats) in &drained {
            tracing::info!(
                metric = "tool.telemetry",
                tool = %tool,
                calls = stats.calls,
                failures = stats.failures,
                mean_duration_ms = stats.mean_duration_ms(),
                max_duration_ms = stats.max_duration_ms,
            );
        }
        drained
    }
}

impl TelemetrySink for AggregatingTelemetrySink {
    fn record(&self, entry: TelemetryEntry) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let tool = stats.entry(entry.tool_name).or_default();
        tool.calls += 1;
        tool.total_duration_ms = tool.total_duration_ms.saturating_add(entry.duration_ms);
        tool.max_duration_ms = tool.max_duration_ms.max(entry.duration_ms);
        if !entry.success {
            tool.failures += 1;
            if let Some(kind) = entry.error_kind {
                *tool.failures_by_kind.entry(kind).or_default() += 1;
            }
        }
    }
}

/// Keeps every entry; for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryTelemetrySink {
    entries: Mutex<Vec<TelemetryEntry>>,
}

impl MemoryTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TelemetryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TelemetrySink for MemoryTelemetrySink {
    fn record(&self, entry: TelemetryEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}
