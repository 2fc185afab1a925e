//! Audit trail of guarded calls.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::ErrorKind;

/// Replacement for redacted parameter values.
pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    /// The tool body ran and failed, timed out or was cancelled.
    Failed { kind: ErrorKind, message: String },
    /// A guard, the rate limiter or the breaker turned the call away.
    Rejected { kind: ErrorKind, message: String },
}

impl AuditOutcome {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Succeeded => None,
            Self::Failed { kind, .. } | Self::Rejected { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub agent_id: String,
    pub tool_name: String,
    /// Call parameters with sensitive values already redacted.
    pub parameters: Value,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    /// Digest of the effective profile that governed the call.
    pub policy_digest: String,
}

/// Replace the value of every key in `redact_keys` (ASCII case-insensitive)
/// with [`REDACTED`], at any depth.
pub fn redact_parameters(value: &Value, redact_keys: &BTreeSet<String>) -> Value {
    let keys: Vec<String> = redact_keys.iter().map(|k| k.to_ascii_lowercase()).collect();
    redact_with(value, &keys)
}

fn redact_with(value: &Value, keys: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let lowered = k.to_ascii_lowercase();
                    if keys.iter().any(|key| *key == lowered) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact_with(v, keys))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_with(v, keys)).collect()),
        other => other.clone(),
    }
}

/// Consumer of audit entries. `record` must not block the call path.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Writes each entry as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        let (status, kind, message) = match &entry.outcome {
            AuditOutcome::Succeeded => ("succeeded", "", ""),
            AuditOutcome::Failed { kind, message } => ("failed", kind.as_str(), message.as_str()),
            AuditOutcome::Rejected { kind, message } => {
                ("rejected", kind.as_str(), message.as_str())
            }
        };
        tracing::info!(
            event = "audit",
            audit_id = %entry.id,
            agent_id = %entry.agent_id,
            tool = %entry.tool_name,
            caller = entry.caller.as_deref().unwrap_or(""),
            status = status,
            error_kind = kind,
            message = message,
            duration_ms = entry.duration_ms,
            policy_digest = %entry.policy_digest,
            parameters = %entry.parameters,
        );
    }
}

/// Bounded in-process buffer; the oldest entries fall off first.
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::with_capacity(1_000)
    }
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn entries_for_agent(&self, agent_id: &str) -> Vec<AuditEntry> {
        self.lock()
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Live feed for read-only subscribers (dashboards, exporters).
///
/// A subscriber that falls behind loses the oldest entries
/// (`RecvError::Lagged`); calls never wait on it.
#[derive(Debug, Clone)]
pub struct BroadcastAuditSink {
    tx: broadcast::Sender<AuditEntry>,
}

impl BroadcastAuditSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl AuditSink for BroadcastAuditSink {
    fn record(&self, entry: AuditEntry) {
        // Err only means nobody is listening.
        let _ = self.tx.send(entry);
    }
}
