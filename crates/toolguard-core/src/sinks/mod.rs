//! Audit and telemetry consumers. Both are write-only from the middleware's
//! point of view and never influence whether a call is admitted.

pub mod audit;
pub mod telemetry;

pub use audit::{
    redact_parameters, AuditEntry, AuditOutcome, AuditSink, BroadcastAuditSink, MemoryAuditSink,
    TracingAuditSink, REDACTED,
};
pub use telemetry::{
    AggregatingTelemetrySink, MemoryTelemetrySink, TelemetryEntry, TelemetrySink, ToolStats,
};
