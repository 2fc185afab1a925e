//! toolguard core library
//!
//! Containment guards, resilience middleware and policy resolution for
//! AI-agent tool calls.

pub mod domain;
pub mod guards;
pub mod metrics;
pub mod middleware;
pub mod obs;
pub mod policy;
pub mod resilience;
pub mod sinks;
pub mod tool;

pub use domain::{
    BucketLimit, CommandMode, ConfigurationError, ErrorKind, GuardKind, GuardViolation,
    ToolCallError, ToolCapability, ToolSecurityOverrides, ToolSecurityProfile,
};

pub use guards::{shell_escape, shell_join, CommandSanitizer, PathSandbox, SsrfGuard};

pub use resilience::{
    Admission, CallKey, CallOutcome, CircuitBreaker, CircuitRejection, CircuitState,
    InMemoryCircuitBreaker, InMemoryRateLimiter, RateDecision, RateLimiter,
};

pub use sinks::{
    AggregatingTelemetrySink, AuditEntry, AuditOutcome, AuditSink, BroadcastAuditSink,
    MemoryAuditSink, MemoryTelemetrySink, TelemetryEntry, TelemetrySink, TracingAuditSink,
};

pub use tool::{
    ApiExecutor, ApiRequest, GuardedParams, Tool, ToolExecutionContext, ToolResult, ToolSpec,
    UnavailableApiExecutor,
};

pub use middleware::{GuardedTool, ToolMiddleware};

pub use policy::{
    FilePolicyStore, MemoryPolicyStore, PolicyError, PolicyResolver, PolicyStore,
    ToolSecurityUpdate, ToolSecurityView,
};

pub use metrics::METRICS;
pub use obs::init_tracing;

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
