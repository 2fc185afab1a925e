//! Domain types shared by guards, middleware and the policy resolver.

pub mod capability;
pub mod error;
pub mod profile;

pub use capability::{GuardKind, ToolCapability};
pub use error::{ConfigurationError, ErrorKind, GuardViolation, ToolCallError};
pub use profile::{
    AuditConfig, AuditPatch, BucketLimit, CircuitBreakerConfig, CircuitBreakerPatch,
    CommandMode, CommandSanitizerConfig, CommandSanitizerPatch, MiddlewareConfig,
    MiddlewareOverrides, PathSandboxConfig, PathSandboxPatch, RateLimitConfig, RateLimitPatch,
    Section, SecurityConfig, SecurityOverrides, SsrfGuardConfig, SsrfGuardPatch,
    TelemetryConfig, TelemetryPatch, ToolSecurityOverrides, ToolSecurityProfile,
};
