//! Error taxonomy for guarded tool execution.
//!
//! Containment and resilience rejections are runtime events: they surface to
//! the agent as an error [`ToolResult`](crate::tool::ToolResult) and never
//! escape the middleware. [`ConfigurationError`] is the one error raised at
//! setup time, when a tool is wrapped with a policy it cannot satisfy.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Rejection produced by one of the containment guards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardViolation {
    #[error("path sandbox violation: {0}")]
    PathSandbox(String),

    #[error("SSRF violation: {0}")]
    Ssrf(String),

    #[error("command violation: {0}")]
    Command(String),
}

impl GuardViolation {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PathSandbox(_) => ErrorKind::PathSandboxViolation,
            Self::Ssrf(_) => ErrorKind::SsrfViolation,
            Self::Command(_) => ErrorKind::CommandViolation,
        }
    }
}

/// Stable, serializable classification of a failed or rejected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PathSandboxViolation,
    SsrfViolation,
    CommandViolation,
    RateLimitExceeded,
    CircuitOpen,
    ToolError,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PathSandboxViolation => "path_sandbox_violation",
            Self::SsrfViolation => "ssrf_violation",
            Self::CommandViolation => "command_violation",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::CircuitOpen => "circuit_open",
            Self::ToolError => "tool_error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Containment and resilience rejections never reached the tool body.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::ToolError | Self::Timeout | Self::Cancelled)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can go wrong while a guarded tool call runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolCallError {
    #[error(transparent)]
    Guard(#[from] GuardViolation),

    #[error("rate limit exceeded for tool '{tool_name}'{}", retry_hint(.retry_after))]
    RateLimitExceeded {
        tool_name: String,
        retry_after: Option<Duration>,
    },

    #[error("circuit open for tool '{tool_name}' after repeated failures{}", retry_hint(.retry_after))]
    CircuitOpen {
        tool_name: String,
        retry_after: Option<Duration>,
    },

    #[error("tool '{tool_name}' failed: {message}")]
    ToolFailed { tool_name: String, message: String },

    #[error("tool '{tool_name}' timed out")]
    TimedOut { tool_name: String },

    #[error("tool '{tool_name}' was cancelled")]
    Cancelled { tool_name: String },
}

impl ToolCallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Guard(v) => v.kind(),
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::ToolFailed { .. } => ErrorKind::ToolError,
            Self::TimedOut { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Retry hint derived from bucket refill rate or breaker cooldown.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!("; retry in {}ms", d.as_millis()),
        None => String::new(),
    }
}

/// Deployment or programming error detected while wrapping a tool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("allowed directory must be absolute: {}", .0.display())]
    RelativeAllowedDir(PathBuf),

    #[error(
        "tool '{tool_name}' declares capability '{capability}' but no guarded {param} parameter"
    )]
    MissingGuardedParam {
        tool_name: String,
        capability: String,
        param: &'static str,
    },

    #[error("invalid rate limit for tool '{tool_name}': {reason}")]
    InvalidRateLimit { tool_name: String, reason: String },
}
