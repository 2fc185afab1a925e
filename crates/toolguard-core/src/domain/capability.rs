//! Tool capabilities: the axis the middleware uses to pick guards and
//! default rate-limit families.

use serde::{Deserialize, Serialize};

use super::profile::BucketLimit;

/// What kind of operation a tool performs.
///
/// `Custom(String)` is an escape hatch for project-specific capabilities
/// (SaaS adapters and the like); it selects no guard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCapability {
    FileRead,
    FileWrite,
    Shell,
    HttpFetch,
    Browser,
    Custom(String),
}

/// The containment guard a capability must pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardKind {
    PathSandbox,
    Ssrf,
    Command,
}

impl ToolCapability {
    /// Guard consulted for this capability, if any.
    pub fn guard(&self) -> Option<GuardKind> {
        match self {
            Self::FileRead | Self::FileWrite => Some(GuardKind::PathSandbox),
            Self::HttpFetch | Self::Browser => Some(GuardKind::Ssrf),
            Self::Shell => Some(GuardKind::Command),
            Self::Custom(_) => None,
        }
    }

    /// Built-in token bucket for the capability's tool family.
    ///
    /// Low-risk reads get a generous bucket, execution-capable tools a tight one.
    pub fn default_bucket(&self) -> BucketLimit {
        let n = match self {
            Self::FileRead => 120,
            Self::Custom(_) => 60,
            Self::FileWrite | Self::HttpFetch => 30,
            Self::Browser => 20,
            Self::Shell => 10,
        };
        BucketLimit::new(n, n)
    }
}

impl std::fmt::Display for ToolCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolCapability::FileRead => write!(f, "file_read"),
            ToolCapability::FileWrite => write!(f, "file_write"),
            ToolCapability::Shell => write!(f, "shell"),
            ToolCapability::HttpFetch => write!(f, "http_fetch"),
            ToolCapability::Browser => write!(f, "browser"),
            ToolCapability::Custom(s) => write!(f, "custom({s})"),
        }
    }
}
