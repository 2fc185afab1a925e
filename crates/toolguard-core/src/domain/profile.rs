//! Tool security profile: the policy unit stored per organization (fully
//! populated) and per agent (sparse overrides).
//!
//! Field names are camelCase on the wire so the dashboard's JSON and the
//! TOML policy file share one shape.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Guard sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSandboxConfig {
    pub enabled: bool,
    /// Absolute directories a path must live under (ordered, deduplicated on save).
    pub allowed_dirs: Vec<PathBuf>,
    /// Regexes matched against the canonical path; any match rejects.
    pub blocked_patterns: Vec<String>,
}

impl Default for PathSandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_dirs: Vec::new(),
            blocked_patterns: vec![
                r"(^|/)\.ssh(/|$)".to_string(),
                r"(^|/)\.aws(/|$)".to_string(),
                r"(^|/)\.env(\.|$)".to_string(),
                r"\.pem$".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsrfGuardConfig {
    pub enabled: bool,
    /// Hostnames (or `*.suffix` wildcards) exempt from the built-in
    /// private-range check after DNS resolution.
    pub allowed_hosts: BTreeSet<String>,
    pub blocked_cidrs: BTreeSet<String>,
}

impl Default for SsrfGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_hosts: BTreeSet::new(),
            blocked_cidrs: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMode {
    Allowlist,
    #[default]
    Blocklist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSanitizerConfig {
    pub enabled: bool,
    pub mode: CommandMode,
    pub allowed_commands: BTreeSet<String>,
    pub blocked_patterns: Vec<String>,
}

impl Default for CommandSanitizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CommandMode::Blocklist,
            allowed_commands: BTreeSet::new(),
            blocked_patterns: vec![
                r"\|\s*(sudo\s+)?(ba|z|da|k)?sh\b".to_string(),
                r"\brm\s+-[a-zA-Z]*r[a-zA-Z]*\s+/(\s|\*|$)".to_string(),
                r">\s*/dev/(sd|hd|nvme|mem|kmem|port)".to_string(),
                r"\bdd\b.*\bof=/dev/".to_string(),
                r"\bmkfs(\.\w+)?\b".to_string(),
                r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}".to_string(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Middleware sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    pub enabled: bool,
    /// Parameter keys whose values are replaced before logging.
    pub redact_keys: BTreeSet<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_keys: ["password", "secret", "token", "apiKey", "authorization"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Token bucket parameters for one tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketLimit {
    pub max_tokens: u32,
    pub refill_rate_per_minute: u32,
}

impl BucketLimit {
    pub const fn new(max_tokens: u32, refill_rate_per_minute: u32) -> Self {
        Self {
            max_tokens,
            refill_rate_per_minute,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Per-tool buckets; tools not listed use their family default.
    pub overrides: BTreeMap<String, BucketLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            cooldown_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    pub enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    pub path_sandbox: PathSandboxConfig,
    pub ssrf: SsrfGuardConfig,
    pub command_sanitizer: CommandSanitizerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareConfig {
    pub audit: AuditConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub telemetry: TelemetryConfig,
}

/// Fully populated security + middleware policy.
///
/// `Default` is the profile an organization is provisioned with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSecurityProfile {
    pub security: SecurityConfig,
    pub middleware: MiddlewareConfig,
}

impl ToolSecurityProfile {
    /// SHA-256 hex digest of the canonical JSON encoding.
    ///
    /// Collections are ordered, so equal profiles always hash equal.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

// ---------------------------------------------------------------------------
// Sparse overrides
// ---------------------------------------------------------------------------

/// A profile section that can be partially overridden.
pub trait Section: Clone + PartialEq + Serialize {
    type Patch: Clone + Default + PartialEq;

    /// Overlay every field present in `patch`.
    fn apply(&self, patch: &Self::Patch) -> Self;

    /// A patch with every field set to this section's value.
    fn full_patch(&self) -> Self::Patch;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSandboxPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_dirs: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_patterns: Option<Vec<String>>,
}

impl Section for PathSandboxConfig {
    type Patch = PathSandboxPatch;

    fn apply(&self, p: &PathSandboxPatch) -> Self {
        Self {
            enabled: p.enabled.unwrap_or(self.enabled),
            allowed_dirs: p
                .allowed_dirs
                .clone()
                .unwrap_or_else(|| self.allowed_dirs.clone()),
            blocked_patterns: p
                .blocked_patterns
                .clone()
                .unwrap_or_else(|| self.blocked_patterns.clone()),
        }
    }

    fn full_patch(&self) -> PathSandboxPatch {
        PathSandboxPatch {
            enabled: Some(self.enabled),
            allowed_dirs: Some(self.allowed_dirs.clone()),
            blocked_patterns: Some(self.blocked_patterns.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsrfGuardPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_hosts: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_cidrs: Option<BTreeSet<String>>,
}

impl Section for SsrfGuardConfig {
    type Patch = SsrfGuardPatch;

    fn apply(&self, p: &SsrfGuardPatch) -> Self {
        Self {
            enabled: p.enabled.unwrap_or(self.enabled),
            allowed_hosts: p
                .allowed_hosts
                .clone()
                .unwrap_or_else(|| self.allowed_hosts.clone()),
            blocked_cidrs: p
                .blocked_cidrs
                .clone()
                .unwrap_or_else(|| self.blocked_cidrs.clone()),
        }
    }

    fn full_patch(&self) -> SsrfGuardPatch {
        SsrfGuardPatch {
            enabled: Some(self.enabled),
            allowed_hosts: Some(self.allowed_hosts.clone()),
            blocked_cidrs: Some(self.blocked_cidrs.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSanitizerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<CommandMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_commands: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_patterns: Option<Vec<String>>,
}

impl Section for CommandSanitizerConfig {
    type Patch = CommandSanitizerPatch;

    fn apply(&self, p: &CommandSanitizerPatch) -> Self {
        Self {
            enabled: p.enabled.unwrap_or(self.enabled),
            mode: p.mode.unwrap_or(self.mode),
            allowed_commands: p
                .allowed_commands
                .clone()
                .unwrap_or_else(|| self.allowed_commands.clone()),
            blocked_patterns: p
                .blocked_patterns
                .clone()
                .unwrap_or_else(|| self.blocked_patterns.clone()),
        }
    }

    fn full_patch(&self) -> CommandSanitizerPatch {
        CommandSanitizerPatch {
            enabled: Some(self.enabled),
            mode: Some(self.mode),
            allowed_commands: Some(self.allowed_commands.clone()),
            blocked_patterns: Some(self.blocked_patterns.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redact_keys: Option<BTreeSet<String>>,
}

impl Section for AuditConfig {
    type Patch = AuditPatch;

    fn apply(&self, p: &AuditPatch) -> Self {
        Self {
            enabled: p.enabled.unwrap_or(self.enabled),
            redact_keys: p
                .redact_keys
                .clone()
                .unwrap_or_else(|| self.redact_keys.clone()),
        }
    }

    fn full_patch(&self) -> AuditPatch {
        AuditPatch {
            enabled: Some(self.enabled),
            redact_keys: Some(self.redact_keys.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<BTreeMap<String, BucketLimit>>,
}

impl Section for RateLimitConfig {
    type Patch = RateLimitPatch;

    fn apply(&self, p: &RateLimitPatch) -> Self {
        Self {
            enabled: p.enabled.unwrap_or(self.enabled),
            overrides: p
                .overrides
                .clone()
                .unwrap_or_else(|| self.overrides.clone()),
        }
    }

    fn full_patch(&self) -> RateLimitPatch {
        RateLimitPatch {
            enabled: Some(self.enabled),
            overrides: Some(self.overrides.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,
}

impl Section for CircuitBreakerConfig {
    type Patch = CircuitBreakerPatch;

    fn apply(&self, p: &CircuitBreakerPatch) -> Self {
        Self {
            enabled: p.enabled.unwrap_or(self.enabled),
            failure_threshold: p.failure_threshold.unwrap_or(self.failure_threshold),
            cooldown_seconds: p.cooldown_seconds.unwrap_or(self.cooldown_seconds),
        }
    }

    fn full_patch(&self) -> CircuitBreakerPatch {
        CircuitBreakerPatch {
            enabled: Some(self.enabled),
            failure_threshold: Some(self.failure_threshold),
            cooldown_seconds: Some(self.cooldown_seconds),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl Section for TelemetryConfig {
    type Patch = TelemetryPatch;

    fn apply(&self, p: &TelemetryPatch) -> Self {
        Self {
            enabled: p.enabled.unwrap_or(self.enabled),
        }
    }

    fn full_patch(&self) -> TelemetryPatch {
        TelemetryPatch {
            enabled: Some(self.enabled),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_sandbox: Option<PathSandboxPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrf: Option<SsrfGuardPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_sanitizer: Option<CommandSanitizerPatch>,
}

impl SecurityOverrides {
    pub fn is_empty(&self) -> bool {
        self.path_sandbox.is_none() && self.ssrf.is_none() && self.command_sanitizer.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryPatch>,
}

impl MiddlewareOverrides {
    pub fn is_empty(&self) -> bool {
        self.audit.is_none()
            && self.rate_limit.is_none()
            && self.circuit_breaker.is_none()
            && self.telemetry.is_none()
    }
}

/// Sparse per-agent customization of a [`ToolSecurityProfile`].
///
/// Unknown keys are ignored on deserialization, so the dashboard may send
/// agent fields that live outside tool security in the same payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSecurityOverrides {
    #[serde(default, skip_serializing_if = "SecurityOverrides::is_empty")]
    pub security: SecurityOverrides,
    #[serde(default, skip_serializing_if = "MiddlewareOverrides::is_empty")]
    pub middleware: MiddlewareOverrides,
}

impl ToolSecurityOverrides {
    pub fn is_empty(&self) -> bool {
        self.security.is_empty() && self.middleware.is_empty()
    }

    /// Dotted names of the sections this override customizes.
    pub fn section_names(&self) -> Vec<&'static str> {
        let present = [
            ("security.pathSandbox", self.security.path_sandbox.is_some()),
            ("security.ssrf", self.security.ssrf.is_some()),
            (
                "security.commandSanitizer",
                self.security.command_sanitizer.is_some(),
            ),
            ("middleware.audit", self.middleware.audit.is_some()),
            ("middleware.rateLimit", self.middleware.rate_limit.is_some()),
            (
                "middleware.circuitBreaker",
                self.middleware.circuit_breaker.is_some(),
            ),
            ("middleware.telemetry", self.middleware.telemetry.is_some()),
        ];
        present
            .into_iter()
            .filter_map(|(name, set)| set.then_some(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_serializes_camel_case() {
        let json = serde_json::to_value(ToolSecurityProfile::default()).unwrap();
        assert!(json["security"]["pathSandbox"]["allowedDirs"].is_array());
        assert_eq!(json["security"]["commandSanitizer"]["mode"], "blocklist");
        assert_eq!(json["middleware"]["circuitBreaker"]["failureThreshold"], 5);
    }

    #[test]
    fn test_patch_applies_only_present_fields() {
        let base = CircuitBreakerConfig::default();
        let patched = base.apply(&CircuitBreakerPatch {
            failure_threshold: Some(2),
            ..Default::default()
        });
        assert_eq!(patched.failure_threshold, 2);
        assert_eq!(patched.cooldown_seconds, base.cooldown_seconds);
        assert!(patched.enabled);
    }

    #[test]
    fn test_overrides_ignore_unknown_keys() {
        let ov: ToolSecurityOverrides =
            serde_json::from_str(r#"{"maxRiskLevel":"high","security":{"ssrf":{"enabled":false}}}"#)
                .unwrap();
        assert_eq!(ov.section_names(), vec!["security.ssrf"]);
        assert_eq!(ov.security.ssrf.unwrap().enabled, Some(false));
    }

    #[test]
    fn test_empty_overrides_serialize_to_empty_object() {
        let json = serde_json::to_string(&ToolSecurityOverrides::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_digest_is_stable_and_sensitive() {
        let a = ToolSecurityProfile::default();
        let mut b = a.clone();
        assert_eq!(a.digest(), b.digest());
        b.middleware.telemetry.enabled = false;
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
