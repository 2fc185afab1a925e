//! Org defaults + agent overrides = effective profile.
//!
//! Overrides are stored as a diff against the org defaults: a section is
//! present only when it differs, and a present section is stored fully
//! populated. So
//!
//! ```text
//! merge(org, diff(effective, org)) == effective
//! diff(org, org)                   == {}
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    MiddlewareOverrides, Section, SecurityOverrides, ToolSecurityOverrides, ToolSecurityProfile,
};
use crate::obs;

use super::error::PolicyError;
use super::store::{PolicySnapshot, PolicyStore};

/// Field-level overlay of `overrides` onto `org`.
pub fn merge(org: &ToolSecurityProfile, overrides: &ToolSecurityOverrides) -> ToolSecurityProfile {
    let (s, m) = (&overrides.security, &overrides.middleware);
    let mut out = org.clone();
    overlay(&mut out.security.path_sandbox, &s.path_sandbox);
    overlay(&mut out.security.ssrf, &s.ssrf);
    overlay(&mut out.security.command_sanitizer, &s.command_sanitizer);
    overlay(&mut out.middleware.audit, &m.audit);
    overlay(&mut out.middleware.rate_limit, &m.rate_limit);
    overlay(&mut out.middleware.circuit_breaker, &m.circuit_breaker);
    overlay(&mut out.middleware.telemetry, &m.telemetry);
    out
}

/// Sections of `effective` that differ from `org`, fully populated.
pub fn diff(effective: &ToolSecurityProfile, org: &ToolSecurityProfile) -> ToolSecurityOverrides {
    let (e, o) = (effective, org);
    ToolSecurityOverrides {
        security: SecurityOverrides {
            path_sandbox: changed(&e.security.path_sandbox, &o.security.path_sandbox),
            ssrf: changed(&e.security.ssrf, &o.security.ssrf),
            command_sanitizer: changed(
                &e.security.command_sanitizer,
                &o.security.command_sanitizer,
            ),
        },
        middleware: MiddlewareOverrides {
            audit: changed(&e.middleware.audit, &o.middleware.audit),
            rate_limit: changed(&e.middleware.rate_limit, &o.middleware.rate_limit),
            circuit_breaker: changed(&e.middleware.circuit_breaker, &o.middleware.circuit_breaker),
            telemetry: changed(&e.middleware.telemetry, &o.middleware.telemetry),
        },
    }
}

/// Carry `overrides` from `old_org` to `new_org`: only sections the agent
/// had customized are kept, and only while they still differ.
pub fn rebase(
    overrides: &ToolSecurityOverrides,
    old_org: &ToolSecurityProfile,
    new_org: &ToolSecurityProfile,
) -> ToolSecurityOverrides {
    let (s, m) = (&overrides.security, &overrides.middleware);
    let (o, n) = (old_org, new_org);
    ToolSecurityOverrides {
        security: SecurityOverrides {
            path_sandbox: carried(&s.path_sandbox, &o.security.path_sandbox, &n.security.path_sandbox),
            ssrf: carried(&s.ssrf, &o.security.ssrf, &n.security.ssrf),
            command_sanitizer: carried(
                &s.command_sanitizer,
                &o.security.command_sanitizer,
                &n.security.command_sanitizer,
            ),
        },
        middleware: MiddlewareOverrides {
            audit: carried(&m.audit, &o.middleware.audit, &n.middleware.audit),
            rate_limit: carried(&m.rate_limit, &o.middleware.rate_limit, &n.middleware.rate_limit),
            circuit_breaker: carried(
                &m.circuit_breaker,
                &o.middleware.circuit_breaker,
                &n.middleware.circuit_breaker,
            ),
            telemetry: carried(&m.telemetry, &o.middleware.telemetry, &n.middleware.telemetry),
        },
    }
}

/// Collapse duplicate list entries, keeping first occurrences.
pub fn normalize(profile: &mut ToolSecurityProfile) {
    dedup_in_order(&mut profile.security.path_sandbox.allowed_dirs);
    dedup_in_order(&mut profile.security.path_sandbox.blocked_patterns);
    dedup_in_order(&mut profile.security.command_sanitizer.blocked_patterns);
}

fn dedup_in_order<T: PartialEq + Clone>(items: &mut Vec<T>) {
    let mut seen: Vec<T> = Vec::with_capacity(items.len());
    items.retain(|item| {
        if seen.contains(item) {
            false
        } else {
            seen.push(item.clone());
            true
        }
    });
}

fn overlay<S: Section>(target: &mut S, patch: &Option<S::Patch>) {
    if let Some(patch) = patch {
        *target = target.apply(patch);
    }
}

fn changed<S: Section>(effective: &S, org: &S) -> Option<S::Patch> {
    differs(effective, org).then(|| effective.full_patch())
}

fn carried<S: Section>(patch: &Option<S::Patch>, old: &S, new: &S) -> Option<S::Patch> {
    let value = old.apply(patch.as_ref()?);
    changed(&value, new)
}

/// Sections are compared by their serialized form.
fn differs<S: Section>(a: &S, b: &S) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a != b,
        _ => a != b,
    }
}

/// Configuration read model: what the dashboard renders for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSecurityView {
    pub org_defaults: ToolSecurityProfile,
    #[serde(alias = "toolSecurity")]
    pub agent_overrides: ToolSecurityOverrides,
    pub effective: ToolSecurityProfile,
    pub customized_sections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<PolicySnapshot> for ToolSecurityView {
    fn from(snapshot: PolicySnapshot) -> Self {
        let effective = merge(&snapshot.org_defaults, &snapshot.agent_overrides);
        let customized_sections = snapshot
            .agent_overrides
            .section_names()
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            org_defaults: snapshot.org_defaults,
            agent_overrides: snapshot.agent_overrides,
            effective,
            customized_sections,
            updated_by: snapshot.updated_by,
            updated_at: snapshot.updated_at,
        }
    }
}

/// Configuration write payload.
///
/// `tool_security` is the agent's complete desired customization; sections
/// it leaves out revert to the org defaults. An empty object resets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSecurityUpdate {
    #[serde(default)]
    pub tool_security: ToolSecurityOverrides,
    pub updated_by: String,
}

/// Reads and writes tool-security policy through a [`PolicyStore`].
#[derive(Clone)]
pub struct PolicyResolver {
    store: Arc<dyn PolicyStore>,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    /// Defaults, overrides and their merge, all from one snapshot.
    pub async fn read_config(
        &self,
        org_id: &str,
        agent_id: &str,
    ) -> Result<ToolSecurityView, PolicyError> {
        Ok(self.store.snapshot(org_id, agent_id).await?.into())
    }

    pub async fn effective(
        &self,
        org_id: &str,
        agent_id: &str,
    ) -> Result<ToolSecurityProfile, PolicyError> {
        let snapshot = self.store.snapshot(org_id, agent_id).await?;
        Ok(merge(&snapshot.org_defaults, &snapshot.agent_overrides))
    }

    /// Replace the agent's customization with `update.tool_security`.
    pub async fn write_config(
        &self,
        org_id: &str,
        agent_id: &str,
        update: ToolSecurityUpdate,
    ) -> Result<ToolSecurityView, PolicyError> {
        if update.tool_security.is_empty() {
            return self
                .reset_to_defaults(org_id, agent_id, &update.updated_by)
                .await;
        }

        let snapshot = self
            .store
            .save_agent_overrides(org_id, agent_id, &update.tool_security, &update.updated_by)
            .await?;
        obs::emit_policy_saved(
            org_id,
            agent_id,
            &update.updated_by,
            &snapshot.agent_overrides.section_names(),
        );
        Ok(snapshot.into())
    }

    /// Drop every override; the agent follows the org defaults again.
    pub async fn reset_to_defaults(
        &self,
        org_id: &str,
        agent_id: &str,
        updated_by: &str,
    ) -> Result<ToolSecurityView, PolicyError> {
        let snapshot = self
            .store
            .clear_agent_overrides(org_id, agent_id, updated_by)
            .await?;
        obs::emit_policy_reset(org_id, agent_id, updated_by);
        Ok(snapshot.into())
    }

    /// Dotted names of the sections the agent overrides.
    pub async fn customized_sections(
        &self,
        org_id: &str,
        agent_id: &str,
    ) -> Result<Vec<&'static str>, PolicyError> {
        let snapshot = self.store.snapshot(org_id, agent_id).await?;
        Ok(snapshot.agent_overrides.section_names())
    }

    /// Replace the org defaults; agent overrides are re-pruned against them.
    pub async fn set_org_defaults(
        &self,
        org_id: &str,
        defaults: ToolSecurityProfile,
    ) -> Result<(), PolicyError> {
        self.store.set_org_defaults(org_id, defaults).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use super::*;
    use crate::domain::{CircuitBreakerPatch, CommandMode, SsrfGuardPatch};

    fn customized() -> ToolSecurityProfile {
        let mut p = ToolSecurityProfile::default();
        p.security.command_sanitizer.mode = CommandMode::Allowlist;
        p.security.command_sanitizer.allowed_commands = BTreeSet::from(["git".to_string()]);
        p.middleware.circuit_breaker.failure_threshold = 2;
        p
    }

    #[test]
    fn test_diff_of_defaults_is_empty() {
        let org = ToolSecurityProfile::default();
        assert!(diff(&org, &org).is_empty());
    }

    #[test]
    fn test_diff_then_merge_round_trips() {
        let org = ToolSecurityProfile::default();
        let eff = customized();
        let ov = diff(&eff, &org);
        assert_eq!(
            ov.section_names(),
            vec!["security.commandSanitizer", "middleware.circuitBreaker"]
        );
        assert_eq!(merge(&org, &ov), eff);
    }

    #[test]
    fn test_included_sections_are_fully_populated() {
        let org = ToolSecurityProfile::default();
        let ov = diff(&customized(), &org);
        let cb = ov.middleware.circuit_breaker.unwrap();
        assert_eq!(cb.failure_threshold, Some(2));
        assert_eq!(cb.cooldown_seconds, Some(60));
        assert_eq!(cb.enabled, Some(true));
    }

    #[test]
    fn test_merge_applies_partial_patch_fieldwise() {
        let org = ToolSecurityProfile::default();
        let ov = ToolSecurityOverrides {
            middleware: MiddlewareOverrides {
                circuit_breaker: Some(CircuitBreakerPatch {
                    cooldown_seconds: Some(5),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let eff = merge(&org, &ov);
        assert_eq!(eff.middleware.circuit_breaker.cooldown_seconds, 5);
        assert_eq!(eff.middleware.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_rebase_keeps_only_sections_that_still_differ() {
        let old = ToolSecurityProfile::default();
        let ov = ToolSecurityOverrides {
            security: SecurityOverrides {
                ssrf: Some(SsrfGuardPatch {
                    enabled: Some(true),
                    allowed_hosts: Some(BTreeSet::from(["api.example.com".to_string()])),
                    blocked_cidrs: Some(BTreeSet::new()),
                }),
                ..Default::default()
            },
            ..diff(&customized(), &old)
        };

        let mut new = old.clone();
        new.security.ssrf.allowed_hosts = BTreeSet::from(["api.example.com".to_string()]);
        new.security.ssrf.enabled = true;
        new.middleware.telemetry.enabled = false;

        let rebased = rebase(&ov, &old, &new);
        assert_eq!(rebased.section_names(), vec!["middleware.circuitBreaker"]);
        assert!(rebased.middleware.telemetry.is_none());
    }

    #[test]
    fn test_normalize_dedups_in_order() {
        let mut p = ToolSecurityProfile::default();
        p.security.path_sandbox.allowed_dirs = vec![
            PathBuf::from("/b"),
            PathBuf::from("/a"),
            PathBuf::from("/b"),
        ];
        normalize(&mut p);
        assert_eq!(
            p.security.path_sandbox.allowed_dirs,
            vec![PathBuf::from("/b"), PathBuf::from("/a")]
        );
    }
}
