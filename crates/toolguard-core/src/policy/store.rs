//! Policy persistence boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ToolSecurityOverrides, ToolSecurityProfile};

use super::error::PolicyError;
use super::resolver::{diff, merge, normalize, rebase};

/// Org defaults and one agent's overrides, read together.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySnapshot {
    pub org_defaults: ToolSecurityProfile,
    pub agent_overrides: ToolSecurityOverrides,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Storage for org defaults and agent overrides.
///
/// Every method is atomic with respect to the others: a snapshot never
/// pairs defaults and overrides from different writes.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn org_defaults(&self, org_id: &str) -> Result<ToolSecurityProfile, PolicyError>;

    /// Create or replace the org's defaults and re-prune its agents.
    async fn set_org_defaults(
        &self,
        org_id: &str,
        defaults: ToolSecurityProfile,
    ) -> Result<(), PolicyError>;

    async fn snapshot(&self, org_id: &str, agent_id: &str) -> Result<PolicySnapshot, PolicyError>;

    /// Store `requested` as the agent's customization, diffed against the
    /// org defaults current at write time.
    async fn save_agent_overrides(
        &self,
        org_id: &str,
        agent_id: &str,
        requested: &ToolSecurityOverrides,
        updated_by: &str,
    ) -> Result<PolicySnapshot, PolicyError>;

    async fn clear_agent_overrides(
        &self,
        org_id: &str,
        agent_id: &str,
        updated_by: &str,
    ) -> Result<PolicySnapshot, PolicyError>;
}

/// Everything a store holds. Serialized as-is by the file store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    #[serde(default)]
    pub orgs: BTreeMap<String, OrgPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgPolicy {
    pub defaults: ToolSecurityProfile,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<String, AgentRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    #[serde(default)]
    pub overrides: ToolSecurityOverrides,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PolicyDocument {
    fn org(&self, org_id: &str) -> Result<&OrgPolicy, PolicyError> {
        self.orgs
            .get(org_id)
            .ok_or_else(|| PolicyError::OrgNotFound(org_id.to_string()))
    }

    fn org_mut(&mut self, org_id: &str) -> Result<&mut OrgPolicy, PolicyError> {
        self.orgs
            .get_mut(org_id)
            .ok_or_else(|| PolicyError::OrgNotFound(org_id.to_string()))
    }

    pub fn org_defaults(&self, org_id: &str) -> Result<ToolSecurityProfile, PolicyError> {
        Ok(self.org(org_id)?.defaults.clone())
    }

    /// Unknown agents have no overrides.
    pub fn snapshot(&self, org_id: &str, agent_id: &str) -> Result<PolicySnapshot, PolicyError> {
        let org = self.org(org_id)?;
        let record = org.agents.get(agent_id).cloned().unwrap_or_default();
        Ok(PolicySnapshot {
            org_defaults: org.defaults.clone(),
            agent_overrides: record.overrides,
            updated_by: record.updated_by,
            updated_at: record.updated_at,
        })
    }

    pub fn set_org_defaults(&mut self, org_id: &str, mut defaults: ToolSecurityProfile) {
        normalize(&mut defaults);
        let org = self.orgs.entry(org_id.to_string()).or_default();
        let old = std::mem::replace(&mut org.defaults, defaults);
        for record in org.agents.values_mut() {
            record.overrides = rebase(&record.overrides, &old, &org.defaults);
        }
    }

    pub fn save_agent_overrides(
        &mut self,
        org_id: &str,
        agent_id: &str,
        requested: &ToolSecurityOverrides,
        updated_by: &str,
    ) -> Result<PolicySnapshot, PolicyError> {
        let org = self.org_mut(org_id)?;
        let mut desired = merge(&org.defaults, requested);
        normalize(&mut desired);
        let overrides = diff(&desired, &org.defaults);

        org.agents.insert(
            agent_id.to_string(),
            AgentRecord {
                overrides,
                updated_by: Some(updated_by.to_string()),
                updated_at: Some(Utc::now()),
            },
        );
        self.snapshot(org_id, agent_id)
    }

    pub fn clear_agent_overrides(
        &mut self,
        org_id: &str,
        agent_id: &str,
        updated_by: &str,
    ) -> Result<PolicySnapshot, PolicyError> {
        let org = self.org_mut(org_id)?;
        org.agents.insert(
            agent_id.to_string(),
            AgentRecord {
                overrides: ToolSecurityOverrides::default(),
                updated_by: Some(updated_by.to_string()),
                updated_at: Some(Utc::now()),
            },
        );
        self.snapshot(org_id, agent_id)
    }
}
