use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{ToolSecurityOverrides, ToolSecurityProfile};

use super::error::PolicyError;
use super::store::{PolicyDocument, PolicySnapshot, PolicyStore};

/// In-process policy store, for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    doc: RwLock<PolicyDocument>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(doc: PolicyDocument) -> Self {
        Self {
            doc: RwLock::new(doc),
        }
    }

    /// A store holding one org provisioned with `ToolSecurityProfile::default()`.
    pub fn with_org(org_id: &str) -> Self {
        let mut doc = PolicyDocument::default();
        doc.set_org_defaults(org_id, ToolSecurityProfile::default());
        Self::from_document(doc)
    }

    pub async fn document(&self) -> PolicyDocument {
        self.doc.read().await.clone()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn org_defaults(&self, org_id: &str) -> Result<ToolSecurityProfile, PolicyError> {
        self.doc.read().await.org_defaults(org_id)
    }

    async fn set_org_defaults(
        &self,
        org_id: &str,
        defaults: ToolSecurityProfile,
    ) -> Result<(), PolicyError> {
        self.doc.write().await.set_org_defaults(org_id, defaults);
        Ok(())
    }

    async fn snapshot(&self, org_id: &str, agent_id: &str) -> Result<PolicySnapshot, PolicyError> {
        self.doc.read().await.snapshot(org_id, agent_id)
    }

    async fn save_agent_overrides(
        &self,
        org_id: &str,
        agent_id: &str,
        requested: &ToolSecurityOverrides,
        updated_by: &str,
    ) -> Result<PolicySnapshot, PolicyError> {
        self.doc
            .write()
            .await
            .save_agent_overrides(org_id, agent_id, requested, updated_by)
    }

    async fn clear_agent_overrides(
        &self,
        org_id: &str,
        agent_id: &str,
        updated_by: &str,
    ) -> Result<PolicySnapshot, PolicyError> {
        self.doc
            .write()
            .await
            .clear_agent_overrides(org_id, agent_id, updated_by)
    }
}
