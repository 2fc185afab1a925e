//! TOML-file policy store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::RwLock;

use crate::domain::{ToolSecurityOverrides, ToolSecurityProfile};

use super::error::PolicyError;
use super::store::{PolicyDocument, PolicySnapshot, PolicyStore};

/// Policy document persisted as one TOML file.
///
/// Writes go to a temp file in the same directory which then replaces the
/// original, so readers of the file never see a partial document. The
/// in-memory copy is only updated after the file write succeeds.
#[derive(Debug)]
pub struct FilePolicyStore {
    path: PathBuf,
    doc: RwLock<PolicyDocument>,
}

impl FilePolicyStore {
    /// Load `path`, or start empty if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PolicyError> {
        let path = path.into();
        let doc = if path.exists() {
            load(&path)?
        } else {
            PolicyDocument::default()
        };
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to a copy of the document, persist it, then commit it.
    async fn update<R>(
        &self,
        f: impl FnOnce(&mut PolicyDocument) -> Result<R, PolicyError>,
    ) -> Result<R, PolicyError> {
        let mut doc = self.doc.write().await;
        let mut next = doc.clone();
        let out = f(&mut next)?;
        persist(&self.path, &next)?;
        *doc = next;
        Ok(out)
    }
}

fn load(path: &Path) -> Result<PolicyDocument, PolicyError> {
    let text = fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|e| PolicyError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn persist(path: &Path, doc: &PolicyDocument) -> Result<(), PolicyError> {
    let text = toml::to_string_pretty(doc).map_err(|e| PolicyError::Serialize(e.to_string()))?;
    let io_err = |source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(text.as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[async_trait]
impl PolicyStore for FilePolicyStore {
    async fn org_defaults(&self, org_id: &str) -> Result<ToolSecurityProfile, PolicyError> {
        self.doc.read().await.org_defaults(org_id)
    }

    async fn set_org_defaults(
        &self,
        org_id: &str,
        defaults: ToolSecurityProfile,
    ) -> Result<(), PolicyError> {
        self.update(|doc| {
            doc.set_org_defaults(org_id, defaults);
            Ok(())
        })
        .await
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
        self.update(|doc| doc.save_agent_overrides(org_id, agent_id, requested, updated_by))
            .await
    }

    async fn clear_agent_overrides(
        &self,
        org_id: &str,
        agent_id: &str,
        updated_by: &str,
    ) -> Result<PolicySnapshot, PolicyError> {
        self.update(|doc| doc.clear_agent_overrides(org_id, agent_id, updated_by))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_starts_empty_and_persists_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/policy.toml");
        let store = FilePolicyStore::open(&path).unwrap();
        assert!(matches!(
            store.snapshot("acme", "a").await,
            Err(PolicyError::OrgNotFound(_))
        ));

        store
            .set_org_defaults("acme", ToolSecurityProfile::default())
            .await
            .unwrap();
        assert!(path.exists());

        let reopened = FilePolicyStore::open(&path).unwrap();
        assert_eq!(
            reopened.org_defaults("acme").await.unwrap(),
            ToolSecurityProfile::default()
        );
    }

    #[test]
    fn test_garbage_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        fs::write(&path, "orgs = 12\n[[[").unwrap();
        assert!(matches!(
            FilePolicyStore::open(&path),
            Err(PolicyError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        let store = FilePolicyStore::open(&path).unwrap();
        let err = store
            .clear_agent_overrides("ghost-org", "agent", "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::OrgNotFound(_)));
        assert!(!path.exists());
    }
}
