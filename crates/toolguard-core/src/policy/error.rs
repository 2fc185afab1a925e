use std::path::PathBuf;

/// Policy store errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("organization not found: {0}")]
    OrgNotFound(String),

    #[error("policy file I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("failed to serialize policy: {0}")]
    Serialize(String),
}
