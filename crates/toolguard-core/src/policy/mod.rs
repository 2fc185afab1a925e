//! Tool-security policy: org defaults, per-agent overrides, and the
//! resolver that merges them.

pub mod error;
pub mod file;
pub mod memory;
pub mod resolver;
pub mod store;

pub use error::PolicyError;
pub use file::FilePolicyStore;
pub use memory::MemoryPolicyStore;
pub use resolver::{
    diff, merge, normalize, rebase, PolicyResolver, ToolSecurityUpdate, ToolSecurityView,
};
pub use store::{AgentRecord, OrgPolicy, PolicyDocument, PolicySnapshot, PolicyStore};
