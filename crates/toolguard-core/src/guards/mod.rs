//! Containment guards.
//!
//! Guards are pure validators compiled once from a profile section. They
//! hold no per-call state, so a compiled guard is shared freely across
//! concurrent calls.

pub mod command;
pub mod path;
pub mod ssrf;

pub use command::{shell_escape, shell_join, CommandSanitizer};
pub use path::PathSandbox;
pub use ssrf::SsrfGuard;

use regex::Regex;

use crate::domain::ConfigurationError;

pub(crate) fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigurationError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| ConfigurationError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}
