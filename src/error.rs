//! Error types for the pipeline.
//!
//! Everything fallible returns an `anyhow` based [`Result`]. The handful of failures that the
//! calling automation needs to tell apart are raised as a [`Fatal`] somewhere in the error chain,
//! and `main` turns that into the process exit code.

use std::path::PathBuf;
use thiserror::Error;

pub type Error = anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for an error that carries no [`Fatal`] classification.
pub const UNCLASSIFIED: u8 = 1;

/// Failures that terminate the whole run with a specific exit code.
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("the config file is missing at '{}', run 'budget init' to create it", .0.display())]
    MissingConfig(PathBuf),

    #[error("the config file is corrupt: {0}")]
    CorruptConfig(String),

    #[error("the knowledge cache at '{}' is corrupt, refusing to drop cached cursors", .0.display())]
    CorruptKnowledge(PathBuf),

    #[error("the API rejected the request for '{entity}' with status {status}")]
    Rejected { entity: String, status: u16 },

    #[error("giving up on '{entity}' after {attempts} failed attempts")]
    RetriesExhausted { entity: String, attempts: u32 },

    #[error("duplicate resolution failed for '{entity}': {reason}")]
    DuplicateResolution { entity: String, reason: String },

    #[error(
        "'{entity}' was merged into its base table but '{}' could not be archived, \
        clear the raw folder for '{entity}' before the next run",
        .path.display()
    )]
    ArchiveMove { entity: String, path: PathBuf },

    #[error("unique id column '{column}' is missing from the '{entity}' snapshot")]
    MissingUniqueId { entity: String, column: String },

    #[error("no base tables exist, there is nothing to build the warehouse from")]
    NoData,
}

impl Fatal {
    /// The process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Fatal::MissingCredentials(_) => 2,
            Fatal::MissingConfig(_) => 3,
            Fatal::CorruptConfig(_) => 4,
            Fatal::CorruptKnowledge(_) => 5,
            Fatal::Rejected { status, .. } => match status {
                400 => 10,
                401 => 11,
                403 => 12,
                404 => 13,
                409 => 14,
                _ => UNCLASSIFIED,
            },
            Fatal::RetriesExhausted { .. } => 20,
            Fatal::DuplicateResolution { .. } => 30,
            Fatal::ArchiveMove { .. } => 31,
            Fatal::MissingUniqueId { .. } => 32,
            Fatal::NoData => 40,
        }
    }
}

/// Finds the [`Fatal`] carried by `e`, either as its root cause, as context attached to it, or as
/// the source of some other error in its chain.
pub fn fatal(e: &Error) -> Option<&Fatal> {
    e.downcast_ref::<Fatal>()
        .or_else(|| e.chain().find_map(|cause| cause.downcast_ref::<Fatal>()))
}

/// The exit code `main` should use for `e`.
pub fn exit_code(e: &Error) -> u8 {
    fatal(e).map(Fatal::exit_code).unwrap_or(UNCLASSIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_code_found_through_context() {
        let e = Err::<(), _>(Fatal::NoData)
            .context("building the warehouse")
            .context("running the pipeline")
            .unwrap_err();
        assert_eq!(exit_code(&e), 40);
    }

    #[test]
    fn test_exit_code_unclassified() {
        let e = anyhow::anyhow!("something else went wrong");
        assert_eq!(exit_code(&e), UNCLASSIFIED);
        assert!(fatal(&e).is_none());
    }

    #[test]
    fn test_exit_code_found_when_attached_as_context() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e = anyhow::Error::new(parse)
            .context(Fatal::CorruptKnowledge(PathBuf::from("k.json")))
            .context("loading cursors");
        assert_eq!(exit_code(&e), 5);
    }

    #[test]
    fn test_client_errors_have_distinct_codes() {
        let codes: Vec<u8> = [400, 401, 403, 404, 409]
            .into_iter()
            .map(|status| {
                Fatal::Rejected {
                    entity: "accounts".into(),
                    status,
                }
                .exit_code()
            })
            .collect();
        assert_eq!(codes, vec![10, 11, 12, 13, 14]);
    }
}
