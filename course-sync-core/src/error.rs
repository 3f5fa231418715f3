//! Error taxonomy for a synchronisation run.
//!
//! Every failure aborts the run. The variants map onto the three failure
//! classes of the engine: collaborator transport failures, validation
//! failures found before any destination write, and destination apply
//! failures. Checkpoint store failures are reported separately because they
//! happen outside the appliers.

use std::fmt;

use thiserror::Error;

/// Boxed error returned by destination and checkpoint collaborators.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by the source-control collaborator.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The requested path does not exist at the requested revision.
    #[error("path not found in source repository: {path}")]
    NotFound { path: String },

    /// Non-success response, network failure or undecodable payload.
    #[error("source control request failed: {0}")]
    Transport(String),
}

/// Which destination an [`SyncError::Apply`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Relational,
    Documents,
    Blobs,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Relational => f.write_str("relational store"),
            Destination::Documents => f.write_str("document store"),
            Destination::Blobs => f.write_str("blob store"),
        }
    }
}

/// A single naming or reference problem found while building a change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Markdown path that does not follow `/Modules/<module>/<order>-<name>.md`.
    UnparseableSection { path: String },
    /// Attachment path containing a space.
    WhitespaceInAttachment { path: String },
    /// Course references a module with no `module.json`.
    MissingModule { course_id: String, module_id: String },
    /// Descriptor file outside its expected `/Courses/<id>/` or `/Modules/<id>/` folder.
    UnexpectedLayout { path: String },
    /// Descriptor JSON that cannot be parsed.
    MalformedDescriptor { path: String, reason: String },
    /// Section content that is not valid UTF-8.
    InvalidEncoding { path: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::UnparseableSection { path } => write!(
                f,
                "{path}: section file name must match /Modules/<module>/<order>-<name>.md"
            ),
            Violation::WhitespaceInAttachment { path } => {
                write!(f, "{path}: attachment path must not contain spaces")
            }
            Violation::MissingModule {
                course_id,
                module_id,
            } => write!(
                f,
                "course '{course_id}' references module '{module_id}' which has no /Modules/{module_id}/module.json"
            ),
            Violation::UnexpectedLayout { path } => {
                write!(f, "{path}: descriptor is not in its expected folder")
            }
            Violation::MalformedDescriptor { path, reason } => {
                write!(f, "{path}: invalid descriptor JSON: {reason}")
            }
            Violation::InvalidEncoding { path } => {
                write!(f, "{path}: content is not valid UTF-8")
            }
        }
    }
}

/// All violations found in one build pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.violations.len())?;
        for v in &self.violations {
            write!(f, "\n  - {v}")?;
        }
        Ok(())
    }
}

/// Errors that abort a synchronisation run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{operation} failed: {source}")]
    Transport {
        operation: String,
        #[source]
        source: SourceError,
    },

    #[error("change set rejected: {0}")]
    Validation(ValidationReport),

    #[error("{destination} write failed for '{key}': {source}")]
    Apply {
        destination: Destination,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("checkpoint store {operation} failed: {source}")]
    Checkpoint {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    pub(crate) fn transport(operation: impl Into<String>, source: SourceError) -> Self {
        SyncError::Transport {
            operation: operation.into(),
            source,
        }
    }

    pub(crate) fn apply(destination: Destination, key: impl Into<String>, source: StoreError) -> Self {
        SyncError::Apply {
            destination,
            key: key.into(),
            source,
        }
    }
}
