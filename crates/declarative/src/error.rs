//! Error types for the reconciliation core

use std::sync::Arc;
use thiserror::Error;

use crate::types::{Fqn, Phase};

/// Errors raised while declaring, reconciling, or destroying resources
#[derive(Debug, Error)]
pub enum Error {
    /// Resource kind does not look like `provider::Type`
    #[error("invalid resource kind '{0}': expected 'provider::Type'")]
    InvalidKind(String),

    /// Scope or resource name cannot be used as an FQN segment
    #[error("invalid name '{name}': {reason}")]
    InvalidName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// No handler is registered for a kind
    #[error("no handler registered for resource kind '{0}'")]
    UnknownKind(String),

    /// Two handlers were registered for the same kind
    #[error("a handler for resource kind '{0}' is already registered")]
    DuplicateKind(String),

    /// The same FQN was declared twice in one run with different kinds
    #[error("{fqn} is declared as '{existing}' in this run and cannot also be '{requested}'")]
    KindConflict {
        /// The contested FQN
        fqn: Fqn,
        /// Kind of the first declaration
        existing: String,
        /// Kind of the conflicting declaration
        requested: String,
    },

    /// A handler broke the lifecycle contract
    #[error("contract violation in {fqn} during {phase}: {message}")]
    ContractViolation {
        /// Offending resource
        fqn: Fqn,
        /// Phase the handler ran in
        phase: Phase,
        /// What went wrong
        message: String,
    },

    /// A provider handler returned an error
    #[error("{phase} of {fqn} failed: {source:#}")]
    Handler {
        /// Failing resource
        fqn: Fqn,
        /// Phase the handler ran in
        phase: Phase,
        /// Error reported by the handler
        source: anyhow::Error,
    },

    /// A declared resource failed; shared by every caller awaiting it
    #[error("resource {fqn} failed: {source}")]
    Resource {
        /// Failing resource
        fqn: Fqn,
        /// The original failure
        source: Arc<Error>,
    },

    /// Props, outputs or private data could not be (de)serialized
    #[error("could not decode {what} of {fqn}: {source}")]
    Decode {
        /// Resource whose data failed to decode
        fqn: Fqn,
        /// Which part of the record
        what: &'static str,
        /// Underlying serde error
        source: serde_json::Error,
    },

    /// The state store failed
    #[error("state store error: {0:#}")]
    State(anyhow::Error),

    /// Sealing or opening secrets failed
    #[error("secret vault error: {0}")]
    Secret(#[from] secretkit::Error),

    /// A scope was entered but never closed before the run finished
    #[error("scope {0} was never closed; refusing to reconcile a partially enumerated program")]
    ScopeNotClosed(Fqn),

    /// Work was added to a scope after it was closed
    #[error("scope {0} is already closed")]
    ScopeClosed(Fqn),

    /// A deferred task was dropped before it ran
    #[error("deferred task in scope {0} was dropped before it ran")]
    DeferredDropped(Fqn),

    /// A handler awaited a task deferred on its own, still open, scope
    #[error("deferred task in scope {0} cannot run before its handler returns; defer on the declaring scope instead")]
    DeferredInHandler(Fqn),

    /// Read mode found no state for a declared resource
    #[error("{0} has no recorded state")]
    NotFound(Fqn),

    /// Deletion order cannot be satisfied
    #[error("dependency cycle among {}", format_fqns(.0))]
    DependencyCycle(Vec<Fqn>),

    /// A deletion was not attempted because something it blocks on failed
    #[error("{fqn} was not deleted because {blocker} could not be deleted")]
    Blocked {
        /// Resource whose deletion was skipped
        fqn: Fqn,
        /// The failed deletion it waited on
        blocker: Fqn,
    },

    /// The run was aborted
    #[error("run aborted: {0}")]
    Aborted(String),
}

impl Error {
    /// Whether this error must abort the whole run instead of a single resource
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ContractViolation { .. }
            | Self::Secret(_)
            | Self::ScopeNotClosed(_)
            | Self::Aborted(_) => true,
            Self::Resource { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Wrap a state store failure
    pub fn state(error: anyhow::Error) -> Self {
        Self::State(error)
    }
}

fn format_fqns(fqns: &[Fqn]) -> String {
    fqns.iter()
        .map(Fqn::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;
