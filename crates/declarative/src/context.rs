//! Per-invocation context handed to resource handlers

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::diff::PropsDiff;
use crate::resource::{HandlerOutcome, Sealed};
use crate::scope::Scope;
use crate::shutdown::ShutdownCoordinator;
use crate::types::{Fqn, Phase, PrivateData, ReplaceMode, ResourceIdentity};

/// Runtime context of one handler invocation
///
/// `O` is the handler's output type and `P` its props type. The terminal
/// methods ([`seal_output`](Self::seal_output), [`destroy`](Self::destroy),
/// [`replace`](Self::replace)) build the [`HandlerOutcome`] the handler must
/// return.
pub struct Context<O, P> {
    pub(crate) phase: Phase,
    pub(crate) identity: ResourceIdentity,
    pub(crate) prior_props: Option<P>,
    pub(crate) prior_output: Option<O>,
    pub(crate) diff: Option<PropsDiff>,
    pub(crate) data: PrivateData,
    pub(crate) replacing: bool,
    pub(crate) local: bool,
    pub(crate) adopt: bool,
    pub(crate) scope: Scope,
    pub(crate) parent: Option<Scope>,
    pub(crate) shutdown: ShutdownCoordinator,
    pub(crate) destroy_requested: bool,
}

impl<O, P> Context<O, P> {
    /// Phase being executed
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Logical id of the resource
    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// Fully-qualified name of the resource
    pub fn fqn(&self) -> &Fqn {
        &self.identity.fqn
    }

    /// Resource kind
    pub fn kind(&self) -> &str {
        &self.identity.kind
    }

    /// Declaration sequence number
    pub fn seq(&self) -> u64 {
        self.identity.seq
    }

    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// Output stored by the previous run (update and delete only)
    pub fn prior_output(&self) -> Option<&O> {
        self.prior_output.as_ref()
    }

    /// Props stored by the previous run (update and delete only)
    pub fn prior_props(&self) -> Option<&P> {
        self.prior_props.as_ref()
    }

    /// Difference between stored and declared props (update only)
    pub fn props_diff(&self) -> Option<&PropsDiff> {
        self.diff.as_ref()
    }

    /// Whether this invocation is one half of a replacement
    pub fn is_replacing(&self) -> bool {
        self.replacing
    }

    /// Whether the resource runs against local emulation
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Whether pre-existing remote objects may be taken over
    pub fn adopt(&self) -> bool {
        self.adopt
    }

    /// The resource's own scope, for declaring nested resources
    ///
    /// It closes only after the handler returns, so awaiting a task deferred
    /// on it from inside the handler fails with [`Error::DeferredInHandler`].
    ///
    /// [`Error::DeferredInHandler`]: crate::Error::DeferredInHandler
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The scope this resource was declared in (create and update only)
    ///
    /// A task deferred here runs once the declaring scope closes and sees
    /// every sibling through [`Scope::resources`]. Awaiting it only resolves
    /// if whoever closes that scope doesn't wait on this resource first.
    pub fn parent_scope(&self) -> Option<&Scope> {
        self.parent.as_ref()
    }

    /// Shutdown coordinator for registering cleanups
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Read a private value
    pub fn get_private<T: DeserializeOwned>(&self, key: &str) -> serde_json::Result<Option<T>> {
        self.data
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }

    /// Read a private value without decoding it
    pub fn get_private_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Store a private value; persisted with the resource's state
    pub fn set_private<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> serde_json::Result<()> {
        self.data.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Remove a private value, returning it
    pub fn delete_private(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Request a replacement (create the new instance before deleting the old one)
    pub fn replace(&self) -> HandlerOutcome<O> {
        HandlerOutcome::Replaced(ReplaceMode::CreateBeforeDelete)
    }

    /// Request a replacement with an explicit ordering
    pub fn replace_with(&self, mode: ReplaceMode) -> HandlerOutcome<O> {
        HandlerOutcome::Replaced(mode)
    }

    /// Confirm the remote object is gone
    ///
    /// Only valid during delete; any other phase aborts the run even if the
    /// handler goes on to return a different outcome.
    pub fn destroy(&mut self) -> HandlerOutcome<O> {
        self.destroy_requested = true;
        HandlerOutcome::Destroyed
    }

    /// Seal the output for this resource
    ///
    /// The output is bound to this resource's FQN; dependents receive it
    /// wrapped in a [`Resource`](crate::Resource) carrying the identity.
    pub fn seal_output(&self, output: O) -> HandlerOutcome<O> {
        HandlerOutcome::Sealed(Sealed {
            fqn: self.identity.fqn.clone(),
            id: self.identity.id.clone(),
            output,
        })
    }

    /// Seal the output under an explicit id
    ///
    /// The id must name this resource: sealing under another id produces an
    /// output for a different FQN, which the engine rejects.
    pub fn seal_output_with_id(&self, id: impl Into<String>, output: O) -> HandlerOutcome<O> {
        let id = id.into();
        let fqn = match self.identity.fqn.parent() {
            Some(parent) => Fqn::from(format!("{parent}/{id}")),
            None => Fqn::from(id.clone()),
        };
        HandlerOutcome::Sealed(Sealed { fqn, id, output })
    }
}
