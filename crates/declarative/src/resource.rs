//! Resource handler contract and its type-erased registry

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::context::Context;
use crate::diff::PropsDiff;
use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::shutdown::ShutdownCoordinator;
use crate::types::{
    DestroyStrategy, Fqn, Phase, PrivateData, ReplaceMode, ResourceIdentity, validate_kind,
};

/// Provider code for one resource kind
///
/// The engine invokes `handle` once per declared FQN per run, in the phase it
/// derived from stored state. The handler performs the remote calls and
/// returns exactly one terminal outcome through the [`Context`]:
///
/// - create: [`Context::seal_output`]
/// - update: [`Context::seal_output`] or [`Context::replace`]
/// - delete: [`Context::destroy`]
///
/// Anything else is a contract violation and aborts the run.
///
/// ```ignore
/// struct Bucket;
///
/// #[async_trait]
/// impl ResourceHandler for Bucket {
///     const KIND: &'static str = "storage::Bucket";
///     type Props = BucketProps;
///     type Output = BucketOutput;
///
///     async fn handle(
///         &self,
///         ctx: &mut Context<BucketOutput, BucketProps>,
///         id: &str,
///         props: BucketProps,
///     ) -> anyhow::Result<HandlerOutcome<BucketOutput>> {
///         match ctx.phase() {
///             Phase::Delete => {
///                 api::delete_bucket(id).await?;
///                 Ok(ctx.destroy())
///             }
///             Phase::Update if ctx.props_diff().is_some_and(|d| d.touches(&["region"])) => {
///                 Ok(ctx.replace())
///             }
///             _ => {
///                 let bucket = api::put_bucket(id, &props).await?;
///                 Ok(ctx.seal_output(bucket.into()))
///             }
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    /// Resource kind, `provider::Type`
    const KIND: &'static str;

    /// How resources nested under this one are torn down
    const DESTROY_STRATEGY: DestroyStrategy = DestroyStrategy::Sequential;

    /// Declared configuration
    type Props: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Sealed output visible to dependents
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Perform the phase's side effects and return the terminal outcome
    async fn handle(
        &self,
        ctx: &mut Context<Self::Output, Self::Props>,
        id: &str,
        props: Self::Props,
    ) -> anyhow::Result<HandlerOutcome<Self::Output>>;
}

/// Terminal outcome of a handler invocation
#[derive(Debug, Clone)]
pub enum HandlerOutcome<O> {
    /// Output produced by create or update
    Sealed(Sealed<O>),
    /// The remote object is gone
    Destroyed,
    /// Update cannot be applied in place
    Replaced(ReplaceMode),
}

/// An output bound to the FQN it was produced for
#[derive(Debug, Clone)]
pub struct Sealed<O> {
    pub(crate) fqn: Fqn,
    pub(crate) id: String,
    pub(crate) output: O,
}

impl<O> Sealed<O> {
    /// FQN the output was sealed for
    pub fn fqn(&self) -> &Fqn {
        &self.fqn
    }

    /// Id the output was sealed with
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The sealed output
    pub fn output(&self) -> &O {
        &self.output
    }
}

/// A reconciled resource: its identity and sealed output
///
/// The identity travels beside the output instead of being stamped into it.
/// State records keep kind, id, FQN and sequence number as their own fields,
/// so the stored output is exactly what the handler sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource<O> {
    identity: ResourceIdentity,
    output: O,
}

impl<O> Resource<O> {
    pub(crate) fn new(identity: ResourceIdentity, output: O) -> Self {
        Self { identity, output }
    }

    /// Identity of the resource, for declaring dependencies on it
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// Fully-qualified name
    pub fn fqn(&self) -> &Fqn {
        &self.identity.fqn
    }

    /// Take the output
    pub fn into_output(self) -> O {
        self.output
    }
}

impl<O> Deref for Resource<O> {
    type Target = O;

    fn deref(&self) -> &O {
        &self.output
    }
}

/// Stored props and output handed to update and delete
#[derive(Debug, Clone)]
pub(crate) struct Prior {
    pub props: Value,
    pub output: Value,
}

/// Everything needed to invoke a handler once
pub(crate) struct Invocation {
    pub phase: Phase,
    pub identity: ResourceIdentity,
    pub props: Value,
    pub prior: Option<Prior>,
    pub data: PrivateData,
    pub replacing: bool,
    pub local: bool,
    pub adopt: bool,
    pub scope: Scope,
    /// Declaring scope; absent for deletions
    pub parent: Option<Scope>,
    pub shutdown: ShutdownCoordinator,
}

pub(crate) enum ErasedOutcome {
    Sealed(Value),
    Destroyed,
    Replaced(ReplaceMode),
}

pub(crate) struct Invoked {
    pub outcome: ErasedOutcome,
    pub data: PrivateData,
}

/// Object-safe view of a [`ResourceHandler`] working on JSON values
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    fn kind(&self) -> &'static str;
    fn destroy_strategy(&self) -> DestroyStrategy;
    async fn invoke(&self, invocation: Invocation) -> Result<Invoked>;
}

struct Adapter<H>(H);

impl<H: ResourceHandler> Adapter<H> {
    fn decode<T: DeserializeOwned>(fqn: &Fqn, what: &'static str, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|source| Error::Decode {
            fqn: fqn.clone(),
            what,
            source,
        })
    }

    fn violation(invocation_fqn: &Fqn, phase: Phase, message: impl Into<String>) -> Error {
        Error::ContractViolation {
            fqn: invocation_fqn.clone(),
            phase,
            message: message.into(),
        }
    }
}

#[async_trait]
impl<H: ResourceHandler> ErasedHandler for Adapter<H> {
    fn kind(&self) -> &'static str {
        H::KIND
    }

    fn destroy_strategy(&self) -> DestroyStrategy {
        H::DESTROY_STRATEGY
    }

    async fn invoke(&self, invocation: Invocation) -> Result<Invoked> {
        let Invocation {
            phase,
            identity,
            props,
            prior,
            data,
            replacing,
            local,
            adopt,
            scope,
            parent,
            shutdown,
        } = invocation;
        let fqn = identity.fqn.clone();

        let diff = match (&prior, phase) {
            (Some(prior), Phase::Update) => Some(PropsDiff::between(&prior.props, &props)),
            _ => None,
        };
        let typed_props: H::Props = Self::decode(&fqn, "props", props)?;
        let (prior_props, prior_output) = match prior {
            Some(prior) => (
                Some(Self::decode(&fqn, "stored props", prior.props)?),
                Some(Self::decode(&fqn, "stored output", prior.output)?),
            ),
            None => (None, None),
        };

        let mut ctx = Context {
            phase,
            identity,
            prior_props,
            prior_output,
            diff,
            data,
            replacing,
            local,
            adopt,
            scope,
            parent,
            shutdown,
            destroy_requested: false,
        };

        let id = ctx.identity.id.clone();
        log::debug!("{phase} {fqn} ({})", H::KIND);
        let outcome = self
            .0
            .handle(&mut ctx, &id, typed_props)
            .await
            .map_err(|source| Error::Handler {
                fqn: fqn.clone(),
                phase,
                source,
            })?;

        if ctx.destroy_requested && phase != Phase::Delete {
            return Err(Self::violation(
                &fqn,
                phase,
                "destroy() may only be called during delete",
            ));
        }

        let outcome = match (phase, outcome) {
            (Phase::Create | Phase::Update, HandlerOutcome::Sealed(sealed)) => {
                if sealed.fqn != fqn {
                    return Err(Self::violation(
                        &fqn,
                        phase,
                        format!("output was sealed for {} (id '{}')", sealed.fqn, sealed.id),
                    ));
                }
                let output = serde_json::to_value(&sealed.output).map_err(|source| Error::Decode {
                    fqn: fqn.clone(),
                    what: "output",
                    source,
                })?;
                ErasedOutcome::Sealed(output)
            }
            (Phase::Update, HandlerOutcome::Replaced(mode)) => ErasedOutcome::Replaced(mode),
            (Phase::Delete, HandlerOutcome::Destroyed) => ErasedOutcome::Destroyed,
            (phase, outcome) => {
                let got = match outcome {
                    HandlerOutcome::Sealed(_) => "a sealed output",
                    HandlerOutcome::Destroyed => "destroyed",
                    HandlerOutcome::Replaced(_) => "a replace request",
                };
                let expected = match phase {
                    Phase::Create => "a sealed output",
                    Phase::Update => "a sealed output or a replace request",
                    Phase::Delete => "destroyed",
                };
                return Err(Self::violation(
                    &fqn,
                    phase,
                    format!("handler returned {got}, expected {expected}"),
                ));
            }
        };

        Ok(Invoked {
            outcome,
            data: ctx.data,
        })
    }
}

/// Handlers keyed by resource kind
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn register<H: ResourceHandler>(&mut self, handler: H) -> Result<()> {
        validate_kind(H::KIND)?;
        if self.handlers.contains_key(H::KIND) {
            return Err(Error::DuplicateKind(H::KIND.to_string()));
        }
        self.handlers.insert(H::KIND, Arc::new(Adapter(handler)));
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn ErasedHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    pub fn strategy(&self, kind: &str) -> Option<DestroyStrategy> {
        self.handlers.get(kind).map(|h| h.destroy_strategy())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.values().map(|h| h.kind())
    }
}
