//! # Declarative
//!
//! Reconciliation core for declarative infrastructure.
//!
//! A program declares the remote resources it wants by calling resource
//! constructors on a [`Scope`]. The engine persists what each resource looked
//! like after the last run, derives whether it must be created, updated or
//! replaced, invokes the resource kind's handler exactly once per run, and
//! deletes whatever a previous run created that the program no longer
//! declares.
//!
//! ## Core Concepts
//!
//! - **FQN**: `app/stage/<scope chain>/<id>`, the stable identity used to
//!   find a resource's state across runs
//! - **ResourceHandler**: provider code for one kind, returning a
//!   [`HandlerOutcome`] through its [`Context`]
//! - **StateStore**: durable FQN-to-record mapping ([`MemoryStateStore`] here,
//!   file and SQLite backends in the application crate)
//! - **DestroyPlan**: dependency-ordered deletion of orphans, sequential or
//!   parallel per owner kind
//! - **ShutdownCoordinator**: cleanups run when a run is aborted
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{Engine, MemoryStateStore, Stage};
//! use std::sync::Arc;
//!
//! let engine = Engine::builder(Arc::new(MemoryStateStore::new()))
//!     .handler(BucketHandler::new(client))
//!     .build()?;
//!
//! let run = engine.begin(Stage::new("shop", "dev")?).await?;
//! let assets = run.root().resource::<BucketHandler>("assets", props).await?;
//! run.root()
//!     .resource_with_deps::<SiteHandler>("site", site_props(&assets), &[assets.identity()])
//!     .await?;
//! let report = run.finish().await?;
//! ```
//!
//! ## Guarantees
//!
//! State is written only after a handler returned a valid outcome, so a
//! crash between a remote call and the write leaves the next run to
//! re-derive the phase from what was stored. Side effects are therefore
//! at-least-once; handlers should tolerate re-running a create.

pub mod context;
pub mod diff;
pub mod engine;
pub mod error;
mod executor;
pub mod planner;
pub mod resource;
pub mod scope;
pub mod shutdown;
pub mod state;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export main types at crate root
pub use context::Context;
pub use diff::{PropsDiff, compute_orphans, group_by_kind};
pub use engine::{Engine, EngineBuilder, Run};
pub use error::{Error, Result};
pub use planner::{DestroyPlan, DestroyTarget, PlanNode};
pub use resource::{HandlerOutcome, Resource, ResourceHandler, Sealed};
pub use scope::{Deferred, ResourceHandle, Scope};
pub use shutdown::ShutdownCoordinator;
pub use state::{MemoryStateStore, StateStore};
pub use types::{
    ApplyResult, DestroyStrategy, Fqn, Phase, PrivateData, ReplaceMode, ReplacedInstance,
    ResourceIdentity, RunMode, RunOptions, RunReport, RunSummary, Stage, StateRecord,
};

pub use async_trait::async_trait;
pub use secretkit::{Secret, Vault};
