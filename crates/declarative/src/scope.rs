//! Scopes: the namespace tree resources are declared into

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use tokio::sync::oneshot;
use tokio::task_local;

use crate::error::{Error, Result};
use crate::executor::{RunState, lock};
use crate::resource::{Resource, ResourceHandler};
use crate::types::{Fqn, ResourceIdentity};

task_local! {
    /// FQN of the handler currently being polled on this task
    static RUNNING_HANDLER: Fqn;
}

/// Poll `future` as the handler owning the scope `fqn`
pub(crate) async fn in_handler<F: Future>(fqn: Fqn, future: F) -> F::Output {
    RUNNING_HANDLER.scope(fqn, future).await
}

/// Closed flag of one scope, tracked by the run so unclosed scopes are found
#[derive(Debug)]
pub(crate) struct ScopeStatus {
    pub fqn: Fqn,
    closed: AtomicBool,
}

impl ScopeStatus {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Output of a settled construction, shared by everyone awaiting it
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub identity: ResourceIdentity,
    pub output: Value,
}

impl Envelope {
    fn decode<O: serde::de::DeserializeOwned>(self) -> Result<Resource<O>> {
        let output = serde_json::from_value(self.output).map_err(|source| Error::Decode {
            fqn: self.identity.fqn.clone(),
            what: "output",
            source,
        })?;
        Ok(Resource::new(self.identity, output))
    }
}

pub(crate) type Settled = Shared<BoxFuture<'static, std::result::Result<Envelope, Arc<Error>>>>;

/// A declared resource whose construction may still be running
#[derive(Clone)]
pub struct ResourceHandle {
    identity: ResourceIdentity,
    settled: Settled,
}

impl ResourceHandle {
    pub(crate) fn new(identity: ResourceIdentity, settled: Settled) -> Self {
        Self { identity, settled }
    }

    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// Wait for the construction to finish
    pub async fn settled(&self) -> Result<()> {
        self.envelope().await.map(|_| ())
    }

    pub(crate) async fn envelope(&self) -> Result<Envelope> {
        self.settled.clone().await.map_err(|source| Error::Resource {
            fqn: self.identity.fqn.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("identity", &self.identity)
            .field("settled", &self.settled.peek().is_some())
            .finish()
    }
}

struct ScopeNode {
    fqn: Fqn,
    run: Arc<RunState>,
    local: bool,
    children: Mutex<Vec<ResourceHandle>>,
    deferred: Mutex<Vec<BoxFuture<'static, ()>>>,
    status: Arc<ScopeStatus>,
}

/// A node in the FQN tree
///
/// Every program starts from the run's root scope. Resources declared through
/// a scope get the FQN `<scope fqn>/<id>`; a resource's handler receives a
/// scope named after the resource for declaring nested resources.
///
/// Scopes must be closed before the run finishes. Closing marks the end of
/// the scope's declaration phase and runs its deferred tasks.
#[derive(Clone)]
pub struct Scope {
    node: Arc<ScopeNode>,
}

impl Scope {
    pub(crate) fn open(run: &Arc<RunState>, fqn: Fqn, local: bool) -> Self {
        let status = Arc::new(ScopeStatus {
            fqn: fqn.clone(),
            closed: AtomicBool::new(false),
        });
        run.track_scope(status.clone());
        Self {
            node: Arc::new(ScopeNode {
                fqn,
                run: Arc::clone(run),
                local,
                children: Mutex::new(Vec::new()),
                deferred: Mutex::new(Vec::new()),
                status,
            }),
        }
    }

    pub fn fqn(&self) -> &Fqn {
        &self.node.fqn
    }

    /// Whether resources in this scope run against local emulation
    pub fn is_local(&self) -> bool {
        self.node.local
    }

    pub fn is_closed(&self) -> bool {
        self.node.status.is_closed()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ScopeClosed(self.node.fqn.clone()))
        } else {
            Ok(())
        }
    }

    /// Enter a child scope named `name`
    pub fn enter_scope(&self, name: &str) -> Result<Scope> {
        self.enter(name, self.node.local)
    }

    /// Enter a child scope whose resources run against local emulation
    pub fn enter_local_scope(&self, name: &str) -> Result<Scope> {
        self.enter(name, true)
    }

    fn enter(&self, name: &str, local: bool) -> Result<Scope> {
        self.ensure_open()?;
        let fqn = self.node.fqn.child(name)?;
        log::trace!("entering scope {fqn}");
        Ok(Self::open(&self.node.run, fqn, local))
    }

    /// Close the scope and run its deferred tasks concurrently
    ///
    /// Closing twice is a no-op.
    pub async fn close(&self) {
        let tasks = {
            let mut deferred = lock(&self.node.deferred);
            if self.node.status.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *deferred)
        };
        if !tasks.is_empty() {
            log::debug!("running {} deferred task(s) in {}", tasks.len(), self.node.fqn);
            join_all(tasks).await;
        }
    }

    /// Run `body` in a child scope, closing it when the body succeeds
    ///
    /// On error the child stays open and the run refuses to finish, so a
    /// partially enumerated program never deletes anything.
    pub async fn scoped<F, Fut, T, E>(&self, name: &str, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let scope = self.enter_scope(name)?;
        let value = body(scope.clone()).await?;
        scope.close().await;
        Ok(value)
    }

    /// Record a declared resource as a child, once per FQN
    pub fn register(&self, handle: ResourceHandle) {
        let mut children = lock(&self.node.children);
        if children
            .iter()
            .any(|child| child.identity.fqn == handle.identity.fqn)
        {
            return;
        }
        children.push(handle);
    }

    /// Identities of the declared children, in declaration order
    pub fn resources(&self) -> Vec<ResourceIdentity> {
        lock(&self.node.children)
            .iter()
            .map(|child| child.identity.clone())
            .collect()
    }

    /// Handles of the declared children, in declaration order
    pub fn handles(&self) -> Vec<ResourceHandle> {
        lock(&self.node.children).clone()
    }

    /// Queue `task` to run when the scope closes
    pub fn defer<F, T>(&self, task: F) -> Result<Deferred<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut deferred = lock(&self.node.deferred);
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        deferred.push(
            async move {
                // Nobody waiting on the result is fine
                let _ = tx.send(task.await);
            }
            .boxed(),
        );
        Ok(Deferred {
            status: Arc::clone(&self.node.status),
            rx,
        })
    }

    /// Declare a resource of kind `H::KIND` named `id` in this scope
    ///
    /// Declaration happens immediately: the resource is registered and its
    /// reconciliation starts before the returned future is polled. Awaiting
    /// the future yields the sealed output.
    pub fn resource<H: ResourceHandler>(
        &self,
        id: &str,
        props: H::Props,
    ) -> BoxFuture<'static, Result<Resource<H::Output>>> {
        self.resource_with_deps::<H>(id, props, &[])
    }

    /// Declare a resource that depends on `dependencies`
    ///
    /// Dependencies are persisted with the resource's state; on teardown the
    /// resource is deleted before anything it depends on.
    pub fn resource_with_deps<H: ResourceHandler>(
        &self,
        id: &str,
        props: H::Props,
        dependencies: &[&ResourceIdentity],
    ) -> BoxFuture<'static, Result<Resource<H::Output>>> {
        let dependencies = dependencies.iter().map(|d| d.fqn.clone()).collect();
        let declared = serde_json::to_value(&props)
            .map_err(|source| Error::Decode {
                fqn: Fqn::from(format!("{}/{id}", self.node.fqn)),
                what: "props",
                source,
            })
            .and_then(|props| {
                self.node
                    .run
                    .declare(self, H::KIND, id, props, dependencies)
            });

        async move {
            let handle = declared?;
            handle.envelope().await?.decode()
        }
        .boxed()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("fqn", &self.node.fqn)
            .field("local", &self.node.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Result of a deferred task
///
/// Resolves after the scope closes and the task has run. Resolves to
/// [`Error::DeferredDropped`] if the scope was dropped without closing, and
/// to [`Error::DeferredInHandler`] when awaited by the handler that owns the
/// still-open scope, which would otherwise wait forever.
#[derive(Debug)]
pub struct Deferred<T> {
    status: Arc<ScopeStatus>,
    rx: oneshot::Receiver<T>,
}

impl<T> Deferred<T> {
    /// Whether the current task is the handler that will close this scope
    fn polled_by_owner(&self) -> bool {
        !self.status.is_closed()
            && RUNNING_HANDLER
                .try_with(|fqn| *fqn == self.status.fqn)
                .unwrap_or(false)
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(Error::DeferredDropped(this.status.fqn.clone())))
            }
            Poll::Pending if this.polled_by_owner() => {
                Poll::Ready(Err(Error::DeferredInHandler(this.status.fqn.clone())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
