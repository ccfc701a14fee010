//! Shutdown coordination for interrupted or aborted runs
//!
//! Handlers that start long-lived local processes (emulators, tunnels, file
//! watchers) register a cleanup here. The run invokes every cleanup once when
//! it is aborted, and the program runner does the same on Ctrl-C.

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Inner {
    cleanups: Mutex<Vec<(String, Cleanup)>>,
    signal: watch::Sender<bool>,
}

/// Named cleanup callbacks plus a cancellation signal
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no cleanups
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cleanups: Mutex::new(Vec::new()),
                signal,
            }),
        }
    }

    /// Register a cleanup to run on shutdown
    ///
    /// Returns `false` (and drops the cleanup) if shutdown already started.
    pub fn register<F, Fut>(&self, name: impl Into<String>, cleanup: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut cleanups = self
            .inner
            .cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_shutting_down() {
            log::warn!("cleanup '{name}' registered after shutdown started; ignoring it");
            return false;
        }
        log::debug!("registered cleanup '{name}'");
        cleanups.push((name, Box::new(move || cleanup().boxed())));
        true
    }

    /// Number of cleanups waiting to run
    pub fn pending(&self) -> usize {
        self.inner
            .cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether shutdown has started
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.signal.borrow()
    }

    /// Resolves once shutdown starts
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.signal.subscribe();
        async move {
            // The sender lives as long as the coordinator; a closed channel
            // means nobody can shut down anymore, so just return.
            let _ = rx.wait_for(|started| *started).await;
        }
    }

    /// Run every registered cleanup once, concurrently
    ///
    /// Errors and panics are caught per cleanup and returned with the
    /// cleanup's name. Calling this again is a no-op.
    pub async fn shutdown(&self) -> Vec<(String, anyhow::Error)> {
        let cleanups = {
            let mut cleanups = self
                .inner
                .cleanups
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.signal.send_replace(true) {
                return Vec::new();
            }
            std::mem::take(&mut *cleanups)
        };

        log::info!("running {} shutdown cleanup(s)", cleanups.len());
        let runs = cleanups.into_iter().map(|(name, cleanup)| async move {
            let outcome = AssertUnwindSafe(async move { cleanup().await })
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => return None,
                Ok(Err(e)) => e,
                Err(panic) => anyhow::anyhow!("cleanup panicked: {}", panic_message(&*panic)),
            };
            log::warn!("cleanup '{name}' failed: {error:#}");
            Some((name, error))
        });

        join_all(runs).await.into_iter().flatten().collect()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("pending", &self.pending())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
