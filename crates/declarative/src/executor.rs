//! Execution engine - reconciles declared resources against stored state

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use secretkit::{Vault, contains_secrets};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::diff::group_by_kind;
use crate::error::{Error, Result};
use crate::planner::{DestroyPlan, DestroyTarget, PlanNode};
use crate::resource::{ErasedHandler, ErasedOutcome, HandlerRegistry, Invocation, Invoked, Prior};
use crate::scope::{Envelope, ResourceHandle, Scope, ScopeStatus, in_handler};
use crate::shutdown::ShutdownCoordinator;
use crate::state::StateStore;
use crate::types::{
    ApplyResult, DestroyStrategy, Fqn, Phase, PrivateData, ReplaceMode, ReplacedInstance,
    ResourceIdentity, RunMode, RunOptions, RunReport, Stage, StateRecord,
};

/// Lock a mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A resource as declared by the program in this run
struct Declaration {
    identity: ResourceIdentity,
    props: Value,
    dependencies: Vec<Fqn>,
    local: bool,
    /// Scope the resource was declared in
    parent: Scope,
}

impl Declaration {
    fn record(&self, output: Value, data: PrivateData, replaced: Vec<ReplacedInstance>) -> StateRecord {
        StateRecord {
            kind: self.identity.kind.clone(),
            id: self.identity.id.clone(),
            fqn: self.identity.fqn.clone(),
            seq: self.identity.seq,
            props: self.props.clone(),
            output,
            data,
            dependencies: self.dependencies.clone(),
            replaced,
            local: self.local,
        }
    }
}

/// Shared state of one run
pub(crate) struct RunState {
    pub stage: Stage,
    pub options: RunOptions,
    pub shutdown: ShutdownCoordinator,
    /// FQNs on record when the run began
    pub prior: BTreeSet<Fqn>,
    store: Arc<dyn StateStore>,
    vault: Option<Arc<Vault>>,
    registry: Arc<HandlerRegistry>,
    seq: AtomicU64,
    /// Declared FQNs; the keys are the run's touched set
    inflight: Mutex<BTreeMap<Fqn, ResourceHandle>>,
    results: Mutex<Vec<(Fqn, ApplyResult)>>,
    fatal: Mutex<Option<String>>,
    scopes: Mutex<Vec<Arc<ScopeStatus>>>,
    tasks: Mutex<Vec<AbortHandle>>,
    /// Records holding replaced instances to delete at the end of the run
    pending_replaced: Mutex<BTreeSet<Fqn>>,
}

impl RunState {
    pub fn new(
        stage: Stage,
        options: RunOptions,
        store: Arc<dyn StateStore>,
        vault: Option<Arc<Vault>>,
        registry: Arc<HandlerRegistry>,
        prior: BTreeSet<Fqn>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stage,
            options,
            shutdown: ShutdownCoordinator::new(),
            prior,
            store,
            vault,
            registry,
            seq: AtomicU64::new(0),
            inflight: Mutex::new(BTreeMap::new()),
            results: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            scopes: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            pending_replaced: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn track_scope(&self, status: Arc<ScopeStatus>) {
        lock(&self.scopes).push(status);
    }

    /// First scope that was entered but never closed
    pub fn unclosed_scope(&self) -> Option<Fqn> {
        lock(&self.scopes)
            .iter()
            .find(|status| !status.is_closed())
            .map(|status| status.fqn.clone())
    }

    /// Reason the run must abort, if a fatal error happened
    pub fn fatal(&self) -> Option<String> {
        lock(&self.fatal).clone()
    }

    pub fn touched(&self) -> BTreeSet<Fqn> {
        lock(&self.inflight).keys().cloned().collect()
    }

    /// FQNs whose reconciliation failed so far in this run
    pub fn failed(&self) -> BTreeSet<Fqn> {
        lock(&self.results)
            .iter()
            .filter(|(_, result)| !result.is_success())
            .map(|(fqn, _)| fqn.clone())
            .collect()
    }

    pub fn report(&self) -> RunReport {
        RunReport::new(self.stage.clone(), lock(&self.results).clone())
    }

    fn record(&self, fqn: &Fqn, result: ApplyResult) {
        lock(&self.results).push((fqn.clone(), result));
    }

    fn fail(&self, fqn: &Fqn, error: &Error) {
        log::warn!("{error}");
        self.record(
            fqn,
            ApplyResult::Failed {
                error: error.to_string(),
            },
        );
        if error.is_fatal() {
            lock(&self.fatal).get_or_insert_with(|| error.to_string());
        }
    }

    /// Declare a resource, joining an in-flight declaration of the same FQN
    pub fn declare(
        self: &Arc<Self>,
        scope: &Scope,
        kind: &'static str,
        id: &str,
        props: Value,
        dependencies: Vec<Fqn>,
    ) -> Result<ResourceHandle> {
        scope.ensure_open()?;
        let fqn = scope.fqn().child(id)?;
        self.registry.get(kind)?;

        let handle = {
            let mut inflight = lock(&self.inflight);
            if let Some(existing) = inflight.get(&fqn) {
                if existing.identity().kind != kind {
                    return Err(Error::KindConflict {
                        fqn,
                        existing: existing.identity().kind.clone(),
                        requested: kind.to_string(),
                    });
                }
                log::debug!("{fqn} is already declared in this run; sharing its result");
                existing.clone()
            } else {
                let declaration = Declaration {
                    identity: ResourceIdentity {
                        kind: kind.to_string(),
                        id: id.to_string(),
                        fqn: fqn.clone(),
                        seq: self.seq.fetch_add(1, Ordering::SeqCst),
                    },
                    props,
                    dependencies,
                    local: scope.is_local(),
                    parent: scope.clone(),
                };
                let handle = self.spawn(declaration);
                inflight.insert(fqn, handle.clone());
                handle
            }
        };

        scope.register(handle.clone());
        Ok(handle)
    }

    /// Start reconciling a declaration, on the current runtime when there is one
    fn spawn(self: &Arc<Self>, declaration: Declaration) -> ResourceHandle {
        let identity = declaration.identity.clone();
        let run = Arc::clone(self);
        let work = async move { run.reconcile(declaration).await };

        let settled: BoxFuture<'static, std::result::Result<Envelope, Arc<Error>>> =
            match Handle::try_current() {
                Ok(runtime) => {
                    let task = runtime.spawn(work);
                    lock(&self.tasks).push(task.abort_handle());
                    let run = Arc::clone(self);
                    let fqn = identity.fqn.clone();
                    async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => {
                                let error = if e.is_cancelled() {
                                    Error::Aborted(format!("reconciliation of {fqn} was cancelled"))
                                } else {
                                    Error::Aborted(format!("handler for {fqn} panicked"))
                                };
                                run.fail(&fqn, &error);
                                Err(Arc::new(error))
                            }
                        }
                    }
                    .boxed()
                }
                Err(_) => work.boxed(),
            };

        ResourceHandle::new(identity, settled.shared())
    }

    async fn reconcile(
        self: Arc<Self>,
        declaration: Declaration,
    ) -> std::result::Result<Envelope, Arc<Error>> {
        let fqn = declaration.identity.fqn.clone();
        match self.reconcile_phase(&declaration).await {
            Ok((output, result)) => {
                log::info!("{fqn}: {result:?}");
                self.record(&fqn, result);
                Ok(Envelope {
                    identity: declaration.identity,
                    output,
                })
            }
            Err(error) => {
                self.fail(&fqn, &error);
                Err(Arc::new(error))
            }
        }
    }

    async fn reconcile_phase(
        self: &Arc<Self>,
        declaration: &Declaration,
    ) -> Result<(Value, ApplyResult)> {
        let identity = &declaration.identity;
        let handler = self.registry.get(&identity.kind)?;
        let stored = self.load(&identity.fqn).await?;

        if self.options.mode == RunMode::Read {
            let record = stored.ok_or_else(|| Error::NotFound(identity.fqn.clone()))?;
            if record.kind != identity.kind {
                return Err(Error::KindConflict {
                    fqn: identity.fqn.clone(),
                    existing: record.kind,
                    requested: identity.kind.clone(),
                });
            }
            return Ok((record.output, ApplyResult::Read));
        }

        // Refuse before any side effect happens rather than after
        if self.vault.is_none() && contains_secrets(&declaration.props) {
            return Err(self.missing_key());
        }

        let Some(record) = stored else {
            let (output, data) = self.create(&handler, declaration, false).await?;
            self.save(&declaration.record(output.clone(), data, Vec::new()))
                .await?;
            return Ok((output, ApplyResult::Created));
        };

        if record.kind != identity.kind {
            log::info!(
                "{} changed kind from {} to {}; replacing it",
                identity.fqn,
                record.kind,
                identity.kind
            );
            let output = self
                .replace(&handler, declaration, record, ReplaceMode::CreateBeforeDelete)
                .await?;
            return Ok((output, ApplyResult::Replaced));
        }

        let mut invocation = self.invocation(
            Phase::Update,
            identity.clone(),
            declaration.props.clone(),
            declaration.local,
        );
        invocation.parent = Some(declaration.parent.clone());
        invocation.prior = Some(Prior {
            props: record.props.clone(),
            output: record.output.clone(),
        });
        invocation.data = record.data.clone();

        let invoked = self.run_handler(&handler, invocation).await?;
        match invoked.outcome {
            ErasedOutcome::Sealed(output) => {
                let updated =
                    declaration.record(output.clone(), invoked.data, record.replaced);
                self.save(&updated).await?;
                Ok((output, ApplyResult::Updated))
            }
            ErasedOutcome::Replaced(mode) => {
                log::info!("{} requested replacement ({mode:?})", identity.fqn);
                let output = self.replace(&handler, declaration, record, mode).await?;
                Ok((output, ApplyResult::Replaced))
            }
            ErasedOutcome::Destroyed => Err(Error::ContractViolation {
                fqn: identity.fqn.clone(),
                phase: Phase::Update,
                message: "update returned destroyed".into(),
            }),
        }
    }

    async fn create(
        self: &Arc<Self>,
        handler: &Arc<dyn ErasedHandler>,
        declaration: &Declaration,
        replacing: bool,
    ) -> Result<(Value, PrivateData)> {
        let mut invocation = self.invocation(
            Phase::Create,
            declaration.identity.clone(),
            declaration.props.clone(),
            declaration.local,
        );
        invocation.parent = Some(declaration.parent.clone());
        invocation.replacing = replacing;

        let invoked = self.run_handler(handler, invocation).await?;
        match invoked.outcome {
            ErasedOutcome::Sealed(output) => Ok((output, invoked.data)),
            _ => Err(Error::ContractViolation {
                fqn: declaration.identity.fqn.clone(),
                phase: Phase::Create,
                message: "create did not seal an output".into(),
            }),
        }
    }

    async fn replace(
        self: &Arc<Self>,
        handler: &Arc<dyn ErasedHandler>,
        declaration: &Declaration,
        mut old: StateRecord,
        mode: ReplaceMode,
    ) -> Result<Value> {
        match mode {
            ReplaceMode::CreateBeforeDelete => {
                // Nothing is persisted unless the new instance exists
                let (output, data) = self.create(handler, declaration, true).await?;
                old.retire();
                let record = declaration.record(output.clone(), data, old.replaced);
                self.save(&record).await?;
                Ok(output)
            }
            ReplaceMode::DeleteBeforeCreate => {
                self.delete_replaced(&mut old).await?;
                let identity = old.identity();
                self.delete_instance(identity, old.props, old.output, old.data, old.local, true)
                    .await?;
                self.store
                    .delete(&old.fqn)
                    .await
                    .map_err(Error::State)?;

                let (output, data) = self.create(handler, declaration, true).await?;
                self.save(&declaration.record(output.clone(), data, Vec::new()))
                    .await?;
                Ok(output)
            }
        }
    }

    fn invocation(
        self: &Arc<Self>,
        phase: Phase,
        identity: ResourceIdentity,
        props: Value,
        local: bool,
    ) -> Invocation {
        let scope = Scope::open(self, identity.fqn.clone(), local);
        Invocation {
            phase,
            identity,
            props,
            prior: None,
            data: PrivateData::new(),
            replacing: false,
            local,
            adopt: self.options.adopt,
            scope,
            parent: None,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Invoke a handler, then close its scope and wait for nested resources
    async fn run_handler(
        &self,
        handler: &Arc<dyn ErasedHandler>,
        invocation: Invocation,
    ) -> Result<Invoked> {
        let scope = invocation.scope.clone();
        let result = in_handler(scope.fqn().clone(), handler.invoke(invocation)).await;
        scope.close().await;
        // Failures of nested resources are recorded against their own FQNs
        let children = scope.handles();
        join_all(children.iter().map(ResourceHandle::settled)).await;
        result
    }

    async fn delete_instance(
        self: &Arc<Self>,
        identity: ResourceIdentity,
        props: Value,
        output: Value,
        data: PrivateData,
        local: bool,
        replacing: bool,
    ) -> Result<()> {
        let handler = self.registry.get(&identity.kind)?;
        let mut invocation = self.invocation(Phase::Delete, identity, props.clone(), local);
        invocation.prior = Some(Prior { props, output });
        invocation.data = data;
        invocation.replacing = replacing;
        self.run_handler(&handler, invocation).await?;
        Ok(())
    }

    /// Delete a record's replaced instances, persisting after each one
    async fn delete_replaced(self: &Arc<Self>, record: &mut StateRecord) -> Result<()> {
        while let Some(instance) = record.replaced.first().cloned() {
            let identity = ResourceIdentity {
                kind: instance.kind,
                id: record.id.clone(),
                fqn: record.fqn.clone(),
                seq: instance.seq,
            };
            self.delete_instance(
                identity,
                instance.props,
                instance.output,
                instance.data,
                instance.local,
                true,
            )
            .await?;
            record.replaced.remove(0);
            self.save(record).await?;
        }
        Ok(())
    }

    /// Delete a record's replaced instances, then the live one, then the record
    async fn destroy_record(self: &Arc<Self>, mut record: StateRecord) -> Result<()> {
        self.delete_replaced(&mut record).await?;
        let fqn = record.fqn.clone();
        let identity = record.identity();
        self.delete_instance(
            identity,
            record.props,
            record.output,
            record.data,
            record.local,
            false,
        )
        .await?;
        self.store.delete(&fqn).await.map_err(Error::State)
    }

    /// Wait until every declared resource (including ones declared while
    /// waiting) has settled
    pub async fn settle(&self) {
        loop {
            let handles: Vec<ResourceHandle> = lock(&self.inflight).values().cloned().collect();
            join_all(handles.iter().map(ResourceHandle::settled)).await;
            if lock(&self.inflight).len() == handles.len() {
                break;
            }
        }
    }

    /// Delete instances superseded by replacements during this run
    pub async fn delete_pending_replaced(self: &Arc<Self>) {
        let pending = std::mem::take(&mut *lock(&self.pending_replaced));
        for fqn in pending {
            let outcome = async {
                match self.load(&fqn).await? {
                    Some(mut record) => self.delete_replaced(&mut record).await,
                    None => Ok(()),
                }
            }
            .await;
            if let Err(error) = outcome {
                self.fail(&fqn, &error);
            }
        }
    }

    /// Recorded FQNs whose record matches `target`, plus everything nested under them
    pub async fn matching(&self, target: &DestroyTarget) -> Result<BTreeSet<Fqn>> {
        let mut matched = BTreeSet::new();
        for fqn in &self.prior {
            if let Some(record) = self.load(fqn).await?
                && target.matches(&record.kind, &record.id)
            {
                matched.insert(fqn.clone());
            }
        }
        let nested: Vec<Fqn> = self
            .prior
            .iter()
            .filter(|fqn| matched.iter().any(|m| fqn.is_descendant_of(m)))
            .cloned()
            .collect();
        matched.extend(nested);
        Ok(matched)
    }

    /// Delete the records of `fqns` in dependency order
    ///
    /// Failed deletions skip whatever is hard-blocked on them; unrelated
    /// deletions still run. Only fatal errors are returned.
    pub async fn destroy(self: &Arc<Self>, fqns: &BTreeSet<Fqn>) -> Result<()> {
        let mut records = BTreeMap::new();
        for fqn in fqns {
            match self.load(fqn).await {
                Ok(Some(record)) => {
                    records.insert(fqn.clone(), record);
                }
                Ok(None) => {}
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => self.fail(fqn, &error),
            }
        }
        if records.is_empty() {
            return Ok(());
        }

        let listed: Vec<StateRecord> = records.values().cloned().collect();
        for (kind, group) in group_by_kind(&listed) {
            log::info!("deleting {} {kind} resource(s)", group.len());
        }

        let plan = DestroyPlan::build(
            records.values().map(PlanNode::from).collect(),
            |owner| self.strategy_for(owner, &records),
        );
        if let Err(error) = plan.ensure_acyclic() {
            for fqn in plan.cyclic() {
                self.fail(fqn, &error);
            }
        }

        // Failed or skipped deletions
        let mut blocked = BTreeSet::new();
        for layer in plan.layers() {
            let mut runnable = Vec::new();
            for fqn in layer {
                if let Some(blocker) = plan.blockers(fqn).find(|b| blocked.contains(*b)) {
                    let reason = Error::Blocked {
                        fqn: fqn.clone(),
                        blocker: blocker.clone(),
                    }
                    .to_string();
                    log::warn!("{reason}");
                    self.record(fqn, ApplyResult::Skipped { reason });
                    blocked.insert(fqn.clone());
                } else if let Some(record) = records.remove(fqn) {
                    runnable.push(record);
                }
            }

            let outcomes = join_all(runnable.into_iter().map(|record| {
                let fqn = record.fqn.clone();
                self.destroy_record(record).map(|outcome| (fqn, outcome))
            }))
            .await;

            for (fqn, outcome) in outcomes {
                match outcome {
                    Ok(()) => {
                        log::info!("{fqn}: deleted");
                        self.record(&fqn, ApplyResult::Deleted);
                    }
                    Err(error) => {
                        self.fail(&fqn, &error);
                        blocked.insert(fqn);
                    }
                }
            }
        }
        Ok(())
    }

    fn strategy_for(&self, owner: &Fqn, records: &BTreeMap<Fqn, StateRecord>) -> DestroyStrategy {
        let kind = records.get(owner).map(|r| r.kind.clone()).or_else(|| {
            lock(&self.inflight)
                .get(owner)
                .map(|h| h.identity().kind.clone())
        });
        kind.and_then(|kind| self.registry.strategy(&kind))
            .unwrap_or(self.options.default_strategy)
    }

    /// Abort spawned reconciliations and run shutdown cleanups
    pub async fn halt(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let failures = self.shutdown.shutdown().await;
        if !failures.is_empty() {
            log::warn!("{} cleanup(s) failed during shutdown", failures.len());
        }
    }

    /// Drop handles so nothing keeps the run alive after it ends
    pub fn release(&self) {
        lock(&self.inflight).clear();
        lock(&self.tasks).clear();
    }

    fn missing_key(&self) -> Error {
        Error::Secret(secretkit::Error::MissingKey {
            stage: self.stage.to_string(),
        })
    }

    async fn load(&self, fqn: &Fqn) -> Result<Option<StateRecord>> {
        let Some(mut record) = self.store.get(fqn).await.map_err(Error::State)? else {
            return Ok(None);
        };
        match &self.vault {
            Some(vault) => {
                for value in secret_values(&mut record) {
                    *value = vault.open_value(value)?;
                }
            }
            None if secret_values(&mut record).any(|v| contains_secrets(v)) => {
                return Err(self.missing_key());
            }
            None => {}
        }
        Ok(Some(record))
    }

    async fn save(&self, record: &StateRecord) -> Result<()> {
        let mut sealed = record.clone();
        match &self.vault {
            Some(vault) => {
                for value in secret_values(&mut sealed) {
                    *value = vault.seal_value(value)?;
                }
            }
            None if secret_values(&mut sealed).any(|v| contains_secrets(v)) => {
                return Err(self.missing_key());
            }
            None => {}
        }
        self.store
            .put(&sealed.fqn, &sealed)
            .await
            .map_err(Error::State)?;
        if !record.replaced.is_empty() {
            lock(&self.pending_replaced).insert(record.fqn.clone());
        }
        Ok(())
    }
}

/// Every value of a record that may carry secret markers
fn secret_values(record: &mut StateRecord) -> impl Iterator<Item = &mut Value> {
    let StateRecord {
        props,
        output,
        data,
        replaced,
        ..
    } = record;
    std::iter::once(props)
        .chain(std::iter::once(output))
        .chain(data.values_mut())
        .chain(replaced.iter_mut().flat_map(
            |ReplacedInstance {
                 props, output, data, ..
             }| {
                std::iter::once(props)
                    .chain(std::iter::once(output))
                    .chain(data.values_mut())
            },
        ))
}
