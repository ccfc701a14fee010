//! Engine entry points: building an engine, running programs, tearing down stages

use secretkit::Vault;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::diff::compute_orphans;
use crate::error::{Error, Result};
use crate::executor::RunState;
use crate::planner::DestroyTarget;
use crate::resource::{HandlerRegistry, ResourceHandler};
use crate::scope::Scope;
use crate::shutdown::ShutdownCoordinator;
use crate::state::StateStore;
use crate::types::{Fqn, RunMode, RunOptions, RunReport, Stage};

/// Registered handlers plus the state store and vault they run against
pub struct Engine {
    store: Arc<dyn StateStore>,
    vault: Option<Arc<Vault>>,
    registry: Arc<HandlerRegistry>,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    store: Arc<dyn StateStore>,
    vault: Option<Arc<Vault>>,
    registry: HandlerRegistry,
    error: Option<Error>,
}

impl EngineBuilder {
    /// Encrypt secrets at rest with `vault`
    pub fn vault(mut self, vault: Vault) -> Self {
        self.vault = Some(Arc::new(vault));
        self
    }

    /// Register the handler for `H::KIND`
    pub fn handler<H: ResourceHandler>(mut self, handler: H) -> Self {
        if self.error.is_none()
            && let Err(e) = self.registry.register(handler)
        {
            self.error = Some(e);
        }
        self
    }

    /// Finish building; fails if a handler registration was rejected
    pub fn build(self) -> Result<Engine> {
        if let Some(e) = self.error {
            return Err(e);
        }
        log::debug!(
            "engine ready with {} handler(s): {}",
            self.registry.kinds().count(),
            self.registry.kinds().collect::<Vec<_>>().join(", ")
        );
        Ok(Engine {
            store: self.store,
            vault: self.vault,
            registry: Arc::new(self.registry),
        })
    }
}

impl Engine {
    /// Start building an engine over `store`
    pub fn builder(store: Arc<dyn StateStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            vault: None,
            registry: HandlerRegistry::default(),
            error: None,
        }
    }

    /// The state store runs read and write
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Begin a reconciling run
    pub async fn begin(&self, stage: Stage) -> Result<Run> {
        self.begin_with(stage, RunOptions::default()).await
    }

    /// Begin a run with explicit options
    pub async fn begin_with(&self, stage: Stage, options: RunOptions) -> Result<Run> {
        if let Some(vault) = &self.vault {
            vault.ensure_stage(&stage.to_string())?;
        }
        let prior = self.store.list_all(&stage).await.map_err(Error::State)?;
        log::info!(
            "starting {:?} run for {stage} with {} resource(s) on record",
            options.mode,
            prior.len()
        );

        let state = RunState::new(
            stage,
            options,
            Arc::clone(&self.store),
            self.vault.clone(),
            Arc::clone(&self.registry),
            prior,
        );
        let root = Scope::open(&state, state.stage.root_fqn(), state.options.local);
        Ok(Run { state, root })
    }

    /// Delete every resource recorded for `stage`
    pub async fn destroy(&self, stage: Stage) -> Result<RunReport> {
        self.begin(stage).await?.finish().await
    }

    /// Delete the resources matching `target`, and anything nested under them
    pub async fn destroy_matching(&self, stage: Stage, target: &DestroyTarget) -> Result<RunReport> {
        let run = self.begin(stage).await?;
        run.root.close().await;
        let selected = run.state.matching(target).await?;
        log::info!("{} resource(s) match {target:?}", selected.len());
        run.teardown(&selected).await?;
        run.conclude()
    }
}

/// One execution of a program against a stage
///
/// Declare resources through [`Run::root`], then call [`Run::finish`] to
/// settle them and delete orphans, or [`Run::abort`] to stop.
pub struct Run {
    state: Arc<RunState>,
    root: Scope,
}

impl Run {
    /// The stage's root scope
    pub fn root(&self) -> &Scope {
        &self.root
    }

    pub fn stage(&self) -> &Stage {
        &self.state.stage
    }

    pub fn options(&self) -> &RunOptions {
        &self.state.options
    }

    /// Cleanups registered here run when the run is aborted
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.state.shutdown
    }

    /// FQNs that were on record when the run began
    pub fn prior_fqns(&self) -> &BTreeSet<Fqn> {
        &self.state.prior
    }

    /// Settle every declaration, then delete replaced and orphaned resources
    ///
    /// Nothing is deleted when a scope was left open or a fatal error
    /// happened; the run is aborted instead.
    pub async fn finish(self) -> Result<RunReport> {
        self.root.close().await;
        self.state.settle().await;

        if let Some(fqn) = self.state.unclosed_scope() {
            self.state.halt().await;
            self.state.release();
            return Err(Error::ScopeNotClosed(fqn));
        }
        self.check_fatal().await?;

        if self.state.options.mode == RunMode::Up {
            self.state.delete_pending_replaced().await;
            let orphans = compute_orphans(
                &self.state.prior,
                &self.state.touched(),
                &self.state.failed(),
            );
            if !orphans.is_empty() {
                log::info!("{} orphaned resource(s) in {}", orphans.len(), self.state.stage);
            }
            self.teardown(&orphans).await?;
        }

        self.conclude()
    }

    /// Stop the run: cancel pending reconciliations and run shutdown cleanups
    pub async fn abort(self) -> RunReport {
        log::warn!("aborting run for {}", self.state.stage);
        self.state.halt().await;
        let report = self.state.report();
        self.state.release();
        report
    }

    async fn teardown(&self, fqns: &BTreeSet<Fqn>) -> Result<()> {
        if let Err(e) = self.state.destroy(fqns).await {
            self.state.halt().await;
            self.state.release();
            return Err(e);
        }
        self.check_fatal().await
    }

    async fn check_fatal(&self) -> Result<()> {
        match self.state.fatal() {
            Some(reason) => {
                self.state.halt().await;
                self.state.release();
                Err(Error::Aborted(reason))
            }
            None => Ok(()),
        }
    }

    fn conclude(self) -> Result<RunReport> {
        let report = self.state.report();
        self.state.release();
        let summary = &report.summary;
        log::info!(
            "{}: {} created, {} updated, {} replaced, {} deleted, {} failed",
            report.stage,
            summary.created,
            summary.updated,
            summary.replaced,
            summary.deleted,
            summary.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::state::MemoryStateStore;
    use crate::test_support::demo::{
        Group, GroupProps, ParallelGroup, Peer, Recorder, Rogue, Thing, ThingOutput, ThingProps,
    };
    use crate::types::{ApplyResult, DestroyStrategy, Phase};
    use std::time::Duration;
    use tokio::sync::Barrier;

    struct Harness {
        store: Arc<MemoryStateStore>,
        recorder: Arc<Recorder>,
        engine: Engine,
    }

    fn harness() -> Harness {
        harness_with(None)
    }

    fn harness_with(vault: Option<Vault>) -> Harness {
        let store = Arc::new(MemoryStateStore::new());
        let recorder = Arc::new(Recorder::default());
        let mut builder = Engine::builder(store.clone())
            .handler(Thing(recorder.clone()))
            .handler(Group(recorder.clone()))
            .handler(ParallelGroup(recorder.clone()))
            .handler(Peer(recorder.clone()))
            .handler(Rogue);
        if let Some(vault) = vault {
            builder = builder.vault(vault);
        }
        Harness {
            store,
            recorder,
            engine: builder.build().unwrap(),
        }
    }

    fn stage() -> Stage {
        Stage::new("app", "dev").unwrap()
    }

    fn fqn(path: &str) -> Fqn {
        Fqn::from(format!("app/dev/{path}"))
    }

    async fn declare_things(engine: &Engine, ids: &[&str]) -> RunReport {
        let run = engine.begin(stage()).await.unwrap();
        for id in ids {
            run.root()
                .resource::<Thing>(id, ThingProps::named(id))
                .await
                .unwrap();
        }
        run.finish().await.unwrap()
    }

    #[tokio::test]
    async fn test_create_update_delete_lifecycle() {
        let h = harness();

        // Run 1: create
        let run = h.engine.begin(stage()).await.unwrap();
        let x = run
            .root()
            .resource::<Thing>("x", ThingProps::named("a"))
            .await
            .unwrap();
        assert_eq!(
            *x,
            ThingOutput {
                name: "a".into(),
                id: "generated-1".into()
            }
        );
        let report = run.finish().await.unwrap();
        assert_eq!(report.result_for(&fqn("x")), Some(&ApplyResult::Created));
        assert_eq!(h.recorder.phases_for("x"), vec![Phase::Create]);

        // Run 2: update sees the prior output
        let run = h.engine.begin(stage()).await.unwrap();
        let x = run
            .root()
            .resource::<Thing>("x", ThingProps::named("b"))
            .await
            .unwrap();
        assert_eq!(x.name, "b");
        assert_eq!(x.id, "generated-1");
        run.finish().await.unwrap();

        let update = h.recorder.last_for("x").unwrap();
        assert_eq!(update.phase, Phase::Update);
        assert_eq!(update.prior_name.as_deref(), Some("a"));

        // Run 3: removed from the program, so deleted
        let report = h.engine.begin(stage()).await.unwrap().finish().await.unwrap();
        assert_eq!(report.result_for(&fqn("x")), Some(&ApplyResult::Deleted));
        assert_eq!(
            h.recorder.phases_for("x"),
            vec![Phase::Create, Phase::Update, Phase::Delete]
        );
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let h = harness();
        declare_things(&h.engine, &["a", "b"]).await;
        let first = h.store.snapshot();

        let report = declare_things(&h.engine, &["a", "b"]).await;
        assert_eq!(report.summary.updated, 2);
        assert_eq!(report.summary.created + report.summary.deleted, 0);
        assert_eq!(h.store.snapshot(), first);
    }

    #[tokio::test]
    async fn test_same_fqn_shares_one_invocation() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();

        let first = run.root().resource::<Thing>("x", ThingProps::named("a"));
        let second = run.root().resource::<Thing>("x", ThingProps::named("a"));
        let (first, second) = futures::join!(first, second);
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(run.root().resources().len(), 1);

        let conflict = run
            .root()
            .resource::<Group>("x", GroupProps::default())
            .await;
        assert!(matches!(conflict, Err(Error::KindConflict { .. })));

        run.finish().await.unwrap();
        assert_eq!(h.recorder.phases_for("x"), vec![Phase::Create]);
    }

    #[tokio::test]
    async fn test_orphans_are_deleted() {
        let h = harness();
        declare_things(&h.engine, &["a", "b", "c"]).await;

        let report = declare_things(&h.engine, &["a"]).await;
        assert_eq!(report.summary.deleted, 2);
        assert_eq!(h.store.len(), 1);
        assert!(h.store.snapshot().contains_key(&fqn("a")));
    }

    #[tokio::test]
    async fn test_replace_creates_before_deleting() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<Thing>("x", ThingProps::named("a").in_region("eu"))
            .await
            .unwrap();
        run.finish().await.unwrap();

        let run = h.engine.begin(stage()).await.unwrap();
        let x = run
            .root()
            .resource::<Thing>("x", ThingProps::named("a").in_region("us"))
            .await
            .unwrap();
        assert_eq!(x.id, "generated-2");
        let report = run.finish().await.unwrap();

        assert_eq!(report.result_for(&fqn("x")), Some(&ApplyResult::Replaced));
        let events: Vec<_> = h
            .recorder
            .events_for("x")
            .into_iter()
            .map(|e| (e.phase, e.replacing))
            .collect();
        assert_eq!(
            events,
            vec![
                (Phase::Create, false),
                (Phase::Update, false),
                (Phase::Create, true),
                (Phase::Delete, true),
            ]
        );
        // The deleted instance was the old one
        assert_eq!(
            h.recorder.last_for("x").unwrap().prior_id.as_deref(),
            Some("generated-1")
        );

        let record = &h.store.snapshot()[&fqn("x")];
        assert!(record.replaced.is_empty());
        assert_eq!(record.output["id"], "generated-2");
    }

    #[tokio::test]
    async fn test_failed_replacement_keeps_old_instance() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<Thing>("x", ThingProps::named("a").in_region("eu"))
            .await
            .unwrap();
        run.finish().await.unwrap();
        let before = h.store.snapshot();

        h.recorder.fail_on(Phase::Create, "x");
        let run = h.engine.begin(stage()).await.unwrap();
        let result = run
            .root()
            .resource::<Thing>("x", ThingProps::named("a").in_region("us"))
            .await;
        assert!(matches!(result, Err(Error::Resource { .. })));
        let report = run.finish().await.unwrap();

        assert!(matches!(
            report.result_for(&fqn("x")),
            Some(ApplyResult::Failed { .. })
        ));
        assert!(!h.recorder.phases_for("x").contains(&Phase::Delete));
        assert_eq!(h.store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_delete_before_create_replacement() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<Thing>("x", ThingProps::named("a").in_region("eu").delete_first())
            .await
            .unwrap();
        run.finish().await.unwrap();

        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<Thing>("x", ThingProps::named("a").in_region("us").delete_first())
            .await
            .unwrap();
        run.finish().await.unwrap();

        assert_eq!(
            h.recorder.phases_for("x"),
            vec![Phase::Create, Phase::Update, Phase::Delete, Phase::Create]
        );
        assert_eq!(h.store.snapshot()[&fqn("x")].output["id"], "generated-2");
    }

    #[tokio::test]
    async fn test_sequential_children_destroyed_newest_first() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let group = run
            .root()
            .resource::<Group>("g", GroupProps::children(&["A", "B", "C"]))
            .await
            .unwrap();
        assert_eq!(group.count, 3);
        assert_eq!(h.store.len(), 4);
        run.finish().await.unwrap();

        h.engine.begin(stage()).await.unwrap().finish().await.unwrap();

        let deletions: Vec<String> = h
            .recorder
            .events()
            .into_iter()
            .filter(|e| e.phase == Phase::Delete)
            .map(|e| e.id)
            .collect();
        assert_eq!(deletions, vec!["C", "B", "A", "g"]);
        assert_eq!(h.recorder.max_concurrent_deletes(), 1);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_parallel_children_destroyed_concurrently() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<ParallelGroup>("g", GroupProps::children(&["A", "B", "C"]))
            .await
            .unwrap();
        run.finish().await.unwrap();

        h.engine.begin(stage()).await.unwrap().finish().await.unwrap();

        assert_eq!(h.recorder.max_concurrent_deletes(), 3);
        let deletions: Vec<String> = h
            .recorder
            .events()
            .into_iter()
            .filter(|e| e.phase == Phase::Delete)
            .map(|e| e.id)
            .collect();
        assert_eq!(deletions.last().map(String::as_str), Some("g"));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_dependents_deleted_first_and_failures_block() {
        let h = harness();
        let options = RunOptions {
            default_strategy: DestroyStrategy::Parallel,
            ..Default::default()
        };

        let run = h.engine.begin_with(stage(), options.clone()).await.unwrap();
        let db = run
            .root()
            .resource::<Thing>("db", ThingProps::named("db"))
            .await
            .unwrap();
        run.root()
            .resource_with_deps::<Thing>("api", ThingProps::named("api"), &[db.identity()])
            .await
            .unwrap();
        run.root()
            .resource::<Thing>("cache", ThingProps::named("cache"))
            .await
            .unwrap();
        run.finish().await.unwrap();
        assert_eq!(
            h.store.snapshot()[&fqn("api")].dependencies,
            vec![fqn("db")]
        );

        // api cannot be deleted, so db must stay; cache is unrelated
        h.recorder.fail_on(Phase::Delete, "api");
        let report = h
            .engine
            .begin_with(stage(), options.clone())
            .await
            .unwrap()
            .finish()
            .await
            .unwrap();
        assert!(matches!(
            report.result_for(&fqn("api")),
            Some(ApplyResult::Failed { .. })
        ));
        assert!(matches!(
            report.result_for(&fqn("db")),
            Some(ApplyResult::Skipped { .. })
        ));
        assert_eq!(report.result_for(&fqn("cache")), Some(&ApplyResult::Deleted));
        assert_eq!(h.store.len(), 2);

        // Once api deletes cleanly, db follows it
        h.recorder.clear_failures();
        h.engine
            .begin_with(stage(), options)
            .await
            .unwrap()
            .finish()
            .await
            .unwrap();
        let deletions: Vec<String> = h
            .recorder
            .events()
            .into_iter()
            .filter(|e| e.phase == Phase::Delete && e.id != "cache")
            .map(|e| e.id)
            .collect();
        assert_eq!(deletions, vec!["api", "api", "db"]);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_contract_violation_aborts_run() {
        let h = harness();
        declare_things(&h.engine, &["keep"]).await;

        let run = h.engine.begin(stage()).await.unwrap();
        let cleaned = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = cleaned.clone();
        run.shutdown().register("dev-server", move || async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            anyhow::Ok(())
        });

        let rogue = run.root().resource::<Rogue>("r", "destroy_on_create".into()).await;
        let error = rogue.unwrap_err();
        assert!(error.is_fatal());
        assert!(error.to_string().contains("destroy() may only be called during delete"));

        let finished = run.finish().await;
        assert!(matches!(finished, Err(Error::Aborted(_))));
        assert!(cleaned.load(std::sync::atomic::Ordering::SeqCst));
        // The orphan pass never ran
        assert!(h.store.snapshot().contains_key(&fqn("keep")));
    }

    #[tokio::test]
    async fn test_sealing_for_another_fqn_is_a_violation() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let error = run
            .root()
            .resource::<Rogue>("r", "wrong_id".into())
            .await
            .unwrap_err();
        assert!(error.is_fatal());
        assert!(run.finish().await.is_err());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_replace_during_create_is_a_violation() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let error = run
            .root()
            .resource::<Rogue>("r", "replace_on_create".into())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("expected a sealed output"));
        assert!(run.finish().await.is_err());
    }

    #[tokio::test]
    async fn test_unclosed_scope_prevents_deletion() {
        let h = harness();
        declare_things(&h.engine, &["a", "b"]).await;

        let run = h.engine.begin(stage()).await.unwrap();
        let api = run.root().enter_scope("api").unwrap();
        api.resource::<Thing>("a", ThingProps::named("a")).await.unwrap();

        let finished = run.finish().await;
        assert!(matches!(finished, Err(Error::ScopeNotClosed(f)) if f == fqn("api")));
        assert!(h.store.snapshot().contains_key(&fqn("a")));
        assert!(h.store.snapshot().contains_key(&fqn("b")));
    }

    #[tokio::test]
    async fn test_scoped_nesting() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let output = run
            .root()
            .scoped("api", |scope| async move {
                let db = scope.resource::<Thing>("db", ThingProps::named("db")).await?;
                Ok::<_, Error>(db.into_output())
            })
            .await
            .unwrap();
        assert_eq!(output.name, "db");
        run.finish().await.unwrap();
        assert!(h.store.snapshot().contains_key(&fqn("api/db")));
    }

    #[tokio::test]
    async fn test_handler_failure_is_attributed() {
        let h = harness();
        h.recorder.fail_on(Phase::Create, "b");

        let run = h.engine.begin(stage()).await.unwrap();
        let a = run.root().resource::<Thing>("a", ThingProps::named("a"));
        let b = run.root().resource::<Thing>("b", ThingProps::named("b"));
        let (a, b) = futures::join!(a, b);
        assert!(a.is_ok());
        let error = b.unwrap_err();
        assert!(!error.is_fatal());
        assert!(error.to_string().contains("injected failure"));

        let report = run.finish().await.unwrap();
        assert_eq!(report.summary.created, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.failures().next().map(|(f, _)| f), Some(&fqn("b")));
        assert!(!h.store.snapshot().contains_key(&fqn("b")));
    }

    #[tokio::test]
    async fn test_secrets_encrypted_at_rest() {
        let vault = Vault::from_key(Vault::generate_key(), "app/dev");
        let h = harness_with(Some(vault));

        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<Thing>("x", ThingProps::named("a").with_token("hunter2"))
            .await
            .unwrap();
        run.finish().await.unwrap();

        let stored = serde_json::to_string(&h.store.snapshot()[&fqn("x")]).unwrap();
        assert!(stored.contains(secretkit::SECRET_MARKER));
        assert!(!stored.contains("hunter2"));

        // The next run reads it back and hands the handler plaintext
        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<Thing>("x", ThingProps::named("a").with_token("hunter2"))
            .await
            .unwrap();
        let report = run.finish().await.unwrap();
        assert_eq!(report.result_for(&fqn("x")), Some(&ApplyResult::Updated));
        assert_eq!(
            h.recorder.last_for("x").unwrap().prior_token.as_deref(),
            Some("hunter2")
        );
    }

    #[tokio::test]
    async fn test_secrets_without_vault_are_fatal() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let result = run
            .root()
            .resource::<Thing>("x", ThingProps::named("a").with_token("hunter2"))
            .await;
        assert!(result.unwrap_err().is_fatal());
        assert!(matches!(run.finish().await, Err(Error::Aborted(_))));
        // Refused before the handler ran
        assert!(h.recorder.events().is_empty());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_vault_stage_must_match() {
        let vault = Vault::from_key(Vault::generate_key(), "app/prod");
        let h = harness_with(Some(vault));
        assert!(matches!(
            h.engine.begin(stage()).await,
            Err(Error::Secret(secretkit::Error::StageMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_kind_change_replaces() {
        let h = harness();
        declare_things(&h.engine, &["x"]).await;

        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<Group>("x", GroupProps::default())
            .await
            .unwrap();
        let report = run.finish().await.unwrap();

        assert_eq!(report.result_for(&fqn("x")), Some(&ApplyResult::Replaced));
        let events = h.recorder.events_for("x");
        let kinds: Vec<_> = events.iter().map(|e| (e.kind.as_str(), e.phase)).collect();
        assert_eq!(
            kinds,
            vec![
                ("demo::Thing", Phase::Create),
                ("demo::Group", Phase::Create),
                ("demo::Thing", Phase::Delete),
            ]
        );
        let record = &h.store.snapshot()[&fqn("x")];
        assert_eq!(record.kind, "demo::Group");
        assert!(record.replaced.is_empty());
    }

    #[tokio::test]
    async fn test_read_mode_returns_stored_outputs() {
        let h = harness();
        declare_things(&h.engine, &["a", "b"]).await;
        let events_before = h.recorder.events().len();

        let options = RunOptions {
            mode: RunMode::Read,
            ..Default::default()
        };
        let run = h.engine.begin_with(stage(), options).await.unwrap();
        let a: Resource<ThingOutput> = run
            .root()
            .resource::<Thing>("a", ThingProps::named("ignored"))
            .await
            .unwrap();
        assert_eq!(a.name, "a");
        let missing = run
            .root()
            .resource::<Thing>("zz", ThingProps::named("zz"))
            .await;
        assert!(missing.is_err());
        let report = run.finish().await.unwrap();

        assert_eq!(report.summary.read, 1);
        assert_eq!(report.summary.deleted, 0);
        assert_eq!(h.recorder.events().len(), events_before);
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test]
    async fn test_deferred_tasks_run_on_close() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let scope = run.root().enter_scope("site").unwrap();

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let deferred = scope
            .defer(async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                42
            })
            .unwrap();
        tokio::task::yield_now().await;
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));

        scope.close().await;
        assert_eq!(deferred.await.unwrap(), 42);
        assert!(matches!(
            scope.defer(async {}),
            Err(Error::ScopeClosed(_))
        ));
        assert!(matches!(
            scope.enter_scope("late"),
            Err(Error::ScopeClosed(_))
        ));
        run.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_stage() {
        let h = harness();
        declare_things(&h.engine, &["a", "b"]).await;

        let report = h.engine.destroy(stage()).await.unwrap();
        assert_eq!(report.summary.deleted, 2);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_matching_target() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<Thing>("a", ThingProps::named("a"))
            .await
            .unwrap();
        run.root()
            .resource::<Group>("g", GroupProps::children(&["x"]))
            .await
            .unwrap();
        run.finish().await.unwrap();
        assert_eq!(h.store.len(), 3);

        let report = h
            .engine
            .destroy_matching(stage(), &DestroyTarget::parse("demo::Group.g"))
            .await
            .unwrap();
        assert_eq!(report.summary.deleted, 2);
        assert_eq!(h.store.len(), 1);
        assert!(h.store.snapshot().contains_key(&fqn("a")));
    }

    #[tokio::test]
    async fn test_abort_runs_cleanups() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let cleaned = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = cleaned.clone();
        run.shutdown().register("tunnel", move || async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            anyhow::Ok(())
        });

        let report = run.abort().await;
        assert!(report.results.is_empty());
        assert!(cleaned.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_duplicate_handler_rejected() {
        let recorder = Arc::new(Recorder::default());
        let result = Engine::builder(Arc::new(MemoryStateStore::new()))
            .handler(Thing(recorder.clone()))
            .handler(Thing(recorder))
            .build();
        assert!(matches!(result, Err(Error::DuplicateKind(kind)) if kind == "demo::Thing"));
    }

    #[tokio::test]
    async fn test_unknown_kind_and_invalid_id() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let engine = Engine::builder(store).build().unwrap();
        let run = engine.begin(stage()).await.unwrap();
        let result = run
            .root()
            .resource::<Thing>("a", ThingProps::named("a"))
            .await;
        assert!(matches!(result, Err(Error::UnknownKind(_))));

        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let result = run
            .root()
            .resource::<Thing>("a/b", ThingProps::named("a"))
            .await;
        assert!(matches!(result, Err(Error::InvalidName { .. })));
        run.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_owner_keeps_nested_resources() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<Group>("g", GroupProps::children(&["A", "B"]))
            .await
            .unwrap();
        run.finish().await.unwrap();
        let before = h.store.snapshot();
        assert_eq!(before.len(), 3);

        // g fails before it re-declares its children
        h.recorder.fail_on(Phase::Update, "g");
        let run = h.engine.begin(stage()).await.unwrap();
        let group = run
            .root()
            .resource::<Group>("g", GroupProps::children(&["A", "B"]))
            .await;
        assert!(group.is_err());
        let report = run.finish().await.unwrap();

        assert!(matches!(
            report.result_for(&fqn("g")),
            Some(ApplyResult::Failed { .. })
        ));
        assert_eq!(report.result_for(&fqn("g/A")), None);
        assert_eq!(report.result_for(&fqn("g/B")), None);
        assert_eq!(report.summary.deleted, 0);
        assert_eq!(h.store.snapshot(), before);

        // The next run picks up where it left off
        h.recorder.clear_failures();
        let run = h.engine.begin(stage()).await.unwrap();
        run.root()
            .resource::<Group>("g", GroupProps::children(&["A", "B"]))
            .await
            .unwrap();
        let report = run.finish().await.unwrap();
        assert_eq!(report.summary.updated, 3);
        assert_eq!(h.recorder.phases_for("A"), vec![Phase::Create, Phase::Update]);
        assert_eq!(h.store.len(), 3);
    }

    #[tokio::test]
    async fn test_deferred_task_sees_every_sibling() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let site = run.root().enter_scope("site").unwrap();

        let a = site.resource::<Peer>("a", ());
        let b = site.resource::<Peer>("b", ());
        let c = site.resource::<Thing>("c", ThingProps::named("c"));

        // Both peers have deferred their lookup; nothing has resolved yet
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.recorder.events().iter().filter(|e| e.kind == "demo::Peer").count() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        site.close().await;
        let (a, b, c) = futures::join!(a, b, c);
        let expected = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(a.unwrap().siblings, expected);
        assert_eq!(b.unwrap().siblings, expected);
        assert_eq!(c.unwrap().name, "c");

        run.finish().await.unwrap();
        assert_eq!(h.store.snapshot()[&fqn("site/a")].output["siblings"][2], "c");
    }

    #[tokio::test]
    async fn test_defer_on_own_scope_fails_instead_of_hanging() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run.root().resource::<Rogue>("r", "defer_in_own_scope".into()),
        )
        .await
        .expect("deferred await inside the handler must not hang");

        let error = result.unwrap_err();
        assert!(!error.is_fatal());
        assert!(format!("{error:#}").contains("cannot run before its handler returns"));
        run.finish().await.unwrap();
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_deferred_tasks_run_concurrently() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let left = run.root().enter_scope("left").unwrap();
        let right = run.root().enter_scope("right").unwrap();

        // Each task only finishes once all four have started
        let barrier = Arc::new(Barrier::new(4));
        let mut pending = Vec::new();
        for scope in [&left, &left, &right, &right] {
            let barrier = barrier.clone();
            pending.push(
                scope
                    .defer(async move {
                        barrier.wait().await;
                    })
                    .unwrap(),
            );
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            futures::join!(left.close(), right.close());
        })
        .await
        .unwrap();
        for deferred in pending {
            deferred.await.unwrap();
        }
        run.finish().await.unwrap();
    }

    #[test]
    fn test_runs_without_a_runtime() {
        let h = harness();
        futures::executor::block_on(async {
            let run = h.engine.begin(stage()).await.unwrap();
            let group = run
                .root()
                .resource::<Group>("g", GroupProps::children(&["A", "B"]))
                .await
                .unwrap();
            assert_eq!(group.count, 2);

            // Never awaited by the program; settled when the run finishes
            let _unawaited = run.root().resource::<Thing>("x", ThingProps::named("x"));
            let report = run.finish().await.unwrap();
            assert_eq!(report.summary.created, 4);
        });
        assert_eq!(h.store.len(), 4);
        assert_eq!(h.recorder.phases_for("x"), vec![Phase::Create]);
    }

    #[tokio::test]
    async fn test_local_flag_survives_into_deletion() {
        let h = harness();
        let declare = |region: &'static str| {
            let engine = &h.engine;
            async move {
                let run = engine.begin(stage()).await.unwrap();
                let emulated = run.root().enter_local_scope("emu").unwrap();
                emulated
                    .resource::<Thing>("x", ThingProps::named("x").in_region(region))
                    .await
                    .unwrap();
                emulated.close().await;
                run.finish().await.unwrap()
            }
        };

        declare("eu").await;
        assert!(h.store.snapshot()[&fqn("emu/x")].local);

        // Region change: the replaced instance is deleted locally too
        let report = declare("us").await;
        assert_eq!(report.result_for(&fqn("emu/x")), Some(&ApplyResult::Replaced));

        // Dropped from the program: the orphan is deleted locally
        h.engine.begin(stage()).await.unwrap().finish().await.unwrap();
        assert!(h.store.is_empty());

        let events = h.recorder.events_for("x");
        let phases: Vec<_> = events.iter().map(|e| (e.phase, e.replacing)).collect();
        assert_eq!(
            phases,
            vec![
                (Phase::Create, false),
                (Phase::Update, false),
                (Phase::Create, true),
                (Phase::Delete, true),
                (Phase::Delete, false),
            ]
        );
        assert!(events.iter().all(|e| e.local));
    }

    #[tokio::test]
    async fn test_identity_travels_beside_output() {
        let h = harness();
        let run = h.engine.begin(stage()).await.unwrap();
        let x = run
            .root()
            .resource::<Thing>("x", ThingProps::named("a"))
            .await
            .unwrap();
        run.finish().await.unwrap();

        assert_eq!(x.identity().kind, "demo::Thing");
        assert_eq!(x.identity().id, "x");
        assert_eq!(x.fqn(), &fqn("x"));

        let record = &h.store.snapshot()[&fqn("x")];
        assert_eq!(record.identity(), *x.identity());
        // The stored output is exactly what the handler sealed
        assert_eq!(record.output, serde_json::to_value(x.into_output()).unwrap());
    }
}
