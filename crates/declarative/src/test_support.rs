//! Recording demo handlers for lifecycle tests

pub(crate) mod demo {
    use async_trait::async_trait;
    use futures::future::join_all;
    use secretkit::Secret;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::context::Context;
    use crate::resource::{HandlerOutcome, ResourceHandler};
    use crate::types::{DestroyStrategy, Phase, ReplaceMode};

    /// One handler invocation as seen by the handler
    #[derive(Debug, Clone, PartialEq)]
    pub struct Event {
        pub kind: String,
        pub id: String,
        pub phase: Phase,
        pub replacing: bool,
        pub local: bool,
        pub prior_name: Option<String>,
        pub prior_id: Option<String>,
        pub prior_token: Option<String>,
    }

    /// Shared log of invocations plus failure injection
    #[derive(Debug, Default)]
    pub struct Recorder {
        events: Mutex<Vec<Event>>,
        failures: Mutex<Vec<(Phase, String)>>,
        next_id: AtomicUsize,
        active_deletes: AtomicUsize,
        max_deletes: AtomicUsize,
    }

    impl Recorder {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub fn events_for(&self, id: &str) -> Vec<Event> {
            self.events().into_iter().filter(|e| e.id == id).collect()
        }

        pub fn phases_for(&self, id: &str) -> Vec<Phase> {
            self.events_for(id).into_iter().map(|e| e.phase).collect()
        }

        pub fn last_for(&self, id: &str) -> Option<Event> {
            self.events_for(id).pop()
        }

        pub fn fail_on(&self, phase: Phase, id: &str) {
            self.failures.lock().unwrap().push((phase, id.to_string()));
        }

        pub fn clear_failures(&self) {
            self.failures.lock().unwrap().clear();
        }

        pub fn max_concurrent_deletes(&self) -> usize {
            self.max_deletes.load(Ordering::SeqCst)
        }

        fn should_fail(&self, phase: Phase, id: &str) -> bool {
            self.failures
                .lock()
                .unwrap()
                .iter()
                .any(|(p, i)| *p == phase && i == id)
        }

        fn generate_id(&self) -> String {
            format!("generated-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ThingProps {
        pub name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub token: Option<Secret>,
        #[serde(default)]
        pub delete_first: bool,
    }

    impl ThingProps {
        pub fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
                region: None,
                token: None,
                delete_first: false,
            }
        }

        pub fn in_region(mut self, region: &str) -> Self {
            self.region = Some(region.to_string());
            self
        }

        pub fn with_token(mut self, token: &str) -> Self {
            self.token = Some(Secret::new(token));
            self
        }

        pub fn delete_first(mut self) -> Self {
            self.delete_first = true;
            self
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ThingOutput {
        pub name: String,
        pub id: String,
    }

    /// `demo::Thing`: a remote object with a generated id
    ///
    /// Changing `region` requires a replacement.
    pub struct Thing(pub Arc<Recorder>);

    #[async_trait]
    impl ResourceHandler for Thing {
        const KIND: &'static str = "demo::Thing";
        type Props = ThingProps;
        type Output = ThingOutput;

        async fn handle(
            &self,
            ctx: &mut Context<ThingOutput, ThingProps>,
            id: &str,
            props: ThingProps,
        ) -> anyhow::Result<HandlerOutcome<ThingOutput>> {
            let recorder = &self.0;
            recorder.push(Event {
                kind: Self::KIND.to_string(),
                id: id.to_string(),
                phase: ctx.phase(),
                replacing: ctx.is_replacing(),
                local: ctx.is_local(),
                prior_name: ctx.prior_output().map(|o| o.name.clone()),
                prior_id: ctx.prior_output().map(|o| o.id.clone()),
                prior_token: ctx
                    .prior_props()
                    .and_then(|p| p.token.as_ref())
                    .map(|t| t.expose().to_string()),
            });
            if recorder.should_fail(ctx.phase(), id) {
                anyhow::bail!("injected failure");
            }

            match ctx.phase() {
                Phase::Create => Ok(ctx.seal_output(ThingOutput {
                    name: props.name,
                    id: recorder.generate_id(),
                })),
                Phase::Update => {
                    if ctx.props_diff().is_some_and(|d| d.touches(&["region"])) {
                        return Ok(if props.delete_first {
                            ctx.replace_with(ReplaceMode::DeleteBeforeCreate)
                        } else {
                            ctx.replace()
                        });
                    }
                    let previous = ctx
                        .prior_output()
                        .map(|o| o.id.clone())
                        .unwrap_or_default();
                    Ok(ctx.seal_output(ThingOutput {
                        name: props.name,
                        id: previous,
                    }))
                }
                Phase::Delete => {
                    let active = recorder.active_deletes.fetch_add(1, Ordering::SeqCst) + 1;
                    recorder.max_deletes.fetch_max(active, Ordering::SeqCst);
                    for _ in 0..3 {
                        tokio::task::yield_now().await;
                    }
                    recorder.active_deletes.fetch_sub(1, Ordering::SeqCst);
                    Ok(ctx.destroy())
                }
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct GroupProps {
        pub children: Vec<String>,
    }

    impl GroupProps {
        pub fn children(ids: &[&str]) -> Self {
            Self {
                children: ids.iter().map(|id| (*id).to_string()).collect(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct GroupOutput {
        pub count: usize,
    }

    async fn reconcile_group(
        recorder: &Recorder,
        kind: &str,
        ctx: &mut Context<GroupOutput, GroupProps>,
        id: &str,
        props: GroupProps,
    ) -> anyhow::Result<HandlerOutcome<GroupOutput>> {
        recorder.push(Event {
            kind: kind.to_string(),
            id: id.to_string(),
            phase: ctx.phase(),
            replacing: ctx.is_replacing(),
            local: ctx.is_local(),
            prior_name: None,
            prior_id: None,
            prior_token: None,
        });
        if recorder.should_fail(ctx.phase(), id) {
            anyhow::bail!("injected failure");
        }
        if ctx.phase() == Phase::Delete {
            return Ok(ctx.destroy());
        }

        let children: Vec<_> = props
            .children
            .iter()
            .map(|child| ctx.scope().resource::<Thing>(child, ThingProps::named(child)))
            .collect();
        let mut count = 0;
        for child in join_all(children).await {
            child?;
            count += 1;
        }
        Ok(ctx.seal_output(GroupOutput { count }))
    }

    /// `demo::Group`: owns nested `demo::Thing`s, destroyed one at a time
    pub struct Group(pub Arc<Recorder>);

    #[async_trait]
    impl ResourceHandler for Group {
        const KIND: &'static str = "demo::Group";
        type Props = GroupProps;
        type Output = GroupOutput;

        async fn handle(
            &self,
            ctx: &mut Context<GroupOutput, GroupProps>,
            id: &str,
            props: GroupProps,
        ) -> anyhow::Result<HandlerOutcome<GroupOutput>> {
            reconcile_group(&self.0, Self::KIND, ctx, id, props).await
        }
    }

    /// `demo::ParallelGroup`: like [`Group`] but children are destroyed together
    pub struct ParallelGroup(pub Arc<Recorder>);

    #[async_trait]
    impl ResourceHandler for ParallelGroup {
        const KIND: &'static str = "demo::ParallelGroup";
        const DESTROY_STRATEGY: DestroyStrategy = DestroyStrategy::Parallel;
        type Props = GroupProps;
        type Output = GroupOutput;

        async fn handle(
            &self,
            ctx: &mut Context<GroupOutput, GroupProps>,
            id: &str,
            props: GroupProps,
        ) -> anyhow::Result<HandlerOutcome<GroupOutput>> {
            reconcile_group(&self.0, Self::KIND, ctx, id, props).await
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PeerOutput {
        /// Ids registered in the declaring scope when it closed
        pub siblings: Vec<String>,
    }

    /// `demo::Peer`: finishes construction only after its declaring scope
    /// closes, reporting every sibling it saw
    pub struct Peer(pub Arc<Recorder>);

    #[async_trait]
    impl ResourceHandler for Peer {
        const KIND: &'static str = "demo::Peer";
        type Props = ();
        type Output = PeerOutput;

        async fn handle(
            &self,
            ctx: &mut Context<PeerOutput, ()>,
            id: &str,
            _props: (),
        ) -> anyhow::Result<HandlerOutcome<PeerOutput>> {
            if ctx.phase() == Phase::Delete {
                return Ok(ctx.destroy());
            }
            let parent = ctx
                .parent_scope()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no declaring scope"))?;
            let view = parent.clone();
            let siblings = parent.defer(async move {
                view.resources()
                    .into_iter()
                    .map(|identity| identity.id)
                    .collect::<Vec<_>>()
            })?;
            // Deferred, not yet run
            self.0.push(Event {
                kind: Self::KIND.to_string(),
                id: id.to_string(),
                phase: ctx.phase(),
                replacing: ctx.is_replacing(),
                local: ctx.is_local(),
                prior_name: None,
                prior_id: None,
                prior_token: None,
            });
            let siblings = siblings.await?;
            Ok(ctx.seal_output(PeerOutput { siblings }))
        }
    }

    /// `demo::Rogue`: breaks the lifecycle contract in the way its props name
    pub struct Rogue;

    #[async_trait]
    impl ResourceHandler for Rogue {
        const KIND: &'static str = "demo::Rogue";
        type Props = String;
        type Output = String;

        async fn handle(
            &self,
            ctx: &mut Context<String, String>,
            _id: &str,
            props: String,
        ) -> anyhow::Result<HandlerOutcome<String>> {
            if props == "defer_in_own_scope" {
                let late = ctx.scope().defer(async { "late".to_string() })?.await?;
                return Ok(ctx.seal_output(late));
            }
            Ok(match props.as_str() {
                "destroy_on_create" => {
                    ctx.destroy();
                    ctx.seal_output(props)
                }
                "wrong_id" => ctx.seal_output_with_id("other", props),
                "replace_on_create" => ctx.replace(),
                _ => ctx.seal_output(props),
            })
        }
    }
}
