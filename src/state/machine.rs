//! The per-cluster state machine and the map that owns the machines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{HandlerTable, MachineState, Outcome, StateContext, StateDeps, Step};
use crate::conditions::{ClusterEvents, RESTART_ANNOTATION};
use crate::crd::{ClusterPhase, ClusterStatus, StatusPatch, StratusCluster};
use crate::error::{OperatorError, Result};
use crate::hash::spec_hash;

pub struct StateMachine {
    key: String,
    handlers: Arc<HandlerTable>,
    state: MachineState,
}

impl StateMachine {
    /// Rebuild a machine from the persisted status.
    pub fn new(key: impl Into<String>, handlers: Arc<HandlerTable>, status: Option<&ClusterStatus>) -> Self {
        Self {
            key: key.into(),
            handlers,
            state: MachineState::from_status(status),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn phase(&self) -> ClusterPhase {
        self.state.phase
    }

    pub fn events(&self) -> &ClusterEvents {
        &self.state.events
    }

    /// Run one reconcile pass for `cluster`.
    pub async fn manage(
        &mut self,
        cluster: &StratusCluster,
        deps: &StateDeps,
        token: &CancellationToken,
    ) -> Result<Outcome> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(OperatorError::Cancelled),
            outcome = self.drive(cluster, deps) => outcome,
        }
    }

    async fn drive(&mut self, cluster: &StratusCluster, deps: &StateDeps) -> Result<Outcome> {
        let mut spec = cluster.spec.clone();
        spec.apply_defaults();
        let hash = spec_hash(&spec)?;
        let handlers = Arc::clone(&self.handlers);

        let mut ctx = StateContext {
            cluster,
            spec: &spec,
            hash: &hash,
            deps,
            state: &mut self.state,
        };

        if !ctx.state.entered {
            debug!(cluster = %self.key, phase = %ctx.state.phase, "Running entry hook of recovered phase");
            handlers.get(ctx.state.phase)?.enter(&mut ctx).await?;
            ctx.state.entered = true;
        }

        if let Some((next, reason)) = preemption(cluster, ctx.state.phase) {
            info!(cluster = %self.key, from = %ctx.state.phase, to = %next, reason, "Preempting phase");
            let patch = StatusPatch::default().with_reason(reason, preemption_message(reason));
            transition(&handlers, &mut ctx, next, patch).await?;
            return Ok(Outcome::Requeue(Duration::ZERO));
        }

        let handler = handlers.get(ctx.state.phase)?;
        match handler.reconcile(&mut ctx).await {
            Ok(Step::Wait) => Ok(Outcome::Wait),
            Ok(Step::RequeueAfter(delay)) => Ok(Outcome::Requeue(delay)),
            Ok(Step::Transition { next, status }) => {
                transition(&handlers, &mut ctx, next, status).await?;
                Ok(Outcome::Requeue(Duration::ZERO))
            }
            Ok(Step::Finished) => Ok(Outcome::Finished),
            Err(err) if err.is_terminal() => {
                error!(cluster = %self.key, phase = %ctx.state.phase, error = %err, "Cluster failed");
                let patch = StatusPatch {
                    failed_generation: cluster.metadata.generation,
                    ..Default::default()
                }
                .with_reason(failure_reason(&err), err.to_string());
                transition(&handlers, &mut ctx, ClusterPhase::Error, patch).await?;
                Ok(Outcome::Requeue(Duration::ZERO))
            }
            Err(err) => Err(err),
        }
    }
}

/// Persist `next`, then switch in memory, then run its entry hook.
async fn transition(
    handlers: &HandlerTable,
    ctx: &mut StateContext<'_>,
    next: ClusterPhase,
    mut patch: StatusPatch,
) -> Result<()> {
    let current = ctx.state.phase;
    if next == current {
        return Ok(());
    }
    if !current.can_transition_to(next) {
        return Err(OperatorError::InvalidState(format!(
            "illegal phase transition {} -> {}",
            current, next
        )));
    }
    let handler = handlers.get(next)?;
    patch.phase = Some(next);
    patch.check(next)?;

    ctx.write_status(patch.clone()).await?;
    info!(cluster = %ctx.name(), from = %current, to = %next, "Phase transition");

    ctx.state.absorb(&patch);
    ctx.state.entered = false;
    handler.enter(ctx).await?;
    ctx.state.entered = true;
    Ok(())
}

/// Lifecycle requests that interrupt whatever the current phase is doing.
fn preemption(cluster: &StratusCluster, phase: ClusterPhase) -> Option<(ClusterPhase, &'static str)> {
    use ClusterPhase::*;
    if cluster.metadata.deletion_timestamp.is_some() && !matches!(phase, Stopping | Stopped) {
        return Some((Stopping, "Deleting"));
    }
    if cluster.spec.paused
        && matches!(
            phase,
            Initializing | DeployingThirdParties | DeployingOrchest | Updating | Starting | Running
        )
    {
        return Some((Stopping, "Paused"));
    }
    if phase == Running && cluster.annotations().contains_key(RESTART_ANNOTATION) {
        return Some((Stopping, "Restarting"));
    }
    None
}

fn preemption_message(reason: &str) -> &'static str {
    match reason {
        "Deleting" => "cluster is being deleted",
        "Paused" => "cluster paused",
        _ => "restart requested",
    }
}

fn failure_reason(err: &OperatorError) -> &'static str {
    match err {
        OperatorError::Validation(_) => "ValidationFailed",
        OperatorError::RetriesExhausted { .. } => "DeployFailed",
        _ => "Failed",
    }
}

pub type SharedMachine = Arc<tokio::sync::Mutex<StateMachine>>;

/// Key → machine. The outer lock only guards lookups; a machine itself is
/// used by one worker at a time because the queue never hands the same key
/// to two workers.
#[derive(Clone, Default)]
pub struct MachineMap {
    machines: Arc<Mutex<HashMap<String, SharedMachine>>>,
}

impl MachineMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SharedMachine>> {
        self.machines.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_or_create(&self, key: &str, create: impl FnOnce() -> StateMachine) -> SharedMachine {
        let mut machines = self.lock();
        Arc::clone(
            machines
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(create()))),
        )
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = self.lock().remove(key).is_some();
        if removed {
            debug!(cluster = %key, "State machine removed");
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Take exclusive use of a machine or report the concurrent reconcile.
pub fn acquire(
    key: &str,
    machine: &SharedMachine,
) -> Result<tokio::sync::OwnedMutexGuard<StateMachine>> {
    Arc::clone(machine).try_lock_owned().map_err(|_| {
        OperatorError::InvalidState(format!("concurrent reconcile of {}", key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::testing::{fake_registry, CallLog};
    use crate::components::CORE_COMPONENTS;
    use crate::conditions::{created, CLUSTER_FINALIZER};
    use crate::crd::ClusterSpec;
    use crate::state::{MachineSettings, MockClusterClient};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::Mutex as StdMutex;

    /// Fake API server state shared with the mock client.
    #[derive(Default)]
    struct Recorded {
        patches: Vec<StatusPatch>,
        finalizer_removed: bool,
        restart_cleared: bool,
        spec_writes: usize,
    }

    struct Harness {
        cluster: StratusCluster,
        machine: StateMachine,
        deps: StateDeps,
        log: Arc<CallLog>,
        recorded: Arc<StdMutex<Recorded>>,
        applied: usize,
    }

    fn cluster(spec: serde_json::Value) -> StratusCluster {
        let spec: ClusterSpec = serde_json::from_value(spec).unwrap();
        let mut cluster = StratusCluster::new("demo", spec);
        cluster.metadata.namespace = Some("default".to_string());
        cluster.metadata.uid = Some("uid-1".to_string());
        cluster.metadata.generation = Some(1);
        cluster
    }

    fn mock_client(recorded: Arc<StdMutex<Recorded>>, runtime: Option<&'static str>) -> MockClusterClient {
        let mut client = MockClusterClient::new();
        {
            let recorded = recorded.clone();
            client.expect_patch_status().returning(move |_, _, patch| {
                recorded.lock().unwrap().patches.push(patch.clone());
                Ok(())
            });
        }
        {
            let recorded = recorded.clone();
            client.expect_patch_spec().returning(move |_, _, _| {
                recorded.lock().unwrap().spec_writes += 1;
                Ok(())
            });
        }
        client.expect_add_finalizer().returning(|_| Ok(()));
        {
            let recorded = recorded.clone();
            client.expect_remove_finalizer().returning(move |_| {
                recorded.lock().unwrap().finalizer_removed = true;
                Ok(())
            });
        }
        {
            let recorded = recorded.clone();
            client.expect_clear_restart_annotation().returning(move |_, _| {
                recorded.lock().unwrap().restart_cleared = true;
                Ok(())
            });
        }
        client.expect_storage_class_exists().returning(|name| Ok(name == "standard"));
        client
            .expect_detect_container_runtime()
            .returning(move || Ok(runtime.map(String::from)));
        client
    }

    impl Harness {
        async fn new(spec: serde_json::Value) -> Self {
            Self::with_runtime(spec, Some("containerd")).await
        }

        async fn with_runtime(spec: serde_json::Value, runtime: Option<&'static str>) -> Self {
            let log = Arc::new(CallLog::default());
            let recorded = Arc::new(StdMutex::new(Recorded::default()));
            let deps = StateDeps {
                client: Arc::new(mock_client(recorded.clone(), runtime)),
                registry: Arc::new(fake_registry(log.clone()).await),
                settings: MachineSettings {
                    operation_timeout: Duration::from_secs(5),
                    create_retries: 3,
                    poll_interval: Duration::from_secs(5),
                    resync_interval: Duration::from_secs(300),
                },
            };
            let mut cluster = cluster(spec);
            cluster.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
            Self {
                machine: StateMachine::new("default/demo", Arc::new(HandlerTable::standard()), None),
                cluster,
                deps,
                log,
                recorded,
                applied: 0,
            }
        }

        /// One pass, then fold the written status into the cached object.
        async fn step(&mut self) -> Result<Outcome> {
            let outcome = self
                .machine
                .manage(&self.cluster, &self.deps, &CancellationToken::new())
                .await;
            let recorded = self.recorded.lock().unwrap();
            let status = self.cluster.status.get_or_insert_with(Default::default);
            for patch in &recorded.patches[self.applied..] {
                patch.apply_to(status);
            }
            self.applied = recorded.patches.len();
            if recorded.restart_cleared {
                if let Some(annotations) = self.cluster.metadata.annotations.as_mut() {
                    annotations.remove(RESTART_ANNOTATION);
                }
            }
            outcome
        }

        /// Step until the machine waits, finishes, or fails.
        async fn settle(&mut self) -> Result<Outcome> {
            for _ in 0..200 {
                match self.step().await? {
                    Outcome::Requeue(d) if d.is_zero() => continue,
                    Outcome::Requeue(d) if d == self.deps.settings.poll_interval => continue,
                    other => return Ok(other),
                }
            }
            panic!("machine did not settle");
        }

        /// Like `settle` but keeps going through retryable errors.
        async fn settle_through_errors(&mut self) -> Outcome {
            for _ in 0..200 {
                match self.step().await {
                    Ok(Outcome::Requeue(d)) if d.is_zero() || d == self.deps.settings.poll_interval => continue,
                    Ok(other) => return other,
                    Err(_) => continue,
                }
            }
            panic!("machine did not settle");
        }

        fn phases(&self) -> Vec<ClusterPhase> {
            self.recorded
                .lock()
                .unwrap()
                .patches
                .iter()
                .filter_map(|p| p.phase)
                .collect()
        }

        fn writes(&self) -> usize {
            self.recorded.lock().unwrap().patches.len()
        }

        fn status(&self) -> &ClusterStatus {
            self.cluster.status.as_ref().unwrap()
        }

        fn bump_spec(&mut self, edit: impl FnOnce(&mut ClusterSpec)) {
            edit(&mut self.cluster.spec);
            let generation = self.cluster.metadata.generation.unwrap_or(0);
            self.cluster.metadata.generation = Some(generation + 1);
        }

        fn mark_deleted(&mut self) {
            self.cluster.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }

        fn desired_hash(&self) -> String {
            let mut spec = self.cluster.spec.clone();
            spec.apply_defaults();
            spec_hash(&spec).unwrap()
        }

        fn calls_with(&self, prefix: &str) -> Vec<String> {
            self.log
                .calls()
                .into_iter()
                .filter(|c| c.starts_with(prefix))
                .collect()
        }
    }

    fn position(calls: &[String], call: &str) -> usize {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{} not called in {:?}", call, calls))
    }

    #[tokio::test]
    async fn test_fresh_cluster_reaches_running() {
        use ClusterPhase::*;
        let mut h = Harness::new(serde_json::json!({})).await;

        let outcome = h.settle().await.unwrap();

        assert_eq!(outcome, Outcome::Requeue(Duration::from_secs(300)));
        assert_eq!(h.phases(), vec![DeployingThirdParties, DeployingOrchest, Running]);
        let status = h.status();
        assert_eq!(status.phase, Running);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.container_runtime.as_deref(), Some("containerd"));
        let mut spec = h.cluster.spec.clone();
        spec.apply_defaults();
        assert_eq!(status.observed_hash, Some(spec_hash(&spec).unwrap()));
        for component in CORE_COMPONENTS {
            assert!(h.machine.events().contains(&created(component)));
        }
        // defaults were written back once
        assert_eq!(h.recorded.lock().unwrap().spec_writes, 1);
    }

    #[tokio::test]
    async fn test_stages_deploy_in_declared_order() {
        let mut h = Harness::new(serde_json::json!({
            "thirdParties": [{"name": "local-path-provisioner"}, {"name": "ingress-nginx"}]
        }))
        .await;
        h.settle().await.unwrap();

        let deploys = h.calls_with("deploy ");
        assert_eq!(
            deploys,
            vec![
                "deploy local-path-provisioner",
                "deploy ingress-nginx",
                "deploy resources",
                "deploy database",
                "deploy broker",
                "deploy auth",
                "deploy worker",
                "deploy api",
                "deploy web",
                "deploy agent",
            ]
        );
    }

    #[tokio::test]
    async fn test_next_stage_waits_for_readiness() {
        let mut h = Harness::new(serde_json::json!({})).await;
        h.log.set_ready("database", false);

        // Init, DeployingThirdParties (empty), then DeployingOrchest stalls
        let mut outcome = Outcome::Wait;
        for _ in 0..6 {
            outcome = h.step().await.unwrap();
        }
        assert_eq!(outcome, Outcome::Requeue(h.deps.settings.poll_interval));
        assert_eq!(h.machine.phase(), ClusterPhase::DeployingOrchest);
        assert!(h.calls_with("deploy auth").is_empty());
        assert_eq!(h.calls_with("deploy database").len(), 1);

        h.log.set_ready("database", true);
        h.settle().await.unwrap();
        assert_eq!(h.machine.phase(), ClusterPhase::Running);
        // not redeployed while waiting
        assert_eq!(h.calls_with("deploy database").len(), 1);
    }

    #[tokio::test]
    async fn test_faulty_database_ends_in_error() {
        let mut h = Harness::new(serde_json::json!({})).await;
        h.log.fail("database");

        let outcome = h.settle_through_errors().await;

        assert_eq!(outcome, Outcome::Wait);
        assert_eq!(h.machine.phase(), ClusterPhase::Error);
        let status = h.status();
        assert_eq!(status.reason.as_deref(), Some("DeployFailed"));
        assert_eq!(status.failed_generation, Some(1));
        let events = h.machine.events();
        assert!(events.contains("resourcesCreated"));
        assert!(!events.contains("databaseCreated"));
        for later in ["broker", "auth", "worker", "api", "web", "agent"] {
            assert!(!events.contains(&created(later)), "{} should not be created", later);
            assert!(h.calls_with(&format!("deploy {}", later)).is_empty());
        }
        assert_eq!(h.calls_with("deploy database").len(), 3);
    }

    #[tokio::test]
    async fn test_error_waits_until_spec_edit() {
        let mut h = Harness::new(serde_json::json!({})).await;
        h.log.fail("database");
        h.settle_through_errors().await;

        // no edit: stays put without writing
        let writes = h.writes();
        assert_eq!(h.step().await.unwrap(), Outcome::Wait);
        assert_eq!(h.writes(), writes);

        let log = Arc::new(CallLog::default());
        h.deps.registry = Arc::new(fake_registry(log.clone()).await);
        h.log = log;
        h.bump_spec(|spec| {
            spec.components.entry("database".to_string()).or_default().image =
                Some("postgres:16".to_string());
        });
        h.settle().await.unwrap();

        assert_eq!(h.machine.phase(), ClusterPhase::Running);
        assert_eq!(h.status().reason.as_deref(), Some(""));
        assert!(h.phases().contains(&ClusterPhase::Initializing));
    }

    #[tokio::test]
    async fn test_validation_failures_go_to_error() {
        let mut h = Harness::new(serde_json::json!({"storage": {"storageClassName": "missing"}})).await;
        h.settle().await.unwrap();
        assert_eq!(h.machine.phase(), ClusterPhase::Error);
        assert_eq!(h.status().reason.as_deref(), Some("ValidationFailed"));

        let mut h = Harness::new(serde_json::json!({"thirdParties": [{"name": "tiller"}]})).await;
        h.settle().await.unwrap();
        assert_eq!(h.machine.phase(), ClusterPhase::Error);

        let mut h = Harness::with_runtime(serde_json::json!({}), None).await;
        h.settle().await.unwrap();
        assert_eq!(h.machine.phase(), ClusterPhase::Error);
        assert!(h.log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_third_party_added_while_running_goes_to_error() {
        use ClusterPhase::*;
        let mut h = Harness::new(serde_json::json!({})).await;
        h.settle().await.unwrap();
        h.log.clear();

        h.bump_spec(|spec| {
            spec.third_parties
                .push(serde_json::from_value(serde_json::json!({"name": "tiller"})).unwrap())
        });
        let outcome = h.settle().await.unwrap();

        assert_eq!(outcome, Outcome::Wait);
        let phases = h.phases();
        assert_eq!(&phases[phases.len() - 2..], &[Updating, Error]);
        let status = h.status();
        assert_eq!(status.reason.as_deref(), Some("ValidationFailed"));
        assert_eq!(status.failed_generation, Some(2));
        assert!(h.calls_with("deploy ").is_empty());
    }

    #[tokio::test]
    async fn test_missing_storage_class_on_unpause_goes_to_error() {
        use ClusterPhase::*;
        let mut h = Harness::new(serde_json::json!({})).await;
        h.settle().await.unwrap();
        h.bump_spec(|spec| spec.paused = true);
        h.settle().await.unwrap();
        h.log.clear();

        h.bump_spec(|spec| {
            spec.paused = false;
            spec.storage.storage_class_name = Some("missing".to_string());
        });
        h.settle().await.unwrap();

        let phases = h.phases();
        assert_eq!(&phases[phases.len() - 2..], &[Starting, Error]);
        assert_eq!(h.status().reason.as_deref(), Some("ValidationFailed"));
        assert!(h.calls_with("deploy ").is_empty());
    }

    #[tokio::test]
    async fn test_recovery_from_failed_deploy_redeploys_every_component() {
        let mut h = Harness::new(serde_json::json!({})).await;
        h.log.fail("database");
        h.settle_through_errors().await;
        assert_eq!(h.machine.phase(), ClusterPhase::Error);
        assert!(h.machine.events().contains(&created("resources")));

        let log = Arc::new(CallLog::default());
        h.deps.registry = Arc::new(fake_registry(log.clone()).await);
        h.log = log;
        h.bump_spec(|spec| spec.topology = crate::crd::Topology::MultiNode);
        h.settle().await.unwrap();

        assert_eq!(h.machine.phase(), ClusterPhase::Running);
        let deploys = h.calls_with("deploy ");
        assert_eq!(deploys.len(), CORE_COMPONENTS.len());
        assert_eq!(deploys[0], "deploy resources");
        assert_eq!(h.status().observed_hash, Some(h.desired_hash()));
    }

    #[tokio::test]
    async fn test_recovery_from_failed_update_applies_new_spec() {
        let mut h = Harness::new(serde_json::json!({})).await;
        h.settle().await.unwrap();
        let initial = h.status().observed_hash.clone();

        h.log.fail("api");
        h.bump_spec(|spec| {
            spec.components.entry("api".to_string()).or_default().image = Some("api:2".to_string());
        });
        h.settle_through_errors().await;
        assert_eq!(h.machine.phase(), ClusterPhase::Error);
        assert_eq!(h.status().reason.as_deref(), Some("DeployFailed"));
        assert_eq!(h.status().observed_hash, initial);

        let log = Arc::new(CallLog::default());
        h.deps.registry = Arc::new(fake_registry(log.clone()).await);
        h.log = log;
        h.bump_spec(|spec| {
            spec.components.entry("api".to_string()).or_default().image = Some("api:3".to_string());
        });
        h.settle().await.unwrap();

        assert_eq!(h.machine.phase(), ClusterPhase::Running);
        for component in CORE_COMPONENTS {
            assert_eq!(
                h.calls_with(&format!("deploy {}", component)).len(),
                1,
                "{} should be deployed with the new spec",
                component
            );
        }
        assert_eq!(h.status().observed_hash, Some(h.desired_hash()));
        assert_eq!(h.status().observed_generation, Some(3));
    }

    #[tokio::test]
    async fn test_third_party_dropped_while_in_error_is_removed() {
        let mut h = Harness::new(serde_json::json!({
            "thirdParties": [{"name": "cert-manager"}]
        }))
        .await;
        h.log.fail("database");
        h.settle_through_errors().await;
        assert!(h.machine.events().contains(&created("cert-manager")));

        let log = Arc::new(CallLog::default());
        h.deps.registry = Arc::new(fake_registry(log.clone()).await);
        h.log = log;
        h.bump_spec(|spec| spec.third_parties.clear());
        h.settle().await.unwrap();

        assert_eq!(h.machine.phase(), ClusterPhase::Running);
        assert_eq!(h.calls_with("delete"), vec!["delete cert-manager"]);
        assert!(h.calls_with("deploy cert-manager").is_empty());
        assert!(!h.machine.events().contains(&created("cert-manager")));
    }

    #[tokio::test]
    async fn test_running_sync_is_idempotent() {
        let mut h = Harness::new(serde_json::json!({})).await;
        h.settle().await.unwrap();
        let writes = h.writes();
        let calls = h.log.calls().len();

        for _ in 0..3 {
            assert_eq!(h.step().await.unwrap(), Outcome::Requeue(Duration::from_secs(300)));
        }
        assert_eq!(h.writes(), writes);
        assert_eq!(h.log.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_drift_runs_update_and_converges() {
        use ClusterPhase::*;
        let mut h = Harness::new(serde_json::json!({})).await;
        h.settle().await.unwrap();
        h.log.clear();
        let before = h.status().observed_hash.clone();

        h.bump_spec(|spec| spec.topology = crate::crd::Topology::MultiNode);
        h.settle().await.unwrap();

        let phases = h.phases();
        assert_eq!(&phases[phases.len() - 2..], &[Updating, Running]);
        let status = h.status();
        assert_ne!(status.observed_hash, before);
        let mut spec = h.cluster.spec.clone();
        spec.apply_defaults();
        assert_eq!(status.observed_hash, Some(spec_hash(&spec).unwrap()));
        assert_eq!(status.observed_generation, Some(2));
        // every component redeployed exactly once
        assert_eq!(h.calls_with("deploy ").len(), CORE_COMPONENTS.len());
    }

    #[tokio::test]
    async fn test_generation_bump_without_drift_records_generation_only() {
        let mut h = Harness::new(serde_json::json!({})).await;
        h.settle().await.unwrap();
        let writes = h.writes();

        // an edit that leaves the defaulted spec unchanged
        h.bump_spec(|_| {});
        h.step().await.unwrap();

        let recorded = h.recorded.lock().unwrap();
        assert_eq!(recorded.patches.len(), writes + 1);
        let patch = recorded.patches.last().unwrap();
        assert_eq!(patch.observed_generation, Some(2));
        assert_eq!(patch.phase, None);
    }

    #[tokio::test]
    async fn test_pause_while_running_stops_without_starting() {
        use ClusterPhase::*;
        let mut h = Harness::new(serde_json::json!({})).await;
        h.settle().await.unwrap();
        h.log.clear();

        h.bump_spec(|spec| spec.paused = true);
        let outcome = h.settle().await.unwrap();

        assert_eq!(outcome, Outcome::Wait);
        let phases = h.phases();
        assert_eq!(&phases[phases.len() - 2..], &[Stopping, Stopped]);
        assert!(!phases.contains(&Starting));
        assert_eq!(h.status().reason.as_deref(), Some("Paused"));
        // volumes survive a pause
        assert!(h.calls_with("delete").iter().all(|c| !c.ends_with("purge")));

        // still paused: nothing happens
        assert_eq!(h.step().await.unwrap(), Outcome::Wait);
    }

    #[tokio::test]
    async fn test_teardown_runs_in_reverse_stage_order() {
        let mut h = Harness::new(serde_json::json!({
            "thirdParties": [{"name": "cert-manager"}]
        }))
        .await;
        h.settle().await.unwrap();
        h.log.clear();

        h.log.set_lingering("web", true);
        h.bump_spec(|spec| spec.paused = true);
        for _ in 0..4 {
            h.step().await.unwrap();
        }
        // the last stage is still going away, so nothing earlier is touched
        let deletes = h.calls_with("delete");
        assert_eq!(deletes, vec!["delete web", "delete agent"]);

        h.log.set_lingering("web", false);
        h.settle().await.unwrap();
        let deletes = h.calls_with("delete");
        let at = |c: &str| position(&deletes, c);
        assert!(at("delete web") < at("delete api"));
        assert!(at("delete api") < at("delete auth"));
        assert!(at("delete auth") < at("delete database"));
        assert!(at("delete broker") < at("delete resources"));
        assert!(at("delete resources") < at("delete cert-manager"));
    }

    #[tokio::test]
    async fn test_unpause_restarts_from_stopped() {
        use ClusterPhase::*;
        let mut h = Harness::new(serde_json::json!({})).await;
        h.settle().await.unwrap();
        h.bump_spec(|spec| spec.paused = true);
        h.settle().await.unwrap();
        h.log.clear();

        h.bump_spec(|spec| spec.paused = false);
        h.settle().await.unwrap();

        let phases = h.phases();
        assert_eq!(&phases[phases.len() - 2..], &[Starting, Running]);
        assert_eq!(h.calls_with("deploy ").len(), CORE_COMPONENTS.len());
        assert!(!h.machine.events().names().any(|e| e.ends_with("Deleted")));
    }

    #[tokio::test]
    async fn test_restart_annotation_round_trip() {
        use ClusterPhase::*;
        let mut h = Harness::new(serde_json::json!({})).await;
        h.settle().await.unwrap();

        h.cluster
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(RESTART_ANNOTATION.to_string(), "now".to_string());
        h.settle().await.unwrap();

        let phases = h.phases();
        assert_eq!(&phases[phases.len() - 4..], &[Stopping, Stopped, Starting, Running]);
        assert!(h.recorded.lock().unwrap().restart_cleared);
    }

    #[tokio::test]
    async fn test_deletion_tears_down_then_clears_finalizer() {
        use ClusterPhase::*;
        let mut h = Harness::new(serde_json::json!({})).await;
        h.settle().await.unwrap();
        h.log.set_lingering("resources", true);

        h.mark_deleted();
        for _ in 0..10 {
            h.step().await.unwrap();
        }
        // teardown blocked: finalizer must stay
        assert_eq!(h.machine.phase(), Stopping);
        assert!(!h.recorded.lock().unwrap().finalizer_removed);

        h.log.set_lingering("resources", false);
        let outcome = h.settle().await.unwrap();
        assert_eq!(outcome, Outcome::Finished);
        assert!(h.recorded.lock().unwrap().finalizer_removed);
        assert!(h.calls_with("delete").iter().all(|c| c.ends_with("purge")));
    }

    #[tokio::test]
    async fn test_restarted_operator_resumes_persisted_phase() {
        let mut h = Harness::new(serde_json::json!({})).await;
        h.log.set_ready("database", false);
        for _ in 0..6 {
            h.step().await.unwrap();
        }
        assert_eq!(h.machine.phase(), ClusterPhase::DeployingOrchest);

        // process restart: rebuild from the persisted status alone
        h.machine = StateMachine::new(
            "default/demo",
            Arc::new(HandlerTable::standard()),
            h.cluster.status.as_ref(),
        );
        assert_eq!(h.machine.phase(), ClusterPhase::DeployingOrchest);
        h.log.clear();
        h.log.set_ready("database", true);
        h.settle().await.unwrap();

        assert_eq!(h.machine.phase(), ClusterPhase::Running);
        // completed creates are not repeated
        let deploys = h.calls_with("deploy ");
        assert!(!deploys.contains(&"deploy resources".to_string()));
        assert!(!deploys.contains(&"deploy database".to_string()));
        assert!(deploys.contains(&"deploy auth".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_pass() {
        let mut h = Harness::new(serde_json::json!({})).await;
        let token = CancellationToken::new();
        token.cancel();
        let result = h.machine.manage(&h.cluster, &h.deps, &token).await;
        assert!(matches!(result, Err(OperatorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let mut h = Harness::new(serde_json::json!({})).await;
        let handlers = HandlerTable::standard();
        let spec = h.cluster.spec.clone();
        let mut ctx = StateContext {
            cluster: &h.cluster,
            spec: &spec,
            hash: "h",
            deps: &h.deps,
            state: &mut h.machine.state,
        };
        let err = transition(&handlers, &mut ctx, ClusterPhase::Running, StatusPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::InvalidState(_)));
        assert_eq!(h.machine.phase(), ClusterPhase::Initializing);
        assert_eq!(h.writes(), 0);
    }

    #[tokio::test]
    async fn test_machine_map_reports_concurrent_use() {
        let map = MachineMap::new();
        let create = || StateMachine::new("default/a", Arc::new(HandlerTable::standard()), None);
        let first = map.get_or_create("default/a", create);
        let again = map.get_or_create("default/a", || panic!("must reuse the machine"));
        assert!(Arc::ptr_eq(&first, &again));

        let guard = acquire("default/a", &first).unwrap();
        assert!(matches!(
            acquire("default/a", &again),
            Err(OperatorError::InvalidState(_))
        ));
        drop(guard);
        assert!(acquire("default/a", &again).is_ok());

        assert!(map.remove("default/a"));
        assert!(map.is_empty());
    }
}
