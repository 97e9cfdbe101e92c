//! Table of live runs.
//!
//! The registry is the only way outside actors reach a run: it starts the
//! controller, routes control signals and selections, and hands out event
//! subscriptions. It is injected as an `Arc<RunRegistry>`.

use std::sync::Arc;
use std::time::Duration;

use conductor_common::{RunId, RunMode, RunSnapshot, RunStatus, SelectionRecord};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::Instrument;

use crate::bus::{EventBus, Subscription};
use crate::config::RuntimeSection;
use crate::controller::{RunControl, RunController, RunTiming, mark_faulted, panic_message};
use crate::errors::{ControllerFault, RunError};
use crate::plan::PlanSource;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub query: String,
    pub mode: RunMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Pause,
    Resume,
    Stop,
}

impl ControlSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Pause => "pause",
            ControlSignal::Resume => "resume",
            ControlSignal::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub timing: RunTiming,
    pub retain_finished: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        RuntimeSettings::from(&RuntimeSection::default())
    }
}

impl From<&RuntimeSection> for RuntimeSettings {
    fn from(section: &RuntimeSection) -> Self {
        Self {
            timing: RunTiming {
                poll_interval: section.poll_interval(),
                stage_timeout: section.stage_timeout(),
            },
            retain_finished: section.retain_finished(),
        }
    }
}

/// Registry-side view of one run.
pub struct RunHandle {
    id: RunId,
    control: Arc<RunControl>,
    bus: EventBus,
    state: Arc<watch::Sender<RunSnapshot>>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Controller-written state plus the current control flags.
    pub fn snapshot(&self) -> RunSnapshot {
        let mut snapshot = self.state.borrow().clone();
        snapshot.paused = self.control.is_paused();
        snapshot.stop_requested = self.control.stop_requested();
        snapshot.pending_selections = self.control.pending_selections();
        snapshot
    }

    pub fn status(&self) -> RunStatus {
        self.state.borrow().status
    }

    pub fn watch(&self) -> watch::Receiver<RunSnapshot> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }
}

pub struct RunRegistry {
    runs: Arc<DashMap<RunId, Arc<RunHandle>>>,
    plan_source: Arc<dyn PlanSource>,
    settings: RuntimeSettings,
}

impl RunRegistry {
    pub fn new(plan_source: Arc<dyn PlanSource>, settings: RuntimeSettings) -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            plan_source,
            settings,
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Start a run. Must be called from within a tokio runtime.
    pub fn create(&self, request: RunRequest) -> RunId {
        self.start(request, self.plan_source.clone()).0
    }

    /// Start a run and subscribe before its first event is published.
    pub fn create_subscribed(&self, request: RunRequest) -> (RunId, Subscription) {
        self.start(request, self.plan_source.clone())
    }

    /// Start a run with a plan source other than the registry's default.
    pub fn create_with_plan(
        &self,
        request: RunRequest,
        plan_source: Arc<dyn PlanSource>,
    ) -> (RunId, Subscription) {
        self.start(request, plan_source)
    }

    fn start(&self, request: RunRequest, plan_source: Arc<dyn PlanSource>) -> (RunId, Subscription) {
        let id = RunId::new();
        let controller = RunController::new(
            id,
            request.mode,
            request.query,
            plan_source,
            self.settings.timing,
        );
        let handle = Arc::new(RunHandle {
            id,
            control: controller.control(),
            bus: controller.bus(),
            state: controller.state(),
        });
        let subscription = handle.subscribe();
        self.runs.insert(id, handle.clone());
        tracing::info!(run_id = %id, mode = %request.mode, "Run created");

        let task = tokio::spawn(controller.run());
        let runs = self.runs.clone();
        let retain = self.settings.retain_finished;
        tokio::spawn(
            async move {
                match task.await {
                    Ok(status) => tracing::debug!(%status, "Run controller exited"),
                    Err(e) => {
                        let detail = if e.is_panic() {
                            panic_message(e.into_panic())
                        } else {
                            e.to_string()
                        };
                        let fault = ControllerFault::Panicked(detail);
                        tracing::error!(error = %fault, "Run controller died");
                        mark_faulted(&handle.state, &handle.bus, &fault);
                        handle.bus.close();
                    }
                }
                tokio::time::sleep(retain).await;
                if runs.remove(&id).is_some() {
                    tracing::debug!("Run retired");
                }
            }
            .instrument(tracing::debug_span!("supervisor", run_id = %id)),
        );

        (id, subscription)
    }

    pub fn handle(&self, id: RunId) -> Result<Arc<RunHandle>, RunError> {
        self.runs
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RunError::NotFound { id: id.to_string() })
    }

    pub fn get(&self, id: RunId) -> Result<RunSnapshot, RunError> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Snapshots of every registered run, oldest first.
    pub fn list(&self) -> Vec<RunSnapshot> {
        let mut snapshots: Vec<RunSnapshot> = self
            .runs
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    pub fn subscribe(&self, id: RunId) -> Result<Subscription, RunError> {
        Ok(self.handle(id)?.subscribe())
    }

    pub fn signal(&self, id: RunId, signal: ControlSignal) -> Result<RunSnapshot, RunError> {
        let handle = self.handle(id)?;
        match signal {
            ControlSignal::Pause => handle.control.set_paused(true),
            ControlSignal::Resume => {
                if handle.status() == RunStatus::PausedError {
                    return Err(RunError::ResumeRejected { id: id.to_string() });
                }
                handle.control.set_paused(false);
            }
            ControlSignal::Stop => handle.control.request_stop(),
        }
        tracing::info!(run_id = %id, signal = signal.as_str(), "Control signal recorded");
        Ok(handle.snapshot())
    }

    pub fn record_selection(
        &self,
        id: RunId,
        stage: &str,
        choice_index: i64,
    ) -> Result<SelectionRecord, RunError> {
        let handle = self.handle(id)?;
        let record = handle.control.record_selection(stage, choice_index);
        tracing::info!(run_id = %id, %stage, choice_index, "Selection recorded");
        Ok(record)
    }

    /// Remove a run from the table. Its controller keeps running if it has
    /// not finished, but can no longer be reached.
    pub fn retire(&self, id: RunId) -> bool {
        self.runs.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageFailure;
    use crate::plan::{Plan, StageDescriptor};
    use crate::stages::Stage;
    use async_trait::async_trait;
    use conductor_common::{StageInput, StageRecord};

    struct Echo;

    #[async_trait]
    impl Stage for Echo {
        async fn invoke(&self, input: &StageInput) -> Result<StageRecord, StageFailure> {
            Ok(StageRecord::text(input.subject()))
        }
    }

    struct Explodes;

    #[async_trait]
    impl PlanSource for Explodes {
        async fn resolve(&self, _query: &str) -> Result<Plan, crate::errors::PlanError> {
            panic!("planner exploded")
        }
    }

    fn settings(retain: Duration) -> RuntimeSettings {
        RuntimeSettings {
            timing: RunTiming {
                poll_interval: Duration::from_millis(10),
                stage_timeout: None,
            },
            retain_finished: retain,
        }
    }

    fn registry(retain: Duration) -> RunRegistry {
        let plan = Plan::new(vec![StageDescriptor::new("echo", Arc::new(Echo), false)]).unwrap();
        RunRegistry::new(Arc::new(plan), settings(retain))
    }

    fn request(query: &str) -> RunRequest {
        RunRequest {
            query: query.to_string(),
            mode: RunMode::Autonomous,
        }
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let registry = registry(Duration::from_secs(60));
        let id = RunId::new();
        assert!(matches!(registry.get(id), Err(RunError::NotFound { .. })));
        assert!(matches!(
            registry.signal(id, ControlSignal::Stop),
            Err(RunError::NotFound { .. })
        ));
        assert!(matches!(
            registry.record_selection(id, "echo", 0),
            Err(RunError::NotFound { .. })
        ));
        assert!(registry.subscribe(id).is_err());
    }

    #[tokio::test]
    async fn created_run_completes_and_is_listed() {
        let registry = registry(Duration::from_secs(60));
        let (id, mut sub) = registry.create_subscribed(request("hello"));
        while sub.recv().await.is_some() {}

        let snapshot = registry.get(id).unwrap();
        assert_eq!(snapshot.status, RunStatus::Done);
        assert_eq!(snapshot.final_text.as_deref(), Some("hello"));
        assert_eq!(snapshot.plan, vec!["echo".to_string()]);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn finished_runs_are_retired_after_retention() {
        let registry = registry(Duration::from_millis(20));
        let (id, mut sub) = registry.create_subscribed(request("q"));
        while sub.recv().await.is_some() {}
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(registry.get(id), Err(RunError::NotFound { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn controller_panic_marks_run_errored() {
        let registry = RunRegistry::new(Arc::new(Explodes), settings(Duration::from_secs(60)));
        let (id, mut sub) = registry.create_subscribed(request("q"));

        let mut last = None;
        while let Some(event) = sub.recv().await {
            last = Some(event);
        }
        let last = last.expect("fault event");
        assert_eq!(last.kind(), conductor_common::EventKind::Error);
        assert!(last.node().is_none());

        let mut rx = registry.handle(id).unwrap().watch();
        rx.wait_for(|s| s.status == RunStatus::Error).await.unwrap();
    }

    #[tokio::test]
    async fn pause_flag_shows_in_snapshot() {
        let registry = registry(Duration::from_secs(60));
        let id = registry.create(request("q"));
        let snapshot = registry.signal(id, ControlSignal::Pause).unwrap();
        assert!(snapshot.paused);
        let snapshot = registry.signal(id, ControlSignal::Resume).unwrap();
        assert!(!snapshot.paused);
        assert!(registry.retire(id));
        assert!(!registry.retire(id));
    }
}
