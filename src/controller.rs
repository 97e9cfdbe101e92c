//! Per-run controller.
//!
//! One [`RunController`] owns one run. It is the only writer of the run's
//! status and stage store, which it publishes through a `watch` channel.
//! Outside actors reach it only through [`RunControl`]: two flags and a table
//! of selection records, with a `Notify` that wakes whichever wait is active.
//!
//! Suspension points: the checkpoint before each stage (pause and stop), the
//! awaiting-selection wait and the paused-on-error wait. Each wait re-checks
//! its condition at least every `poll_interval` even without a wake-up.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use conductor_common::{
    EventBody, RunEvent, RunId, RunMode, RunSnapshot, RunStatus, Selection, SelectionRecord,
    StageEntry, StageFailureInfo, StageInput, StageRecord,
};
use tokio::sync::{Notify, watch};
use tracing::Instrument;

use crate::bus::EventBus;
use crate::errors::{ControllerFault, StageFailure};
use crate::gate::{self, GateDecision};
use crate::plan::{PlanSource, StageDescriptor};

/// Shared control surface of a run.
pub struct RunControl {
    paused: AtomicBool,
    stop: AtomicBool,
    selections: Mutex<HashMap<String, SelectionRecord>>,
    notify: Notify,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            selections: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Store an operator's choice for `stage`. A later record for the same
    /// stage replaces an unconsumed earlier one.
    pub fn record_selection(&self, stage: &str, choice_index: i64) -> SelectionRecord {
        let record = SelectionRecord {
            stage: stage.to_string(),
            choice_index,
            submitted_at: Utc::now(),
        };
        self.selections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stage.to_string(), record.clone());
        self.notify.notify_waiters();
        record
    }

    pub fn take_selection(&self, stage: &str) -> Option<SelectionRecord> {
        self.selections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stage)
    }

    pub fn pending_selections(&self) -> BTreeMap<String, i64> {
        self.selections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(stage, record)| (stage.clone(), record.choice_index))
            .collect()
    }

    /// Wait until `probe` yields a value, re-checking on every wake-up and at
    /// least once per `tick`.
    pub async fn wait_for<T>(&self, tick: Duration, mut probe: impl FnMut() -> Option<T>) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before probing so a write between the probe and the
            // await still wakes us.
            notified.as_mut().enable();
            if let Some(value) = probe() {
                return value;
            }
            let _ = tokio::time::timeout(tick, notified).await;
        }
    }
}

/// Timing knobs for a controller.
#[derive(Debug, Clone, Copy)]
pub struct RunTiming {
    pub poll_interval: Duration,
    pub stage_timeout: Option<Duration>,
}

impl Default for RunTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stage_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct RunController {
    id: RunId,
    mode: RunMode,
    query: String,
    plan_source: Arc<dyn PlanSource>,
    control: Arc<RunControl>,
    bus: EventBus,
    state: Arc<watch::Sender<RunSnapshot>>,
    timing: RunTiming,
}

impl RunController {
    pub fn new(
        id: RunId,
        mode: RunMode,
        query: impl Into<String>,
        plan_source: Arc<dyn PlanSource>,
        timing: RunTiming,
    ) -> Self {
        let query = query.into();
        let (state, _) = watch::channel(RunSnapshot::new(id, mode, query.clone()));
        Self {
            id,
            mode,
            query,
            plan_source,
            control: Arc::new(RunControl::new()),
            bus: EventBus::new(id),
            state: Arc::new(state),
            timing,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn control(&self) -> Arc<RunControl> {
        self.control.clone()
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn state(&self) -> Arc<watch::Sender<RunSnapshot>> {
        self.state.clone()
    }

    /// Drive the run to a terminal status, then close the bus.
    pub async fn run(self) -> RunStatus {
        let span = tracing::info_span!("run", run_id = %self.id, mode = %self.mode);
        async move {
            tracing::info!(query = %self.query, "Run started");
            if let Err(fault) = self.drive().await {
                self.fail(&fault);
            }
            self.bus.close();
            let status = self.state.borrow().status;
            tracing::info!(%status, events = self.bus.published(), "Run finished");
            status
        }
        .instrument(span)
        .await
    }

    async fn drive(&self) -> Result<(), ControllerFault> {
        let plan = self.plan_source.resolve(&self.query).await?;
        let names = plan.names();
        tracing::debug!(plan = ?names, "Plan resolved");
        self.state.send_modify(|s| s.plan = names);
        self.publish(EventBody::Workflow {
            mode: self.mode,
            steps: plan.workflow_steps(),
            graph: plan.graph(),
        })?;

        let mut input = StageInput::new(self.query.clone(), self.mode);
        for stage in plan.stages() {
            let node = stage.name.as_str();
            if self.checkpoint(node).await? == Flow::Stop {
                return self.finish_stopped(Some(node));
            }

            self.state
                .send_modify(|s| s.current_stage = Some(node.to_string()));
            self.publish(EventBody::Enter {
                node: node.to_string(),
            })?;

            let output = match self.invoke(stage, &input).await {
                Ok(output) => output,
                Err(failure) => return self.park_on_failure(node, failure).await,
            };
            self.publish(EventBody::Segment {
                node: node.to_string(),
                input: input.clone(),
                output: output.clone(),
            })?;

            let options = output.options().to_vec();
            let selection = if !options.is_empty() || stage.requires_selection {
                if !options.is_empty() {
                    self.publish(EventBody::Options {
                        node: node.to_string(),
                        options: options.clone(),
                    })?;
                }
                match self.select(stage, &options).await? {
                    Some(selection) => Some(selection),
                    None => return self.finish_stopped(Some(node)),
                }
            } else {
                None
            };

            let entry = StageEntry {
                input: input.clone(),
                output: output.clone(),
                selection: selection.clone(),
            };
            input.advance(&output, selection.as_ref());
            self.state.send_modify(|s| {
                s.store.insert(node.to_string(), entry);
            });
            self.publish(EventBody::Exit {
                node: node.to_string(),
            })?;
        }

        self.finish_done(input.carry)
    }

    /// Stage-boundary checkpoint: honors stop, and blocks while paused.
    async fn checkpoint(&self, next: &str) -> Result<Flow, ControllerFault> {
        if self.control.stop_requested() {
            return Ok(Flow::Stop);
        }
        if !self.control.is_paused() {
            return Ok(Flow::Continue);
        }

        self.set_status(RunStatus::Paused)?;
        self.publish(EventBody::Paused {
            node: Some(next.to_string()),
        })?;
        tracing::info!(next_stage = %next, "Run paused");

        let control = &self.control;
        let flow = control
            .wait_for(self.timing.poll_interval, || {
                if control.stop_requested() {
                    Some(Flow::Stop)
                } else if !control.is_paused() {
                    Some(Flow::Continue)
                } else {
                    None
                }
            })
            .await;

        if flow == Flow::Continue {
            self.set_status(RunStatus::Running)?;
            self.publish(EventBody::Resumed {
                node: Some(next.to_string()),
            })?;
            tracing::info!(next_stage = %next, "Run resumed");
        }
        Ok(flow)
    }

    /// Run the handler on its own task so a panic stays contained.
    async fn invoke(
        &self,
        stage: &StageDescriptor,
        input: &StageInput,
    ) -> Result<StageRecord, StageFailure> {
        let handler = stage.handler.clone();
        let input = input.clone();
        let mut task = tokio::spawn(async move { handler.invoke(&input).await });

        let joined = match self.timing.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(StageFailure::timed_out(limit.as_secs()));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(StageFailure::panicked(panic_message(e.into_panic()))),
            Err(e) => Err(StageFailure::new(format!("stage task failed: {}", e))),
        }
    }

    /// Resolve the selection gate. `None` means the run was stopped while
    /// waiting for an operator.
    async fn select(
        &self,
        stage: &StageDescriptor,
        options: &[String],
    ) -> Result<Option<Selection>, ControllerFault> {
        let node = stage.name.as_str();
        let selection = match gate::decide(options, self.mode, stage.requires_selection) {
            GateDecision::Resolved(selection) => selection,
            GateDecision::AwaitOperator => {
                self.set_status(RunStatus::AwaitingSelection)?;
                self.publish(EventBody::AwaitingSelection {
                    node: node.to_string(),
                    options: options.to_vec(),
                })?;
                tracing::info!(stage = %node, options = options.len(), "Awaiting operator selection");

                let control = &self.control;
                let record = control
                    .wait_for(self.timing.poll_interval, || {
                        if control.stop_requested() {
                            Some(None)
                        } else {
                            control.take_selection(node).map(Some)
                        }
                    })
                    .await;

                let Some(record) = record else {
                    return Ok(None);
                };
                self.set_status(RunStatus::Running)?;
                gate::resolve(options, record.choice_index)
            }
        };

        self.publish(EventBody::selection(node, &selection))?;
        Ok(Some(selection))
    }

    /// Park in `paused_error` until stop. Resume is not honored here.
    async fn park_on_failure(&self, node: &str, failure: StageFailure) -> Result<(), ControllerFault> {
        tracing::warn!(stage = %node, error = %failure, "Stage failed; run paused on error");
        self.state.send_modify(|s| {
            s.failure = Some(StageFailureInfo {
                node: node.to_string(),
                message: failure.message.clone(),
            });
        });
        self.set_status(RunStatus::PausedError)?;
        self.publish(EventBody::Error {
            node: Some(node.to_string()),
            message: failure.message,
        })?;

        let control = &self.control;
        control
            .wait_for(self.timing.poll_interval, || control.stop_requested().then_some(()))
            .await;
        self.finish_stopped(Some(node))
    }

    fn finish_stopped(&self, node: Option<&str>) -> Result<(), ControllerFault> {
        self.set_status(RunStatus::Stopping)?;
        self.publish(EventBody::Stopping {
            node: node.map(str::to_string),
        })?;
        tracing::info!(stage = ?node, "Run stopped");

        self.state.send_modify(|s| s.current_stage = None);
        self.set_status(RunStatus::Done)?;
        self.publish(EventBody::Done {
            final_text: None,
            stopped: true,
        })?;
        Ok(())
    }

    fn finish_done(&self, final_text: Option<String>) -> Result<(), ControllerFault> {
        self.state.send_modify(|s| {
            s.current_stage = None;
            s.final_text = final_text.clone();
        });
        self.set_status(RunStatus::Done)?;
        self.publish(EventBody::Done {
            final_text,
            stopped: false,
        })?;
        Ok(())
    }

    fn fail(&self, fault: &ControllerFault) {
        tracing::error!(error = %fault, "Run controller fault");
        mark_faulted(&self.state, &self.bus, fault);
    }

    fn set_status(&self, next: RunStatus) -> Result<(), ControllerFault> {
        let current = self.state.borrow().status;
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(ControllerFault::IllegalTransition {
                from: current,
                to: next,
            });
        }
        self.state.send_modify(|s| {
            s.status = next;
            if next.is_terminal() {
                s.finished_at = Some(Utc::now());
            }
        });
        tracing::debug!(from = %current, to = %next, "Run status changed");
        Ok(())
    }

    fn publish(&self, body: EventBody) -> Result<RunEvent, ControllerFault> {
        let event = self.bus.publish(body)?;
        tracing::trace!(seq = event.seq, kind = %event.kind(), "Event published");
        Ok(event)
    }
}

/// Move a run to `error` and announce it. Used by the controller for its own
/// faults and by the registry's supervisor when the controller task dies.
pub(crate) fn mark_faulted(
    state: &watch::Sender<RunSnapshot>,
    bus: &EventBus,
    fault: &ControllerFault,
) {
    let already_terminal = state.borrow().status.is_terminal();
    if !already_terminal {
        state.send_modify(|s| {
            s.status = RunStatus::Error;
            s.current_stage = None;
            s.finished_at = Some(Utc::now());
        });
    }
    if let Err(e) = bus.publish(EventBody::Error {
        node: None,
        message: fault.to_string(),
    }) {
        tracing::debug!(error = %e, "Could not publish fault event");
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
