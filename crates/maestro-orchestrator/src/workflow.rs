//! Workflow DAG execution.
//!
//! A validated [`StepGraph`] is executed dependency-first: each step tracks
//! how many of its dependencies are still unresolved and becomes Ready the
//! moment that count hits zero. Ready steps run under a counting semaphore of
//! `max_concurrent_steps` permits. A failed or timed-out step skips its
//! dependents transitively while unrelated branches keep running.

use crate::graph::{interpolate, StepGraph};
use crate::invoker::{AgentInvoker, InvokeTarget, Invocation};
use crate::plan::WorkflowPlan;
use crate::types::{
    short_id, ProgressEvent, RunContext, StepRecord, StepStatus, WorkflowReport, WorkflowStatus,
};
use chrono::Utc;
use maestro_core::{AgentSpec, BackendKind, MaestroError, MaestroResult, Tier};
use maestro_security::ActionClass;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id as TaskId, JoinSet};
use tracing::{info, warn};

/// Engine-wide workflow settings. Plans may override the parallelism cap and
/// balancing flag.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Steps allowed to run at once.
    pub max_concurrent_steps: usize,
    /// Timeout for steps that do not set their own.
    pub step_timeout: Duration,
    /// Budget for the whole run.
    pub workflow_timeout: Duration,
    /// Spread unpinned steps round-robin over the backends.
    pub backend_balancing: bool,
    /// Tier for steps that do not request one.
    pub default_step_tier: Tier,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 3,
            step_timeout: Duration::from_secs(600),
            workflow_timeout: Duration::from_secs(3600),
            backend_balancing: true,
            default_step_tier: Tier::MemoryWrite,
        }
    }
}

type StepOutcome = (usize, MaestroResult<String>, OwnedSemaphorePermit);

/// Validates and runs workflow plans.
pub struct WorkflowEngine {
    invoker: Arc<dyn AgentInvoker>,
    config: WorkflowConfig,
}

struct RunState {
    records: Vec<StepRecord>,
    remaining: Vec<usize>,
    ready: VecDeque<usize>,
    outputs: HashMap<String, String>,
}

impl RunState {
    fn finish(&mut self, idx: usize, status: StepStatus) {
        let record = &mut self.records[idx];
        record.status = status;
        record.finished_at = Some(Utc::now());
    }
}

impl WorkflowEngine {
    /// Engine calling agents through `invoker`.
    pub fn new(invoker: Arc<dyn AgentInvoker>, config: WorkflowConfig) -> Self {
        Self { invoker, config }
    }

    /// Engine-wide settings.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Validate without running.
    pub fn validate(&self, plan: &WorkflowPlan) -> MaestroResult<StepGraph> {
        StepGraph::build(plan)
    }

    /// Run a plan to completion.
    ///
    /// Only validation problems are returned as `Err`; everything that goes
    /// wrong once steps are running is reported in the [`WorkflowReport`].
    pub async fn run(&self, plan: &WorkflowPlan, ctx: &RunContext) -> MaestroResult<WorkflowReport> {
        let graph = StepGraph::build(plan)?;
        let backends = self.invoker.backends();
        if backends.is_empty() {
            return Err(MaestroError::Config("no backends available for workflow steps".into()));
        }

        let workflow_id = format!("wf-{}", short_id());
        let max_concurrent = plan
            .max_concurrent_steps
            .unwrap_or(self.config.max_concurrent_steps)
            .max(1);
        let balancing = plan.backend_balancing.unwrap_or(self.config.backend_balancing);
        let scope = ctx.scope(&workflow_id);
        info!(
            workflow_id = %workflow_id,
            steps = graph.len(),
            max_concurrent,
            balancing,
            "workflow started"
        );

        let mut state = RunState {
            records: graph
                .nodes()
                .iter()
                .map(|n| StepRecord::pending(&n.plan.id))
                .collect(),
            remaining: graph.nodes().iter().map(|n| n.deps.len()).collect(),
            ready: VecDeque::new(),
            outputs: HashMap::new(),
        };
        for i in 0..graph.len() {
            if state.remaining[i] == 0 {
                state.records[i].status = StepStatus::Ready;
                state.ready.push_back(i);
            }
        }

        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let run_cancel = ctx.cancel.child_token();
        let deadline = tokio::time::sleep(self.config.workflow_timeout);
        tokio::pin!(deadline);

        let mut tasks: JoinSet<StepOutcome> = JoinSet::new();
        let mut task_steps: HashMap<TaskId, usize> = HashMap::new();
        let mut ephemeral_keys: BTreeSet<(BackendKind, Option<String>)> = BTreeSet::new();
        let mut next_backend = 0usize;
        let mut peak = 0usize;
        let mut stopped: Option<MaestroError> = None;

        loop {
            while stopped.is_none() && !state.ready.is_empty() {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let Some(idx) = state.ready.pop_front() else {
                    break;
                };
                let node = graph.node(idx);
                let spec = node.plan.agent.clone().unwrap_or_default();
                let backend = match spec.backend {
                    Some(pinned) => pinned,
                    None if balancing => {
                        let b = backends[next_backend % backends.len()];
                        next_backend += 1;
                        b
                    }
                    None => backends[0],
                };
                ephemeral_keys.insert((backend, spec.model.clone()));

                let invocation = Invocation {
                    target: InvokeTarget::Ephemeral {
                        backend,
                        spec: AgentSpec {
                            backend: Some(backend),
                            model: spec.model.clone(),
                            system_prompt: spec
                                .system_prompt
                                .as_deref()
                                .map(|s| interpolate(s, &state.outputs)),
                        },
                        burst: max_concurrent,
                    },
                    tier: self.step_tier(node.plan.tier, ctx.tier),
                    action: ActionClass::Respond,
                    prompt: interpolate(&node.plan.prompt_template, &state.outputs),
                    timeout: node
                        .plan
                        .timeout_secs
                        .map_or(self.config.step_timeout, Duration::from_secs),
                    scope: format!("{scope}/{}", node.plan.id),
                };

                let record = &mut state.records[idx];
                record.status = StepStatus::Running;
                record.backend = Some(backend);
                record.started_at = Some(Utc::now());
                ctx.emit(ProgressEvent::StepStarted {
                    workflow_id: workflow_id.clone(),
                    step_id: node.plan.id.clone(),
                    backend,
                });
                info!(workflow_id = %workflow_id, step_id = %node.plan.id, %backend, "step started");

                let invoker = self.invoker.clone();
                let cancel = run_cancel.child_token();
                let handle = tasks.spawn(async move {
                    let result = invoker.invoke(invocation, &cancel).await;
                    (idx, result, permit)
                });
                task_steps.insert(handle.id(), idx);
                peak = peak.max(tasks.len());
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = run_cancel.cancelled(), if stopped.is_none() => {
                    stopped = Some(MaestroError::Cancelled(format!("workflow {workflow_id} stopped")));
                    info!(workflow_id = %workflow_id, "workflow cancellation requested");
                }
                _ = &mut deadline, if stopped.is_none() => {
                    stopped = Some(MaestroError::Timeout(format!(
                        "workflow {workflow_id} exceeded {}s",
                        self.config.workflow_timeout.as_secs()
                    )));
                    warn!(workflow_id = %workflow_id, "workflow deadline reached");
                    run_cancel.cancel();
                }
                joined = tasks.join_next_with_id() => {
                    let (idx, result) = match joined {
                        Some(Ok((id, (idx, result, permit)))) => {
                            task_steps.remove(&id);
                            drop(permit);
                            (idx, result)
                        }
                        Some(Err(e)) => {
                            let Some(idx) = task_steps.remove(&e.id()) else { continue };
                            (idx, Err(MaestroError::Process(format!("step task failed: {e}"))))
                        }
                        None => continue,
                    };
                    self.settle(&graph, &mut state, idx, result, stopped.as_ref(), &workflow_id, ctx);
                }
            }
        }

        // Anything never started is skipped.
        for record in &mut state.records {
            if !record.status.is_terminal() {
                record.status = StepStatus::Skipped;
                record.finished_at = Some(Utc::now());
            }
        }

        for (backend, model) in &ephemeral_keys {
            self.invoker.reclaim_ephemeral(*backend, model.as_deref()).await;
        }

        let all_ok = state
            .records
            .iter()
            .all(|r| r.status == StepStatus::Succeeded);
        let status = match &stopped {
            Some(MaestroError::Cancelled(_)) => WorkflowStatus::Cancelled,
            _ if all_ok => WorkflowStatus::Succeeded,
            _ => WorkflowStatus::Failed,
        };

        let outputs: BTreeMap<String, String> = if status == WorkflowStatus::Succeeded {
            graph
                .terminal_steps()
                .into_iter()
                .filter_map(|i| {
                    let id = &graph.node(i).plan.id;
                    state.outputs.get(id).map(|out| (id.clone(), out.clone()))
                })
                .collect()
        } else {
            BTreeMap::new()
        };

        let failure_notice = (status == WorkflowStatus::Failed).then(|| {
            let name = plan.name.as_deref().unwrap_or(&workflow_id);
            render_failure_notice(name, &state.records, stopped.as_ref())
        });
        if let Some(notice) = &failure_notice {
            ctx.emit(ProgressEvent::Notice {
                text: notice.clone(),
            });
        }
        ctx.emit(ProgressEvent::WorkflowFinished {
            workflow_id: workflow_id.clone(),
            status,
        });
        info!(workflow_id = %workflow_id, ?status, peak_concurrency = peak, "workflow finished");

        Ok(WorkflowReport {
            workflow_id,
            name: plan.name.clone(),
            status,
            steps: state.records,
            outputs,
            peak_concurrency: peak,
            failure_notice,
        })
    }

    fn step_tier(&self, requested: Option<u8>, ceiling: Tier) -> Tier {
        requested
            .and_then(|t| Tier::try_from(t).ok())
            .unwrap_or(self.config.default_step_tier)
            .most_restrictive(ceiling)
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        graph: &StepGraph,
        state: &mut RunState,
        idx: usize,
        result: MaestroResult<String>,
        stopped: Option<&MaestroError>,
        workflow_id: &str,
        ctx: &RunContext,
    ) {
        let step_id = graph.node(idx).plan.id.clone();
        let status = match result {
            Ok(output) => {
                state.records[idx].result = Some(output.clone());
                state.outputs.insert(step_id.clone(), output);
                state.finish(idx, StepStatus::Succeeded);
                for &dep in &graph.node(idx).dependents {
                    state.remaining[dep] -= 1;
                    if state.remaining[dep] == 0 && state.records[dep].status == StepStatus::Pending {
                        state.records[dep].status = StepStatus::Ready;
                        state.ready.push_back(dep);
                    }
                }
                StepStatus::Succeeded
            }
            Err(e) => {
                // An in-flight step cut short by the workflow deadline counts as timed out.
                let e = match (&e, stopped) {
                    (MaestroError::Cancelled(_), Some(MaestroError::Timeout(msg))) => {
                        MaestroError::Timeout(msg.clone())
                    }
                    _ => e,
                };
                let status = match &e {
                    MaestroError::Timeout(_) | MaestroError::HungProcess { .. } => {
                        StepStatus::TimedOut
                    }
                    _ => StepStatus::Failed,
                };
                warn!(workflow_id, step_id = %step_id, error = %e, ?status, "step did not succeed");
                state.records[idx].error = Some(e.report());
                state.finish(idx, status);
                self.skip_dependents(graph, state, idx, workflow_id, ctx);
                status
            }
        };
        ctx.emit(ProgressEvent::StepFinished {
            workflow_id: workflow_id.to_string(),
            step_id,
            status,
        });
    }

    fn skip_dependents(
        &self,
        graph: &StepGraph,
        state: &mut RunState,
        failed: usize,
        workflow_id: &str,
        ctx: &RunContext,
    ) {
        let cause = graph.node(failed).plan.id.clone();
        let mut queue: VecDeque<usize> = graph.node(failed).dependents.iter().copied().collect();
        while let Some(i) = queue.pop_front() {
            if state.records[i].status.is_terminal() {
                continue;
            }
            state.ready.retain(|&r| r != i);
            state.records[i].error = Some(
                MaestroError::Validation(format!("skipped because '{cause}' did not succeed"))
                    .report(),
            );
            state.finish(i, StepStatus::Skipped);
            ctx.emit(ProgressEvent::StepFinished {
                workflow_id: workflow_id.to_string(),
                step_id: graph.node(i).plan.id.clone(),
                status: StepStatus::Skipped,
            });
            queue.extend(graph.node(i).dependents.iter().copied());
        }
    }
}

/// Structured `[SYSTEM]` notice sent back to the conductor on failure.
fn render_failure_notice(name: &str, records: &[StepRecord], stopped: Option<&MaestroError>) -> String {
    let mut lines = vec![format!("[SYSTEM] Workflow '{name}' failed.")];
    if let Some(e) = stopped {
        lines.push(format!("Reason: {e}"));
    }
    let failed: Vec<&StepRecord> = records
        .iter()
        .filter(|r| matches!(r.status, StepStatus::Failed | StepStatus::TimedOut))
        .collect();
    if !failed.is_empty() {
        lines.push("Failed steps:".into());
        for r in failed {
            let (kind, message) = r
                .error
                .as_ref()
                .map(|e| (e.kind.to_string(), e.message.clone()))
                .unwrap_or_default();
            lines.push(format!("- {} ({kind}): {message}", r.id));
        }
    }
    let list = |status: StepStatus| {
        records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let skipped = list(StepStatus::Skipped);
    if !skipped.is_empty() {
        lines.push(format!("Skipped steps: {skipped}"));
    }
    let done = list(StepStatus::Succeeded);
    if !done.is_empty() {
        lines.push(format!("Completed steps: {done}"));
    }
    lines.push(
        "Reply with a revised workflow_plan to retry, or answer in plain text to stop.".into(),
    );
    lines.join("\n")
}
