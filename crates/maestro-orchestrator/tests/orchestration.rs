#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end scenarios across the orchestration engines.

use maestro_core::{AgentConfig, AgentSpec, BackendKind, MaestroError, Tier};
use maestro_orchestrator::testing::{RecordingMemory, ScriptedAnswer, ScriptedInvoker};
use maestro_orchestrator::{
    AgentMonitor, DelegationChain, DelegationConfig, DelegationManager, DispatchOutcome,
    Orchestrator, OrchestratorConfig, PooledInvoker, ProgressEvent, RunContext, RunKind,
    StepPlan, StepStatus, UltraWorkConfig, UltraWorkManager, WorkflowConfig, WorkflowEngine,
    WorkflowPlan, WorkflowStatus,
};
use maestro_pool::testing::{ScriptedReply, ScriptedSpawner};
use maestro_pool::{PoolConfig, PoolRegistry, WorkerSpawner};
use maestro_security::AuditLog;
use maestro_session::{FilePhaseStore, Phase, Verdict};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn step(id: &str, deps: &[&str], template: &str) -> StepPlan {
    StepPlan {
        id: id.into(),
        agent: Some(AgentSpec::default()),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        prompt_template: template.into(),
        ..Default::default()
    }
}

fn plan(steps: Vec<StepPlan>) -> WorkflowPlan {
    WorkflowPlan {
        steps,
        ..Default::default()
    }
}

fn slow_echo(delay: Duration) -> Arc<ScriptedInvoker> {
    Arc::new(ScriptedInvoker::new(vec![], move |inv| {
        ScriptedAnswer::Delayed(delay, format!("<{}>", inv.prompt))
    }))
}

// --- workflow scheduling ---

#[tokio::test(start_paused = true)]
async fn test_diamond_runs_middle_steps_concurrently() {
    let invoker = slow_echo(Duration::from_secs(1));
    let engine = WorkflowEngine::new(invoker.clone(), WorkflowConfig::default());
    let diamond = plan(vec![
        step("a", &[], "root"),
        step("b", &["a"], "left {{a.output}}"),
        step("c", &["a"], "right {{a.output}}"),
        step("d", &["b", "c"], "join {{b.output}} {{c.output}}"),
    ]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = RunContext::new(Tier::Full).with_events(tx);
    let report = engine.run(&diamond, &ctx).await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Succeeded);
    assert_eq!(report.peak_concurrency, 2);
    assert_eq!(invoker.max_concurrent(), 2);
    assert_eq!(report.outputs["d"], "<join <left <root>> <right <root>>>");

    // b and c both start before either finishes
    let mut order = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            ProgressEvent::StepStarted { step_id, .. } => order.push(format!("start:{step_id}")),
            ProgressEvent::StepFinished { step_id, .. } => order.push(format!("end:{step_id}")),
            _ => {}
        }
    }
    let pos = |s: &str| order.iter().position(|o| o == s).unwrap();
    assert!(pos("start:b") < pos("end:c"));
    assert!(pos("start:c") < pos("end:b"));
    assert!(pos("end:a") < pos("start:b"));
}

#[tokio::test(start_paused = true)]
async fn test_independent_steps_respect_concurrency_cap() {
    let invoker = slow_echo(Duration::from_secs(2));
    let engine = WorkflowEngine::new(invoker.clone(), WorkflowConfig::default());
    let steps = (1..=5).map(|i| step(&format!("s{i}"), &[], "work")).collect();
    let mut wide = plan(steps);
    wide.max_concurrent_steps = Some(3);

    let report = engine.run(&wide, &RunContext::new(Tier::Full)).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Succeeded);
    assert_eq!(report.peak_concurrency, 3);
    assert_eq!(invoker.max_concurrent(), 3);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Succeeded));
}

#[tokio::test]
async fn test_cyclic_plan_never_invokes_an_agent() {
    let invoker = slow_echo(Duration::ZERO);
    let engine = WorkflowEngine::new(invoker.clone(), WorkflowConfig::default());
    let cyclic = plan(vec![step("a", &["b"], "x"), step("b", &["a"], "y")]);

    let err = engine
        .run(&cyclic, &RunContext::new(Tier::Full))
        .await
        .unwrap_err();
    assert!(matches!(err, MaestroError::Validation(_)));
    assert!(invoker.calls().is_empty());
}

// --- delegation ---

#[tokio::test]
async fn test_fourth_delegation_rejected_and_chain_unchanged() {
    let agents = vec![
        AgentConfig::new("lead").with_tier(Tier::Full).delegating(),
        AgentConfig::new("h1"),
        AgentConfig::new("h2"),
        AgentConfig::new("h3"),
        AgentConfig::new("h4"),
    ];
    let invoker = Arc::new(ScriptedInvoker::echo(agents));
    let manager = DelegationManager::new(
        invoker.clone(),
        DelegationConfig::default(),
        Arc::new(AuditLog::disabled()),
    );
    let cancel = CancellationToken::new();
    let mut chain = DelegationChain::new("lead".into());

    for helper in ["h1", "h2", "h3"] {
        manager
            .delegate(&mut chain, &"lead".into(), &helper.into(), "task", &cancel)
            .await
            .unwrap();
    }
    assert_eq!(chain.depth, 3);

    let before = chain.clone();
    let err = manager
        .delegate(&mut chain, &"lead".into(), &"h4".into(), "task", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MaestroError::LoopPrevention(_)));
    assert_eq!(chain, before);
    assert!(invoker.prompts_for("h4").is_empty());
}

// --- ultrawork ---

#[tokio::test]
async fn test_ultrawork_retries_at_most_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FilePhaseStore::new(dir.path().to_path_buf()).await.unwrap());
    let invoker = Arc::new(ScriptedInvoker::new(vec![AgentConfig::new("lead")], |inv| {
        if inv.prompt.starts_with("[ULTRAWORK RETROSPECTIVE]") {
            ScriptedAnswer::text("not there yet. RETRO_INCOMPLETE")
        } else if inv.prompt.starts_with("[ULTRAWORK BUILD]") {
            ScriptedAnswer::text("did a thing. PLAN_COMPLETE")
        } else {
            ScriptedAnswer::text("1. do the thing")
        }
    }));
    let memory = Arc::new(RecordingMemory::new());
    let config = UltraWorkConfig {
        phase_delay: Duration::ZERO,
        ..Default::default()
    };
    let manager = UltraWorkManager::new(invoker.clone(), store.clone(), memory, config);

    let session = manager
        .start("finish it", "lead".into(), &RunContext::new(Tier::Full))
        .await
        .unwrap();
    assert_eq!(session.phase, Phase::Done);
    assert_eq!(session.retry_count, 1);
    assert_eq!(session.steps_done(), 2);
    assert_eq!(
        session.retrospective.as_ref().map(|r| r.verdict),
        Some(Verdict::Incomplete)
    );
    let retros = invoker
        .prompts_for("lead")
        .iter()
        .filter(|p| p.starts_with("[ULTRAWORK RETROSPECTIVE]"))
        .count();
    assert_eq!(retros, 2);

    // the finished state is durable
    let manager = UltraWorkManager::new(
        invoker,
        store,
        Arc::new(RecordingMemory::new()),
        UltraWorkConfig::default(),
    );
    let resumed = manager
        .resume(&session.session_id, &RunContext::new(Tier::Full))
        .await
        .unwrap();
    assert_eq!(resumed, session);
}

// --- pooled workers ---

#[tokio::test(start_paused = true)]
async fn test_hung_worker_times_out_step_and_is_replaced() {
    let spawner = Arc::new(ScriptedSpawner::new(|_, call| {
        if call.prompt == "stall" {
            ScriptedReply::Hang
        } else {
            ScriptedReply::Text("ok".into())
        }
    }));
    let mut spawners: HashMap<BackendKind, Arc<dyn WorkerSpawner>> = HashMap::new();
    spawners.insert(BackendKind::PrimaryCli, spawner.clone());
    let pool_config = PoolConfig {
        default_pool_size: 1,
        idle_timeout: Duration::from_secs(300),
        hung_timeout: Duration::from_secs(10),
        sweep_interval: Duration::from_secs(1),
    };
    let audit = Arc::new(AuditLog::disabled());
    let registry = Arc::new(PoolRegistry::new(spawners, pool_config, vec![], audit.clone()).unwrap());
    let shutdown = CancellationToken::new();
    let sweeper = registry.spawn_sweeper(shutdown.clone());

    let invoker = Arc::new(PooledInvoker::new(registry.clone(), audit, AgentMonitor::new()));
    let engine = WorkflowEngine::new(invoker, WorkflowConfig::default());

    let stuck = plan(vec![step("a", &[], "stall"), step("b", &["a"], "{{a.output}}")]);
    let report = engine.run(&stuck, &RunContext::new(Tier::Full)).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.step("a").unwrap().status, StepStatus::TimedOut);
    assert_eq!(report.step("b").unwrap().status, StepStatus::Skipped);
    assert_eq!(spawner.spawned(), 1);

    let healthy = plan(vec![step("a", &[], "go")]);
    let report = engine.run(&healthy, &RunContext::new(Tier::Full)).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Succeeded);
    assert_eq!(spawner.spawned(), 2);

    shutdown.cancel();
    sweeper.await.unwrap();
}

// --- stop ---

#[tokio::test]
async fn test_stop_cancels_running_workflow() {
    let plan_text = r#"{"steps":[{"id":"a","agent":{},"prompt_template":"wait"},{"id":"b","agent":{},"depends_on":["a"],"prompt_template":"{{a.output}}"}]}"#;
    let invoker = Arc::new(ScriptedInvoker::new(
        vec![AgentConfig::new("lead").with_tier(Tier::Full).delegating()],
        move |inv| {
            if inv.label().as_str() == "lead" {
                ScriptedAnswer::text(plan_text)
            } else {
                ScriptedAnswer::Hang
            }
        },
    ));
    let orch = Arc::new(Orchestrator::new(
        invoker,
        Arc::new(AuditLog::disabled()),
        OrchestratorConfig::default(),
    ));

    let running = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.handle_message("chan-1", &"lead".into(), "go", None)
                .await
        })
    };

    for _ in 0..200 {
        if orch
            .sessions()
            .active()
            .iter()
            .any(|r| r.kind == RunKind::Workflow)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(orch.stop("other-chan"), 0);
    assert!(orch.stop("chan-1") >= 1);

    let outcome = running.await.unwrap().unwrap();
    let DispatchOutcome::Workflow { report, replans } = outcome else {
        panic!("expected workflow outcome");
    };
    assert_eq!(report.status, WorkflowStatus::Cancelled);
    assert_eq!(replans, 0);
    assert!(orch.sessions().active().is_empty());
}
