#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Gateway served on a real socket and driven over HTTP.

use maestro_core::{AgentConfig, BackendKind, Tier};
use maestro_gateway::{AppState, AuthConfig, GatewayServer};
use maestro_orchestrator::{AgentMonitor, Orchestrator, OrchestratorConfig, PooledInvoker};
use maestro_pool::testing::ScriptedSpawner;
use maestro_pool::{PoolConfig, PoolRegistry, WorkerSpawner};
use maestro_security::AuditLog;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

async fn start_test_server(auth: AuthConfig) -> (String, Arc<ScriptedSpawner>) {
    let spawner = Arc::new(ScriptedSpawner::echo());
    let mut spawners: HashMap<BackendKind, Arc<dyn WorkerSpawner>> = HashMap::new();
    spawners.insert(BackendKind::PrimaryCli, spawner.clone());
    let audit = Arc::new(AuditLog::disabled());
    let agents = vec![
        AgentConfig::new("lead").with_tier(Tier::Full).delegating(),
        AgentConfig::new("scout").with_tier(Tier::ReadOnly),
    ];
    let registry = Arc::new(
        PoolRegistry::new(spawners, PoolConfig::default(), agents, audit.clone()).unwrap(),
    );
    let monitor = AgentMonitor::new();
    let invoker = Arc::new(PooledInvoker::new(registry.clone(), audit.clone(), monitor.clone()));
    let orchestrator = Arc::new(Orchestrator::new(invoker, audit, OrchestratorConfig::default()));
    let state = Arc::new(AppState::new(orchestrator, registry, monitor));
    let app = GatewayServer::build_with_middleware(state, None, auth);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://127.0.0.1:{}", addr.port()), spawner)
}

#[tokio::test]
async fn test_config_update_drains_workers() {
    let (base, spawner) = start_test_server(AuthConfig::default()).await;
    let client = reqwest::Client::new();

    let reply: Value = client
        .post(format!("{base}/api/messages"))
        .json(&serde_json::json!({"origin": "c1", "agent": "scout", "content": "look"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["reply"], "scout: look");
    assert_eq!(spawner.spawned(), 1);

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["workers"].as_array().unwrap().len(), 1);
    assert_eq!(health["agents"]["aggregate"]["invocations"], 1);

    let resp = client
        .put(format!("{base}/api/multi-agent/agents/scout"))
        .json(&serde_json::json!({"model": "bigger"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(spawner.terminated(), 1);

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(health["workers"].as_array().unwrap().is_empty());
    assert_eq!(health["config_generation"], 1);
}

#[tokio::test]
async fn test_api_key_query_param_accepted() {
    let (base, _) = start_test_server(AuthConfig::new(vec!["secret".into()])).await;
    let client = reqwest::Client::new();

    let denied = client
        .post(format!("{base}/api/sessions/c1/stop"))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    let ok: Value = client
        .post(format!("{base}/api/sessions/c1/stop?api_key=secret"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["origin"], "c1");
    assert_eq!(ok["stopped"], 0);
}
