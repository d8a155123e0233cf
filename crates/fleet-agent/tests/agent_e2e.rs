//! End-to-end tests driving the agent against an in-process control service

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use fleet_agent::drain::RetryDrain;
use fleet_agent::heartbeat::HeartbeatService;
use fleet_agent::registration::RegistrationService;
use fleet_agent::runtime::RuntimeService;
use fleet_agent::{ApiClient, Config, IdentityManager, LocalStore};
use fleet_db::{DbPool, Repository};
use fleet_server::auth::JwtService;
use fleet_server::{build_router, AppState};

const TEST_SECRET: &str = "agent-e2e-secret";

async fn spawn_control_service() -> (SocketAddr, JoinHandle<()>, Repository, DbPool) {
    let pool = DbPool::in_memory().await.expect("in-memory db");
    let repo = Repository::new(pool.clone());
    let state = AppState {
        repo: repo.clone(),
        jwt: Arc::new(JwtService::new(TEST_SECRET, 3600)),
        jwt_expiration_secs: 3600,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });
    (addr, handle, repo, pool)
}

fn test_config(dir: &tempfile::TempDir, addr: SocketAddr) -> Config {
    Config {
        agent_svc_url: format!("http://{addr}"),
        identity_path: dir.path().join("identity.json"),
        db_path: dir.path().join("agent.db"),
        chunk_size: 16_384,
        chunk_interval_sec: 1,
        heartbeat_interval_sec: 30,
        default_timeout_sec: 30,
        worker_count: 2,
        channel_size: 100,
    }
}

#[tokio::test]
async fn command_executes_and_logs_round_trip() {
    let (addr, _server, repo, _pool) = spawn_control_service().await;
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config(&dir, addr);

    let client = Arc::new(ApiClient::new(&config.agent_svc_url, ""));
    let token = client
        .register("edge-e2e", &serde_json::json!({"os_name": "linux"}))
        .await
        .unwrap();
    client.update_token(&token).await;

    let command_id = repo
        .create_command("edge-e2e", "RunCommand", &serde_json::json!({"cmd": "echo hi", "timeout_sec": 10}))
        .await
        .unwrap()
        .to_string();

    let store = LocalStore::open(&config.db_path).await.unwrap();
    let runtime = RuntimeService::new(store.clone(), client.clone(), &config);

    // One poll accepts the command into the local queue.
    runtime.poll_remote_once().await;

    let local = store.next_queued().await.unwrap().expect("command accepted");
    assert_eq!(local.command_id, command_id);
    runtime.execute_local_command(local).await;

    let cmd = repo.get_command(&command_id).await.unwrap().unwrap();
    assert_eq!(cmd.status, "success");
    assert_eq!(cmd.exit_code, Some(0));

    let logs = repo.get_command_logs(&command_id, None).await.unwrap();
    let stdout: String = logs
        .iter()
        .filter(|l| l.stream == "stdout")
        .map(|l| l.data.as_str())
        .collect();
    assert_eq!(stdout, "hi\n");
    assert!(logs.iter().all(|l| l.is_final));

    // Every buffered chunk is acked locally once delivery succeeded.
    assert!(store.pending_chunks(&command_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn buffered_chunks_survive_offline_and_drain() {
    let (addr, _server, repo, _pool) = spawn_control_service().await;
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config(&dir, addr);

    let client = Arc::new(ApiClient::new(&config.agent_svc_url, ""));
    let token = client
        .register("edge-e2e", &serde_json::json!({}))
        .await
        .unwrap();
    client.update_token(&token).await;

    let command_id = repo
        .create_command("edge-e2e", "RunCommand", &serde_json::json!({"cmd": "true"}))
        .await
        .unwrap()
        .to_string();
    repo.lease_commands("edge-e2e", 5).await.unwrap();

    // Chunks produced while the push path was down: they sit pending in
    // the local buffer with the command already finished locally.
    let store = LocalStore::open(&config.db_path).await.unwrap();
    store.save_command(&command_id, "RunCommand", "{}").await.unwrap();
    store.save_chunk(&command_id, 0, "stdout", "one\n").await.unwrap();
    store.save_chunk(&command_id, 1, "stdout", "two\n").await.unwrap();
    store
        .update_command_status(&command_id, "success", Some(0), None)
        .await
        .unwrap();

    let drain = RetryDrain::new(store.clone(), client.clone());
    drain.drain_once().await;

    assert!(store.pending_chunks(&command_id).await.unwrap().is_empty());

    let logs = repo.get_command_logs(&command_id, None).await.unwrap();
    assert_eq!(logs.len(), 2);
    // The command was locally terminal, so the drained batch was
    // final-marked.
    assert!(logs.iter().all(|l| l.is_final));
}

#[tokio::test]
async fn heartbeat_404_triggers_reregistration_with_same_node_id() {
    let (addr, _server, repo, pool) = spawn_control_service().await;
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config(&dir, addr);

    let client = Arc::new(ApiClient::new(&config.agent_svc_url, ""));
    let identity_mgr = IdentityManager::new(&config.identity_path);
    let registration = RegistrationService::new(client.clone(), identity_mgr.clone());

    let identity = registration.register_new().await.unwrap();
    client.update_token(&identity.jwt_token).await;
    let node_id = identity.node_id.clone();

    let heartbeat = HeartbeatService::new(
        client.clone(),
        RegistrationService::new(client.clone(), identity_mgr.clone()),
        node_id.clone(),
        30,
    );

    // Node is known: heartbeat succeeds.
    assert!(client.heartbeat(&node_id).await.is_ok());

    // Remove the node row behind the agent's back.
    sqlx::query("DELETE FROM nodes WHERE node_id = ?")
        .bind(&node_id)
        .execute(pool.inner())
        .await
        .unwrap();
    assert!(client.heartbeat(&node_id).await.unwrap_err().is_not_found());

    // The next beat re-registers with the *same* node id and swaps the
    // token in place.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    heartbeat.beat_once().await;

    let node = repo.get_node(&node_id).await.unwrap();
    assert!(node.is_some(), "node row recreated under the same id");

    let stored = identity_mgr.load().unwrap().unwrap();
    assert_eq!(stored.node_id, node_id);
    assert_ne!(stored.jwt_token, identity.jwt_token, "token refreshed");

    // Subsequent authenticated calls work with the refreshed token.
    assert!(client.heartbeat(&node_id).await.is_ok());
}

#[tokio::test]
async fn unknown_command_type_reports_failed() {
    let (addr, _server, repo, _pool) = spawn_control_service().await;
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config(&dir, addr);

    let client = Arc::new(ApiClient::new(&config.agent_svc_url, ""));
    let token = client
        .register("edge-e2e", &serde_json::json!({}))
        .await
        .unwrap();
    client.update_token(&token).await;

    let command_id = repo
        .create_command("edge-e2e", "RunCommand", &serde_json::json!({"cmd": "true"}))
        .await
        .unwrap()
        .to_string();
    repo.lease_commands("edge-e2e", 5).await.unwrap();

    // The payload was accepted server-side, but the local row carries a
    // type this agent build does not recognize.
    let store = LocalStore::open(&config.db_path).await.unwrap();
    store
        .save_command(&command_id, "RotateCredentials", "{}")
        .await
        .unwrap();

    let runtime = RuntimeService::new(store.clone(), client.clone(), &config);
    let local = store.next_queued().await.unwrap().unwrap();
    runtime.execute_local_command(local).await;

    let cmd = repo.get_command(&command_id).await.unwrap().unwrap();
    assert_eq!(cmd.status, "failed");
    assert_eq!(cmd.exit_code, Some(-1));
    assert!(cmd.error_msg.unwrap().contains("unknown command type"));
}
