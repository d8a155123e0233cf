use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use fleet_db::{DbPool, Repository};
use fleet_server::auth::JwtService;
use fleet_server::{build_router, AppState};

const TEST_SECRET: &str = "integration-test-secret";

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, DbPool) {
    let pool = DbPool::in_memory().await.expect("in-memory db");
    let repo = Repository::new(pool.clone());
    let state = AppState {
        repo,
        jwt: std::sync::Arc::new(JwtService::new(TEST_SECRET, 3600)),
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
    (addr, handle, pool)
}

async fn register(client: &reqwest::Client, addr: SocketAddr, node_id: &str) -> String {
    let resp = client
        .post(format!("http://{addr}/v1/agents/register"))
        .json(&json!({"node_id": node_id, "attrs": {"os_name": "linux"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["node_id"], node_id);
    assert_eq!(body["expires_in"], 3600);
    body["token"].as_str().unwrap().to_string()
}

async fn submit(
    client: &reqwest::Client,
    addr: SocketAddr,
    node_id: &str,
    payload: Value,
) -> String {
    let resp = client
        .post(format!("http://{addr}/v1/commands/submit"))
        .json(&json!({
            "command_type": "RunCommand",
            "node_id": node_id,
            "payload": payload,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();
    body["command_id"].as_str().unwrap().to_string()
}

async fn poll_next(client: &reqwest::Client, addr: SocketAddr, token: &str) -> Value {
    let resp = client
        .get(format!("http://{addr}/v1/commands/next?wait=2"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn happy_path_round_trip() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();

    let token = register(&client, addr, "n1").await;
    let command_id = submit(&client, addr, "n1", json!({"cmd": "echo hi", "timeout_sec": 5})).await;

    let polled = poll_next(&client, addr, &token).await;
    let commands = polled["commands"].as_array().unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0]["command_id"], command_id.as_str());
    assert_eq!(commands[0]["payload"]["cmd"], "echo hi");

    let push = client
        .post(format!("http://{addr}/v1/commands/logs"))
        .bearer_auth(&token)
        .json(&json!({
            "command_id": command_id,
            "chunks": [{"chunk_index": 0, "stream": "stdout", "data": "hi\n", "is_final": true}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(push.status(), reqwest::StatusCode::CREATED);
    let acked: Value = push.json().await.unwrap();
    assert_eq!(acked["acked_offsets"], json!([0]));

    let status = client
        .post(format!("http://{addr}/v1/commands/status"))
        .bearer_auth(&token)
        .json(&json!({"command_id": command_id, "status": "success", "exit_code": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(status.status(), reqwest::StatusCode::OK);

    let logs: Value = client
        .get(format!("http://{addr}/v1/commands/{command_id}/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = logs["logs"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["data"], "hi\n");
    assert_eq!(rows[0]["is_final"], true);

    let listed: Value = client
        .get(format!("http://{addr}/v1/commands?node_id=n1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["commands"][0]["status"], "success");
    assert_eq!(listed["commands"][0]["exit_code"], 0);
}

#[tokio::test]
async fn duplicate_chunk_is_stored_once() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();

    let token = register(&client, addr, "n1").await;
    let command_id = submit(&client, addr, "n1", json!({"cmd": "true"})).await;
    poll_next(&client, addr, &token).await;

    let chunk = json!({
        "command_id": command_id,
        "chunks": [{"chunk_index": 0, "stream": "stdout", "data": "A\n", "is_final": false}],
    });

    let first: Value = client
        .post(format!("http://{addr}/v1/commands/logs"))
        .bearer_auth(&token)
        .json(&chunk)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["acked_offsets"], json!([0]));

    let second: Value = client
        .post(format!("http://{addr}/v1/commands/logs"))
        .bearer_auth(&token)
        .json(&chunk)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["acked_offsets"], json!([]));

    let logs: Value = client
        .get(format!("http://{addr}/v1/commands/{command_id}/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = logs["logs"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["is_final"], false);
}

#[tokio::test]
async fn terminal_status_finalizes_stored_chunks() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();

    let token = register(&client, addr, "n1").await;
    let command_id = submit(&client, addr, "n1", json!({"cmd": "sleep 60"})).await;
    poll_next(&client, addr, &token).await;

    for i in 0..2 {
        let resp = client
            .post(format!("http://{addr}/v1/commands/logs"))
            .bearer_auth(&token)
            .json(&json!({
                "command_id": command_id,
                "chunks": [{"chunk_index": i, "stream": "stdout", "data": format!("part {i}\n")}],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    }

    client
        .post(format!("http://{addr}/v1/commands/status"))
        .bearer_auth(&token)
        .json(&json!({"command_id": command_id, "status": "success", "exit_code": 0}))
        .send()
        .await
        .unwrap();

    let logs: Value = client
        .get(format!("http://{addr}/v1/commands/{command_id}/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = logs["logs"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["is_final"] == true));
}

#[tokio::test]
async fn long_poll_times_out_with_empty_shape() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();
    let token = register(&client, addr, "n1").await;

    let start = Instant::now();
    let polled = poll_next(&client, addr, &token).await;
    let elapsed = start.elapsed();

    assert_eq!(polled["commands"], json!([]));
    assert!(elapsed >= Duration::from_millis(1800), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "returned too late: {elapsed:?}");
}

#[tokio::test]
async fn ownership_violation_rejected_without_storing() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();

    let token_n1 = register(&client, addr, "n1").await;
    register(&client, addr, "n2").await;
    let command_id = submit(&client, addr, "n2", json!({"cmd": "true"})).await;

    let resp = client
        .post(format!("http://{addr}/v1/commands/logs"))
        .bearer_auth(&token_n1)
        .json(&json!({
            "command_id": command_id,
            "chunks": [{"chunk_index": 0, "stream": "stdout", "data": "stolen\n"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let logs: Value = client
        .get(format!("http://{addr}/v1/commands/{command_id}/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs["logs"], json!([]));
}

#[tokio::test]
async fn reregistration_keeps_one_row_and_rotates_tokens() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();

    let first = register(&client, addr, "n1").await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = register(&client, addr, "n1").await;
    assert_ne!(first, second, "re-registration mints a fresh token");

    let nodes: Value = client
        .get(format!("http://{addr}/v1/agents"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = nodes["nodes"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["node_id"], "n1");
    assert_eq!(rows[0]["is_healthy"], true);
}

#[tokio::test]
async fn heartbeat_404_after_node_row_removed() {
    let (addr, _handle, pool) = spawn_server().await;
    let client = reqwest::Client::new();
    let token = register(&client, addr, "n1").await;

    let ok = client
        .post(format!("http://{addr}/v1/agents/heartbeat"))
        .bearer_auth(&token)
        .json(&json!({"node_id": "n1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), reqwest::StatusCode::OK);

    // Remove the node row behind the agent's back.
    sqlx::query("DELETE FROM nodes WHERE node_id = 'n1'")
        .execute(pool.inner())
        .await
        .unwrap();

    let gone = client
        .post(format!("http://{addr}/v1/agents/heartbeat"))
        .bearer_auth(&token)
        .json(&json!({"node_id": "n1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn heartbeat_requires_matching_token_subject() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();
    let token_n1 = register(&client, addr, "n1").await;
    register(&client, addr, "n2").await;

    let resp = client
        .post(format!("http://{addr}/v1/agents/heartbeat"))
        .bearer_auth(&token_n1)
        .json(&json!({"node_id": "n2"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("http://{addr}/v1/agents/heartbeat"))
        .json(&json!({"node_id": "n1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submit_validates_type_node_and_payload() {
    let (addr, _handle, pool) = spawn_server().await;
    let client = reqwest::Client::new();
    register(&client, addr, "n1").await;

    // Unknown command type
    let resp = client
        .post(format!("http://{addr}/v1/commands/submit"))
        .json(&json!({"command_type": "Reboot", "node_id": "n1", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // Schema mismatch
    let resp = client
        .post(format!("http://{addr}/v1/commands/submit"))
        .json(&json!({"command_type": "RunCommand", "node_id": "n1", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // Unknown node
    let resp = client
        .post(format!("http://{addr}/v1/commands/submit"))
        .json(&json!({"command_type": "RunCommand", "node_id": "ghost", "payload": {"cmd": "ls"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    // Disabled node
    sqlx::query("UPDATE nodes SET disabled = 1 WHERE node_id = 'n1'")
        .execute(pool.inner())
        .await
        .unwrap();
    let resp = client
        .post(format!("http://{addr}/v1/commands/submit"))
        .json(&json!({"command_type": "RunCommand", "node_id": "n1", "payload": {"cmd": "ls"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chunk_boundaries_enforced() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();
    let token = register(&client, addr, "n1").await;
    let command_id = submit(&client, addr, "n1", json!({"cmd": "true"})).await;
    poll_next(&client, addr, &token).await;

    // chunk_index 0 is legal
    let resp = client
        .post(format!("http://{addr}/v1/commands/logs"))
        .bearer_auth(&token)
        .json(&json!({
            "command_id": command_id,
            "chunks": [{"chunk_index": 0, "stream": "stdout", "data": "x"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

    // negative chunk_index rejected
    let resp = client
        .post(format!("http://{addr}/v1/commands/logs"))
        .bearer_auth(&token)
        .json(&json!({
            "command_id": command_id,
            "chunks": [{"chunk_index": -1, "stream": "stdout", "data": "x"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // empty data rejected
    let resp = client
        .post(format!("http://{addr}/v1/commands/logs"))
        .bearer_auth(&token)
        .json(&json!({
            "command_id": command_id,
            "chunks": [{"chunk_index": 1, "stream": "stdout", "data": ""}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // unknown stream rejected
    let resp = client
        .post(format!("http://{addr}/v1/commands/logs"))
        .bearer_auth(&token)
        .json(&json!({
            "command_id": command_id,
            "chunks": [{"chunk_index": 1, "stream": "stdin", "data": "x"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // data is opaque: an embedded NUL byte round-trips
    let resp = client
        .post(format!("http://{addr}/v1/commands/logs"))
        .bearer_auth(&token)
        .json(&json!({
            "command_id": command_id,
            "chunks": [{"chunk_index": 2, "stream": "stdout", "data": "a\u{0}b"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

    let logs: Value = client
        .get(format!(
            "http://{addr}/v1/commands/{command_id}/logs?after_chunk_index=1"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs["logs"][0]["data"], "a\u{0}b");
}

#[tokio::test]
async fn terminal_status_is_not_reversible() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();
    let token = register(&client, addr, "n1").await;
    let command_id = submit(&client, addr, "n1", json!({"cmd": "true"})).await;
    poll_next(&client, addr, &token).await;

    let resp = client
        .post(format!("http://{addr}/v1/commands/status"))
        .bearer_auth(&token)
        .json(&json!({"command_id": command_id, "status": "failed", "exit_code": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let resp = client
        .post(format!("http://{addr}/v1/commands/status"))
        .bearer_auth(&token)
        .json(&json!({"command_id": command_id, "status": "running"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn late_chunks_after_terminal_are_forced_final() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();
    let token = register(&client, addr, "n1").await;
    let command_id = submit(&client, addr, "n1", json!({"cmd": "true"})).await;
    poll_next(&client, addr, &token).await;

    client
        .post(format!("http://{addr}/v1/commands/status"))
        .bearer_auth(&token)
        .json(&json!({"command_id": command_id, "status": "success", "exit_code": 0}))
        .send()
        .await
        .unwrap();

    // A straggler arriving after completion must not reopen the stream.
    let resp = client
        .post(format!("http://{addr}/v1/commands/logs"))
        .bearer_auth(&token)
        .json(&json!({
            "command_id": command_id,
            "chunks": [{"chunk_index": 7, "stream": "stderr", "data": "late\n", "is_final": false}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

    let logs: Value = client
        .get(format!("http://{addr}/v1/commands/{command_id}/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs["logs"][0]["is_final"], true);
}

#[tokio::test]
async fn list_limit_clamped_to_default() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();
    register(&client, addr, "n1").await;
    for _ in 0..3 {
        submit(&client, addr, "n1", json!({"cmd": "true"})).await;
    }

    for bad in ["0", "101", "abc"] {
        let resp = client
            .get(format!("http://{addr}/v1/commands?limit={bad}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["commands"].as_array().unwrap().len(), 3);
    }
}

#[tokio::test]
async fn logs_after_chunk_index_strictly_greater() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();
    let token = register(&client, addr, "n1").await;
    let command_id = submit(&client, addr, "n1", json!({"cmd": "true"})).await;
    poll_next(&client, addr, &token).await;

    for i in 0..3 {
        client
            .post(format!("http://{addr}/v1/commands/logs"))
            .bearer_auth(&token)
            .json(&json!({
                "command_id": command_id,
                "chunks": [{"chunk_index": i, "stream": "stdout", "data": format!("{i}")}],
            }))
            .send()
            .await
            .unwrap();
    }

    let logs: Value = client
        .get(format!(
            "http://{addr}/v1/commands/{command_id}/logs?after_chunk_index=1"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let indexes: Vec<i64> = logs["logs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["chunk_index"].as_i64().unwrap())
        .collect();
    assert_eq!(indexes, vec![2]);
}

#[tokio::test]
async fn purge_removes_only_queued_commands() {
    let (addr, _handle, _pool) = spawn_server().await;
    let client = reqwest::Client::new();
    let token = register(&client, addr, "n1").await;

    let running = submit(&client, addr, "n1", json!({"cmd": "true"})).await;
    poll_next(&client, addr, &token).await;
    let queued = submit(&client, addr, "n1", json!({"cmd": "true"})).await;

    let resp: Value = client
        .delete(format!("http://{addr}/v1/commands?node_id=n1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["deleted_count"], 1);

    let listed: Value = client
        .get(format!("http://{addr}/v1/commands"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = listed["commands"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["command_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&running.as_str()));
    assert!(!ids.contains(&queued.as_str()));
}
