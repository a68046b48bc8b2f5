//! Integration tests for the `/ws` session gateway.

mod common;

use common::*;
use futures::SinkExt;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;

// The shell echoes typed input, so markers are computed by the shell to
// avoid matching the echo.
const MARKER_CMD: &str = "echo tg_$((40+2))_ok";
const MARKER: &str = "tg_42_ok";

async fn close_with(tx: &mut WsTx, code: CloseCode) {
    tx.send(Message::Close(Some(CloseFrame {
        code,
        reason: "bye".into(),
    })))
    .await
    .ok();
}

async fn close_normal(tx: &mut WsTx) {
    close_with(tx, CloseCode::Normal).await;
}

/// Read `stream` messages until `needle` has arrived and return the message
/// that completed it.
async fn stream_message_with(rx: &mut WsRx, needle: &str) -> serde_json::Value {
    let mut seen = String::new();
    loop {
        let msg = recv_type(rx, "stream").await;
        seen.push_str(msg["data"].as_str().unwrap_or_default());
        if seen.contains(needle) {
            return msg;
        }
    }
}

#[tokio::test]
async fn connect_streams_shell_output() {
    let server = start_server(test_config(), None).await;
    let (mut tx, mut rx) = connect(&server.ws("projectId=web&path=/tmp")).await;

    let hello = recv_json(&mut rx).await;
    assert_eq!(hello["type"], "connected");
    let id = hello["sessionId"].as_str().unwrap().to_string();
    assert_eq!(hello["session"]["projectId"], "web");
    assert_eq!(hello["session"]["status"], "active");

    send_line(&mut tx, MARKER_CMD).await;
    read_stream_until(&mut rx, MARKER).await;

    let info = server.orchestrator.get(&id).unwrap();
    assert!(info.ws_connected);
}

#[tokio::test]
async fn missing_project_is_rejected() {
    let server = start_server(test_config(), None).await;
    let result = tokio_tungstenite::connect_async(server.ws("path=/tmp")).await;
    assert!(result.is_err(), "upgrade without projectId must fail");
}

#[tokio::test]
async fn ping_gets_pong() {
    let server = start_server(test_config(), None).await;
    let (mut tx, mut rx) = connect(&server.ws("projectId=web")).await;
    recv_type(&mut rx, "connected").await;

    send_json(&mut tx, serde_json::json!({"type": "ping"})).await;
    let pong = recv_type(&mut rx, "pong").await;
    assert!(pong["ts"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn malformed_message_reports_error_and_keeps_socket() {
    let server = start_server(test_config(), None).await;
    let (mut tx, mut rx) = connect(&server.ws("projectId=web")).await;
    recv_type(&mut rx, "connected").await;

    tx.send(Message::text("{not json")).await.unwrap();
    let err = recv_type(&mut rx, "error").await;
    assert_eq!(err["code"], "bad_message");

    send_line(&mut tx, MARKER_CMD).await;
    read_stream_until(&mut rx, MARKER).await;
}

#[tokio::test]
async fn reconnect_within_window_replays_history() {
    let server = start_server(test_config(), None).await;
    let (mut tx, mut rx) = connect(&server.ws("projectId=web")).await;
    let hello = recv_type(&mut rx, "connected").await;
    let id = hello["sessionId"].as_str().unwrap().to_string();

    send_line(&mut tx, MARKER_CMD).await;
    read_stream_until(&mut rx, MARKER).await;
    close_normal(&mut tx).await;
    drop((tx, rx));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let info = server.orchestrator.get(&id).unwrap();
    assert_eq!(info.status.as_str(), "inactive");

    let (_tx, mut rx) = connect(&server.ws(&format!("projectId=web&sessionId={id}"))).await;
    let again = recv_json(&mut rx).await;
    assert_eq!(again["type"], "reconnected");
    assert_eq!(again["sessionId"], id.as_str());
    let history = recv_type(&mut rx, "history").await;
    assert!(history["data"].as_str().unwrap().contains(MARKER));
}

#[tokio::test]
async fn reconnect_after_keepalive_gets_fresh_session() {
    let mut config = test_config();
    config.keepalive.intentional_secs = 1;
    let server = start_server(config, None).await;

    let (mut tx, mut rx) = connect(&server.ws("projectId=web")).await;
    let hello = recv_type(&mut rx, "connected").await;
    let old_id = hello["sessionId"].as_str().unwrap().to_string();
    close_normal(&mut tx).await;
    drop((tx, rx));

    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert!(server.orchestrator.process(&old_id).is_none());

    let (_tx, mut rx) = connect(&server.ws(&format!("projectId=web&sessionId={old_id}"))).await;
    let hello = recv_json(&mut rx).await;
    assert_eq!(hello["type"], "connected");
    assert_ne!(hello["sessionId"], old_id.as_str());
}

#[tokio::test]
async fn page_reload_reconnect_replays_late_output() {
    let mut config = test_config();
    config.keepalive.reload_secs = 1;
    let server = start_server(config, None).await;

    let (mut tx, mut rx) = connect(&server.ws("projectId=web")).await;
    let hello = recv_type(&mut rx, "connected").await;
    let id = hello["sessionId"].as_str().unwrap().to_string();

    // The marker is printed after the socket is gone.
    send_line(&mut tx, "sleep 0.3; echo tg_$((40+2))_ok").await;
    close_with(&mut tx, CloseCode::Away).await;
    drop((tx, rx));
    tokio::time::sleep(Duration::from_millis(600)).await;

    let url = server.ws(&format!("projectId=web&sessionId={id}"));
    let (mut tx, mut rx) = connect(&url).await;
    let again = recv_json(&mut rx).await;
    assert_eq!(again["type"], "reconnected");
    assert_eq!(again["sessionId"], id.as_str());
    let history = recv_type(&mut rx, "history").await;
    assert!(history["data"].as_str().unwrap().contains(MARKER));

    close_with(&mut tx, CloseCode::Away).await;
    drop((tx, rx));
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert!(server.orchestrator.process(&id).is_none());

    let (_tx, mut rx) = connect(&url).await;
    let fresh = recv_json(&mut rx).await;
    assert_eq!(fresh["type"], "connected");
    assert_ne!(fresh["sessionId"], id.as_str());
}

#[tokio::test]
async fn creation_burst_trips_rate_limit_then_breaker() {
    let mut config = test_config();
    config.limits.max_creations_per_window = 1;
    let server = start_server(config, None).await;

    let (_tx, mut rx) = connect(&server.ws("projectId=web")).await;
    recv_type(&mut rx, "connected").await;

    let (_tx2, mut rx2) = connect(&server.ws("projectId=web")).await;
    let err = recv_json(&mut rx2).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "creation_rate_exceeded");
    assert_eq!(recv_close(&mut rx2).await, Some(4002));

    let (_tx3, mut rx3) = connect(&server.ws("projectId=web")).await;
    let err = recv_json(&mut rx3).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "circuit_breaker_open");
    assert_eq!(recv_close(&mut rx3).await, Some(4001));

    // Other projects are unaffected.
    let (_tx4, mut rx4) = connect(&server.ws("projectId=docs")).await;
    recv_type(&mut rx4, "connected").await;
}

#[tokio::test]
async fn session_id_from_other_project_is_not_reattached() {
    let server = start_server(test_config(), None).await;
    let (_tx, mut rx) = connect(&server.ws("projectId=alpha")).await;
    let hello = recv_type(&mut rx, "connected").await;
    let id = hello["sessionId"].as_str().unwrap().to_string();

    let (_tx2, mut rx2) = connect(&server.ws(&format!("projectId=beta&sessionId={id}"))).await;
    let other = recv_json(&mut rx2).await;
    assert_eq!(other["type"], "connected");
    assert_ne!(other["sessionId"], id.as_str());
}

#[tokio::test]
async fn second_socket_replaces_first() {
    let server = start_server(test_config(), None).await;
    let (_tx, mut rx) = connect(&server.ws("projectId=web")).await;
    let hello = recv_type(&mut rx, "connected").await;
    let id = hello["sessionId"].as_str().unwrap().to_string();

    let (_tx2, mut rx2) = connect(&server.ws(&format!("projectId=web&sessionId={id}"))).await;
    assert_eq!(recv_json(&mut rx2).await["type"], "reconnected");

    assert_eq!(recv_close(&mut rx).await, Some(4004));
}

#[tokio::test]
async fn suspend_buffers_and_resume_replays() {
    let server = start_server(test_config(), None).await;
    let (mut tx, mut rx) = connect(&server.ws("projectId=web")).await;
    let hello = recv_type(&mut rx, "connected").await;
    let id = hello["sessionId"].as_str().unwrap().to_string();

    send_json(&mut tx, serde_json::json!({"type": "suspend"})).await;
    let suspended = recv_type(&mut rx, "suspended").await;
    assert_eq!(suspended["sessions"], serde_json::json!([id]));

    // Output produced while suspended is held back.
    send_line(&mut tx, MARKER_CMD).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    send_json(&mut tx, serde_json::json!({"type": "resume"})).await;
    let mut saw_buffer = false;
    let mut saw_resumed = false;
    while !(saw_buffer && saw_resumed) {
        let msg = recv_json(&mut rx).await;
        match msg["type"].as_str() {
            Some("buffered") => {
                assert!(msg["data"].as_str().unwrap().contains(MARKER));
                saw_buffer = true;
            }
            Some("resumed") => {
                assert_eq!(msg["sessions"], serde_json::json!([id]));
                saw_resumed = true;
            }
            _ => {}
        }
    }
    assert_eq!(server.orchestrator.get(&id).unwrap().status.as_str(), "active");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_during_output_delivers_every_line_once() {
    const LINES: usize = 40_000;
    let mut config = test_config();
    config.buffers.suspension_entries = 100_000;
    let server = start_server(config, None).await;
    let (mut tx, mut rx) = connect(&server.ws("projectId=web")).await;
    recv_type(&mut rx, "connected").await;

    send_line(&mut tx, "stty -echo").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    send_json(&mut tx, serde_json::json!({"type": "suspend"})).await;
    recv_type(&mut rx, "suspended").await;
    send_line(&mut tx, &format!("seq -f 'n%g' 1 {LINES}; echo DONE_$((1+1))")).await;
    tokio::time::sleep(Duration::from_millis(15)).await;
    send_json(&mut tx, serde_json::json!({"type": "resume"})).await;

    let mut text = String::new();
    while !text.contains("DONE_2") {
        let msg = recv_json(&mut rx).await;
        if matches!(msg["type"].as_str(), Some("stream" | "buffered")) {
            text.push_str(msg["data"].as_str().unwrap_or_default());
        }
    }

    let mut counts = vec![0u32; LINES + 1];
    for word in text.split_whitespace() {
        if let Some(n) = word.strip_prefix('n').and_then(|n| n.parse::<usize>().ok()) {
            assert!((1..=LINES).contains(&n), "unexpected line n{n}");
            counts[n] += 1;
        }
    }
    let missing: Vec<usize> = (1..=LINES).filter(|&n| counts[n] == 0).collect();
    let repeated: Vec<usize> = (1..=LINES).filter(|&n| counts[n] > 1).collect();
    assert!(missing.is_empty(), "{} lines missing, first {:?}", missing.len(), missing.first());
    assert!(repeated.is_empty(), "{} lines repeated, first {:?}", repeated.len(), repeated.first());
}

#[tokio::test]
async fn focus_updates_reach_project_sockets() {
    let server = start_server(test_config(), None).await;
    let (mut tx_a, mut rx_a) = connect(&server.ws("projectId=web")).await;
    let a = recv_type(&mut rx_a, "connected").await["sessionId"]
        .as_str()
        .unwrap()
        .to_string();
    let (_tx_b, mut rx_b) = connect(&server.ws("projectId=web")).await;
    recv_type(&mut rx_b, "connected").await;

    send_json(&mut tx_a, serde_json::json!({"type": "focus"})).await;
    let update = recv_type(&mut rx_b, "focusUpdate").await;
    assert!(update["focusedSessionIds"]
        .as_array()
        .unwrap()
        .iter()
        .any(|v| v == a.as_str()));
}

#[tokio::test]
async fn blurred_session_output_is_tagged_unfocused() {
    let server = start_server(test_config(), None).await;
    let (mut tx, mut rx) = connect(&server.ws("projectId=web")).await;
    recv_type(&mut rx, "connected").await;

    send_json(&mut tx, serde_json::json!({"type": "blur"})).await;
    send_line(&mut tx, MARKER_CMD).await;
    let msg = stream_message_with(&mut rx, MARKER).await;
    assert_eq!(msg["unfocused"], true);

    send_json(&mut tx, serde_json::json!({"type": "focus"})).await;
    send_line(&mut tx, "echo tg_$((40+3))_ok").await;
    let msg = stream_message_with(&mut rx, "tg_43_ok").await;
    assert!(msg.get("unfocused").is_none());
}

#[tokio::test]
async fn shell_exit_sends_exit_then_normal_close() {
    let server = start_server(test_config(), None).await;
    let (mut tx, mut rx) = connect(&server.ws("projectId=web")).await;
    let hello = recv_type(&mut rx, "connected").await;
    let id = hello["sessionId"].as_str().unwrap().to_string();

    send_line(&mut tx, "exit 3").await;
    let exit = recv_type(&mut rx, "exit").await;
    assert_eq!(exit["code"], 3);
    assert_eq!(recv_close(&mut rx).await, Some(1000));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let info = server.orchestrator.get(&id).unwrap();
    assert_eq!(info.status.as_str(), "closed");
}

#[tokio::test]
async fn server_shutdown_sends_going_away() {
    let server = start_server(test_config(), None).await;
    let (_tx, mut rx) = connect(&server.ws("projectId=web")).await;
    recv_type(&mut rx, "connected").await;

    server.shutdown.shutdown();
    assert_eq!(recv_close(&mut rx).await, Some(1001));
    assert!(server.shutdown.wait_for_drain(Duration::from_secs(2)).await);
}
