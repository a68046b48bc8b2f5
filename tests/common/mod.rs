#![allow(dead_code)]

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use termgate::api::{self, AppState, RouterConfig};
use termgate::audit::NoopSink;
use termgate::config::Config;
use termgate::orchestrator::Orchestrator;
use termgate::shell::ShellDiscovery;
use termgate::shutdown::ShutdownCoordinator;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsTx = SplitSink<Ws, Message>;
pub type WsRx = SplitStream<Ws>;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// A server running in-process on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub orchestrator: Orchestrator,
    pub shutdown: ShutdownCoordinator,
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws(&self, query: &str) -> String {
        format!("ws://{}/ws?{}", self.addr, query)
    }
}

/// Default config with `/bin/sh` pinned so tests do not depend on the
/// host's login shell.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.shell.path = Some(PathBuf::from("/bin/sh"));
    config
}

pub async fn start_server(config: Config, token: Option<String>) -> TestServer {
    let config = Arc::new(config);
    let shells = Arc::new(ShellDiscovery::new(config.shell.clone()));
    let orchestrator = Orchestrator::new(config.clone(), shells, Arc::new(NoopSink));
    let shutdown = ShutdownCoordinator::new();
    let state = AppState::new(orchestrator.clone(), shutdown.clone());
    let app = api::router(
        state,
        RouterConfig {
            token,
            cors_origins: Vec::new(),
        },
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        orchestrator,
        shutdown,
    }
}

pub async fn connect(url: &str) -> (WsTx, WsRx) {
    let (ws, _) = tokio::time::timeout(Duration::from_secs(5), connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws.split()
}

/// Receive the next text message as JSON, skipping pings.
pub async fn recv_json(rx: &mut WsRx) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, rx.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text message, got {:?}", other),
        }
    }
}

/// Read messages until one of the given `type` arrives.
pub async fn recv_type(rx: &mut WsRx, ty: &str) -> serde_json::Value {
    loop {
        let msg = recv_json(rx).await;
        if msg["type"] == ty {
            return msg;
        }
    }
}

/// Accumulate `stream` payloads until `needle` shows up.
pub async fn read_stream_until(rx: &mut WsRx, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        let msg = recv_json(rx).await;
        if msg["type"] == "stream" {
            seen.push_str(msg["data"].as_str().unwrap_or_default());
        }
    }
    seen
}

/// Wait for a close frame and return its code.
pub async fn recv_close(rx: &mut WsRx) -> Option<u16> {
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, rx.next()).await {
            Ok(Some(Ok(Message::Close(frame)))) => return frame.map(|f| u16::from(f.code)),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => panic!("timeout waiting for close frame"),
        }
    }
}

pub async fn send_json(tx: &mut WsTx, value: serde_json::Value) {
    tx.send(Message::text(value.to_string()))
        .await
        .expect("send failed");
}

/// Type one line into the shell.
pub async fn send_line(tx: &mut WsTx, line: &str) {
    send_json(
        tx,
        serde_json::json!({"type": "input", "data": format!("{line}\n")}),
    )
    .await;
}
