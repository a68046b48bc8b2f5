//! WebSocket gateway: binds one socket to one session.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::broker::Output;
use crate::orchestrator::{AttachKind, Attachment, OrchestratorError, SessionParams};
use crate::protocol::{
    decode_input, join_chunks, ClientMessage, DisconnectCause, ServerMessage, CLOSE_BREAKER_OPEN,
    CLOSE_EVICTED, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_POLICY, CLOSE_RATE_LIMITED,
    CLOSE_REPLACED, CLOSE_SESSION_CLOSED, CLOSE_SPAWN_FAILED, CLOSE_SUSPENSION_EXPIRED,
};
use crate::session::{validate_session_id, CloseReason, RegistryError, SessionEvent, SessionMode};

use super::error::ApiError;
use super::handlers::user_from_headers;
use super::AppState;

type WsSink = SplitSink<WebSocket, Message>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ConnectQuery {
    project_id: Option<String>,
    session_id: Option<String>,
    path: Option<String>,
    user_id: Option<String>,
    #[serde(default)]
    mode: SessionMode,
    rows: Option<u16>,
    cols: Option<u16>,
}

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return ApiError::ShuttingDown.into_response();
    }
    let project_id = match query.project_id.as_deref() {
        Some(p) if validate_session_id(p).is_ok() => p.to_string(),
        Some(p) => {
            return ApiError::InvalidRequest(format!("invalid projectId '{p}'")).into_response()
        }
        None => return ApiError::InvalidRequest("missing projectId".into()).into_response(),
    };
    let params = SessionParams {
        project_id,
        user_id: user_from_headers(&headers).or(query.user_id),
        path: query.path,
        mode: query.mode,
        rows: query.rows,
        cols: query.cols,
        shell: None,
    };
    let session_id = query.session_id.filter(|s| !s.is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, params))
        .into_response()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Close code for a failed attach.
fn attach_close_code(e: &OrchestratorError) -> u16 {
    match e {
        OrchestratorError::Registry(RegistryError::CircuitBreakerOpen { .. }) => CLOSE_BREAKER_OPEN,
        OrchestratorError::Registry(RegistryError::CreationRateExceeded { .. }) => {
            CLOSE_RATE_LIMITED
        }
        OrchestratorError::Registry(RegistryError::SuspensionExpired(_)) => {
            CLOSE_SUSPENSION_EXPIRED
        }
        OrchestratorError::Registry(RegistryError::SessionClosed(_)) => CLOSE_SESSION_CLOSED,
        e if e.is_spawn_failure() => CLOSE_SPAWN_FAILED,
        _ => CLOSE_POLICY,
    }
}

/// Close code sent when the registry closes the bound session.
fn closed_close_code(reason: CloseReason) -> (u16, &'static str) {
    match reason {
        CloseReason::ProcessExited => (CLOSE_NORMAL, "process exited"),
        CloseReason::Evicted => (CLOSE_EVICTED, "session evicted"),
        CloseReason::SuspensionExpired => (CLOSE_SUSPENSION_EXPIRED, "suspension expired"),
        CloseReason::Shutdown => (CLOSE_GOING_AWAY, "server shutting down"),
        CloseReason::SpawnFailed => (CLOSE_SPAWN_FAILED, "process failed to start"),
        CloseReason::Requested | CloseReason::KeepaliveExpired | CloseReason::MemoryPressure => {
            (CLOSE_SESSION_CLOSED, "session closed")
        }
    }
}

async fn send(ws_tx: &mut WsSink, msg: &ServerMessage) -> bool {
    ws_tx.send(Message::Text(msg.to_json().into())).await.is_ok()
}

async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}

/// Per-connection state for the main loop.
struct Connection {
    state: AppState,
    id: String,
    project: String,
}

enum Flow {
    Continue,
    Close,
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: Option<String>,
    params: SessionParams,
) {
    // Register this connection for graceful shutdown tracking
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Subscribe before attaching so no lifecycle event for this session is missed.
    let mut events = state.orchestrator.subscribe_events();

    let attachment = match state
        .orchestrator
        .attach(session_id.as_deref(), params)
        .await
    {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(error = %e, "connection rejected");
            send(&mut ws_tx, &ServerMessage::error(e.code(), e.to_string())).await;
            let code = attach_close_code(&e);
            send_close(&mut ws_tx, code, "attach failed").await;
            return;
        }
    };
    let Attachment {
        info,
        epoch,
        kind,
        process,
        initial,
        mut output,
    } = attachment;
    let conn = Connection {
        state: state.clone(),
        id: info.id.clone(),
        project: info.project_id.clone(),
    };
    tracing::info!(session = %conn.id, project = %conn.project, epoch, "socket bound");

    let greeted = match kind {
        AttachKind::New => {
            let focused = info.focused;
            send(
                &mut ws_tx,
                &ServerMessage::Connected {
                    session_id: conn.id.clone(),
                    session: info,
                    shell: process.shell().display_name(),
                    pid: process.pid(),
                },
            )
            .await
                && (initial.is_empty()
                    || send(&mut ws_tx, &ServerMessage::stream(join_chunks(&initial).as_bytes(), focused)).await)
        }
        AttachKind::Reconnected { history } => {
            send(
                &mut ws_tx,
                &ServerMessage::Reconnected {
                    session_id: conn.id.clone(),
                    session: info,
                },
            )
            .await
                && (history.is_empty()
                    || send(&mut ws_tx, &ServerMessage::History { data: join_chunks(&history) }).await)
        }
        AttachKind::Resumed { buffered } => {
            // The held output follows on `output` as a replay.
            tracing::debug!(session = %conn.id, buffered, "reattach lifted suspension");
            send(
                &mut ws_tx,
                &ServerMessage::Reconnected {
                    session_id: conn.id.clone(),
                    session: info,
                },
            )
            .await
        }
    };

    let mut cause = DisconnectCause::Network;
    let mut released = !greeted;

    while !released {
        tokio::select! {
            // Process output -> socket
            result = output.recv() => match result {
                Ok(item) => {
                    if !conn.forward(&mut ws_tx, &item).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(session = %conn.id, skipped = n, "socket fell behind, output dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            // Lifecycle events for this session and its project
            event = events.recv() => match event {
                Ok(event) => {
                    if let Flow::Close = conn.on_event(event, epoch, &mut ws_tx, &mut output).await {
                        released = true;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(session = %conn.id, skipped = n, "socket missed lifecycle events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            // Socket -> process
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Flow::Close = conn.on_message(text.as_str(), &mut ws_tx).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = state.orchestrator.write(&conn.id, Bytes::from(data)).await {
                        send(&mut ws_tx, &ServerMessage::error(e.code(), e.to_string())).await;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    cause = DisconnectCause::classify(frame.as_ref().map(|f| f.code));
                    break;
                }
                None => break,
                Some(Ok(_)) => continue, // Ping/Pong handled automatically
                Some(Err(e)) => {
                    tracing::debug!(session = %conn.id, error = %e, "socket error");
                    break;
                }
            },

            // Shutdown signal
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(session = %conn.id, "socket received shutdown signal, closing");
                    send_close(&mut ws_tx, CLOSE_GOING_AWAY, "server shutting down").await;
                    released = true;
                }
            }
        }
    }

    // A stale epoch is ignored, so this is safe after a replacement too.
    state.orchestrator.detach(&conn.id, epoch, cause);
    tracing::debug!(session = %conn.id, ?cause, "socket released");
    // _guard is dropped here, decrementing active connection count
}

impl Connection {
    /// Send one item of process output. Live chunks go out as `stream`,
    /// output held during a suspension as a single `buffered`.
    async fn forward(&self, ws_tx: &mut WsSink, item: &Output) -> bool {
        let msg = match item {
            Output::Data(chunk) => {
                let focused = self.state.orchestrator.registry().is_focused(&self.id);
                ServerMessage::stream(chunk, focused)
            }
            Output::Replay(chunks) => ServerMessage::Buffered {
                data: join_chunks(chunks),
            },
        };
        send(ws_tx, &msg).await
    }

    async fn on_event(
        &self,
        event: SessionEvent,
        epoch: u64,
        ws_tx: &mut WsSink,
        output: &mut broadcast::Receiver<Output>,
    ) -> Flow {
        let delivered = match event {
            SessionEvent::BindingReplaced { id, epoch: newer } if id == self.id && newer > epoch => {
                send_close(ws_tx, CLOSE_REPLACED, "replaced by a newer connection").await;
                return Flow::Close;
            }
            SessionEvent::FocusChanged {
                project_id,
                focused,
            } if project_id == self.project => {
                send(
                    ws_tx,
                    &ServerMessage::FocusUpdate {
                        focused_session_ids: focused,
                    },
                )
                .await
            }
            SessionEvent::Suspended {
                project_id,
                sessions,
            } if project_id == self.project => {
                send(ws_tx, &ServerMessage::Suspended { sessions }).await
            }
            SessionEvent::ProjectResumed {
                project_id,
                resumed,
                expired,
            } if project_id == self.project => {
                send(
                    ws_tx,
                    &ServerMessage::Resumed {
                        sessions: resumed,
                        expired,
                    },
                )
                .await
            }
            SessionEvent::Exited { id, code, .. } if id == self.id => {
                // Flush output that raced the exit notification.
                while let Ok(item) = output.try_recv() {
                    if !self.forward(ws_tx, &item).await {
                        return Flow::Close;
                    }
                }
                send(ws_tx, &ServerMessage::Exit { code }).await
            }
            SessionEvent::Closed { id, reason, .. } if id == self.id => {
                if reason == CloseReason::SuspensionExpired {
                    send(
                        ws_tx,
                        &ServerMessage::error("suspension_expired", "session suspension expired"),
                    )
                    .await;
                }
                let (code, why) = closed_close_code(reason);
                send_close(ws_tx, code, why).await;
                return Flow::Close;
            }
            _ => true,
        };
        if delivered {
            Flow::Continue
        } else {
            Flow::Close
        }
    }

    async fn on_message(&self, text: &str, ws_tx: &mut WsSink) -> Flow {
        let orchestrator = &self.state.orchestrator;
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(session = %self.id, error = %e, "bad client message");
                return self.reply(ws_tx, &ServerMessage::error(e.code(), e.to_string())).await;
            }
        };

        let result = match msg {
            ClientMessage::Input { data, encoding } => match decode_input(&data, encoding) {
                Ok(bytes) => orchestrator.write(&self.id, bytes).await,
                Err(e) => {
                    return self.reply(ws_tx, &ServerMessage::error(e.code(), e.to_string())).await
                }
            },
            ClientMessage::Resize { rows, cols } => orchestrator.resize(&self.id, rows, cols),
            ClientMessage::Ctrl { key } => orchestrator.ctrl(&self.id, key).await,
            ClientMessage::Env { key, value } => orchestrator.export_env(&self.id, &key, &value).await,
            ClientMessage::Ping => {
                orchestrator.ping(&self.id);
                return self.reply(ws_tx, &ServerMessage::Pong { ts: now_ms() }).await;
            }
            // Focus changes reach every socket of the project as focusUpdate.
            ClientMessage::Focus => orchestrator.focus(&self.id, true).map(|_| ()),
            ClientMessage::Blur => orchestrator.focus(&self.id, false).map(|_| ()),
            ClientMessage::Suspend => {
                let suspended = orchestrator.suspend_project(&self.project).await;
                if suspended.is_empty() {
                    return self
                        .reply(ws_tx, &ServerMessage::Suspended { sessions: suspended })
                        .await;
                }
                Ok(())
            }
            ClientMessage::Resume => {
                let report = orchestrator.resume_project(&self.project).await;
                if report.resumed.is_empty() && report.expired.is_empty() {
                    return self
                        .reply(
                            ws_tx,
                            &ServerMessage::Resumed {
                                sessions: Vec::new(),
                                expired: Vec::new(),
                            },
                        )
                        .await;
                }
                Ok(())
            }
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(e) => {
                tracing::debug!(session = %self.id, error = %e, "client request failed");
                self.reply(ws_tx, &ServerMessage::error(e.code(), e.to_string())).await
            }
        }
    }

    async fn reply(&self, ws_tx: &mut WsSink, msg: &ServerMessage) -> Flow {
        if send(ws_tx, msg).await {
            Flow::Continue
        } else {
            Flow::Close
        }
    }
}
