//! JSON message protocol spoken over the terminal socket.
//!
//! Every frame is a text message holding one JSON object tagged by `type`.
//! Binary frames from the client are treated as raw terminal input.

use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::KeepaliveConfig;
use crate::session::SessionInfo;

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY: u16 = 1008;
pub const CLOSE_TOO_BIG: u16 = 1009;

/// Application range reserved for operator-triggered closes.
pub const OPERATOR_RANGE: std::ops::RangeInclusive<u16> = 4000..=4099;

pub const CLOSE_BREAKER_OPEN: u16 = 4001;
pub const CLOSE_RATE_LIMITED: u16 = 4002;
pub const CLOSE_EVICTED: u16 = 4003;
pub const CLOSE_REPLACED: u16 = 4004;
pub const CLOSE_SPAWN_FAILED: u16 = 4100;
pub const CLOSE_SESSION_CLOSED: u16 = 4101;
pub const CLOSE_SUSPENSION_EXPIRED: u16 = 4102;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CtrlKey {
    Interrupt,
    Eof,
    Suspend,
    Quit,
    Clear,
    Escape,
    WordErase,
    LineKill,
}

impl CtrlKey {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Interrupt => b"\x03",
            Self::Eof => b"\x04",
            Self::Suspend => b"\x1a",
            Self::Quit => b"\x1c",
            Self::Clear => b"\x0c",
            Self::Escape => b"\x1b",
            Self::WordErase => b"\x17",
            Self::LineKill => b"\x15",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Input {
        data: String,
        #[serde(default)]
        encoding: InputEncoding,
    },
    Resize {
        rows: u16,
        cols: u16,
    },
    Ctrl {
        key: CtrlKey,
    },
    Env {
        key: String,
        value: String,
    },
    Ping,
    Focus,
    Blur,
    Suspend,
    Resume,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 input: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl DecodeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Json(_) => "bad_message",
            Self::Base64(_) => "bad_encoding",
        }
    }
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Decode the payload of an `input` message into raw bytes.
pub fn decode_input(data: &str, encoding: InputEncoding) -> Result<Bytes, DecodeError> {
    match encoding {
        InputEncoding::Utf8 => Ok(Bytes::copy_from_slice(data.as_bytes())),
        InputEncoding::Base64 => Ok(Bytes::from(
            base64::engine::general_purpose::STANDARD.decode(data)?,
        )),
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        session_id: String,
        session: SessionInfo,
        shell: String,
        pid: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    Reconnected {
        session_id: String,
        session: SessionInfo,
    },
    /// Recent output replayed on a routine reconnect.
    History { data: String },
    /// Output captured while suspended, replayed on resume.
    Buffered { data: String },
    Stream {
        data: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        unfocused: bool,
    },
    Exit { code: Option<u32> },
    Error { code: String, message: String },
    Pong { ts: u64 },
    Suspended { sessions: Vec<String> },
    Resumed { sessions: Vec<String>, expired: Vec<String> },
    #[serde(rename_all = "camelCase")]
    FocusUpdate { focused_session_ids: Vec<String> },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn stream(chunk: &[u8], focused: bool) -> Self {
        Self::Stream {
            data: String::from_utf8_lossy(chunk).into_owned(),
            unfocused: !focused,
        }
    }

    pub fn to_json(&self) -> String {
        // Serialization of these plain structs cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","code":"internal","message":"serialization failed"}"#.to_string()
        })
    }
}

/// Concatenate replay chunks into one text payload.
pub fn join_chunks(chunks: &[Bytes]) -> String {
    let total: usize = chunks.iter().map(|c| c.len()).sum();
    let mut buf = Vec::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(chunk);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ---------------------------------------------------------------------------
// Disconnect policy
// ---------------------------------------------------------------------------

/// Why a socket went away, as inferred from its close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Client closed deliberately (tab closed, explicit disconnect).
    Intentional,
    /// Navigation or page reload.
    PageReload,
    /// Closed for a protocol violation or operator limit.
    PolicyLimit,
    /// Anything else, including no close frame at all.
    Network,
}

impl DisconnectCause {
    pub fn classify(code: Option<u16>) -> Self {
        match code {
            Some(CLOSE_NORMAL) => Self::Intentional,
            Some(CLOSE_GOING_AWAY) => Self::PageReload,
            Some(CLOSE_POLICY) | Some(CLOSE_TOO_BIG) => Self::PolicyLimit,
            Some(c) if OPERATOR_RANGE.contains(&c) => Self::PolicyLimit,
            _ => Self::Network,
        }
    }

    /// How long the process is kept after the socket is gone.
    pub fn keepalive(self, cfg: &KeepaliveConfig) -> Duration {
        Duration::from_secs(match self {
            Self::Intentional => cfg.intentional_secs,
            Self::PageReload => cfg.reload_secs,
            Self::PolicyLimit => cfg.policy_secs,
            Self::Network => cfg.network_secs,
        })
    }
}
