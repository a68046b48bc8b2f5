use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{AuditConfig, AuditSinkKind};

/// One auditable event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord<'a> {
    SessionOpened {
        session: &'a str,
        project: &'a str,
        user: Option<&'a str>,
        shell: &'a str,
    },
    Input {
        session: &'a str,
        bytes: usize,
    },
    Output {
        session: &'a str,
        bytes: usize,
    },
    SessionClosed {
        session: &'a str,
        reason: &'a str,
    },
}

/// Destination for session audit records. The default sink discards them.
pub trait LoggingSink: Send + Sync + 'static {
    fn record(&self, record: &AuditRecord<'_>);
}

pub struct NoopSink;

impl LoggingSink for NoopSink {
    fn record(&self, _record: &AuditRecord<'_>) {}
}

/// Emits records as `tracing` events on the `termgate::audit` target.
pub struct TracingSink;

impl LoggingSink for TracingSink {
    fn record(&self, record: &AuditRecord<'_>) {
        match serde_json::to_string(record) {
            Ok(json) => tracing::info!(target: "termgate::audit", record = %json),
            Err(e) => tracing::warn!(?e, "failed to encode audit record"),
        }
    }
}

/// Capacity of the queue between callers and the writer thread.
const JSONL_QUEUE_CAPACITY: usize = 4096;

/// Appends one JSON object per line to a file.
///
/// Callers only encode and enqueue; a dedicated thread owns the file and
/// writes through a buffer, flushing whenever the queue runs dry. Records
/// are dropped with a warning if the writer falls too far behind. Dropping
/// the sink flushes what is queued and joins the writer.
pub struct JsonlSink {
    tx: Option<mpsc::Sender<String>>,
    writer: Option<JoinHandle<()>>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = mpsc::channel(JSONL_QUEUE_CAPACITY);
        let writer = std::thread::Builder::new()
            .name("audit-jsonl".into())
            .spawn(move || write_lines(BufWriter::new(file), rx))?;
        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
        })
    }
}

fn write_lines(mut out: BufWriter<File>, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.blocking_recv() {
        let mut next = Some(line);
        while let Some(line) = next {
            if let Err(e) = writeln!(out, "{line}") {
                tracing::warn!(?e, "failed to write audit record");
            }
            next = rx.try_recv().ok();
        }
        if let Err(e) = out.flush() {
            tracing::warn!(?e, "failed to flush audit log");
        }
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        // Closing the channel ends the writer loop once the queue is drained.
        self.tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

#[derive(Serialize)]
struct Stamped<'a, 'b> {
    ts: u64,
    #[serde(flatten)]
    record: &'b AuditRecord<'a>,
}

impl LoggingSink for JsonlSink {
    fn record(&self, record: &AuditRecord<'_>) {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let line = match serde_json::to_string(&Stamped { ts, record }) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(?e, "failed to encode audit record");
                return;
            }
        };
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        match tx.try_send(line) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("audit queue full, dropping record (writer may be stalled)");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("audit writer has stopped");
            }
        }
    }
}

/// Build the sink selected in configuration.
pub fn from_config(cfg: &AuditConfig) -> std::io::Result<Arc<dyn LoggingSink>> {
    Ok(match cfg.sink {
        AuditSinkKind::None => Arc::new(NoopSink),
        AuditSinkKind::Tracing => Arc::new(TracingSink),
        AuditSinkKind::Jsonl => {
            let path = cfg.path.as_deref().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "jsonl audit sink needs a path")
            })?;
            Arc::new(JsonlSink::open(path)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlSink::open(&path).unwrap();

        sink.record(&AuditRecord::Input {
            session: "s1",
            bytes: 3,
        });
        sink.record(&AuditRecord::SessionClosed {
            session: "s1",
            reason: "requested",
        });
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "input");
        assert_eq!(lines[0]["bytes"], 3);
        assert!(lines[0]["ts"].as_u64().unwrap() > 0);
        assert_eq!(lines[1]["kind"], "session_closed");
    }

    #[test]
    fn jsonl_sink_keeps_order_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = Arc::new(JsonlSink::open(&path).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    let session = format!("s{t}");
                    for bytes in 0..200 {
                        sink.record(&AuditRecord::Output {
                            session: &session,
                            bytes,
                        });
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        drop(Arc::into_inner(sink).unwrap());

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut last = std::collections::HashMap::new();
        let mut count = 0;
        for line in contents.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            let bytes = v["bytes"].as_i64().unwrap();
            let prev = last.insert(v["session"].as_str().unwrap().to_string(), bytes);
            assert!(prev.map_or(bytes == 0, |p| bytes == p + 1));
            count += 1;
        }
        assert_eq!(count, 800);
    }

    #[test]
    fn from_config_selects_sink() {
        assert!(from_config(&AuditConfig::default()).is_ok());
        let missing_path = AuditConfig {
            sink: AuditSinkKind::Jsonl,
            path: None,
        };
        assert!(from_config(&missing_path).is_err());

        let dir = tempfile::tempdir().unwrap();
        let cfg = AuditConfig {
            sink: AuditSinkKind::Jsonl,
            path: Some(dir.path().join("a.jsonl")),
        };
        assert!(from_config(&cfg).is_ok());
    }
}
