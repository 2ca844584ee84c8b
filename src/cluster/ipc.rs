//! Worker → supervisor messages.
//!
//! Workers write one JSON object per line to stdout, tagged by `type`.
//! The supervisor reads the child's stdout line by line.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing_subscriber::fmt::MakeWriter;

use crate::observability::access_log::{AccessLogSink, AccessRecord};
use crate::registry::StatsSnapshot;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("malformed IPC message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IPC channel closed")]
    Closed,

    #[error("IPC write failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    Log { from: u32, data: String },
    AccessLog { from: u32, data: AccessRecord },
    Stats { from: u32, data: StatsSnapshot },
}

impl WorkerMessage {
    /// Newline-terminated JSON.
    pub fn encode(&self) -> Result<Vec<u8>, IpcError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self, IpcError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// Cloneable handle for queueing messages to the supervisor.
#[derive(Debug, Clone)]
pub struct IpcSender {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    pid: u32,
}

impl IpcSender {
    pub fn channel(pid: u32) -> (Self, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, pid }, rx)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn send(&self, message: WorkerMessage) -> Result<(), IpcError> {
        self.tx.send(message).map_err(|_| IpcError::Closed)
    }

    /// Queue a log line. Falls back to stderr once the channel is gone.
    pub fn log(&self, line: &str) {
        let message = WorkerMessage::Log {
            from: self.pid,
            data: line.to_string(),
        };
        if self.send(message).is_err() {
            eprintln!("(worker #{}) {}", self.pid, line);
        }
    }

    pub fn stats(&self, snapshot: StatsSnapshot) -> Result<(), IpcError> {
        self.send(WorkerMessage::Stats {
            from: self.pid,
            data: snapshot,
        })
    }
}

impl AccessLogSink for IpcSender {
    fn record(&self, record: AccessRecord) {
        let _ = self.send(WorkerMessage::AccessLog {
            from: self.pid,
            data: record,
        });
    }
}

/// Buffers one formatted event and queues it as `log` lines when dropped.
pub struct LineWriter {
    sender: IpcSender,
    buf: Vec<u8>,
}

impl io::Write for LineWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.sender.log(line);
        }
    }
}

impl<'a> MakeWriter<'a> for IpcSender {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter {
            sender: self.clone(),
            buf: Vec::new(),
        }
    }
}

/// Drain queued messages into `out` until every sender is dropped.
pub async fn pump<W>(mut rx: mpsc::UnboundedReceiver<WorkerMessage>, mut out: W) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        out.write_all(&message.encode()?).await?;
        out.flush().await?;
    }
    Ok(())
}
