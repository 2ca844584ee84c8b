//! Worker process supervision.
//!
//! # State Transitions
//! ```text
//! Spawning → Running → Exited → Spawning
//! ```
//!
//! The supervisor re-executes its own binary with the `worker` subcommand,
//! reads each child's stdout as the IPC channel and respawns any child that
//! exits. Termination kills every worker and returns.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::cluster::aggregate::{AggregateMetrics, MetricsSink};
use crate::cluster::ipc::WorkerMessage;
use crate::observability::access_log::{AccessLogSink, TracingAccessLog};
use crate::resilience::Backoff;

/// How long to wait for killed workers to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Program and arguments used to start a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Running,
    Exited,
}

struct WorkerSlot {
    pid: Option<u32>,
    state: WorkerState,
    kill: Option<oneshot::Sender<()>>,
}

enum Event {
    Message(WorkerMessage),
    Exited {
        id: u64,
        pid: Option<u32>,
        status: Option<ExitStatus>,
        voluntary: bool,
    },
    Respawn,
}

pub struct ClusterSupervisor {
    command: WorkerCommand,
    workers: usize,
    slots: HashMap<u64, WorkerSlot>,
    next_id: u64,
    aggregate: AggregateMetrics,
    sink: Box<dyn MetricsSink>,
    access_log: TracingAccessLog,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    respawn_backoff: Backoff,
    stopping: bool,
}

impl ClusterSupervisor {
    pub fn new(command: WorkerCommand, workers: usize, sink: Box<dyn MetricsSink>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            command,
            workers,
            slots: HashMap::new(),
            next_id: 0,
            aggregate: AggregateMetrics::new(),
            sink,
            access_log: TracingAccessLog,
            events_tx,
            events_rx,
            respawn_backoff: Backoff::new(100, 5000),
            stopping: false,
        }
    }

    /// Workers currently running.
    pub fn live_workers(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.state == WorkerState::Running)
            .count()
    }

    /// Spawn the worker pool and supervise it until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: std::future::Future<Output = ()>,
    {
        for n in 0..self.workers {
            tracing::info!(worker = n, "Spawning worker");
            self.spawn_worker()?;
        }

        tokio::pin!(shutdown);
        loop {
            let event = tokio::select! {
                event = self.events_rx.recv() => event,
                _ = &mut shutdown => None,
            };
            match event {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }

        self.terminate_all().await;
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<(), SupervisorError> {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(
            id,
            WorkerSlot {
                pid: None,
                state: WorkerState::Spawning,
                kill: None,
            },
        );

        let mut child = match Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.slots.remove(&id);
                return Err(SupervisorError::Spawn(e));
            }
        };

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.pid = pid;
            slot.state = WorkerState::Running;
            slot.kill = Some(kill_tx);
        }
        tracing::info!(pid = ?pid, "Worker started");

        let stdout = child.stdout.take();
        tokio::spawn(watch_worker(id, child, stdout, self.events_tx.clone(), kill_rx));
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Message(message) => self.handle_message(message),
            Event::Exited {
                id,
                pid,
                status,
                voluntary,
            } => {
                if let Some(slot) = self.slots.get_mut(&id) {
                    slot.state = WorkerState::Exited;
                }
                self.slots.retain(|_, slot| slot.state != WorkerState::Exited);

                let code = status.and_then(|s| s.code());
                let signal = status.and_then(exit_signal);
                if self.stopping {
                    tracing::info!(pid = ?pid, code = ?code, signal = ?signal, "Worker stopped");
                    return;
                }
                tracing::warn!(
                    pid = ?pid,
                    voluntary,
                    code = ?code,
                    signal = ?signal,
                    "Worker died. Spawning a new one."
                );
                self.respawn();
            }
            Event::Respawn => {
                if !self.stopping {
                    self.respawn();
                }
            }
        }
    }

    fn respawn(&mut self) {
        match self.spawn_worker() {
            Ok(()) => self.respawn_backoff.reset(),
            Err(e) => {
                let delay = self.respawn_backoff.next_delay();
                tracing::error!(error = %e, delay_ms = delay.as_millis() as u64, "Respawn failed");
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::Respawn);
                });
            }
        }
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Log { from, data } => {
                tracing::info!(target: "worker", "(worker #{}) {}", from, data);
            }
            WorkerMessage::AccessLog { data, .. } => self.access_log.record(data),
            WorkerMessage::Stats { data, .. } => {
                let live = self.live_workers();
                if let Some(records) = self.aggregate.merge(&data, live) {
                    for record in &records {
                        self.sink.publish(record);
                    }
                }
            }
        }
    }

    async fn terminate_all(&mut self) {
        self.stopping = true;
        for slot in self.slots.values_mut() {
            tracing::info!(pid = ?slot.pid, "Killing worker");
            if let Some(kill) = slot.kill.take() {
                let _ = kill.send(());
            }
        }

        let deadline = tokio::time::sleep(KILL_GRACE);
        tokio::pin!(deadline);
        while !self.slots.is_empty() {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(Event::Exited { id, pid, .. }) => {
                        self.slots.remove(&id);
                        tracing::debug!(pid = ?pid, "Worker reaped");
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::warn!(remaining = self.slots.len(), "Workers did not exit in time");
                    break;
                }
            }
        }
    }
}

/// Forward a child's IPC lines and report its exit.
async fn watch_worker(
    id: u64,
    mut child: Child,
    stdout: Option<tokio::process::ChildStdout>,
    events: mpsc::UnboundedSender<Event>,
    mut kill: oneshot::Receiver<()>,
) {
    let pid = child.id();
    let mut voluntary = false;

    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match WorkerMessage::decode(&line) {
                        Ok(message) => {
                            let _ = events.send(Event::Message(message));
                        }
                        Err(_) if !line.trim().is_empty() => {
                            tracing::info!(target: "worker", "(worker #{}) {}", pid.unwrap_or_default(), line);
                        }
                        Err(_) => {}
                    },
                    Ok(None) | Err(_) => break,
                },
                _ = &mut kill, if !voluntary => {
                    voluntary = true;
                    let _ = child.start_kill();
                }
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = &mut kill, if !voluntary => {
            voluntary = true;
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };

    let _ = events.send(Event::Exited {
        id,
        pid,
        status,
        voluntary,
    });
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cluster::aggregate::MetricsRecord;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<MetricsRecord>>>);

    impl MetricsSink for Shared {
        fn publish(&mut self, record: &MetricsRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn exited_workers_are_respawned() {
        let marker = std::env::temp_dir().join(format!("rm-respawn-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);
        let script = format!("echo x >> {}; exit 3", marker.display());

        let supervisor = ClusterSupervisor::new(sh(&script), 1, Box::new(Shared::default()));
        supervisor
            .run(tokio::time::sleep(Duration::from_millis(500)))
            .await
            .unwrap();

        let spawns = std::fs::read_to_string(&marker).unwrap_or_default().lines().count();
        let _ = std::fs::remove_file(&marker);
        assert!(spawns >= 2, "expected a respawn, saw {spawns} spawns");
    }

    #[tokio::test]
    async fn stats_lines_reach_the_sink() {
        let line = r#"{"type":"stats","from":1,"data":{"app.test":{"bytes_written":5,"bytes_read":1,"count":2,"rt":4.0}}}"#;
        let script = format!("echo '{line}'; sleep 5");
        let sink = Shared::default();

        let supervisor = ClusterSupervisor::new(sh(&script), 1, Box::new(sink.clone()));
        supervisor
            .run(tokio::time::sleep(Duration::from_millis(500)))
            .await
            .unwrap();

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 2);
        assert_eq!(records[0].virtual_host, "app.test");
    }

    #[tokio::test]
    async fn termination_kills_long_running_workers() {
        let marker = std::env::temp_dir().join(format!("rm-terminate-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);
        let script = format!("echo $$ >> {}; exec sleep 60", marker.display());

        let supervisor = ClusterSupervisor::new(sh(&script), 2, Box::new(Shared::default()));
        let started = std::time::Instant::now();
        let result = supervisor
            .run(tokio::time::sleep(Duration::from_millis(500)))
            .await;

        assert!(result.is_ok());
        assert!(started.elapsed() < KILL_GRACE);

        let pids: Vec<String> = std::fs::read_to_string(&marker)
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect();
        let _ = std::fs::remove_file(&marker);
        assert_eq!(pids.len(), 2);
        for pid in pids {
            let alive = std::process::Command::new("kill")
                .args(["-0", &pid])
                .stderr(Stdio::null())
                .status()
                .unwrap()
                .success();
            assert!(!alive, "worker {pid} still running");
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let command = WorkerCommand::new("/nonexistent/route-machine-worker");
        let supervisor = ClusterSupervisor::new(command, 1, Box::new(Shared::default()));
        let result = supervisor.run(std::future::pending()).await;
        assert!(matches!(result, Err(SupervisorError::Spawn(_))));
    }
}
