//! Channel to the transcription worker subprocess.
//!
//! An actor owns the child process and is the single writer to its stdin;
//! everything else talks through a cloneable [`WorkerHandle`]. The worker's
//! stdout is read line by line, parsed by the protocol codec, stamped with the
//! currently bound job and forwarded to the controller. Reading and writing
//! are independent: a pending command never stalls event delivery.
//!
//! Spawning is lazy and idempotent: `ensure_ready` starts the process on
//! first use and gates on the worker's `ready` event; while one healthcheck
//! is in flight further callers just queue on the same process. If the child
//! exits unexpectedly the actor synthesizes an `error` event for whatever job
//! was bound and respawns on the next use.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::Settings;
use crate::job::JobId;
use crate::protocol::{self, Command, WorkerEvent};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker did not report ready within {0:?}")]
    HealthcheckTimeout(Duration),
    #[error("worker exited unexpectedly ({0})")]
    Crashed(String),
    #[error("worker channel is closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Ready,
    Busy,
    Crashed,
    ShuttingDown,
}

/// How to start the worker and how long to wait for its `ready`.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: String,
    pub args: Vec<String>,
    pub healthcheck_timeout: Duration,
}

impl WorkerSpec {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut cmd = settings.worker_cmd.iter();
        let program = cmd.next().cloned().unwrap_or_default();
        Self {
            program,
            args: cmd.cloned().collect(),
            healthcheck_timeout: Duration::from_secs(settings.healthcheck_timeout_sec),
        }
    }
}

/// The job that worker events currently belong to. Written only by the
/// controller: set when a job's first command goes out, cleared the moment a
/// cancellation commits, so anything the reader stamps afterwards is
/// recognizably stale.
#[derive(Debug, Clone, Default)]
pub struct JobBinding(Arc<AtomicU64>);

impl JobBinding {
    pub fn bind(&self, id: JobId) {
        self.0.store(id, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<JobId> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }
}

/// A worker event stamped with the job it was bound to when it arrived.
/// `job` is `None` for lifecycle-independent events (ready, metrics, global
/// errors).
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedEvent {
    pub job: Option<JobId>,
    pub event: WorkerEvent,
}

pub enum WorkerRequest {
    /// Write one command line to the worker.
    Command(Command),
    /// Spawn if necessary and resolve once the worker has reported ready.
    EnsureReady(oneshot::Sender<Result<(), WorkerError>>),
    /// Kill the current process quietly; the next use respawns. For hung
    /// workers the controller has already failed the job.
    Restart,
    Status(oneshot::Sender<WorkerStatus>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub pid: Option<u32>,
}

#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
}

impl WorkerHandle {
    pub async fn send(&self, cmd: Command) -> Result<(), WorkerError> {
        self.tx
            .send(WorkerRequest::Command(cmd))
            .await
            .map_err(|_| WorkerError::ChannelClosed)
    }

    pub async fn ensure_ready(&self) -> Result<(), WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest::EnsureReady(reply))
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }

    pub async fn restart(&self) {
        let _ = self.tx.send(WorkerRequest::Restart).await;
    }

    pub async fn status(&self) -> Result<WorkerStatus, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest::Status(reply))
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        rx.await.map_err(|_| WorkerError::ChannelClosed)
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(WorkerRequest::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    generation: u64,
}

/// The actor. Owns the child process and all of its pipes.
pub struct WorkerChannel {
    spec: WorkerSpec,
    binding: JobBinding,
    events_tx: mpsc::Sender<ScopedEvent>,
    mailbox: mpsc::Receiver<WorkerRequest>,
    reader_tx: mpsc::Sender<(u64, WorkerEvent)>,
    reader_rx: mpsc::Receiver<(u64, WorkerEvent)>,
    state: WorkerState,
    process: Option<WorkerProcess>,
    generation: u64,
    ready_waiters: Vec<oneshot::Sender<Result<(), WorkerError>>>,
    ready_deadline: Option<Instant>,
}

impl WorkerChannel {
    /// Spawn the channel actor; the process itself starts lazily.
    pub fn spawn(
        spec: WorkerSpec,
        binding: JobBinding,
        events_tx: mpsc::Sender<ScopedEvent>,
    ) -> WorkerHandle {
        let (tx, mailbox) = mpsc::channel(32);
        let (reader_tx, reader_rx) = mpsc::channel(256);

        let actor = Self {
            spec,
            binding,
            events_tx,
            mailbox,
            reader_tx,
            reader_rx,
            state: WorkerState::NotStarted,
            process: None,
            generation: 0,
            ready_waiters: Vec::new(),
            ready_deadline: None,
        };
        tokio::spawn(actor.run());

        WorkerHandle { tx }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                req = self.mailbox.recv() => {
                    match req {
                        Some(WorkerRequest::Shutdown(reply)) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(req) => self.handle_request(req).await,
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }

                Some((generation, event)) = self.reader_rx.recv() => {
                    if generation == self.generation {
                        self.handle_event(event).await;
                    } else {
                        tracing::debug!(?event, "dropping event from a previous worker process");
                    }
                }

                status = wait_for_exit(&mut self.process), if self.process.is_some() => {
                    self.handle_exit(status).await;
                }

                _ = sleep_opt(self.ready_deadline), if self.ready_deadline.is_some() => {
                    self.handle_healthcheck_timeout().await;
                }
            }
        }
    }

    async fn handle_request(&mut self, req: WorkerRequest) {
        match req {
            WorkerRequest::Command(cmd) => self.write_command(cmd).await,
            WorkerRequest::EnsureReady(reply) => self.ensure_ready(reply).await,
            WorkerRequest::Restart => {
                tracing::info!("Restarting worker on request");
                self.kill_process().await;
                self.state = WorkerState::NotStarted;
            }
            WorkerRequest::Status(reply) => {
                let state = match self.state {
                    WorkerState::Ready if self.binding.current().is_some() => WorkerState::Busy,
                    other => other,
                };
                let pid = self.process.as_ref().and_then(|p| p.child.id());
                let _ = reply.send(WorkerStatus { state, pid });
            }
            WorkerRequest::Shutdown(_) => unreachable!("handled in run"),
        }
    }

    async fn ensure_ready(&mut self, reply: oneshot::Sender<Result<(), WorkerError>>) {
        match self.state {
            WorkerState::Ready | WorkerState::Busy => {
                let _ = reply.send(Ok(()));
            }
            WorkerState::Starting => {
                self.ready_waiters.push(reply);
            }
            WorkerState::ShuttingDown => {
                let _ = reply.send(Err(WorkerError::ChannelClosed));
            }
            WorkerState::NotStarted | WorkerState::Crashed => {
                if let Err(e) = self.spawn_process() {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.state = WorkerState::Starting;
                self.ready_waiters.push(reply);
                self.ready_deadline = Some(Instant::now() + self.spec.healthcheck_timeout);
                self.write_command(Command::Init).await;
                self.write_command(Command::Healthcheck).await;
            }
        }
    }

    fn spawn_process(&mut self) -> Result<(), WorkerError> {
        let mut cmd = tokio::process::Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            program: self.spec.program.clone(),
            source,
        })?;

        self.generation += 1;
        let generation = self.generation;

        // The actor keeps stdin; stdout/stderr go to reader tasks.
        let stdin = child.stdin.take().ok_or_else(|| WorkerError::Spawn {
            program: self.spec.program.clone(),
            source: std::io::Error::other("failed to capture worker stdin"),
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_events(stdout, generation, self.reader_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        tracing::info!(
            program = %self.spec.program,
            pid = child.id(),
            "Worker process started"
        );

        self.process = Some(WorkerProcess {
            child,
            stdin,
            generation,
        });
        Ok(())
    }

    async fn write_command(&mut self, cmd: Command) {
        let Some(process) = self.process.as_mut() else {
            // A start/stop with no live process means the job cannot proceed;
            // cancel and shutdown with nothing running are no-ops.
            if matches!(
                cmd,
                Command::StartRecording | Command::StopAndTranscribe { .. }
            ) {
                self.forward(WorkerEvent::Error {
                    message: "transcription worker is not running".to_string(),
                })
                .await;
            }
            return;
        };

        let line = protocol::encode_command(&cmd);
        tracing::debug!(line = %line.trim_end(), "worker command");

        let write = async {
            process.stdin.write_all(line.as_bytes()).await?;
            process.stdin.flush().await
        };

        if let Err(e) = write.await {
            tracing::warn!("Failed to write worker command: {}", e);
            // The exit branch will pick the crash up; nothing more to do here.
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        if let WorkerEvent::Ready { device, model } = &event {
            tracing::info!(?device, ?model, "Worker is ready");
            if self.state == WorkerState::Starting {
                self.state = WorkerState::Ready;
                self.ready_deadline = None;
                for waiter in self.ready_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
        self.forward(event).await;
    }

    async fn forward(&self, event: WorkerEvent) {
        let job = match &event {
            WorkerEvent::Ready { .. } | WorkerEvent::Metrics { .. } => None,
            _ => self.binding.current(),
        };
        if self.events_tx.send(ScopedEvent { job, event }).await.is_err() {
            tracing::debug!("Controller event sink is gone");
        }
    }

    async fn handle_exit(&mut self, status: std::io::Result<std::process::ExitStatus>) {
        let status = match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        };

        self.process = None;
        if self.state == WorkerState::ShuttingDown {
            return;
        }

        tracing::warn!(%status, "Worker exited unexpectedly");
        self.state = WorkerState::Crashed;
        self.ready_deadline = None;

        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(WorkerError::Crashed(status.clone())));
        }

        // Crash detection outranks any pending response wait: the bound job
        // fails now rather than when its transcript never shows up.
        self.forward(WorkerEvent::Error {
            message: format!(
                "transcription worker exited unexpectedly ({status}); it will restart on next use"
            ),
        })
        .await;
    }

    async fn handle_healthcheck_timeout(&mut self) {
        tracing::warn!(
            timeout = ?self.spec.healthcheck_timeout,
            "Worker healthcheck timed out"
        );
        self.ready_deadline = None;
        self.kill_process().await;
        self.state = WorkerState::NotStarted;

        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(WorkerError::HealthcheckTimeout(
                self.spec.healthcheck_timeout,
            )));
        }
    }

    async fn kill_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = process.child.start_kill();
            let _ = process.child.wait().await;
        }
    }

    async fn shutdown(&mut self) {
        self.state = WorkerState::ShuttingDown;
        if let Some(process) = self.process.as_mut() {
            let line = protocol::encode_command(&Command::Shutdown);
            let _ = process.stdin.write_all(line.as_bytes()).await;
            let _ = process.stdin.flush().await;
        }
        self.kill_process().await;
        tracing::info!("Worker channel shut down");
    }
}

async fn wait_for_exit(
    process: &mut Option<WorkerProcess>,
) -> std::io::Result<std::process::ExitStatus> {
    match process.as_mut() {
        Some(p) => p.child.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Read loop over the worker's stdout: one event per line, parse failures
/// logged and skipped, never fatal to the loop.
async fn read_events(
    stdout: tokio::process::ChildStdout,
    generation: u64,
    tx: mpsc::Sender<(u64, WorkerEvent)>,
) {
    let mut lines = BufReader::new(stdout).split(b'\n');

    loop {
        match lines.next_segment().await {
            Ok(Some(raw)) => {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match protocol::parse_event(line) {
                    Ok(event) => {
                        if tx.send((generation, event)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!("Discarding worker line: {}", e),
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Worker stdout read error: {}", e);
                return;
            }
        }
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::warn!("worker stderr: {}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    /// A scripted stand-in for the transcription worker.
    const COOPERATIVE_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"healthcheck"'*) printf '{"event":"ready","device":"cpu","model":"stub"}\n';;
    *'"start_recording"'*) printf '{"event":"recording_started"}\n';;
    *'"stop_and_transcribe"'*) printf '{"event":"recording_stopped"}\n{"event":"partial_transcript","text":"hello"}\n{"event":"final_transcript","text":"hello world"}\n{"event":"metrics","latency_ms":5,"device":"cpu","model":"stub"}\n';;
    *'"cancel_current"'*) printf '{"event":"job_cancelled"}\n';;
    *'"shutdown"'*) exit 0;;
  esac
done
"#;

    fn script_spec(dir: &tempfile::TempDir, body: &str, timeout: Duration) -> WorkerSpec {
        let path = dir.path().join("worker.sh");
        std::fs::write(&path, body).unwrap();
        WorkerSpec {
            program: "sh".to_string(),
            args: vec![path.to_string_lossy().into_owned()],
            healthcheck_timeout: timeout,
        }
    }

    struct Rig {
        handle: WorkerHandle,
        binding: JobBinding,
        events: mpsc::Receiver<ScopedEvent>,
        _dir: tempfile::TempDir,
    }

    fn rig(body: &str, timeout: Duration) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let spec = script_spec(&dir, body, timeout);
        let binding = JobBinding::default();
        let (events_tx, events) = mpsc::channel(64);
        let handle = WorkerChannel::spawn(spec, binding.clone(), events_tx);
        Rig {
            handle,
            binding,
            events,
            _dir: dir,
        }
    }

    async fn next_event(rig: &mut Rig) -> ScopedEvent {
        tokio::time::timeout(RECV_TIMEOUT, rig.events.recv())
            .await
            .expect("timed out waiting for worker event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn ensure_ready_is_idempotent_and_keeps_one_process() {
        let mut rig = rig(COOPERATIVE_WORKER, Duration::from_secs(5));

        rig.handle.ensure_ready().await.unwrap();
        let first = rig.handle.status().await.unwrap();
        assert_eq!(first.state, WorkerState::Ready);
        assert!(first.pid.is_some());

        rig.handle.ensure_ready().await.unwrap();
        let second = rig.handle.status().await.unwrap();
        assert_eq!(second.pid, first.pid);

        // The gate's ready event is forwarded, unscoped.
        let ev = next_event(&mut rig).await;
        assert_eq!(ev.job, None);
        assert!(matches!(ev.event, WorkerEvent::Ready { .. }));

        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn events_are_stamped_with_the_bound_job() {
        let mut rig = rig(COOPERATIVE_WORKER, Duration::from_secs(5));
        rig.handle.ensure_ready().await.unwrap();
        assert!(matches!(next_event(&mut rig).await.event, WorkerEvent::Ready { .. }));

        rig.binding.bind(4);
        rig.handle.send(Command::StartRecording).await.unwrap();
        assert_eq!(
            next_event(&mut rig).await,
            ScopedEvent {
                job: Some(4),
                event: WorkerEvent::RecordingStarted
            }
        );

        rig.handle
            .send(Command::StopAndTranscribe {
                audio_path: PathBuf::from("/tmp/take.wav"),
            })
            .await
            .unwrap();

        assert_eq!(next_event(&mut rig).await.job, Some(4)); // recording_stopped
        assert_eq!(next_event(&mut rig).await.job, Some(4)); // partial
        let last = next_event(&mut rig).await;
        assert_eq!(
            last.event,
            WorkerEvent::FinalTranscript {
                text: "hello world".into()
            }
        );
        assert_eq!(last.job, Some(4));

        // Metrics are lifecycle-independent, never job-scoped.
        assert_eq!(next_event(&mut rig).await.job, None);

        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn crash_synthesizes_error_for_the_bound_job_and_respawns() {
        let crashing = r#"
while IFS= read -r line; do
  case "$line" in
    *'"healthcheck"'*) printf '{"event":"ready"}\n';;
    *'"start_recording"'*) exit 3;;
    *'"shutdown"'*) exit 0;;
  esac
done
"#;
        let mut rig = rig(crashing, Duration::from_secs(5));
        rig.handle.ensure_ready().await.unwrap();
        assert!(matches!(next_event(&mut rig).await.event, WorkerEvent::Ready { .. }));
        let first_pid = rig.handle.status().await.unwrap().pid;

        rig.binding.bind(9);
        rig.handle.send(Command::StartRecording).await.unwrap();

        let ev = next_event(&mut rig).await;
        assert_eq!(ev.job, Some(9));
        assert!(
            matches!(ev.event, WorkerEvent::Error { ref message } if message.contains("exited unexpectedly"))
        );
        assert_eq!(
            rig.handle.status().await.unwrap().state,
            WorkerState::Crashed
        );

        // Lazy respawn on the next use.
        rig.binding.clear();
        rig.handle.ensure_ready().await.unwrap();
        let second_pid = rig.handle.status().await.unwrap().pid;
        assert!(second_pid.is_some());
        assert_ne!(second_pid, first_pid);

        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_lines_are_logged_and_skipped() {
        let noisy = r#"
while IFS= read -r line; do
  case "$line" in
    *'"healthcheck"'*) printf 'this is not json\n{"event":"telepathy"}\n{"event":"ready"}\n';;
    *'"start_recording"'*) printf '{"event":"recording_started"}\n';;
    *'"shutdown"'*) exit 0;;
  esac
done
"#;
        let mut rig = rig(noisy, Duration::from_secs(5));
        // The gate still resolves on the valid ready that follows the noise.
        rig.handle.ensure_ready().await.unwrap();

        // And exactly one event came through: the garbage was discarded
        // without killing the loop.
        assert!(matches!(next_event(&mut rig).await.event, WorkerEvent::Ready { .. }));
        rig.binding.bind(1);
        rig.handle.send(Command::StartRecording).await.unwrap();
        assert_eq!(
            next_event(&mut rig).await.event,
            WorkerEvent::RecordingStarted
        );

        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn silent_worker_trips_the_healthcheck_timeout() {
        let mute = "exec sleep 30\n";
        let rig = rig(mute, Duration::from_millis(200));

        let err = rig.handle.ensure_ready().await.unwrap_err();
        assert!(matches!(err, WorkerError::HealthcheckTimeout(_)));

        rig.handle.shutdown().await;
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_failure() {
        let binding = JobBinding::default();
        let (events_tx, _events) = mpsc::channel(8);
        let handle = WorkerChannel::spawn(
            WorkerSpec {
                program: "/nonexistent/pushtalk-worker".to_string(),
                args: vec![],
                healthcheck_timeout: Duration::from_secs(1),
            },
            binding,
            events_tx,
        );

        let err = handle.ensure_ready().await.unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
        handle.shutdown().await;
    }
}
