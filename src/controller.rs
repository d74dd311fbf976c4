//! The session controller: owns the single active job and is the only
//! component that commits state transitions.
//!
//! Everything reaches it as a message: hotkey transitions and UI requests as
//! [`Intent`]s, worker output as [`ScopedEvent`]s. The controller itself is a
//! single task, so job and worker bookkeeping need no locks; the one piece of
//! shared state is the [`JobBinding`] it publishes for the worker channel's
//! event stamping.
//!
//! Invariants enforced here:
//! - at most one job is non-terminal at any instant (a retrigger cancels the
//!   old job synchronously before the new one starts);
//! - the temp audio file is deleted exactly once on every terminal
//!   transition, including worker crashes;
//! - events stamped with a stale job id, or illegal in the current state,
//!   are discarded before they reach listeners.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::broadcast::{Broadcaster, UiEvent};
use crate::clipboard::ClipboardSink;
use crate::config::Settings;
use crate::job::{Job, JobId, JobSnapshot, JobState};
use crate::messages::Intent;
use crate::protocol::{Command, WorkerEvent};
use crate::services::RecorderHandle;
use crate::worker::{JobBinding, ScopedEvent, WorkerHandle};

pub struct Controller {
    settings: Settings,
    intents: mpsc::Receiver<Intent>,
    worker_events: mpsc::Receiver<ScopedEvent>,
    worker: WorkerHandle,
    binding: JobBinding,
    recorder: RecorderHandle,
    broadcaster: Broadcaster,
    clipboard: Box<dyn ClipboardSink + Send>,
    active: Option<Job>,
    next_job_id: JobId,
    hide_popup_at: Option<Instant>,
    transcribe_deadline: Option<Instant>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        intents: mpsc::Receiver<Intent>,
        worker_events: mpsc::Receiver<ScopedEvent>,
        worker: WorkerHandle,
        binding: JobBinding,
        recorder: RecorderHandle,
        broadcaster: Broadcaster,
        clipboard: Box<dyn ClipboardSink + Send>,
    ) -> Self {
        Self {
            settings,
            intents,
            worker_events,
            worker,
            binding,
            recorder,
            broadcaster,
            clipboard,
            active: None,
            next_job_id: 1,
            hide_popup_at: None,
            transcribe_deadline: None,
        }
    }

    /// Run until the intent channel closes or a Shutdown intent arrives.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                intent = self.intents.recv() => {
                    match intent {
                        None | Some(Intent::Shutdown) => break,
                        Some(intent) => self.handle_intent(intent).await,
                    }
                }

                Some(scoped) = self.worker_events.recv() => {
                    self.handle_worker_event(scoped).await;
                }

                _ = sleep_opt(self.hide_popup_at), if self.hide_popup_at.is_some() => {
                    self.hide_popup_at = None;
                    self.broadcaster.publish(UiEvent::HidePopup);
                }

                _ = sleep_opt(self.transcribe_deadline), if self.transcribe_deadline.is_some() => {
                    self.handle_transcribe_timeout().await;
                }
            }
        }

        tracing::info!("Controller shutting down");
        self.cancel_active().await;
        self.worker.shutdown().await;
    }

    async fn handle_intent(&mut self, intent: Intent) {
        tracing::debug!(?intent, "Handling intent");
        match intent {
            Intent::HotkeyPressed => self.start_job().await,
            Intent::HotkeyReleased => self.finish_recording().await,
            Intent::CancelActive => self.cancel_active().await,
            Intent::SettingsChanged(settings) => self.apply_settings(settings).await,
            Intent::Shutdown => {}
        }
    }

    /// Idle -> Recording, cancelling any live job first (retrigger).
    async fn start_job(&mut self) {
        if self.active_live_id().is_some() {
            tracing::info!("Retrigger: cancelling active job before starting a new one");
            self.cancel_active().await;
        }
        self.hide_popup_at = None;

        if let Err(e) = self.worker.ensure_ready().await {
            self.publish_error(None, format!("Cannot start transcription worker: {e}"));
            return;
        }

        let temp = match tempfile::Builder::new()
            .prefix("pushtalk-")
            .suffix(".wav")
            .tempfile()
        {
            Ok(temp) => temp,
            Err(e) => {
                // Core bookkeeping failure, not a worker problem.
                self.publish_error(None, format!("Failed to create temp audio file: {e}"));
                return;
            }
        };

        let id = self.next_job_id;
        self.next_job_id += 1;
        let mut job = Job::new(id, temp);

        let path = match job.audio_path().map(Path::to_owned) {
            Some(path) => path,
            None => return,
        };

        if let Err(e) = self.recorder.start(path).await {
            job.finish(JobState::Failed);
            self.publish_error(None, format!("Failed to open audio capture: {e}"));
            return;
        }

        self.binding.bind(id);
        let _ = self.worker.send(Command::StartRecording).await;

        tracing::info!(job = id, "Job transition: Idle -> Recording");
        self.active = Some(job);
        self.publish_state();
    }

    /// Recording -> Transcribing on hotkey release.
    async fn finish_recording(&mut self) {
        let id = match &self.active {
            Some(job) if job.state == JobState::Recording => job.id,
            _ => {
                tracing::debug!("Hotkey released with no recording in progress");
                return;
            }
        };

        if let Err(e) = self.recorder.stop().await {
            self.fail_active(format!("Failed to finalize recording: {e}"))
                .await;
            return;
        }

        let Some(job) = self.active.as_mut() else { return };
        let path = match job.audio_path().map(Path::to_owned) {
            Some(path) => path,
            None => return,
        };
        job.state = JobState::Transcribing;
        tracing::info!(job = id, "Job transition: Recording -> Transcribing");

        let _ = self
            .worker
            .send(Command::StopAndTranscribe { audio_path: path })
            .await;
        self.transcribe_deadline =
            Some(Instant::now() + Duration::from_secs(self.settings.transcribe_timeout_sec));
        self.publish_state();
    }

    async fn handle_worker_event(&mut self, scoped: ScopedEvent) {
        tracing::debug!(job = ?scoped.job, event = ?scoped.event, "Worker event");

        match scoped.event {
            WorkerEvent::Ready { device, model } => {
                tracing::info!(?device, ?model, "Worker ready");
            }

            WorkerEvent::Metrics {
                latency_ms,
                device,
                model,
            } => {
                tracing::info!(?latency_ms, ?device, ?model, "Worker metrics");
                self.broadcaster.publish(UiEvent::Metrics {
                    latency_ms,
                    device,
                    model,
                });
            }

            WorkerEvent::Error { message } => match (scoped.job, self.active_live_id()) {
                (Some(job), Some(active)) if job == active => self.fail_active(message).await,
                (Some(job), _) => {
                    tracing::debug!(job, "Discarding error for stale job");
                }
                (None, _) => self.publish_error(None, message),
            },

            event => self.handle_job_event(scoped.job, event).await,
        }
    }

    /// Job-scoped events: dropped unless they carry the live job's id and are
    /// legal in its current state.
    async fn handle_job_event(&mut self, job_id: Option<JobId>, event: WorkerEvent) {
        let live = self.active_live_id();
        let Some(id) = job_id else {
            tracing::debug!(?event, "Discarding unbound job event");
            return;
        };
        if live != Some(id) {
            tracing::debug!(job = id, ?event, "Discarding event for stale job");
            return;
        }

        let state = self.active.as_ref().map(|j| j.state);
        match (event, state) {
            (WorkerEvent::RecordingStarted, Some(JobState::Recording)) => {
                self.broadcaster.publish(UiEvent::RecordingStarted { job: id });
            }

            (WorkerEvent::RecordingStopped, Some(JobState::Transcribing)) => {
                self.broadcaster.publish(UiEvent::RecordingStopped { job: id });
            }

            (WorkerEvent::PartialTranscript { text }, Some(JobState::Transcribing)) => {
                if let Some(job) = self.active.as_mut() {
                    job.partial_text = Some(text.clone());
                    self.broadcaster.set_snapshot(job.snapshot());
                }
                self.broadcaster
                    .publish(UiEvent::PartialTranscript { job: id, text });
            }

            (WorkerEvent::FinalTranscript { text }, Some(JobState::Transcribing)) => {
                self.complete_job(text).await;
            }

            (WorkerEvent::JobCancelled, _) => {
                // Cooperative ack; local cleanup already happened.
                tracing::debug!(job = id, "Worker acknowledged cancellation");
            }

            (event, state) => {
                tracing::debug!(job = id, ?event, ?state, "Discarding event illegal in state");
            }
        }
    }

    /// Transcribing -> Done: clipboard, temp file cleanup, popup auto-hide.
    async fn complete_job(&mut self, text: String) {
        self.transcribe_deadline = None;
        self.binding.clear();

        let Some(job) = self.active.as_mut() else { return };
        job.final_text = Some(text.clone());
        job.finish(JobState::Done);
        let id = job.id;
        let elapsed = job.created_at.elapsed();
        tracing::info!(job = id, ?elapsed, "Job transition: Transcribing -> Done");

        match self.clipboard.copy(&text) {
            Ok(()) => tracing::info!(job = id, "Copied transcript to clipboard"),
            Err(e) => self.publish_error(Some(id), format!("Clipboard copy failed: {e}")),
        }

        self.broadcaster
            .publish(UiEvent::FinalTranscript { job: id, text });
        self.publish_state();
        self.hide_popup_at =
            Some(Instant::now() + Duration::from_secs(self.settings.popup_timeout_sec));
    }

    /// Cancel the live job, if any: local cleanup is unconditional, the
    /// worker's `job_cancelled` ack is informational.
    async fn cancel_active(&mut self) {
        self.binding.clear();
        self.transcribe_deadline = None;

        let Some((id, was_recording)) = self.finish_active(JobState::Cancelled) else {
            return;
        };

        if was_recording {
            self.recorder.abort().await;
        }
        let _ = self.worker.send(Command::CancelCurrent).await;

        tracing::info!(job = id, "Job transition: -> Cancelled");
        self.broadcaster.publish(UiEvent::JobCancelled { job: id });
        self.publish_state();
    }

    /// Fail the live job with a message; with no live job the message is
    /// surfaced as a global error.
    async fn fail_active(&mut self, message: String) {
        self.binding.clear();
        self.transcribe_deadline = None;

        let Some((id, was_recording)) = self.finish_active(JobState::Failed) else {
            self.publish_error(None, message);
            return;
        };

        if was_recording {
            self.recorder.abort().await;
        }

        tracing::warn!(job = id, %message, "Job transition: -> Failed");
        self.publish_error(Some(id), message);
        self.publish_state();
    }

    /// Commit a terminal transition on the live job. Returns its id and
    /// whether it was still recording; `None` when there is no live job.
    fn finish_active(&mut self, state: JobState) -> Option<(JobId, bool)> {
        let job = self.active.as_mut()?;
        if job.state.is_terminal() {
            return None;
        }
        let was_recording = job.state == JobState::Recording;
        job.finish(state);
        Some((job.id, was_recording))
    }

    async fn handle_transcribe_timeout(&mut self) {
        self.transcribe_deadline = None;
        tracing::warn!("Worker did not deliver a transcript within the bound");
        self.fail_active("transcription timed out; the worker will be restarted".to_string())
            .await;
        self.worker.restart().await;
    }

    async fn apply_settings(&mut self, settings: Settings) {
        self.settings = settings.clamped();
        let _ = self
            .worker
            .send(Command::SetConfig {
                config: self.settings.worker_config(),
            })
            .await;
        tracing::info!("Settings updated");
    }

    fn active_live_id(&self) -> Option<JobId> {
        self.active
            .as_ref()
            .filter(|job| !job.state.is_terminal())
            .map(|job| job.id)
    }

    fn publish_state(&self) {
        let snap = self
            .active
            .as_ref()
            .map(Job::snapshot)
            .unwrap_or_else(JobSnapshot::default);
        self.broadcaster.publish(UiEvent::StateChanged(snap));
    }

    fn publish_error(&self, job: Option<JobId>, message: String) {
        tracing::warn!(?job, %message, "Surfacing error");
        self.broadcaster.publish(UiEvent::Error { job, message });
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
