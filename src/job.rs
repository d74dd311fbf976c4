//! One recording-to-transcription attempt.

use std::path::Path;
use std::time::Instant;

use tempfile::NamedTempFile;

/// Identifies a job for the lifetime of the process. Ids are handed out by
/// the controller, monotonically increasing from 1; 0 is reserved for "no job"
/// in the worker binding.
pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Idle,
    Recording,
    Transcribing,
    Done,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled | JobState::Failed)
    }
}

/// A single hold-to-talk attempt. Owned exclusively by the controller; the
/// scoped temp audio file lives exactly as long as the job is non-terminal.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub partial_text: Option<String>,
    pub final_text: Option<String>,
    pub created_at: Instant,
    pub ended_at: Option<Instant>,
    temp: Option<NamedTempFile>,
}

impl Job {
    pub fn new(id: JobId, temp: NamedTempFile) -> Self {
        Self {
            id,
            state: JobState::Recording,
            partial_text: None,
            final_text: None,
            created_at: Instant::now(),
            ended_at: None,
            temp: Some(temp),
        }
    }

    /// Path of the scoped audio file; `None` once the job went terminal.
    pub fn audio_path(&self) -> Option<&Path> {
        self.temp.as_ref().map(|t| t.path())
    }

    /// Commit a terminal transition. Deletes the temp audio file exactly once;
    /// calling this again (or on an already-terminal job) is a no-op for the
    /// file.
    pub fn finish(&mut self, state: JobState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        if self.ended_at.is_none() {
            self.ended_at = Some(Instant::now());
        }
        if let Some(temp) = self.temp.take() {
            let path = temp.path().to_owned();
            match temp.close() {
                Ok(()) => tracing::debug!(?path, "deleted temp audio file"),
                Err(e) => tracing::warn!(?path, "failed to delete temp audio file: {}", e),
            }
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: Some(self.id),
            state: self.state,
            partial_text: self.partial_text.clone(),
            final_text: self.final_text.clone(),
        }
    }
}

/// What a UI surface needs to render the current job. Sent to listeners on
/// every state change and handed out on attach, so surfaces never need a
/// backlog.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobSnapshot {
    pub id: Option<JobId>,
    pub state: JobState,
    pub partial_text: Option<String>,
    pub final_text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp() -> NamedTempFile {
        tempfile::Builder::new()
            .prefix("pushtalk-test-")
            .suffix(".wav")
            .tempfile()
            .unwrap()
    }

    #[test]
    fn finish_deletes_the_temp_file_once() {
        let temp = temp();
        let path = temp.path().to_owned();
        let mut job = Job::new(1, temp);
        assert!(path.exists());
        assert_eq!(job.audio_path(), Some(path.as_path()));

        job.finish(JobState::Done);
        assert!(!path.exists());
        assert!(job.audio_path().is_none());
        assert!(job.ended_at.is_some());

        // A second terminal commit must not touch the filesystem again.
        job.finish(JobState::Failed);
        assert_eq!(job.state, JobState::Failed);
    }

    #[test]
    fn snapshot_reflects_partial_text() {
        let mut job = Job::new(3, temp());
        job.state = JobState::Transcribing;
        job.partial_text = Some("hello wor".into());

        let snap = job.snapshot();
        assert_eq!(snap.id, Some(3));
        assert_eq!(snap.state, JobState::Transcribing);
        assert_eq!(snap.partial_text.as_deref(), Some("hello wor"));
        job.finish(JobState::Cancelled);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Idle.is_terminal());
        assert!(!JobState::Recording.is_terminal());
        assert!(!JobState::Transcribing.is_terminal());
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }
}
