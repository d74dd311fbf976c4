//! Fan-out of controller events to UI surfaces.
//!
//! Surfaces attach and detach freely. Delivery is bounded and lossy (a slow
//! popup can never stall the worker stream); a surface attaching mid-job gets
//! the current job snapshot instead of replayed history, so losing old events
//! is harmless.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::job::{JobId, JobSnapshot};

/// Events delivered to attached UI surfaces, in the order the controller
/// committed them.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    StateChanged(JobSnapshot),
    RecordingStarted { job: JobId },
    RecordingStopped { job: JobId },
    PartialTranscript { job: JobId, text: String },
    FinalTranscript { job: JobId, text: String },
    JobCancelled { job: JobId },
    Error { job: Option<JobId>, message: String },
    Metrics {
        latency_ms: Option<u64>,
        device: Option<String>,
        model: Option<String>,
    },
    /// The popup auto-hide timeout elapsed after a completed job.
    HidePopup,
}

#[derive(Clone)]
pub struct Broadcaster {
    events: broadcast::Sender<UiEvent>,
    snapshot: Arc<watch::Sender<JobSnapshot>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (snapshot, _) = watch::channel(JobSnapshot::default());
        Self {
            events,
            snapshot: Arc::new(snapshot),
        }
    }

    /// Attach a surface: returns the current job snapshot plus a live event
    /// stream starting at this instant.
    pub fn attach(&self) -> (JobSnapshot, broadcast::Receiver<UiEvent>) {
        // Subscribe first so no event between snapshot and subscription is lost.
        let rx = self.events.subscribe();
        let snap = self.snapshot.borrow().clone();
        (snap, rx)
    }

    /// Record the latest job snapshot for future attachers.
    pub fn set_snapshot(&self, snap: JobSnapshot) {
        self.snapshot.send_replace(snap);
    }

    /// Deliver an event to whoever is listening. Never blocks; with no
    /// listeners the event simply evaporates.
    pub fn publish(&self, event: UiEvent) {
        if let UiEvent::StateChanged(snap) = &event {
            self.set_snapshot(snap.clone());
        }
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;

    #[test]
    fn attach_mid_job_sees_current_snapshot() {
        let bc = Broadcaster::new(8);
        bc.publish(UiEvent::StateChanged(JobSnapshot {
            id: Some(7),
            state: JobState::Transcribing,
            partial_text: Some("so far".into()),
            final_text: None,
        }));

        let (snap, _rx) = bc.attach();
        assert_eq!(snap.id, Some(7));
        assert_eq!(snap.state, JobState::Transcribing);
        assert_eq!(snap.partial_text.as_deref(), Some("so far"));
    }

    #[tokio::test]
    async fn listeners_receive_events_in_publish_order() {
        let bc = Broadcaster::new(8);
        let (_, mut rx) = bc.attach();

        bc.publish(UiEvent::RecordingStarted { job: 1 });
        bc.publish(UiEvent::RecordingStopped { job: 1 });

        assert_eq!(rx.recv().await.unwrap(), UiEvent::RecordingStarted { job: 1 });
        assert_eq!(rx.recv().await.unwrap(), UiEvent::RecordingStopped { job: 1 });
    }

    #[test]
    fn publish_without_listeners_does_not_block_or_fail() {
        let bc = Broadcaster::new(1);
        for _ in 0..100 {
            bc.publish(UiEvent::HidePopup);
        }
    }
}
