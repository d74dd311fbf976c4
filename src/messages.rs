use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::oneshot;

use crate::config::Settings;

/// Commands for the Recorder service.
pub enum RecorderCommand {
    /// Open the capture sink at the given path and start streaming audio.
    Start {
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Stop capture, drain buffered chunks and finalize the sink.
    Stop(oneshot::Sender<Result<()>>),
    /// Stop capture and discard whatever the sink buffered. Used on
    /// cancellation and failure paths; the file itself is the controller's to
    /// delete.
    Abort,
}

/// Raw hold-to-talk transitions from the hotkey listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEvent {
    Pressed,
    Released,
}

/// Requests for the controller. Hotkey transitions and UI surfaces both end
/// up here; the controller is the only component that acts on them.
#[derive(Debug)]
pub enum Intent {
    HotkeyPressed,
    HotkeyReleased,
    /// Explicit cancellation, e.g. the user closed the popup mid-job.
    CancelActive,
    /// Settings were saved; apply new defaults and forward `set_config`.
    SettingsChanged(Settings),
    Shutdown,
}
