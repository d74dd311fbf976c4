//! Wires the services together and runs the controller.

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task;

use crate::audio::{AudioFormat, AudioSink, WavSink};
use crate::broadcast::Broadcaster;
use crate::clipboard::{ClipboardSink, SystemClipboard};
use crate::config::Settings;
use crate::controller::Controller;
use crate::hotkey::{self, parse_chord};
use crate::messages::{HotkeyEvent, Intent};
use crate::services::{Recorder, RecorderHandle};
use crate::worker::{JobBinding, WorkerChannel, WorkerSpec};

/// Build every service and run the controller until shutdown. Must run
/// inside a `LocalSet` because the recorder holds a `cpal::Stream`.
pub async fn run(settings: Settings) -> Result<()> {
    let broadcaster = Broadcaster::new(64);
    spawn_event_logger(&broadcaster);

    // Worker channel; the subprocess itself starts on first use.
    let binding = JobBinding::default();
    let (worker_events_tx, worker_events_rx) = mpsc::channel(256);
    let spec = WorkerSpec::from_settings(&settings);
    let worker = WorkerChannel::spawn(spec, binding.clone(), worker_events_tx);

    // Recorder service, local because cpal::Stream is !Send.
    let format = AudioFormat::default();
    let sink: Box<dyn AudioSink + Send> = Box::new(WavSink::new(format));
    let (recorder_tx, recorder_rx) = mpsc::channel(10);
    let recorder = Recorder::new(format, recorder_rx, sink);
    task::spawn_local(recorder.run());
    let recorder = RecorderHandle::new(recorder_tx);

    let (intent_tx, intent_rx) = mpsc::channel(32);
    spawn_hotkey_pipeline(&settings, intent_tx.clone())?;
    spawn_signal_handler(intent_tx);

    let clipboard: Box<dyn ClipboardSink + Send> = Box::new(SystemClipboard::new()?);

    tracing::info!(hotkey = %settings.hotkey, "Ready, hold the hotkey to dictate");

    let controller = Controller::new(
        settings,
        intent_rx,
        worker_events_rx,
        worker,
        binding,
        recorder,
        broadcaster,
        clipboard,
    );
    controller.run().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Monitor keyboards and turn press/release transitions into intents.
fn spawn_hotkey_pipeline(settings: &Settings, intents: mpsc::Sender<Intent>) -> Result<()> {
    let chord = parse_chord(&settings.hotkey)?;
    let (hotkey_tx, mut hotkey_rx) = mpsc::channel(10);

    tokio::spawn(async move {
        if let Err(e) = hotkey::monitor_keyboards(chord, hotkey_tx).await {
            tracing::error!("Keyboard monitoring stopped: {}", e);
        }
    });

    tokio::spawn(async move {
        while let Some(event) = hotkey_rx.recv().await {
            let intent = match event {
                HotkeyEvent::Pressed => Intent::HotkeyPressed,
                HotkeyEvent::Released => Intent::HotkeyReleased,
            };
            if intents.send(intent).await.is_err() {
                break;
            }
        }
    });

    Ok(())
}

fn spawn_signal_handler(intents: mpsc::Sender<Intent>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, shutting down");
                let _ = intents.send(Intent::Shutdown).await;
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    });
}

/// Minimal listener surface: logs every broadcast event at debug.
fn spawn_event_logger(broadcaster: &Broadcaster) {
    let (_, mut rx) = broadcaster.attach();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::debug!(?event, "ui event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "ui event listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
