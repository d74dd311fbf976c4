use anyhow::Result;
use tokio::sync::mpsc;

use crate::audio::{AudioCapture, AudioFormat, AudioSink};
use crate::messages::RecorderCommand;

/// Coordinates audio capture and encoding for one recording at a time.
///
/// The controller decides where the audio lands (it owns the temp file and
/// its deletion); this service only opens the sink there for the duration of
/// the Recording state, streams chunks into it, and finalizes or aborts on
/// command.
///
/// Holds a cpal::Stream, which is !Send, so it must be spawned on a LocalSet
/// via tokio::task::spawn_local.
pub struct Recorder {
    format: AudioFormat,
    cmd_rx: mpsc::Receiver<RecorderCommand>,
    audio_rx: mpsc::Receiver<Vec<f32>>,
    audio_tx: mpsc::Sender<Vec<f32>>,
    sink: Box<dyn AudioSink + Send>,
    stream: Option<cpal::Stream>,
    recording: bool,
}

impl Recorder {
    pub fn new(
        format: AudioFormat,
        cmd_rx: mpsc::Receiver<RecorderCommand>,
        sink: Box<dyn AudioSink + Send>,
    ) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(100);
        Self {
            format,
            cmd_rx,
            audio_rx,
            audio_tx,
            sink,
            stream: None,
            recording: false,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }

                Some(chunk) = self.audio_rx.recv(), if self.recording => {
                    if let Err(e) = self.sink.write_chunk(chunk) {
                        tracing::error!("Failed to write audio chunk: {}", e);
                        self.recording = false;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: RecorderCommand) {
        match cmd {
            RecorderCommand::Start { path, reply } => {
                let _ = reply.send(self.start(path));
            }

            RecorderCommand::Stop(reply) => {
                let result = self.stop().await;
                let _ = reply.send(result);
                tracing::info!("Recording stopped");
            }

            RecorderCommand::Abort => {
                self.teardown_stream();
                self.reset_audio_channel();
                self.sink.abort();
                tracing::info!("Recording aborted");
            }
        }
    }

    fn start(&mut self, path: std::path::PathBuf) -> Result<()> {
        if self.recording {
            return Err(anyhow::anyhow!("already recording"));
        }

        self.sink.start(path)?;

        match AudioCapture::start(self.format, self.audio_tx.clone()) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.recording = true;
                tracing::info!("Recording started");
                Ok(())
            }
            Err(e) => {
                self.sink.abort();
                Err(e)
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.teardown_stream();

        // Drain what the bridge already pushed into the old channel before
        // replacing it; this is the tail of the recording.
        while let Ok(chunk) = self.audio_rx.try_recv() {
            if let Err(e) = self.sink.write_chunk(chunk) {
                tracing::error!("Failed to write audio chunk during drain: {}", e);
                break;
            }
        }
        self.reset_audio_channel();

        self.sink.finalize().await
    }

    fn teardown_stream(&mut self) {
        self.recording = false;
        self.stream = None;
    }

    // Swap in fresh audio channels. Dropping the old receiver makes the
    // bridge task's send fail, which is its exit signal.
    fn reset_audio_channel(&mut self) {
        let (new_audio_tx, new_audio_rx) = mpsc::channel(100);
        self.audio_tx = new_audio_tx;
        self.audio_rx = new_audio_rx;
    }
}

/// Handle for communicating with the Recorder.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderCommand>,
}

impl RecorderHandle {
    pub fn new(tx: mpsc::Sender<RecorderCommand>) -> Self {
        Self { tx }
    }

    /// Open the capture sink at `path` and start recording.
    pub async fn start(&self, path: std::path::PathBuf) -> Result<()> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(RecorderCommand::Start { path, reply })
            .await
            .map_err(|_| anyhow::anyhow!("Recorder service is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Recorder dropped the start reply"))?
    }

    /// Stop recording and finalize the audio file.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(RecorderCommand::Stop(reply))
            .await
            .map_err(|_| anyhow::anyhow!("Recorder service is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Recorder dropped the stop reply"))?
    }

    /// Stop recording and discard the capture; used when a job is cancelled
    /// or failed while still recording.
    pub async fn abort(&self) {
        let _ = self.tx.send(RecorderCommand::Abort).await;
    }
}
