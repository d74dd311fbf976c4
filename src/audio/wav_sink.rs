use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use tokio::sync::{mpsc, oneshot};

use super::format::AudioFormat;
use super::sink::AudioSink;

enum WavCommand {
    WriteChunk(Vec<f32>),
    Finalize { reply: oneshot::Sender<Result<()>> },
}

/// WAV encoder running its file I/O on a dedicated blocking thread, so the
/// audio path stays non-blocking. One writer thread lives per recording;
/// dropping the channel without `Finalize` ends it without flushing, which is
/// fine because aborted files get deleted anyway.
pub struct WavSink {
    format: AudioFormat,
    tx: Option<mpsc::UnboundedSender<WavCommand>>,
}

impl WavSink {
    pub fn new(format: AudioFormat) -> Self {
        Self { format, tx: None }
    }
}

#[async_trait]
impl AudioSink for WavSink {
    fn start(&mut self, path: PathBuf) -> Result<()> {
        if self.tx.is_some() {
            return Err(anyhow::anyhow!("WAV sink already recording"));
        }

        let spec = WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            bits_per_sample: AudioFormat::BITS_PER_SAMPLE,
            sample_format: SampleFormat::Int,
        };

        let mut writer = WavWriter::create(&path, spec)
            .map_err(|e| anyhow::anyhow!("Failed to create WAV writer at {:?}: {}", path, e))?;

        let (tx, mut rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    WavCommand::WriteChunk(samples) => {
                        for sample in samples {
                            // f32 in [-1.0, 1.0] to i16
                            let amplitude = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            if let Err(e) = writer.write_sample(amplitude) {
                                tracing::error!("Failed to write sample: {}", e);
                                return;
                            }
                        }
                    }
                    WavCommand::Finalize { reply } => {
                        let result = writer
                            .finalize()
                            .map_err(|e| anyhow::anyhow!("Failed to finalize WAV: {}", e));
                        let _ = reply.send(result);
                        return;
                    }
                }
            }
        });

        self.tx = Some(tx);
        Ok(())
    }

    fn write_chunk(&mut self, samples: Vec<f32>) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("WAV sink is not recording"))?;
        tx.send(WavCommand::WriteChunk(samples))
            .map_err(|_| anyhow::anyhow!("WAV writer thread is gone"))
    }

    async fn finalize(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| anyhow::anyhow!("WAV sink is not recording"))?;

        let (reply, rx) = oneshot::channel();
        tx.send(WavCommand::Finalize { reply })
            .map_err(|_| anyhow::anyhow!("WAV writer thread is gone"))?;

        rx.await
            .map_err(|_| anyhow::anyhow!("WAV writer thread dropped the finalize reply"))?
    }

    fn abort(&mut self) {
        // Dropping the sender ends the writer thread without finalizing.
        self.tx = None;
    }
}
