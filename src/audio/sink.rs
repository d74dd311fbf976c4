use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

/// Streaming audio encoder scoped to one recording.
///
/// `start` opens the sink at a caller-provided path (the controller owns the
/// file and its deletion); chunks are written as they arrive; `finalize`
/// flushes framing and releases the handle. `abort` releases the handle
/// without finalizing, for cancelled recordings.
#[async_trait]
pub trait AudioSink: Send {
    fn start(&mut self, path: PathBuf) -> Result<()>;

    /// Write samples as they arrive. The Vec is moved to avoid copying.
    fn write_chunk(&mut self, samples: Vec<f32>) -> Result<()>;

    async fn finalize(&mut self) -> Result<()>;

    fn abort(&mut self);
}
