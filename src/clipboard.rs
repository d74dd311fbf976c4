use anyhow::{Context, Result};

/// Destination for a finished transcript. Boxed behind a trait so scenario
/// tests can observe writes without a display server.
pub trait ClipboardSink: Send {
    fn copy(&mut self, text: &str) -> Result<()>;
}

/// The system clipboard via arboard. The controller is the only writer, one
/// write per completed job.
pub struct SystemClipboard {
    inner: arboard::Clipboard,
}

impl SystemClipboard {
    pub fn new() -> Result<Self> {
        let inner = arboard::Clipboard::new().context("Failed to open system clipboard")?;
        Ok(Self { inner })
    }
}

impl ClipboardSink for SystemClipboard {
    fn copy(&mut self, text: &str) -> Result<()> {
        self.inner
            .set_text(text.to_owned())
            .context("Failed to set clipboard text")
    }
}
