use anyhow::Result;

use pushtalk::app;
use pushtalk::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    tracing::info!("Starting pushtalk hold-to-talk transcription daemon");

    let settings = Settings::load()?;
    settings.validate()?;

    // LocalSet for !Send futures (the recorder holds a cpal::Stream).
    let local = tokio::task::LocalSet::new();
    local.run_until(app::run(settings)).await
}
