//! Hermes: stream a camera to a remote inference endpoint over UDP

use std::path::PathBuf;

use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hermes::capture::{SyntheticSource, V4l2Source};
use hermes::pipeline::RunSummary;
use hermes::{settings, Controller, UdpTransmitter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hermes=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Hermes launching...");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let synthetic = args.iter().any(|a| a == "--synthetic");
    let config_path = args.iter().find(|a| !a.starts_with("--")).map(PathBuf::from);

    // Load configuration once; it does not change for the rest of the run
    let settings = settings::load(config_path.as_deref())?;
    let pipeline = settings.pipeline.clone();

    let transmitter = UdpTransmitter::bind(&pipeline.destination(), pipeline.send_timeout()).await?;
    let listen_for_replies = pipeline.listen_for_replies;
    let controller = Controller::new(pipeline)?;
    let replies = listen_for_replies.then(|| transmitter.spawn_reply_listener(controller.metrics()));

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            stop.stop();
        }
    });

    let capture = settings.capture;
    let summary: RunSummary = if synthetic {
        info!("Using synthetic test pattern");
        controller
            .run(
                move || Ok(SyntheticSource::new(capture.width, capture.height).with_rate(capture.fps)),
                transmitter,
            )
            .await?
    } else {
        info!("Using capture device: {}", capture.device);
        controller
            .run(move || V4l2Source::open(&capture.device, &capture), transmitter)
            .await?
    };

    if let Some(replies) = replies {
        // Ends once the send stage has dropped the transmitter
        let _ = replies.await;
    }
    if let Some(prediction) = controller.metrics().latest_prediction() {
        info!("Last inference reply: {}", prediction);
    }
    info!(
        "Hermes shutting down: {} frames in {:.2?} ({:.1} fps)",
        summary.metrics.frames_sent, summary.elapsed, summary.fps
    );
    Ok(())
}
