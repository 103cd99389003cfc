use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::pipeline::metrics::MetricsCollector;

/// Log a metrics line every `period` until the task is aborted.
pub async fn report_loop(metrics: Arc<MetricsCollector>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let snap = metrics.snapshot();
        info!(
            "{:.1} fps | {} B (ratio {:.3}, {:.1}% of ceiling) q{} | {:.1} ms | sent {} dropped {} encode-fail {} send-fail {}",
            snap.fps,
            snap.last_frame_bytes,
            snap.compression_ratio,
            snap.buffer_utilization,
            snap.last_quality,
            snap.last_latency_ms,
            snap.frames_sent,
            snap.frames_dropped,
            snap.encode_failures,
            snap.send_failures
        );
        if let Some(prediction) = metrics.latest_prediction() {
            info!("Latest reply: {}", prediction);
        }
    }
}
