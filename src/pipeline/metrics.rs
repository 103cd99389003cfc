//! Live throughput and size statistics
//!
//! Producer stages write through [`MetricsCollector`]. Window statistics are
//! republished atomically after every send; counters are plain atomics merged
//! in when a reader asks, so neither side ever waits on the other.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, RingBuffer};
use ringbuf::HeapRb;
use serde::Serialize;

use crate::transport::{PredictionSummary, TransmissionRecord};
use crate::PipelineConfig;

/// Read-only view of the collector at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Successful sends per second over the sliding window
    pub fps: f64,
    pub last_frame_bytes: usize,
    pub last_raw_bytes: usize,
    pub mean_frame_bytes: f64,
    /// `last_frame_bytes / last_raw_bytes`
    pub compression_ratio: f64,
    /// `last_frame_bytes / max_payload_bytes`, as a percentage
    pub buffer_utilization: f64,
    pub last_quality: u8,
    pub last_latency_ms: f64,
    pub frames_captured: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub encode_failures: u64,
    /// Frames discarded because the next stage was still busy
    pub frames_dropped: u64,
    /// Deepest combined hand-off queue occupancy seen
    pub peak_queue_depth: usize,
    pub window_len: usize,
    /// Inference replies accepted from the destination
    pub predictions_received: u64,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    encode_failures: AtomicU64,
    dropped: AtomicU64,
    peak_depth: AtomicUsize,
    predictions: AtomicU64,
}

#[derive(Clone, Copy)]
struct Sample {
    sent_at: Instant,
    bytes: usize,
}

#[derive(Clone, Copy)]
struct LastFrame {
    bytes: usize,
    raw_len: usize,
    quality: u8,
    latency: Duration,
}

struct Window {
    samples: HeapRb<Sample>,
    last: Option<LastFrame>,
}

pub struct MetricsCollector {
    max_payload: usize,
    span: Duration,
    counters: CachePadded<Counters>,
    // Only producer stages take this lock
    window: Mutex<Window>,
    snapshot: ArcSwap<MetricsSnapshot>,
    prediction: ArcSwapOption<PredictionSummary>,
}

impl MetricsCollector {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            max_payload: config.max_payload_bytes,
            span: config.window(),
            counters: CachePadded::new(Counters::default()),
            window: Mutex::new(Window {
                samples: HeapRb::new(config.window_frames.max(1)),
                last: None,
            }),
            snapshot: ArcSwap::from_pointee(MetricsSnapshot::default()),
            prediction: ArcSwapOption::empty(),
        }
    }

    /// Fold one transmission outcome into the statistics.
    pub fn record(&self, record: &TransmissionRecord) {
        let mut window = self.lock_window();
        if record.succeeded() {
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
            window.samples.push_overwrite(Sample {
                sent_at: record.sent_at,
                bytes: record.bytes,
            });
            window.last = Some(LastFrame {
                bytes: record.bytes,
                raw_len: record.raw_len,
                quality: record.quality,
                latency: record.latency(),
            });

            metrics::counter!("hermes_frames_sent_total").increment(1);
            metrics::histogram!("hermes_frame_bytes").record(record.bytes as f64);
            metrics::histogram!("hermes_frame_latency_seconds")
                .record(record.latency().as_secs_f64());
        } else {
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("hermes_send_failures_total").increment(1);
        }
        self.publish(&window, record.sent_at);
    }

    pub fn record_captured(&self) {
        self.counters.captured.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hermes_frames_captured_total").increment(1);
    }

    pub fn record_encode_failure(&self) {
        self.counters.encode_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hermes_encode_failures_total").increment(1);
    }

    /// A frame was discarded at a full hand-off queue
    pub fn record_dropped(&self, stage: &'static str) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hermes_frames_dropped_total", "stage" => stage).increment(1);
    }

    pub fn observe_queue_depth(&self, depth: usize) {
        self.counters.peak_depth.fetch_max(depth, Ordering::Relaxed);
        metrics::gauge!("hermes_queue_depth").set(depth as f64);
    }

    pub fn record_prediction(&self, summary: PredictionSummary) {
        self.counters.predictions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hermes_predictions_total").increment(1);
        self.prediction.store(Some(Arc::new(summary)));
    }

    /// Summary of the most recent inference reply, if any arrived
    pub fn latest_prediction(&self) -> Option<Arc<PredictionSummary>> {
        self.prediction.load_full()
    }

    /// Window statistics as of the last send, with live counters. Lock-free.
    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        let published = self.snapshot.load();
        Arc::new(MetricsSnapshot {
            frames_captured: self.counters.captured.load(Ordering::Relaxed),
            frames_sent: self.counters.sent.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            encode_failures: self.counters.encode_failures.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            peak_queue_depth: self.counters.peak_depth.load(Ordering::Relaxed),
            predictions_received: self.counters.predictions.load(Ordering::Relaxed),
            ..MetricsSnapshot::clone(&published)
        })
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, window: &Window, now: Instant) {
        let recent: Vec<Sample> = window
            .samples
            .iter()
            .filter(|s| now.saturating_duration_since(s.sent_at) <= self.span)
            .copied()
            .collect();

        let fps = match (recent.first(), recent.last()) {
            (Some(first), Some(last)) if recent.len() > 1 => {
                let elapsed = last.sent_at.saturating_duration_since(first.sent_at);
                if elapsed.is_zero() {
                    0.0
                } else {
                    (recent.len() - 1) as f64 / elapsed.as_secs_f64()
                }
            }
            _ => 0.0,
        };
        let mean_frame_bytes = if recent.is_empty() {
            0.0
        } else {
            recent.iter().map(|s| s.bytes).sum::<usize>() as f64 / recent.len() as f64
        };

        let last = window.last;
        let last_frame_bytes = last.map_or(0, |l| l.bytes);
        let last_raw_bytes = last.map_or(0, |l| l.raw_len);
        let compression_ratio = if last_raw_bytes == 0 {
            0.0
        } else {
            last_frame_bytes as f64 / last_raw_bytes as f64
        };
        let buffer_utilization = if self.max_payload == 0 {
            0.0
        } else {
            last_frame_bytes as f64 / self.max_payload as f64 * 100.0
        };

        metrics::gauge!("hermes_fps").set(fps);
        metrics::gauge!("hermes_buffer_utilization_percent").set(buffer_utilization);

        self.snapshot.store(Arc::new(MetricsSnapshot {
            fps,
            last_frame_bytes,
            last_raw_bytes,
            mean_frame_bytes,
            compression_ratio,
            buffer_utilization,
            last_quality: last.map_or(0, |l| l.quality),
            last_latency_ms: last.map_or(0.0, |l| l.latency.as_secs_f64() * 1000.0),
            window_len: recent.len(),
            ..MetricsSnapshot::default()
        }));
    }
}
