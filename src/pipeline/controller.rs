//! Run loop: capture -> encode -> send
//!
//! Each stage runs on its own thread or task, linked by flume channels of
//! capacity one. A stage that finds the next queue full drops the frame it is
//! holding (the newest) instead of waiting, so latency stays bounded and
//! capture order is preserved for whatever gets through.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureError, FrameSource, RawFrame};
use crate::encode::{EncodedFrame, FrameEncoder};
use crate::pipeline::metrics::{MetricsCollector, MetricsSnapshot};
use crate::pipeline::reporter;
use crate::settings::SettingsError;
use crate::transport::Transmit;
use crate::PipelineConfig;

/// Frames each hand-off queue may hold
const QUEUE_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Idle,
            1 => PipelineState::Running,
            2 => PipelineState::Stopping,
            _ => PipelineState::Stopped,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration")]
    Config(#[from] SettingsError),

    #[error("pipeline cannot start from state {0:?}")]
    NotIdle(PipelineState),

    #[error("capture failed")]
    Capture(#[from] CaptureError),

    #[error("{0} stage panicked")]
    StagePanicked(&'static str),
}

/// End-of-run totals
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub elapsed: Duration,
    /// Successful sends over the whole run divided by `elapsed`
    pub fps: f64,
    pub metrics: MetricsSnapshot,
}

/// Cloneable trigger that moves the controller to `Stopping` from any state.
#[derive(Clone)]
pub struct StopHandle {
    signal: Arc<watch::Sender<bool>>,
    state: Arc<AtomicU8>,
}

impl StopHandle {
    pub fn stop(&self) {
        // Never started: go straight to the terminal state
        let _ = self.state.compare_exchange(
            PipelineState::Idle as u8,
            PipelineState::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.signal.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.signal.borrow()
    }

    async fn stopped(&self) {
        let mut rx = self.signal.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Owns one pipeline run. Not restartable: build a new controller per run.
pub struct Controller {
    config: Arc<PipelineConfig>,
    state: Arc<AtomicU8>,
    metrics: Arc<MetricsCollector>,
    stop: StopHandle,
}

impl Controller {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let state = Arc::new(AtomicU8::new(PipelineState::Idle as u8));
        let (signal, _) = watch::channel(false);
        Ok(Self {
            metrics: Arc::new(MetricsCollector::new(&config)),
            config: Arc::new(config),
            stop: StopHandle {
                signal: Arc::new(signal),
                state: state.clone(),
            },
            state,
        })
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Acquire the source via `open` and stream until end of stream, a stop
    /// request, or a capture error.
    ///
    /// Encode and send failures only show up in the metrics. A capture error
    /// is returned once every stage has shut down and the controller is
    /// `Stopped`.
    pub async fn run<S, F, T>(&self, open: F, transmitter: T) -> Result<RunSummary, PipelineError>
    where
        S: FrameSource + 'static,
        F: FnOnce() -> Result<S, CaptureError> + Send + 'static,
        T: Transmit,
    {
        if let Err(current) = self.state.compare_exchange(
            PipelineState::Idle as u8,
            PipelineState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(PipelineError::NotIdle(PipelineState::from_u8(current)));
        }

        info!(
            "Pipeline running: {}x{} q{} -> {} (max {} bytes)",
            self.config.width,
            self.config.height,
            self.config.quality,
            self.config.destination(),
            self.config.max_payload_bytes
        );
        let started = Instant::now();

        let (raw_tx, raw_rx) = flume::bounded::<RawFrame>(QUEUE_CAPACITY);
        let (enc_tx, enc_rx) = flume::bounded::<EncodedFrame>(QUEUE_CAPACITY);

        let mut capture = tokio::task::spawn_blocking({
            let metrics = self.metrics.clone();
            let stop = self.stop.clone();
            move || capture_loop(open, raw_tx, &metrics, &stop)
        });
        let encode = tokio::task::spawn_blocking({
            let metrics = self.metrics.clone();
            let encoder = FrameEncoder::new(&self.config);
            move || encode_loop(raw_rx, enc_tx, &encoder, &metrics)
        });
        let send = tokio::spawn(send_loop(enc_rx, transmitter, self.metrics.clone()));
        let report = (!self.config.report_interval().is_zero()).then(|| {
            tokio::spawn(reporter::report_loop(
                self.metrics.clone(),
                self.config.report_interval(),
            ))
        });

        let grace = self.config.shutdown_grace();
        let finished = tokio::select! {
            joined = &mut capture => Some(joined),
            _ = self.stop.stopped() => None,
        };
        self.set_state(PipelineState::Stopping);

        let capture_result = match finished {
            Some(joined) => joined,
            None => {
                info!("Stop requested, draining in-flight frames");
                match timeout(grace, &mut capture).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        // The source owns the device; stay in Stopping until it is dropped
                        warn!(
                            "Capture stage still busy after {:?}, waiting for it to release the source",
                            grace
                        );
                        capture.await
                    }
                }
            }
        };

        // Upstream closing its channel lets each later stage drain and exit
        await_stage("encode", encode, grace).await;
        await_stage("send", send, grace).await;
        if let Some(report) = report {
            report.abort();
        }

        let outcome = match capture_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Capture error: {}", e);
                Err(PipelineError::Capture(e))
            }
            Err(_) => Err(PipelineError::StagePanicked("capture")),
        };

        self.set_state(PipelineState::Stopped);
        self.stop.signal.send_replace(true);

        let elapsed = started.elapsed();
        let metrics = (*self.metrics.snapshot()).clone();
        let fps = if elapsed.is_zero() {
            0.0
        } else {
            metrics.frames_sent as f64 / elapsed.as_secs_f64()
        };
        info!(
            "Pipeline stopped after {:.2?}: {} sent, {} dropped, {} encode failures, {} send failures",
            elapsed,
            metrics.frames_sent,
            metrics.frames_dropped,
            metrics.encode_failures,
            metrics.send_failures
        );

        outcome.map(|()| RunSummary {
            elapsed,
            fps,
            metrics,
        })
    }

    fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

async fn await_stage<T>(name: &'static str, mut handle: JoinHandle<T>, grace: Duration) {
    match timeout(grace, &mut handle).await {
        Ok(Ok(_)) => debug!("{} stage finished", name),
        Ok(Err(e)) => error!("{} stage failed: {}", name, e),
        Err(_) => {
            warn!("{} stage did not finish within {:?}, cancelling it", name, grace);
            handle.abort();
            // Abort only cancels async tasks; a blocking stage runs to completion here
            let _ = handle.await;
        }
    }
}

fn capture_loop<S, F>(
    open: F,
    tx: Sender<RawFrame>,
    metrics: &MetricsCollector,
    stop: &StopHandle,
) -> Result<(), CaptureError>
where
    S: FrameSource,
    F: FnOnce() -> Result<S, CaptureError>,
{
    let mut source = open()?;
    info!(
        "Capturing from {} at {:?}",
        source.name(),
        source.dimensions()
    );

    while !stop.is_stopped() {
        let Some(frame) = source.next_frame()? else {
            info!("End of stream from {}", source.name());
            break;
        };
        metrics.record_captured();

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                debug!("Encoder busy, dropping frame {}", frame.sequence);
                metrics.record_dropped("capture");
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    source.close();
    Ok(())
}

fn encode_loop(
    rx: Receiver<RawFrame>,
    tx: Sender<EncodedFrame>,
    encoder: &FrameEncoder,
    metrics: &MetricsCollector,
) {
    for frame in rx.iter() {
        match encoder.encode(&frame) {
            Ok(encoded) => {
                drop(frame);
                match tx.try_send(encoded) {
                    Ok(()) => {}
                    Err(TrySendError::Full(encoded)) => {
                        debug!("Sender busy, dropping frame {}", encoded.sequence);
                        metrics.record_dropped("encode");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Err(e) => {
                warn!("Dropping frame {}: {}", frame.sequence, e);
                metrics.record_encode_failure();
            }
        }
        metrics.observe_queue_depth(rx.len() + tx.len());
    }
}

async fn send_loop<T: Transmit>(
    rx: Receiver<EncodedFrame>,
    mut transmitter: T,
    metrics: Arc<MetricsCollector>,
) {
    while let Ok(frame) = rx.recv_async().await {
        let record = transmitter.send(&frame).await;
        if let Some(e) = &record.error {
            warn!("Frame {} not sent: {}", record.sequence, e);
        }
        metrics.record(&record);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::capture::{PixelFormat, SyntheticSource};
    use crate::encode::QualityFallback;
    use crate::transport::TransmissionRecord;

    struct CountingSink(Arc<AtomicUsize>);

    impl Transmit for CountingSink {
        async fn send(&mut self, frame: &EncodedFrame) -> TransmissionRecord {
            self.0.fetch_add(1, Ordering::SeqCst);
            TransmissionRecord::new(frame, None)
        }
    }

    struct RecordingSink(Arc<Mutex<Vec<u64>>>);

    impl Transmit for RecordingSink {
        async fn send(&mut self, frame: &EncodedFrame) -> TransmissionRecord {
            self.0.lock().unwrap().push(frame.sequence);
            TransmissionRecord::new(frame, None)
        }
    }

    fn rgb_frame(width: u32, height: u32, pixels: Vec<u8>, sequence: u64) -> RawFrame {
        RawFrame::new(
            Bytes::from(pixels),
            width,
            height,
            PixelFormat::Rgb24,
            sequence,
            Instant::now(),
        )
        .unwrap()
    }

    /// Odd frames are white noise that cannot fit a small ceiling, even frames
    /// are flat grey.
    struct NoisyEveryOther {
        sequence: u64,
        limit: u64,
        state: u32,
    }

    impl FrameSource for NoisyEveryOther {
        fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
            if self.sequence == self.limit {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
            self.sequence += 1;

            let len = 160 * 120 * 3;
            let pixels: Vec<u8> = if self.sequence % 2 == 1 {
                (0..len)
                    .map(|_| {
                        self.state ^= self.state << 13;
                        self.state ^= self.state >> 17;
                        self.state ^= self.state << 5;
                        self.state as u8
                    })
                    .collect()
            } else {
                vec![128u8; len]
            };
            Ok(Some(rgb_frame(160, 120, pixels, self.sequence)))
        }

        fn dimensions(&self) -> (u32, u32) {
            (160, 120)
        }

        fn name(&self) -> &str {
            "noisy-every-other"
        }
    }

    /// Blocks in `next_frame` well past the shutdown grace period
    struct StallingSource {
        stall: Duration,
        released: Arc<AtomicBool>,
    }

    impl FrameSource for StallingSource {
        fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
            std::thread::sleep(self.stall);
            Ok(Some(rgb_frame(64, 48, vec![0u8; 64 * 48 * 3], 1)))
        }

        fn dimensions(&self) -> (u32, u32) {
            (64, 48)
        }

        fn name(&self) -> &str {
            "stalling"
        }
    }

    impl Drop for StallingSource {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            width: 64,
            height: 48,
            max_payload_bytes: 20_000,
            report_interval_ms: 0,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Controller::new(PipelineConfig {
            max_payload_bytes: 0,
            ..config()
        })
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn test_runs_to_end_of_stream() {
        let controller = Controller::new(config()).unwrap();
        assert_eq!(controller.state(), PipelineState::Idle);

        let sent = Arc::new(AtomicUsize::new(0));
        let summary = controller
            .run(
                || Ok(SyntheticSource::new(64, 48).with_rate(200).with_limit(10)),
                CountingSink(sent.clone()),
            )
            .await
            .unwrap();

        assert_eq!(controller.state(), PipelineState::Stopped);
        assert_eq!(summary.metrics.frames_captured, 10);
        assert_eq!(summary.metrics.frames_sent as usize, sent.load(Ordering::SeqCst));
        assert_eq!(
            summary.metrics.frames_sent + summary.metrics.frames_dropped,
            10
        );
    }

    #[tokio::test]
    async fn test_not_restartable() {
        let controller = Controller::new(config()).unwrap();
        let sent = Arc::new(AtomicUsize::new(0));
        controller
            .run(
                || Ok(SyntheticSource::new(64, 48).with_limit(1)),
                CountingSink(sent.clone()),
            )
            .await
            .unwrap();

        let err = controller
            .run(
                || Ok(SyntheticSource::new(64, 48).with_limit(1)),
                CountingSink(sent),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotIdle(PipelineState::Stopped)));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_terminal() {
        let controller = Controller::new(config()).unwrap();
        controller.stop_handle().stop();
        assert_eq!(controller.state(), PipelineState::Stopped);

        let err = controller
            .run(
                || Ok(SyntheticSource::new(64, 48)),
                CountingSink(Arc::new(AtomicUsize::new(0))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotIdle(PipelineState::Stopped)));
    }

    #[tokio::test]
    async fn test_stop_ends_unbounded_stream() {
        let controller = Arc::new(Controller::new(config()).unwrap());
        let stop = controller.stop_handle();
        let sent = Arc::new(AtomicUsize::new(0));

        let run = tokio::spawn({
            let controller = controller.clone();
            let sent = sent.clone();
            async move {
                controller
                    .run(
                        || Ok(SyntheticSource::new(64, 48).with_rate(100)),
                        CountingSink(sent),
                    )
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(controller.state(), PipelineState::Running);
        stop.stop();

        let summary = timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(controller.state(), PipelineState::Stopped);
        assert!(summary.metrics.frames_sent > 0);
    }

    #[tokio::test]
    async fn test_capture_error_is_fatal() {
        struct Failing;
        impl FrameSource for Failing {
            fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
                Err(CaptureError::Timeout {
                    device: "failing".into(),
                    timeout: Duration::from_millis(1),
                })
            }
            fn dimensions(&self) -> (u32, u32) {
                (0, 0)
            }
            fn name(&self) -> &str {
                "failing"
            }
        }

        let controller = Controller::new(config()).unwrap();
        let sent = Arc::new(AtomicUsize::new(0));
        let err = controller
            .run(|| Ok(Failing), CountingSink(sent.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Capture(CaptureError::Timeout { .. })));
        assert_eq!(controller.state(), PipelineState::Stopped);
        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_encode_failures_skip_frames_and_keep_streaming() {
        let controller = Controller::new(PipelineConfig {
            width: 160,
            height: 120,
            max_payload_bytes: 2_000,
            fallback: QualityFallback::Fail,
            ..config()
        })
        .unwrap();
        let sent = Arc::new(Mutex::new(Vec::new()));

        let summary = controller
            .run(
                || {
                    Ok(NoisyEveryOther {
                        sequence: 0,
                        limit: 20,
                        state: 0x9E37_79B9,
                    })
                },
                RecordingSink(sent.clone()),
            )
            .await
            .unwrap();
        let m = &summary.metrics;

        assert_eq!(controller.state(), PipelineState::Stopped);
        assert_eq!(m.frames_captured, 20);
        assert!(m.encode_failures > 0, "no encode failures");
        assert_eq!(m.frames_sent + m.frames_dropped + m.encode_failures, 20);

        // Frame 1 is noise and always reaches the encoder, so every send
        // here happened after a failure
        let sent = sent.lock().unwrap();
        assert!(!sent.is_empty(), "nothing sent after the first failure");
        assert!(sent.iter().all(|seq| seq % 2 == 0), "sent {sent:?}");
        assert_eq!(sent.len() as u64, m.frames_sent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stopped_only_after_source_released() {
        let released = Arc::new(AtomicBool::new(false));
        let controller = Arc::new(
            Controller::new(PipelineConfig {
                shutdown_grace_ms: 50,
                ..config()
            })
            .unwrap(),
        );

        let run = tokio::spawn({
            let controller = controller.clone();
            let released = released.clone();
            async move {
                controller
                    .run(
                        move || {
                            Ok(StallingSource {
                                stall: Duration::from_millis(800),
                                released,
                            })
                        },
                        CountingSink(Arc::new(AtomicUsize::new(0))),
                    )
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.stop_handle().stop();

        // Grace has expired but the source is still blocked in a read
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(controller.state(), PipelineState::Stopping);
        assert!(!released.load(Ordering::SeqCst));

        timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(controller.state(), PipelineState::Stopped);
    }
}
