//! Inference replies arriving on the transmit socket
//!
//! The endpoint may answer a frame with a JSON list of detections. Replies are
//! read on the same socket frames leave from, summarised, and published next
//! to the metrics. Nothing is ever acknowledged and sends never wait on a
//! reply.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::pipeline::metrics::MetricsCollector;
use crate::MAX_UDP_PAYLOAD;

/// One reply datagram
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Prediction {
    #[serde(default)]
    pub predictions: Vec<Detection>,
}

/// A detected object. Box coordinates are normalised to the frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(rename = "class", default = "unknown_class")]
    pub class_name: String,
    #[serde(default)]
    pub confidence: f64,
}

fn unknown_class() -> String {
    "unknown".into()
}

/// Object counts from the latest reply
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionSummary {
    pub objects: usize,
    /// Per-class counts in first-seen order
    pub classes: Vec<(String, usize)>,
    pub received_at: Instant,
}

impl PredictionSummary {
    pub fn new(prediction: &Prediction) -> Self {
        let mut classes: Vec<(String, usize)> = Vec::new();
        for detection in &prediction.predictions {
            match classes.iter_mut().find(|(name, _)| *name == detection.class_name) {
                Some((_, count)) => *count += 1,
                None => classes.push((detection.class_name.clone(), 1)),
            }
        }

        Self {
            objects: prediction.predictions.len(),
            classes,
            received_at: Instant::now(),
        }
    }
}

impl fmt::Display for PredictionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.objects == 0 {
            return f.write_str("No predictions");
        }
        write!(f, "Found {} objects: ", self.objects)?;
        for (i, (class, count)) in self.classes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{count} {class}")?;
        }
        Ok(())
    }
}

pub fn parse_prediction(data: &[u8]) -> Result<Prediction, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Read replies from `peer` until `closed` loses its sender.
pub(crate) async fn reply_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    metrics: Arc<MetricsCollector>,
    mut closed: watch::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = closed.changed() => break,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!("Reply receive failed: {}", e);
                continue;
            }
        };
        if from != peer {
            debug!("Ignoring {} byte datagram from {}", len, from);
            continue;
        }

        match parse_prediction(&buf[..len]) {
            Ok(prediction) => {
                let summary = PredictionSummary::new(&prediction);
                debug!("Reply from {}: {}", from, summary);
                metrics.record_prediction(summary);
            }
            Err(e) => warn!("Unparseable reply from {}: {}", from, e),
        }
    }
    debug!("Reply listener closed");
}
