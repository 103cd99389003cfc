use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, trace};

use crate::encode::EncodedFrame;
use crate::pipeline::MetricsCollector;
use crate::transport::reply::reply_loop;
use crate::transport::{Transmit, TransmissionError, TransmissionRecord};

/// Fire-and-forget UDP sender bound to an ephemeral local port
pub struct UdpTransmitter {
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    timeout: Duration,
    // Dropped with the transmitter, which ends any reply listener
    closed: watch::Sender<()>,
}

impl UdpTransmitter {
    /// Resolve `destination` once and bind a matching local socket.
    pub async fn bind(
        destination: &str,
        send_timeout: Duration,
    ) -> Result<Self, TransmissionError> {
        let resolve_err = |source| TransmissionError::Resolve {
            destination: destination.to_string(),
            source,
        };
        let destination = lookup_host(destination)
            .await
            .map_err(|e| resolve_err(Some(e)))?
            .next()
            .ok_or_else(|| resolve_err(None))?;

        let local = if destination.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(TransmissionError::Bind)?;

        info!(
            "UDP transmitter {} -> {}",
            socket.local_addr().map_err(TransmissionError::Bind)?,
            destination
        );

        Ok(Self {
            socket: Arc::new(socket),
            destination,
            timeout: send_timeout,
            closed: watch::channel(()).0,
        })
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Publish replies from the destination into `metrics` until the
    /// transmitter is dropped. Sends go on unaffected.
    pub fn spawn_reply_listener(&self, metrics: Arc<MetricsCollector>) -> JoinHandle<()> {
        tokio::spawn(reply_loop(
            self.socket.clone(),
            self.destination,
            metrics,
            self.closed.subscribe(),
        ))
    }
}

impl Transmit for UdpTransmitter {
    async fn send(&mut self, frame: &EncodedFrame) -> TransmissionRecord {
        let len = frame.len();
        let sent = timeout(
            self.timeout,
            self.socket.send_to(&frame.payload, self.destination),
        )
        .await;
        let error = match sent {
            Ok(Ok(sent)) if sent == len => None,
            Ok(Ok(sent)) => Some(TransmissionError::Truncated { sent, len }),
            Ok(Err(e)) => Some(TransmissionError::Io(e)),
            Err(_) => Some(TransmissionError::Timeout(self.timeout)),
        };
        trace!(sequence = frame.sequence, bytes = len, ok = error.is_none(), "datagram");
        TransmissionRecord::new(frame, error)
    }
}
