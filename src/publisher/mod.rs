//! Publisher module for IPC communication
//!
//! Publishes raw and calculated rates to downstream consumers. Publishing
//! never fails the pipeline: frames are queued and a writer task delivers
//! them over a Unix socket, reconnecting lazily.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CollectorError, Result};
use crate::model::{CalculatedRate, Rate};

/// Frames buffered before new rates are dropped
const QUEUE_CAPACITY: usize = 4096;

/// Sink for accepted rates
#[cfg_attr(test, mockall::automock)]
pub trait RatePublisher: Send + Sync {
    /// Publish a platform's raw rate
    fn send_raw_rate(&self, platform: &str, rate: &Rate);

    /// Publish a consensus or re-based rate
    fn send_calculated_rate(&self, rate: &CalculatedRate);
}

/// Envelope written to the IPC socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PublishedRate {
    Raw { platform: String, rate: Rate },
    Calculated { rate: CalculatedRate },
}

impl PublishedRate {
    fn describe(&self) -> (&str, &str) {
        match self {
            PublishedRate::Raw { platform, rate } => (platform.as_str(), rate.instrument.as_str()),
            PublishedRate::Calculated { rate } => ("calculated", rate.instrument.as_str()),
        }
    }
}

/// Encode an envelope as a MessagePack frame with a big-endian length prefix
pub fn encode_frame(message: &PublishedRate) -> Result<Bytes> {
    let data = rmp_serde::to_vec_named(message)?;
    let len = u32::try_from(data.len())
        .map_err(|_| CollectorError::Serialization(format!("Frame too large: {} bytes", data.len())))?;

    let mut frame = BytesMut::with_capacity(4 + data.len());
    frame.put_u32(len);
    frame.put_slice(&data);
    Ok(frame.freeze())
}

/// Publisher for sending rates via Unix socket
pub struct IpcPublisher {
    tx: mpsc::Sender<PublishedRate>,
}

impl IpcPublisher {
    /// Create a publisher and start its writer task
    pub fn new(socket_path: &str) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(write_loop(socket_path.to_string(), rx));
        Self { tx }
    }

    fn enqueue(&self, message: PublishedRate) {
        if let Err(e) = self.tx.try_send(message) {
            warn!(error = %e, "IPC queue unavailable, dropping rate");
        }
    }
}

impl RatePublisher for IpcPublisher {
    fn send_raw_rate(&self, platform: &str, rate: &Rate) {
        self.enqueue(PublishedRate::Raw {
            platform: platform.to_string(),
            rate: rate.clone(),
        });
    }

    fn send_calculated_rate(&self, rate: &CalculatedRate) {
        self.enqueue(PublishedRate::Calculated { rate: rate.clone() });
    }
}

async fn connect(socket_path: &str) -> Result<UnixStream> {
    let path = Path::new(socket_path);

    if !path.exists() {
        return Err(CollectorError::Ipc(format!(
            "Socket path does not exist: {}",
            socket_path
        )));
    }

    let stream = UnixStream::connect(path).await.map_err(|e| {
        CollectorError::Ipc(format!("Failed to connect to {}: {}", socket_path, e))
    })?;

    info!(path = %socket_path, "Connected to IPC socket");
    Ok(stream)
}

async fn write_loop(socket_path: String, mut rx: mpsc::Receiver<PublishedRate>) {
    let mut stream: Option<UnixStream> = None;

    while let Some(message) = rx.recv().await {
        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode rate");
                continue;
            }
        };

        if stream.is_none() {
            match connect(&socket_path).await {
                Ok(s) => stream = Some(s),
                Err(e) => {
                    debug!(error = %e, "Failed to reconnect to IPC socket");
                    continue;
                }
            }
        }

        if let Some(s) = stream.as_mut() {
            let (source, instrument) = message.describe();
            match s.write_all(&frame).await {
                Ok(()) => debug!(source = %source, instrument = %instrument, "Published rate"),
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    stream = None;
                }
            }
        }
    }

    debug!("IPC publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;
    use tokio::time::timeout;

    async fn read_frame(stream: &mut UnixStream) -> PublishedRate {
        let len = stream.read_u32().await.unwrap() as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        rmp_serde::from_slice(&payload).unwrap()
    }

    #[test]
    fn test_frame_is_length_prefixed() {
        let message = PublishedRate::Calculated {
            rate: CalculatedRate {
                instrument: "USDTRY".to_string(),
                bid: dec!(32.1),
                ask: dec!(32.5),
                computed_at: Utc::now(),
            },
        };

        let frame = encode_frame(&message).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let decoded: PublishedRate = rmp_serde::from_slice(&frame[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_publishes_to_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let publisher = IpcPublisher::new(path.to_str().unwrap());
        let rate = Rate::new("USDTRY", dec!(32.1), dec!(32.2), Utc::now());
        publisher.send_raw_rate("TCP", &rate);

        let (mut stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();

        match read_frame(&mut stream).await {
            PublishedRate::Raw { platform, rate: received } => {
                assert_eq!(platform, "TCP");
                assert_eq!(received, rate);
            }
            other => panic!("Expected Raw, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_socket_does_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");

        let publisher = IpcPublisher::new(path.to_str().unwrap());
        let rate = Rate::new("USDTRY", dec!(32.1), dec!(32.2), Utc::now());
        publisher.send_raw_rate("TCP", &rate);
        publisher.send_calculated_rate(&CalculatedRate::now(
            "USDTRY",
            crate::model::Quote::new(dec!(32.1), dec!(32.2)),
        ));

        // Once the consumer shows up, later rates get through
        tokio::time::sleep(Duration::from_millis(50)).await;
        let listener = UnixListener::bind(&path).unwrap();
        publisher.send_raw_rate("REST", &rate);

        let (mut stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            read_frame(&mut stream).await,
            PublishedRate::Raw { platform, .. } if platform == "REST"
        ));
    }
}
