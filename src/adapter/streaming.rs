//! Streaming socket adapter
//!
//! One long-lived TCP session per venue: login frame, single-line handshake,
//! then a read loop dispatching `|`-delimited quote frames by instrument.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::{EventSink, FirstSeen, PlatformAdapter};
use crate::config::PlatformConfig;
use crate::error::{CollectorError, Result};
use crate::protocol::{self, ServerMessage};

pub const KIND: &str = "streaming";

/// Upper bound for TCP connect and for the handshake line
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type FeedLines = Lines<BufReader<OwnedReadHalf>>;

/// Adapter for line-oriented streaming venues
pub struct StreamingAdapter {
    shared: Arc<Shared>,
}

struct Shared {
    platform: String,
    addr: String,
    username: String,
    password: String,
    read_timeout: Duration,
    events: EventSink,
    session: Mutex<Option<Session>>,
    subscriptions: SyncMutex<HashSet<String>>,
    first_seen: FirstSeen,
    next_session_id: AtomicU64,
}

/// A live connection: write half plus the task draining the read half
struct Session {
    id: u64,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    /// Set by whoever ends the session first; only that party reports
    closing: Arc<AtomicBool>,
}

impl StreamingAdapter {
    pub fn new(config: &PlatformConfig, events: EventSink) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                platform: config.name.clone(),
                addr: config.socket_addr()?,
                username: config.username.clone(),
                password: config.password.clone(),
                read_timeout: config.read_timeout(),
                events,
                session: Mutex::new(None),
                subscriptions: SyncMutex::new(HashSet::new()),
                first_seen: FirstSeen::default(),
                next_session_id: AtomicU64::new(0),
            }),
        })
    }
}

#[async_trait]
impl PlatformAdapter for StreamingAdapter {
    fn platform(&self) -> &str {
        &self.shared.platform
    }

    fn kind(&self) -> &str {
        KIND
    }

    async fn connect(&self) -> Result<()> {
        let shared = &self.shared;

        // Never hold two sessions against the same venue
        shared.close_session().await;
        shared.reset_bookkeeping();

        info!(platform = %shared.platform, addr = %shared.addr, "Connecting to streaming venue");

        let (writer, lines) = match shared.open().await {
            Ok(parts) => parts,
            Err(e) => {
                error!(platform = %shared.platform, error = %e, "Streaming connect failed");
                shared.events.on_connect(false);
                return Err(e);
            }
        };

        // Session is stored and reported before the reader can observe a failure
        let mut guard = shared.session.lock().await;
        let id = shared.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let closing = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            Arc::clone(shared),
            id,
            Arc::clone(&closing),
            lines,
        ));
        *guard = Some(Session {
            id,
            writer,
            reader,
            closing,
        });
        shared.events.on_connect(true);
        drop(guard);

        info!(platform = %shared.platform, session = id, "Streaming venue connected");
        Ok(())
    }

    async fn subscribe(&self, instrument: &str) -> Result<()> {
        let shared = &self.shared;
        if !shared.subscriptions.lock().insert(instrument.to_string()) {
            info!(platform = %shared.platform, instrument = %instrument, "Already subscribed");
            return Ok(());
        }

        let command = protocol::subscribe_command(&shared.platform, instrument);
        if let Err(e) = shared.send(&command).await {
            shared.subscriptions.lock().remove(instrument);
            return Err(e);
        }

        info!(platform = %shared.platform, instrument = %instrument, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, instrument: &str) -> Result<()> {
        let shared = &self.shared;
        if !shared.subscriptions.lock().remove(instrument) {
            debug!(platform = %shared.platform, instrument = %instrument, "Not subscribed");
            return Ok(());
        }
        shared.first_seen.forget(instrument);

        shared
            .send(&protocol::unsubscribe_command(&shared.platform, instrument))
            .await?;
        info!(platform = %shared.platform, instrument = %instrument, "Unsubscribed");
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.close_session().await;
        self.shared.reset_bookkeeping();
    }

    fn subscriptions(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self.shared.subscriptions.lock().iter().cloned().collect();
        instruments.sort();
        instruments
    }
}

impl Shared {
    /// Dial, log in and wait for the handshake line
    async fn open(&self) -> Result<(OwnedWriteHalf, FeedLines)> {
        let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| CollectorError::Timeout)??;
        stream.set_nodelay(true)?;

        let (read_half, mut writer) = stream.into_split();
        writer
            .write_all(protocol::connect_command(&self.username, &self.password).as_bytes())
            .await?;

        let mut lines = BufReader::new(read_half).lines();
        let handshake = timeout(HANDSHAKE_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| CollectorError::Timeout)??;

        match handshake.as_deref().map(ServerMessage::parse) {
            Some(Ok(ServerMessage::Success(_))) => Ok((writer, lines)),
            Some(Ok(ServerMessage::Error(reason))) => Err(CollectorError::Authentication(reason)),
            None => Err(CollectorError::Connection(
                "Server closed connection without response".to_string(),
            )),
            Some(_) => Err(CollectorError::Protocol(format!(
                "Unexpected handshake: {}",
                handshake.unwrap_or_default()
            ))),
        }
    }

    async fn send(&self, command: &str) -> Result<()> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| CollectorError::NotConnected(self.platform.clone()))?;
        session.writer.write_all(command.as_bytes()).await?;
        Ok(())
    }

    /// Tear down the current session without reporting a disconnect
    async fn close_session(&self) {
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };

        // If the reader already claimed the failure it finishes its own cleanup
        if !session.closing.swap(true, Ordering::SeqCst) {
            session.reader.abort();
        }

        let goodbye = protocol::disconnect_command(&self.username, &self.password);
        if let Err(e) = session.writer.write_all(goodbye.as_bytes()).await {
            debug!(platform = %self.platform, error = %e, "Failed to send disconnect");
        }
        let _ = session.writer.shutdown().await;

        info!(platform = %self.platform, session = session.id, "Streaming session closed");
    }

    fn reset_bookkeeping(&self) {
        self.subscriptions.lock().clear();
        self.first_seen.clear();
    }

    fn handle_line(&self, line: &str) {
        match ServerMessage::parse(line) {
            Ok(ServerMessage::Quote(frame)) => {
                if !frame.platform.eq_ignore_ascii_case(&self.platform) {
                    warn!(platform = %self.platform, feed = %frame.platform, "Quote for foreign platform dropped");
                    return;
                }
                let instrument = frame.instrument.clone();
                if !self.subscriptions.lock().contains(&instrument) {
                    debug!(platform = %self.platform, instrument = %instrument, "Quote for unsubscribed instrument dropped");
                    return;
                }
                trace!(
                    platform = %self.platform,
                    instrument = %instrument,
                    bid = %frame.bid,
                    ask = %frame.ask,
                    "Quote received"
                );
                self.first_seen.dispatch(&self.events, &instrument, frame.into_rate());
            }
            Ok(ServerMessage::Success(msg)) => {
                debug!(platform = %self.platform, msg = %msg, "Venue acknowledged");
            }
            Ok(ServerMessage::Info(msg)) => {
                info!(platform = %self.platform, msg = %msg, "Venue info");
            }
            Ok(ServerMessage::Error(msg)) => {
                warn!(platform = %self.platform, msg = %msg, "Venue error");
            }
            Ok(ServerMessage::Unknown(msg)) => {
                trace!(platform = %self.platform, msg = %msg, "Unknown message type");
            }
            Err(e) => {
                warn!(platform = %self.platform, error = %e, "Dropping malformed frame");
            }
        }
    }

    /// Called by the reader when the transport fails
    async fn transport_failed(&self, session_id: u64, closing: &AtomicBool, reason: &str) {
        if closing.swap(true, Ordering::SeqCst) {
            // Session was closed on purpose
            return;
        }

        let mut guard = self.session.lock().await;
        let owned = guard.as_ref().map(|s| s.id) == Some(session_id);
        if !owned {
            // Session already taken by disconnect or a newer connect
            debug!(platform = %self.platform, session = session_id, reason = %reason, "Stale session ended");
            return;
        }

        error!(platform = %self.platform, session = session_id, reason = %reason, "Streaming transport failed");
        if let Some(mut session) = guard.take() {
            let _ = session.writer.shutdown().await;
        }

        // Reported under the lock so a concurrent disconnect returns after it
        self.reset_bookkeeping();
        self.events.on_disconnect();
    }
}

async fn read_loop(shared: Arc<Shared>, session_id: u64, closing: Arc<AtomicBool>, mut lines: FeedLines) {
    debug!(platform = %shared.platform, session = session_id, "Listening for incoming rates");

    let reason = loop {
        match timeout(shared.read_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => shared.handle_line(&line),
            Ok(Ok(None)) => break "stream ended".to_string(),
            Ok(Err(e)) => break e.to_string(),
            Err(_) => break format!("no data within {}s", shared.read_timeout.as_secs()),
        }
    };

    drop(lines);
    shared.transport_failed(session_id, &closing, &reason).await;
}
