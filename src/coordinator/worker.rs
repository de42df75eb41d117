//! Per-platform worker
//!
//! Owns one adapter together with its lifecycle and retry state, drains the
//! adapter's events and hands rates to the rate manager.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, trace, warn};

use super::state::{PlatformState, PlatformStatus, RetryState};
use crate::adapter::{PlatformAdapter, PlatformEvent};
use crate::error::Result;
use crate::metrics::PipelineMetrics;
use crate::notifier::Notifier;
use crate::rate_manager::RateManager;

/// Requests forwarded to a worker by the coordinator handle
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Unsubscribe {
        instrument: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub(crate) struct PlatformWorker {
    pub(crate) platform: String,
    pub(crate) adapter: Arc<dyn PlatformAdapter>,
    pub(crate) instruments: Vec<String>,
    pub(crate) rate_manager: Arc<RateManager>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) metrics: PipelineMetrics,
    pub(crate) statuses: Arc<DashMap<String, PlatformStatus>>,
    pub(crate) state: PlatformState,
    pub(crate) retry_state: RetryState,
    pub(crate) connecting: Option<JoinHandle<()>>,
}

impl PlatformWorker {
    pub(crate) async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PlatformEvent>,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if *shutdown.borrow() {
            return;
        }

        self.begin_connect();

        let retry_timer = sleep(Duration::ZERO);
        tokio::pin!(retry_timer);
        let mut retry_armed = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(event) = events.recv() => {
                    if let Some(delay) = self.on_event(event).await {
                        retry_timer.as_mut().reset(Instant::now() + delay);
                        retry_armed = true;
                    }
                }
                Some(command) = commands.recv() => self.on_command(command).await,
                _ = &mut retry_timer, if retry_armed => {
                    retry_armed = false;
                    self.begin_connect();
                }
            }
        }

        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.adapter.disconnect().await;
        info!(platform = %self.platform, "Platform worker stopped");
    }

    fn begin_connect(&mut self) {
        self.set_state(PlatformState::Connecting);
        self.metrics.record_connection_attempt(&self.platform);
        info!(
            platform = %self.platform,
            attempt = self.retry_state.attempts + 1,
            "Connecting to platform"
        );

        // Connect off the worker so events keep draining meanwhile
        let adapter = Arc::clone(&self.adapter);
        let platform = self.platform.clone();
        self.connecting = Some(tokio::spawn(async move {
            if let Err(e) = adapter.connect().await {
                debug!(platform = %platform, error = %e, "Connect attempt failed");
            }
        }));
    }

    /// Apply an event; returns the delay before the next connect when a retry is due
    async fn on_event(&mut self, event: PlatformEvent) -> Option<Duration> {
        match event {
            PlatformEvent::Connected { ok: true } => {
                self.on_connected().await;
                None
            }
            PlatformEvent::Connected { ok: false } | PlatformEvent::Disconnected => self.on_connection_lost(),
            PlatformEvent::RateAvailable { instrument, rate } => {
                if self.routes_rates(&instrument) {
                    self.metrics.record_received(&self.platform, true);
                    self.rate_manager.handle_first_rate(&self.platform, &instrument, rate);
                }
                None
            }
            PlatformEvent::RateUpdate { instrument, rate } => {
                if self.routes_rates(&instrument) {
                    self.metrics.record_received(&self.platform, false);
                    let outcome = self
                        .rate_manager
                        .handle_rate_update(&self.platform, &instrument, rate);
                    trace!(platform = %self.platform, instrument = %instrument, outcome = ?outcome, "Rate update handled");
                }
                None
            }
        }
    }

    async fn on_connected(&mut self) {
        if self.state == PlatformState::Failed {
            return;
        }

        self.retry_state.reset();
        self.set_state(PlatformState::Connected);
        info!(platform = %self.platform, "Platform connected");

        for instrument in &self.instruments {
            if let Err(e) = self.adapter.subscribe(instrument).await {
                warn!(platform = %self.platform, instrument = %instrument, error = %e, "Subscribe failed");
            }
        }
        self.set_state(PlatformState::Subscribed);
    }

    fn on_connection_lost(&mut self) -> Option<Duration> {
        // Already waiting for a retry, or given up
        if matches!(self.state, PlatformState::Disconnected | PlatformState::Failed) {
            return None;
        }

        if self.retry_state.exhausted() {
            self.set_state(PlatformState::Failed);
            error!(
                platform = %self.platform,
                attempts = self.retry_state.attempts,
                "Retry limit reached, giving up on platform"
            );
            self.notifier.send_connection_failure_alert(
                &self.platform,
                self.retry_state.limit,
                self.retry_state.delay_secs,
            );
            return None;
        }

        self.retry_state.attempts += 1;
        self.set_state(PlatformState::Disconnected);
        warn!(
            platform = %self.platform,
            attempt = self.retry_state.attempts,
            limit = self.retry_state.limit,
            delay_secs = self.retry_state.delay_secs,
            "Platform connection lost, retry scheduled"
        );
        Some(self.retry_state.delay())
    }

    async fn on_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Unsubscribe { instrument, reply } => {
                self.instruments.retain(|i| i != &instrument);
                let result = self.adapter.unsubscribe(&instrument).await;
                self.publish_status();
                if reply.send(result).is_err() {
                    trace!(platform = %self.platform, "Unsubscribe caller went away");
                }
            }
        }
    }

    fn routes_rates(&self, instrument: &str) -> bool {
        if self.state.accepts_rates() {
            return true;
        }
        trace!(platform = %self.platform, instrument = %instrument, state = %self.state, "Dropping rate");
        false
    }

    fn set_state(&mut self, state: PlatformState) {
        self.state = state;
        self.metrics.set_platform_state(&self.platform, state.code());
        self.publish_status();
    }

    fn publish_status(&self) {
        self.statuses.insert(
            self.platform.clone(),
            PlatformStatus {
                platform: self.platform.clone(),
                kind: self.adapter.kind().to_string(),
                state: self.state,
                attempts: self.retry_state.attempts,
                limit: self.retry_state.limit,
                delay_secs: self.retry_state.delay_secs,
                subscriptions: self.adapter.subscriptions(),
                updated_at: Utc::now(),
            },
        );
    }
}
