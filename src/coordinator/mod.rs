//! Platform coordinator
//!
//! Builds one adapter per configured platform and runs a worker task for
//! each. Workers are independent: a platform waiting out its retry delay or
//! marked failed never holds up the others.

mod state;
mod worker;

pub use state::{PlatformState, PlatformStatus, RetryState};

use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapter::{AdapterRegistry, EventSink, PlatformAdapter, PlatformEvent};
use crate::config::{PlatformConfig, Settings};
use crate::error::{CollectorError, Result};
use crate::metrics::PipelineMetrics;
use crate::notifier::Notifier;
use crate::rate_manager::RateManager;
use worker::{PlatformWorker, WorkerCommand};

struct PlatformSlot {
    config: PlatformConfig,
    adapter: Arc<dyn PlatformAdapter>,
    events: mpsc::UnboundedReceiver<PlatformEvent>,
}

/// Owner of every platform adapter, not yet running
pub struct Coordinator {
    settings: Arc<Settings>,
    rate_manager: Arc<RateManager>,
    notifier: Arc<dyn Notifier>,
    metrics: PipelineMetrics,
    slots: Vec<PlatformSlot>,
    statuses: Arc<DashMap<String, PlatformStatus>>,
}

impl Coordinator {
    /// Build an adapter for every configured platform
    ///
    /// Fails on an unknown adapter kind or an incomplete platform definition.
    pub fn new(
        settings: Arc<Settings>,
        registry: &AdapterRegistry,
        rate_manager: Arc<RateManager>,
        notifier: Arc<dyn Notifier>,
        metrics: PipelineMetrics,
    ) -> Result<Self> {
        let statuses = Arc::new(DashMap::new());
        let mut slots = Vec::with_capacity(settings.platforms.len());

        for config in &settings.platforms {
            let (sink, events) = EventSink::channel(&config.name);
            let adapter = registry.build(config, sink)?;

            statuses.insert(
                config.name.clone(),
                PlatformStatus {
                    platform: config.name.clone(),
                    kind: adapter.kind().to_string(),
                    state: PlatformState::Disconnected,
                    attempts: 0,
                    limit: settings.retry.limit,
                    delay_secs: settings.retry.delay_secs,
                    subscriptions: Vec::new(),
                    updated_at: chrono::Utc::now(),
                },
            );
            metrics.set_platform_state(&config.name, PlatformState::Disconnected.code());

            info!(platform = %config.name, kind = %config.kind, "Platform adapter created");
            slots.push(PlatformSlot {
                config: config.clone(),
                adapter,
                events,
            });
        }

        Ok(Self {
            settings,
            rate_manager,
            notifier,
            metrics,
            slots,
            statuses,
        })
    }

    /// Live status mirror, updated by the workers
    pub fn status_map(&self) -> Arc<DashMap<String, PlatformStatus>> {
        Arc::clone(&self.statuses)
    }

    /// Spawn one worker per platform
    pub fn start(self) -> CoordinatorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut commands = HashMap::new();
        let mut workers = Vec::with_capacity(self.slots.len());

        for slot in self.slots {
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            commands.insert(slot.config.name.clone(), command_tx);

            let worker = PlatformWorker {
                platform: slot.config.name.clone(),
                adapter: slot.adapter,
                instruments: slot.config.instruments.clone(),
                rate_manager: Arc::clone(&self.rate_manager),
                notifier: Arc::clone(&self.notifier),
                metrics: self.metrics.clone(),
                statuses: Arc::clone(&self.statuses),
                state: PlatformState::Disconnected,
                retry_state: RetryState::new(&slot.config.name, &self.settings.retry),
                connecting: None,
            };
            workers.push(tokio::spawn(worker.run(
                slot.events,
                command_rx,
                shutdown_rx.clone(),
            )));
        }

        info!(platforms = workers.len(), "Coordinator started");

        CoordinatorHandle {
            statuses: self.statuses,
            commands,
            shutdown: shutdown_tx,
            workers,
        }
    }
}

/// Control handle of a running coordinator
pub struct CoordinatorHandle {
    statuses: Arc<DashMap<String, PlatformStatus>>,
    commands: HashMap<String, mpsc::UnboundedSender<WorkerCommand>>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Status of every platform, sorted by name
    pub fn statuses(&self) -> Vec<PlatformStatus> {
        let mut statuses: Vec<PlatformStatus> =
            self.statuses.iter().map(|entry| entry.value().clone()).collect();
        statuses.sort_by(|a, b| a.platform.cmp(&b.platform));
        statuses
    }

    pub fn status(&self, platform: &str) -> Option<PlatformStatus> {
        self.statuses.get(platform).map(|entry| entry.value().clone())
    }

    /// Stop the feed of one instrument on one platform
    ///
    /// The instrument is also dropped from the platform's resubscribe list.
    pub async fn unsubscribe(&self, platform: &str, instrument: &str) -> Result<()> {
        let commands = self
            .commands
            .get(platform)
            .ok_or_else(|| CollectorError::Config(format!("Unknown platform: {}", platform)))?;

        let (reply, response) = oneshot::channel();
        commands
            .send(WorkerCommand::Unsubscribe {
                instrument: instrument.to_string(),
                reply,
            })
            .map_err(|_| CollectorError::NotConnected(platform.to_string()))?;

        response
            .await
            .map_err(|_| CollectorError::NotConnected(platform.to_string()))?
    }

    /// Disconnect every platform and wait for the workers to finish
    pub async fn shutdown(self) {
        info!("Shutting down coordinator");
        if self.shutdown.send(true).is_err() {
            warn!("All platform workers already stopped");
        }
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Platform worker ended abnormally");
            }
        }
        info!("Coordinator stopped");
    }
}
