//! Polling HTTP adapter
//!
//! Authenticates once for a bearer token, then runs one fixed-delay poll job
//! per subscribed instrument. Jobs are independently cancellable; repeated
//! transport failures in any job take the whole platform down, reported once.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use super::{EventSink, FirstSeen, PlatformAdapter};
use crate::config::PlatformConfig;
use crate::error::{CollectorError, Result};
use crate::model::Rate;
use crate::protocol::{LoginRequest, LoginResponse, RestRate};

pub const KIND: &str = "polling";

/// Every venue request is bounded by this timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Adapter for REST venues polled at a fixed interval
pub struct PollingAdapter {
    shared: Arc<Shared>,
}

struct Shared {
    platform: String,
    base_url: String,
    username: String,
    password: String,
    poll_interval: Duration,
    max_failures: u32,
    client: reqwest::Client,
    events: EventSink,
    api_key: RwLock<Option<String>>,
    jobs: Mutex<HashMap<String, PollJob>>,
    first_seen: FirstSeen,
    /// Set by the first job that gives up on the venue, cleared on connect
    disconnecting: AtomicBool,
}

struct PollJob {
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PollJob {
    fn cancel(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.handle.abort();
    }
}

impl PollingAdapter {
    pub fn new(config: &PlatformConfig, events: EventSink) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            shared: Arc::new(Shared {
                platform: config.name.clone(),
                base_url: config.base_url()?,
                username: config.username.clone(),
                password: config.password.clone(),
                poll_interval: config.poll_interval(),
                max_failures: config.max_poll_failures.max(1),
                client,
                events,
                api_key: RwLock::new(None),
                jobs: Mutex::new(HashMap::new()),
                first_seen: FirstSeen::default(),
                disconnecting: AtomicBool::new(false),
            }),
        })
    }
}

#[async_trait]
impl PlatformAdapter for PollingAdapter {
    fn platform(&self) -> &str {
        &self.shared.platform
    }

    fn kind(&self) -> &str {
        KIND
    }

    async fn connect(&self) -> Result<()> {
        let shared = &self.shared;

        // Drop whatever the previous session left behind
        shared.reset();

        info!(platform = %shared.platform, url = %shared.base_url, "Authenticating with polling venue");

        match shared.login().await {
            Ok(api_key) => {
                *shared.api_key.write() = Some(api_key);
                shared.disconnecting.store(false, Ordering::SeqCst);
                info!(platform = %shared.platform, "Polling venue connected");
                shared.events.on_connect(true);
                Ok(())
            }
            Err(e) => {
                error!(platform = %shared.platform, error = %e, "Polling connect failed");
                shared.events.on_connect(false);
                Err(e)
            }
        }
    }

    async fn subscribe(&self, instrument: &str) -> Result<()> {
        let shared = &self.shared;
        let api_key = shared
            .api_key
            .read()
            .clone()
            .ok_or_else(|| CollectorError::NotConnected(shared.platform.clone()))?;

        let mut jobs = shared.jobs.lock();
        if jobs.contains_key(instrument) {
            info!(platform = %shared.platform, instrument = %instrument, "Already subscribed");
            return Ok(());
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(poll_loop(
            Arc::clone(shared),
            instrument.to_string(),
            api_key,
            Arc::clone(&cancelled),
        ));
        jobs.insert(instrument.to_string(), PollJob { cancelled, handle });

        info!(
            platform = %shared.platform,
            instrument = %instrument,
            interval_ms = shared.poll_interval.as_millis() as u64,
            "Subscribed"
        );
        Ok(())
    }

    async fn unsubscribe(&self, instrument: &str) -> Result<()> {
        let shared = &self.shared;
        let job = shared.jobs.lock().remove(instrument);
        match job {
            Some(job) => {
                job.cancel();
                shared.first_seen.forget(instrument);
                info!(platform = %shared.platform, instrument = %instrument, "Unsubscribed");
            }
            None => {
                debug!(platform = %shared.platform, instrument = %instrument, "Not subscribed");
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.reset();
        info!(platform = %self.shared.platform, "Polling venue disconnected");
    }

    fn subscriptions(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self.shared.jobs.lock().keys().cloned().collect();
        instruments.sort();
        instruments
    }
}

impl Shared {
    async fn login(&self) -> Result<String> {
        let url = format!("{}/auth/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(CollectorError::Authentication(format!(
                "Login returned status {}",
                status
            )));
        }

        let login: LoginResponse = serde_json::from_str(&response.text().await?)?;
        Ok(login.api_key)
    }

    async fn poll_once(&self, url: &str, api_key: &str, instrument: &str) -> Result<Rate> {
        let response = self.client.get(url).bearer_auth(api_key).send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await?;
                let rate: RestRate = serde_json::from_str(&body)?;
                Ok(rate.into_rate(instrument))
            }
            StatusCode::BAD_REQUEST => Err(CollectorError::InstrumentNotOffered(instrument.to_string())),
            status => Err(CollectorError::RestApi(format!(
                "Unexpected status {} from {}",
                status, url
            ))),
        }
    }

    /// Cancel every job and forget the token, without reporting
    fn reset(&self) {
        let jobs: Vec<PollJob> = self.jobs.lock().drain().map(|(_, job)| job).collect();
        for job in jobs {
            job.cancel();
        }
        *self.api_key.write() = None;
        self.first_seen.clear();
    }

    /// Remove a single job that ended on its own
    fn retire_job(&self, instrument: &str, cancelled: &Arc<AtomicBool>) {
        cancelled.store(true, Ordering::SeqCst);
        let mut jobs = self.jobs.lock();
        let owned = jobs
            .get(instrument)
            .map(|job| Arc::ptr_eq(&job.cancelled, cancelled))
            .unwrap_or(false);
        if owned {
            jobs.remove(instrument);
        }
        drop(jobs);
        self.first_seen.forget(instrument);
    }

    /// Give up on the venue: cancel all jobs, then report exactly once
    fn transport_failed(&self, reason: &str) {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        error!(platform = %self.platform, reason = %reason, "Polling venue unreachable, cancelling all jobs");

        let jobs: Vec<PollJob> = self.jobs.lock().drain().map(|(_, job)| job).collect();
        for job in &jobs {
            job.cancelled.store(true, Ordering::SeqCst);
        }
        *self.api_key.write() = None;
        self.first_seen.clear();

        self.events.on_disconnect();

        // The calling job is among these; it stops at its next await
        for job in jobs {
            job.handle.abort();
        }
    }
}

async fn poll_loop(shared: Arc<Shared>, instrument: String, api_key: String, cancelled: Arc<AtomicBool>) {
    let url = format!("{}/api/rates/{}_{}", shared.base_url, shared.platform, instrument);
    let mut failures = 0u32;

    loop {
        let result = shared.poll_once(&url, &api_key, &instrument).await;

        // Results of a cancelled subscription are discarded
        if cancelled.load(Ordering::SeqCst) {
            break;
        }

        match result {
            Ok(rate) => {
                failures = 0;
                trace!(
                    platform = %shared.platform,
                    instrument = %instrument,
                    bid = %rate.bid,
                    ask = %rate.ask,
                    "Quote received"
                );
                shared.first_seen.dispatch(&shared.events, &instrument, rate);
            }
            Err(CollectorError::InstrumentNotOffered(_)) => {
                warn!(platform = %shared.platform, instrument = %instrument, "Instrument not offered, stopping its poll job");
                shared.retire_job(&instrument, &cancelled);
                break;
            }
            Err(CollectorError::Protocol(e)) => {
                warn!(platform = %shared.platform, instrument = %instrument, error = %e, "Dropping malformed rate payload");
            }
            Err(e) => {
                failures += 1;
                warn!(
                    platform = %shared.platform,
                    instrument = %instrument,
                    failures,
                    max_failures = shared.max_failures,
                    error = %e,
                    "Poll failed"
                );
                if failures >= shared.max_failures {
                    shared.transport_failed(&e.to_string());
                    break;
                }
            }
        }

        sleep(shared.poll_interval).await;
    }
}
