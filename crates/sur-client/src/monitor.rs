//! Connection monitor: periodic health probing of the separation service.
//!
//! One background task owns the only `watch::Sender<ConnectionState>`; any
//! number of readers borrow the latest value or await `changed()`.  The first
//! probe fires immediately, later ones on a fixed interval.  Probes are never
//! retried faster than that interval.
//!
//! Dropping the monitor (or calling `shutdown`) cancels the loop, so no
//! timer survives the session.
use std::time::Duration;

use chrono::{DateTime, Utc};
use sur_proto::protocol::HealthResponse;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::HealthProbe;
use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionState {
    pub is_available: bool,
    pub last_error: Option<String>,
    /// `None` until the first probe has completed.
    pub checked_at: Option<DateTime<Utc>>,
}

impl ConnectionState {
    /// State after one probe.  A parsed answer clears the error even when the
    /// service reports something other than healthy.
    pub fn from_probe(result: &Result<HealthResponse, ConnectionError>, now: DateTime<Utc>) -> Self {
        match result {
            Ok(health) => Self {
                is_available: health.is_healthy(),
                last_error: None,
                checked_at: Some(now),
            },
            Err(e) => Self {
                is_available: false,
                last_error: Some(e.to_string()),
                checked_at: Some(now),
            },
        }
    }

    pub fn has_probed(&self) -> bool {
        self.checked_at.is_some()
    }
}

pub struct ConnectionMonitor {
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionMonitor {
    /// Start probing.  Must be called from within a tokio runtime.
    pub fn spawn<P>(probe: P, interval: Duration) -> Self
    where
        P: HealthProbe + 'static,
    {
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(probe_loop(probe, interval, state_tx, cancel.clone()));
        Self {
            state_rx,
            cancel,
            task: Some(task),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn is_available(&self) -> bool {
        self.state_rx.borrow().is_available
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Resolves once at least one probe has landed.
    pub async fn wait_for_first_probe(&self) -> ConnectionState {
        let mut rx = self.state_rx.clone();
        if let Ok(state) = rx.wait_for(ConnectionState::has_probed).await {
            return state.clone();
        }
        let state = rx.borrow().clone();
        state
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn probe_loop<P: HealthProbe>(
    probe: P,
    interval: Duration,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = probe.probe() => result,
        };

        let next = ConnectionState::from_probe(&result, Utc::now());
        let previous = state_tx.send_replace(next.clone());
        match (&result, previous.is_available != next.is_available) {
            (Ok(_), true) => info!("monitor: service available={}", next.is_available),
            (Err(e), true) => warn!("monitor: service unreachable: {}", e),
            (Err(e), false) => debug!("monitor: probe failed: {}", e),
            (Ok(health), false) => debug!("monitor: probe ok status={}", health.status),
        }
    }

    debug!("monitor: probe loop stopped");
}
