use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReachabilityStatus {
    HasInternet,
    NoInternet,
}

/// Source of connectivity changes.
///
/// `subscribe` hands out a receiver whose current value is readable right
/// away; consumers still de-duplicate repeated identical values.
pub trait ReachabilityService {
    fn current(&self) -> ReachabilityStatus;
    fn subscribe(&self) -> watch::Receiver<ReachabilityStatus>;
}

/// Reachability driven by the host, e.g. from platform connectivity callbacks.
#[derive(Debug)]
pub struct ManualReachability {
    tx: watch::Sender<ReachabilityStatus>,
}

impl ManualReachability {
    pub fn new(initial: ReachabilityStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publishes `status`; returns whether it differed from the current one.
    pub fn set(&self, status: ReachabilityStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        })
    }
}

impl ReachabilityService for ManualReachability {
    fn current(&self) -> ReachabilityStatus {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ReachabilityStatus> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbeSettings {
    /// `host:port` to connect to.
    pub address: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_timeout_ms() -> u64 {
    1_500
}

/// Polls a TCP endpoint and reports whether it accepts connections.
///
/// Starts out as [`ReachabilityStatus::NoInternet`] until the first probe
/// completes. The polling task stops when this value is dropped.
#[derive(Debug)]
pub struct ProbeReachability {
    tx: watch::Sender<ReachabilityStatus>,
    task: JoinHandle<()>,
}

impl ProbeReachability {
    /// Must be called within a tokio runtime.
    pub fn spawn(settings: ProbeSettings) -> Self {
        let (tx, _rx) = watch::channel(ReachabilityStatus::NoInternet);
        let publisher = tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(settings.interval_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let limit = Duration::from_millis(settings.timeout_ms);
            loop {
                ticker.tick().await;
                let status = probe_once(&settings.address, limit).await;
                let changed = publisher.send_if_modified(|current| {
                    if *current == status {
                        return false;
                    }
                    *current = status;
                    true
                });
                if changed {
                    info!(address = %settings.address, status = ?status, "reachability changed");
                }
            }
        });
        Self { tx, task }
    }
}

impl ReachabilityService for ProbeReachability {
    fn current(&self) -> ReachabilityStatus {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ReachabilityStatus> {
        self.tx.subscribe()
    }
}

impl Drop for ProbeReachability {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn probe_once(address: &str, limit: Duration) -> ReachabilityStatus {
    match timeout(limit, TcpStream::connect(address)).await {
        Ok(Ok(_)) => ReachabilityStatus::HasInternet,
        Ok(Err(err)) => {
            debug!(address, error = %err, "reachability probe failed");
            ReachabilityStatus::NoInternet
        }
        Err(_) => {
            debug!(address, "reachability probe timed out");
            ReachabilityStatus::NoInternet
        }
    }
}
