use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::reassembly::Outcome;
use crate::source::BdAddr;

/// Counters served by the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub observations: u64,
    pub fragments_stored: u64,
    pub duplicates: u64,
    pub rejected: u64,
    /// Partial records dropped because a new session started.
    pub superseded: u64,
    pub records_completed: u64,
    pub records_published: u64,
    /// Records that could not be encoded.
    pub records_dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub locked_emitter: Option<String>,
    pub last_publish: Option<jiff::Timestamp>,
    #[serde(flatten)]
    pub stats: GatewayStats,
}

/// Shared state updated by the reassembly and publish tasks.
#[derive(Clone)]
pub struct GatewayState {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    stats: GatewayStats,
    locked_emitter: Option<BdAddr>,
    last_publish: Option<jiff::Timestamp>,
    startup_time: Instant,
}

impl GatewayState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                stats: GatewayStats::default(),
                locked_emitter: None,
                last_publish: None,
                startup_time: Instant::now(),
            })),
        }
    }

    /// Account for one observation and what the receiver made of it.
    pub async fn record_outcome(&self, outcome: &Outcome) {
        let mut inner = self.inner.lock().await;
        let stats = &mut inner.stats;
        stats.observations += 1;

        match outcome {
            Outcome::Ignored => {}
            Outcome::Rejected(_) => stats.rejected += 1,
            Outcome::Duplicate => stats.duplicates += 1,
            Outcome::Stored { superseded, .. } => {
                stats.fragments_stored += 1;
                if *superseded {
                    stats.superseded += 1;
                }
            }
            Outcome::Complete { superseded, .. } => {
                stats.fragments_stored += 1;
                stats.records_completed += 1;
                if *superseded {
                    stats.superseded += 1;
                }
            }
        }
    }

    pub async fn emitter_locked(&self, address: BdAddr) {
        let mut inner = self.inner.lock().await;
        inner.locked_emitter = Some(address);
    }

    pub async fn record_published(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.records_published += 1;
        inner.last_publish = Some(jiff::Timestamp::now());
    }

    pub async fn record_dropped(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.records_dropped += 1;
    }

    pub async fn stats(&self) -> GatewayStats {
        self.inner.lock().await.stats.clone()
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock().await;

        HealthSnapshot {
            status: "ok",
            uptime_secs: inner.startup_time.elapsed().as_secs(),
            locked_emitter: inner.locked_emitter.map(|addr| addr.to_string()),
            last_publish: inner.last_publish,
            stats: inner.stats.clone(),
        }
    }
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}
