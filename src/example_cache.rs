//! Example-value cache
//!
//! Keeps a small sample of live vocabulary (class names, fee types, academic
//! years) so generated SQL uses values that actually exist. The snapshot is
//! refreshed when it is older than the TTL; a failed refresh keeps serving the
//! last good snapshot.

use crate::store::{ExampleValues, QueryStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Snapshot {
    values: ExampleValues,
    captured_at: Instant,
}

pub struct ExampleValueCache {
    source: Option<Arc<dyn QueryStore>>,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl ExampleValueCache {
    pub fn new(source: Arc<dyn QueryStore>, ttl: Duration) -> Self {
        Self {
            source: Some(source),
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    /// A cache with no store behind it; always empty.
    pub fn empty() -> Self {
        Self {
            source: None,
            ttl: Duration::MAX,
            snapshot: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current values, refreshing first if the snapshot is missing or stale.
    pub async fn values(&self) -> ExampleValues {
        self.values_at(Instant::now()).await
    }

    pub(crate) async fn values_at(&self, now: Instant) -> ExampleValues {
        {
            let guard = self.snapshot.read().await;
            if let Some(snapshot) = guard.as_ref() {
                if !is_stale(snapshot, now, self.ttl) {
                    return snapshot.values.clone();
                }
            }
        }
        self.refresh(now).await
    }

    async fn refresh(&self, now: Instant) -> ExampleValues {
        let Some(source) = self.source.as_ref() else {
            return ExampleValues::new();
        };

        match source.sample_values().await {
            Ok(values) if !values.is_empty() => {
                info!("Refreshed example values ({} categories)", values.len());
                let mut guard = self.snapshot.write().await;
                *guard = Some(Snapshot {
                    values: values.clone(),
                    captured_at: now,
                });
                values
            }
            Ok(_) => self.keep_last_known(now, "sample came back empty").await,
            Err(e) => self.keep_last_known(now, &e.to_string()).await,
        }
    }

    /// Serve the previous values and restamp them, so the next attempt waits
    /// a full TTL instead of retrying on every request.
    async fn keep_last_known(&self, now: Instant, reason: &str) -> ExampleValues {
        warn!("Example value refresh failed, serving last known values: {}", reason);
        let mut guard = self.snapshot.write().await;
        let snapshot = guard.get_or_insert_with(|| Snapshot {
            values: ExampleValues::new(),
            captured_at: now,
        });
        snapshot.captured_at = now;
        debug!("Last known snapshot has {} categories", snapshot.values.len());
        snapshot.values.clone()
    }
}

fn is_stale(snapshot: &Snapshot, now: Instant, ttl: Duration) -> bool {
    now.saturating_duration_since(snapshot.captured_at) > ttl
}
