//! Background refresh loop.
//!
//! One task lists the bucket on a fixed interval, builds a snapshot and
//! publishes it. A failed cycle is recorded on the cache and the loop keeps
//! going. A single failure is retried on the next tick; repeated failures
//! add a jittered exponential delay on top of the interval.

use crate::cache::SnapshotCache;
use crate::config::RefreshConfig;
use crate::lister::{list_all, ListingError, ObjectLister};
use crate::snapshot::{RefreshError, SnapshotBuilder};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Result of a single refresh cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new snapshot is being served
    Published { generation: u64, items: usize },
    /// The listing failed or timed out, the previous snapshot is kept
    Failed { consecutive_failures: u32 },
    /// Another refresh was still running
    Skipped,
    /// Shutdown was requested mid-cycle
    Cancelled,
}

/// Drives periodic refreshes of a [`SnapshotCache`]
pub struct RefreshScheduler {
    lister: Arc<dyn ObjectLister>,
    builder: SnapshotBuilder,
    cache: Arc<SnapshotCache>,
    interval: Duration,
    timeout: Duration,
    backoff: Option<ExponentialBackoff>,
}

impl RefreshScheduler {
    pub fn new(
        lister: Arc<dyn ObjectLister>,
        builder: SnapshotBuilder,
        cache: Arc<SnapshotCache>,
        config: &RefreshConfig,
    ) -> Self {
        let backoff = config.backoff_enabled.then(|| ExponentialBackoff {
            initial_interval: config.backoff_initial(),
            max_interval: config.backoff_max(),
            max_elapsed_time: None, // Never give up, the service keeps serving stale data
            ..Default::default()
        });

        Self {
            lister,
            builder,
            cache,
            interval: config.interval(),
            timeout: config.timeout(),
            backoff,
        }
    }

    /// Run until `cancel` fires. The first refresh starts immediately.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            source = %self.lister.source(),
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            backoff = self.backoff.is_some(),
            "Refresh scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut backoff = self.backoff.clone();
        if let Some(backoff) = backoff.as_mut() {
            backoff.reset();
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle(&cancel).await {
                RefreshOutcome::Published { .. } => {
                    if let Some(backoff) = backoff.as_mut() {
                        backoff.reset();
                    }
                }
                RefreshOutcome::Failed { consecutive_failures } if consecutive_failures > 1 => {
                    if let Some(delay) = backoff.as_mut().and_then(|b| b.next_backoff()) {
                        warn!(
                            delay_ms = delay.as_millis() as u64,
                            consecutive_failures,
                            "Delaying next refresh"
                        );

                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }

                        // Next attempt comes a full interval after the delay
                        ticker.reset();
                    }
                }
                RefreshOutcome::Failed { .. } | RefreshOutcome::Skipped => {}
                RefreshOutcome::Cancelled => break,
            }
        }

        info!("Refresh scheduler stopped");
    }

    /// Run a single refresh cycle now
    pub async fn refresh_once(&self) -> RefreshOutcome {
        self.run_cycle(&CancellationToken::new()).await
    }

    #[instrument(skip_all)]
    async fn run_cycle(&self, cancel: &CancellationToken) -> RefreshOutcome {
        let Some(_guard) = self.cache.try_begin_refresh() else {
            debug!("Refresh already in progress, skipping tick");
            metrics::counter!("feed.refresh.skipped").increment(1);
            return RefreshOutcome::Skipped;
        };

        let started = Instant::now();
        let build = self.builder.build(list_all(self.lister.as_ref()));

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Refresh cancelled, keeping published snapshot");
                return RefreshOutcome::Cancelled;
            }
            result = tokio::time::timeout(self.timeout, build) => {
                result.unwrap_or_else(|_| Err(RefreshError::from(ListingError::TimedOut(self.timeout))))
            }
        };

        let elapsed = started.elapsed();
        metrics::histogram!("feed.refresh.duration_seconds").record(elapsed.as_secs_f64());

        match result {
            Ok(snapshot) => {
                let items = snapshot.len();
                let generation = self.cache.replace(snapshot);

                metrics::counter!("feed.refresh.succeeded").increment(1);
                metrics::gauge!("feed.snapshot.items").set(items as f64);

                info!(
                    generation,
                    items,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Published snapshot"
                );

                RefreshOutcome::Published { generation, items }
            }
            Err(e) => {
                let consecutive_failures = self.cache.record_failure(&e);
                metrics::counter!("feed.refresh.failed").increment(1);

                error!(
                    error = %e,
                    consecutive_failures,
                    "Refresh failed, serving previous snapshot"
                );

                RefreshOutcome::Failed { consecutive_failures }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lister::{ListingPage, MockObjectLister, ObjectRecord};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, hour, 0, 0).unwrap()
    }

    fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new(".mp4", "https://example.com/{key}")
    }

    fn refresh_config(backoff_enabled: bool) -> RefreshConfig {
        RefreshConfig {
            interval_secs: 10,
            timeout_secs: 30,
            backoff_enabled,
            backoff_initial_ms: 30_000,
            backoff_max_ms: 30_000,
        }
    }

    fn scheduler(lister: impl ObjectLister + 'static, cache: Arc<SnapshotCache>) -> RefreshScheduler {
        RefreshScheduler::new(Arc::new(lister), builder(), cache, &refresh_config(false))
    }

    fn three_videos() -> ListingPage {
        ListingPage {
            records: vec![
                ObjectRecord::new("a.mp4", at(8)),
                ObjectRecord::new("b.mp4", at(9)),
                ObjectRecord::new("c.mp4", at(10)),
            ],
            next_token: None,
        }
    }

    /// Counts page requests, optionally failing every one
    struct CountingLister {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ObjectLister for CountingLister {
        async fn list_page(&self, _token: Option<String>) -> Result<ListingPage, ListingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ListingError::Request("503 Service Unavailable".to_string()));
            }
            Ok(ListingPage {
                records: vec![ObjectRecord::new("cam.mp4", Utc::now())],
                next_token: None,
            })
        }

        fn source(&self) -> String {
            "counting".to_string()
        }
    }

    /// Never answers
    struct HangingLister;

    #[async_trait]
    impl ObjectLister for HangingLister {
        async fn list_page(&self, _token: Option<String>) -> Result<ListingPage, ListingError> {
            std::future::pending().await
        }

        fn source(&self) -> String {
            "hanging".to_string()
        }
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_previous_snapshot() {
        let mut lister = MockObjectLister::new();
        let mut calls = 0;
        lister.expect_list_page().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(three_videos())
            } else {
                Err(ListingError::Request("connection refused".to_string()))
            }
        });

        let cache = Arc::new(SnapshotCache::new());
        let scheduler = scheduler(lister, cache.clone());

        assert_eq!(
            scheduler.refresh_once().await,
            RefreshOutcome::Published { generation: 1, items: 3 }
        );
        assert_eq!(
            scheduler.refresh_once().await,
            RefreshOutcome::Failed { consecutive_failures: 1 }
        );

        let status = cache.status();
        assert!(status.last_error.unwrap().contains("connection refused"));
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.item_count, 3);

        let snapshot = cache.read();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.items()[0].location(), "https://example.com/c.mp4");
    }

    #[tokio::test]
    async fn test_partial_listing_is_not_published() {
        let mut lister = MockObjectLister::new();
        lister
            .expect_list_page()
            .with(eq(None::<String>))
            .returning(|_| {
                Ok(ListingPage {
                    records: vec![ObjectRecord::new("a.mp4", at(10))],
                    next_token: Some("2".to_string()),
                })
            });
        lister
            .expect_list_page()
            .with(eq(Some("2".to_string())))
            .returning(|_| Err(ListingError::Request("connection reset".to_string())));

        let cache = Arc::new(SnapshotCache::new());
        let scheduler = scheduler(lister, cache.clone());

        assert_eq!(
            scheduler.refresh_once().await,
            RefreshOutcome::Failed { consecutive_failures: 1 }
        );
        assert!(cache.read().is_empty());
        assert_eq!(cache.read().generation(), 0);
        assert!(cache.status().last_error.is_some());
    }

    #[tokio::test]
    async fn test_two_pages_publish_filtered_snapshot() {
        let mut lister = MockObjectLister::new();
        lister
            .expect_list_page()
            .with(eq(None::<String>))
            .returning(|_| {
                Ok(ListingPage {
                    records: vec![ObjectRecord::new("a.mp4", at(10))],
                    next_token: Some("2".to_string()),
                })
            });
        lister
            .expect_list_page()
            .with(eq(Some("2".to_string())))
            .returning(|_| {
                Ok(ListingPage {
                    records: vec![
                        ObjectRecord::new("b.mp4", at(11)),
                        ObjectRecord::new("c.txt", at(12)),
                    ],
                    next_token: None,
                })
            });

        let cache = Arc::new(SnapshotCache::new());
        let scheduler = scheduler(lister, cache.clone());

        assert_eq!(
            scheduler.refresh_once().await,
            RefreshOutcome::Published { generation: 1, items: 2 }
        );

        let snapshot = cache.read();
        let locations: Vec<&str> = snapshot.items().iter().map(|i| i.location()).collect();
        assert_eq!(
            locations,
            vec!["https://example.com/b.mp4", "https://example.com/a.mp4"]
        );
    }

    #[tokio::test]
    async fn test_overlapping_refresh_is_skipped() {
        let lister = MockObjectLister::new();
        let cache = Arc::new(SnapshotCache::new());
        let scheduler = scheduler(lister, cache.clone());

        let _running = cache.try_begin_refresh().unwrap();

        // No list_page expectation: the mock panics if it is called
        assert_eq!(scheduler.refresh_once().await, RefreshOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_listing_times_out() {
        let cache = Arc::new(SnapshotCache::new());
        let scheduler = scheduler(HangingLister, cache.clone());

        assert_eq!(
            scheduler.refresh_once().await,
            RefreshOutcome::Failed { consecutive_failures: 1 }
        );

        let status = cache.status();
        assert!(status.last_error.unwrap().contains("timed out"));
        assert!(!status.refreshing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_hung_listing() {
        let cache = Arc::new(SnapshotCache::new());
        let scheduler = Arc::new(scheduler(HangingLister, cache.clone()));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            async move { scheduler.run_cycle(&cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), RefreshOutcome::Cancelled);
        assert_eq!(cache.read().generation(), 0);
        assert!(cache.status().last_error.is_none());
        assert!(!cache.is_refreshing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_refreshes_on_interval_until_cancelled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(SnapshotCache::new());
        let lister = CountingLister {
            calls: calls.clone(),
            fail: false,
        };
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(scheduler(lister, cache.clone()).run(cancel.clone()));

        // Ticks at 0s, 10s and 20s
        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.read().generation(), 3);
        assert_eq!(cache.read().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_back_off() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(SnapshotCache::new());
        let lister = CountingLister {
            calls: calls.clone(),
            fail: true,
        };
        let cancel = CancellationToken::new();

        let scheduler =
            RefreshScheduler::new(Arc::new(lister), builder(), cache.clone(), &refresh_config(true));
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        // The first failure is retried on the next tick at 10s
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The second one waits a 30s backoff (randomized to at least 15s)
        // plus a full interval, so nothing runs before 35s. Without backoff
        // there would have been attempts at 20s and 30s.
        tokio::time::sleep(Duration::from_secs(17)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(cache.status().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_retry_on_interval_without_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(SnapshotCache::new());
        let lister = CountingLister {
            calls: calls.clone(),
            fail: true,
        };
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(scheduler(lister, cache.clone()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(15)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.status().consecutive_failures, 2);
        assert!(cache.read().is_empty());
    }
}
