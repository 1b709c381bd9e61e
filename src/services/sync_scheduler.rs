//! Periodic index rebuild
//!
//! Ticks on a fixed interval and calls the same `rebuild_now` path as the
//! manual trigger. A tick that lands on a running build is skipped by the
//! builder's single-flight guard.

use crate::services::index_builder::{BuildError, IndexBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub struct SyncScheduler {
    builder: Arc<IndexBuilder>,
    /// `None` disables scheduled builds
    interval: Option<Duration>,
    run_on_start: bool,
}

impl SyncScheduler {
    pub fn new(builder: Arc<IndexBuilder>, interval: Option<Duration>, run_on_start: bool) -> Self {
        let interval = interval.filter(|period| !period.is_zero());
        Self { builder, interval, run_on_start }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Some(period) = self.interval else {
            info!(run_on_start = self.run_on_start, "sync_scheduler_disabled");
            if self.run_on_start {
                self.tick().await;
            }
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            return;
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; swallow it unless a startup build is wanted
        if !self.run_on_start {
            ticker.tick().await;
        }
        info!(interval_secs = period.as_secs(), run_on_start = self.run_on_start, "sync_scheduler_started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("sync_scheduler_shutdown");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        match self.builder.rebuild_now().await {
            Ok(_) => {}
            Err(BuildError::InFlight) => debug!("sync_tick_skipped_in_flight"),
            // already logged and counted by the builder
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::Metrics;
    use crate::io::snapshot::SnapshotFiles;
    use crate::services::fakes::{FakeAggregator, FakeOrderSystem};
    use crate::services::index::fixtures::{parcel, shipment};
    use crate::services::index::IndexHandle;

    fn builder(dir: &std::path::Path, handle: Arc<IndexHandle>, metrics: Arc<Metrics>) -> Arc<IndexBuilder> {
        Arc::new(IndexBuilder::new(
            Arc::new(FakeOrderSystem::with(vec![shipment(1, "JJD0001")])),
            Arc::new(FakeAggregator::with(vec![parcel("JJD0001", "gls")])),
            handle,
            SnapshotFiles::new(dir),
            metrics,
            4,
        ))
    }

    #[tokio::test]
    async fn test_run_on_start_builds_then_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Arc::new(IndexHandle::empty());
        let metrics = Arc::new(Metrics::new());
        let builder = builder(dir.path(), handle.clone(), metrics.clone());
        let scheduler = SyncScheduler::new(builder, Some(Duration::from_secs(3600)), true);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(rx));
        while metrics.index_builds_ok() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!handle.current().is_blank());

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(metrics.index_builds_ok(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_run_on_start_waits_for_first_interval() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Arc::new(IndexHandle::empty());
        let metrics = Arc::new(Metrics::new());
        let builder = builder(dir.path(), handle.clone(), metrics.clone());
        let scheduler = SyncScheduler::new(builder, Some(Duration::from_secs(60)), false);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(metrics.index_builds_ok(), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        while metrics.index_builds_ok() == 0 {
            tokio::task::yield_now().await;
        }

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_runs_startup_build_only() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Arc::new(IndexHandle::empty());
        let metrics = Arc::new(Metrics::new());
        let builder = builder(dir.path(), handle.clone(), metrics.clone());
        let scheduler = SyncScheduler::new(builder, Some(Duration::ZERO), true);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(rx));
        while metrics.index_builds_ok() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.index_builds_ok(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
