//! Background Cleaner
//!
//! Periodically hands stale and failed pending operations to
//! [`OperationManager::clean_pending`]. Passes never overlap: the next tick
//! is only awaited once the current pass returns.

use crate::config::CleanerConfig;
use crate::error::Result;
use crate::manager::{CleanReport, OperationManager};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Cleaner {
    manager: Arc<OperationManager>,
    config: CleanerConfig,
    passes: AtomicU64,
}

impl Cleaner {
    pub fn new(manager: Arc<OperationManager>, config: CleanerConfig) -> Arc<Self> {
        Arc::new(Self {
            manager,
            config,
            passes: AtomicU64::new(0),
        })
    }

    /// Completed passes since start
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Run one pass now
    pub async fn pass(&self) -> Result<CleanReport> {
        let report = self.manager.clean_pending().await?;
        self.passes.fetch_add(1, Ordering::Relaxed);
        if report.cleaned + report.failed > 0 {
            info!(
                cleaned = report.cleaned,
                failed = report.failed,
                skipped = report.skipped,
                "cleaner pass done"
            );
        } else {
            debug!(skipped = report.skipped, "cleaner pass found nothing to do");
        }
        Ok(report)
    }

    /// Loop until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Cleaner disabled");
            return;
        }
        info!("Starting cleaner with {:?}", self.config);

        tokio::select! {
            _ = sleep(Duration::from_secs(self.config.start_delay_s)) => {}
            _ = cancel.cancelled() => return,
        }

        let mut tick = interval(Duration::from_secs(self.config.interval_s));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let jitter = self.jitter();
                    if !jitter.is_zero() {
                        tokio::select! {
                            _ = sleep(jitter) => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                    if let Err(e) = self.pass().await {
                        error!("Cleaner pass failed: {}", e);
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("Cleaner shutting down");
    }

    fn jitter(&self) -> Duration {
        if self.config.jitter_s == 0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(0..self.config.jitter_s * 1000);
        Duration::from_millis(ms)
    }
}
