//! Operation Manager
//!
//! Drives domain operations through the pending operation lifecycle and
//! owns the recovery paths.
//!
//! ```text
//!   run(op)
//!     ├─ admission: in-flight limit
//!     ├─ build      (retried with backoff on store lock contention)
//!     ├─ status ─▶ InProgress
//!     ├─ exec ─ ok ──▶ finalize
//!     │    ├─ Retry ──▶ rollback ─▶ build ─▶ exec   (up to max_retries)
//!     │    └─ error ──▶ rollback ─ ok ──▶ original error
//!     │                    └─ failed ──▶ Stale, rollback error
//!   clean_pending()
//!     ├─ unsettled marks ─▶ Stale/Failed
//!     └─ every Stale/Failed record ─▶ load ─▶ clean ─▶ clean_done
//! ```
//!
//! A status write that fails after its retries is kept in memory and
//! replayed at the start of the next clean pass, so a record never stays
//! `New` or `InProgress` once its run has ended.

use crate::error::{Error, Result};
use crate::executor::commands::StorageCommands;
use crate::metrics::{Metrics, Outcome};
use crate::model::{
    OperationKind, PendingOperationEntry, PendingOperationInfo, PendingStatus,
};
use crate::operations::{consistency_check, load_operation, Operation, OperationContext};
use crate::store::TxRead;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Tracking
// =============================================================================

#[derive(Debug, Clone)]
struct Inflight {
    kind: OperationKind,
    started_at: DateTime<Utc>,
}

/// Summary of one clean pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub cleaned: usize,
    pub failed: usize,
    /// Children left to their parent, or records already being worked on
    pub skipped: usize,
}

/// A pending record with the problems found in its references
#[derive(Debug, Clone, Serialize)]
pub struct PendingReport {
    pub operation: PendingOperationInfo,
    pub problems: Vec<String>,
}

fn unwrap_retry(err: Error) -> Error {
    match err {
        Error::Retry(inner) => *inner,
        other => other,
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct OperationManager {
    ctx: OperationContext,
    commands: StorageCommands,
    metrics: Metrics,
    inflight: DashMap<String, Inflight>,
    /// Admission permits, one per operation allowed in flight
    admission: Semaphore,
    /// Terminal statuses that could not be written yet
    unsettled: DashMap<String, PendingStatus>,
}

impl OperationManager {
    pub fn new(ctx: OperationContext, commands: StorageCommands, metrics: Metrics) -> Arc<Self> {
        let admission = Semaphore::new(ctx.config.max_inflight);
        Arc::new(Self {
            ctx,
            commands,
            metrics,
            inflight: DashMap::new(),
            admission,
            unsettled: DashMap::new(),
        })
    }

    pub fn context(&self) -> &OperationContext {
        &self.ctx
    }

    pub fn commands(&self) -> &StorageCommands {
        &self.commands
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Records whose terminal status is waiting for the next clean pass
    pub fn unsettled_count(&self) -> usize {
        self.unsettled.len()
    }

    /// Run an operation to completion.
    ///
    /// On failure the store is back where it started, or the record is left
    /// `Stale` and the error is [`Error::Rollback`].
    #[instrument(skip(self, op), fields(op = %op.id(), kind = %op.kind()))]
    pub async fn run(&self, op: &mut dyn Operation) -> Result<()> {
        let Ok(_permit) = self.admission.try_acquire() else {
            warn!(limit = self.ctx.config.max_inflight, "too many operations in flight");
            self.metrics
                .operation_finished(op.kind(), Outcome::Rejected);
            return Err(Error::TooManyOperations);
        };

        if let Err(e) = self.build(op).await {
            debug!(error = %e, "build rejected");
            self.metrics
                .operation_finished(op.kind(), Outcome::Rejected);
            return Err(e);
        }

        let id = op.id().to_string();
        self.inflight.insert(
            id.clone(),
            Inflight {
                kind: op.kind(),
                started_at: Utc::now(),
            },
        );
        self.metrics.set_inflight(self.inflight.len());
        info!("{} started", op.label());

        let result = self.execute(op).await;

        if let Some((_, tracked)) = self.inflight.remove(&id) {
            let elapsed = (Utc::now() - tracked.started_at).num_milliseconds();
            debug!(elapsed_ms = elapsed, kind = %tracked.kind, "operation left flight");
        }
        self.metrics.set_inflight(self.inflight.len());
        self.refresh_pending_gauge();

        match &result {
            Ok(()) => {
                info!("{} finished", op.label());
                self.metrics.operation_finished(op.kind(), Outcome::Success);
            }
            Err(Error::Rollback { .. }) => {
                self.metrics.operation_finished(op.kind(), Outcome::Stale);
            }
            Err(e) => {
                warn!(error = %e, "{} failed", op.label());
                self.metrics
                    .operation_finished(op.kind(), Outcome::RolledBack);
            }
        }
        result
    }

    /// Build, retrying on store lock contention with doubling backoff
    async fn build(&self, op: &mut dyn Operation) -> Result<()> {
        let retries = self.ctx.config.build_retries;
        let mut backoff = self.ctx.config.build_retry_backoff();
        let mut attempt = 0;
        loop {
            match op.build() {
                Ok(()) => return Ok(()),
                Err(Error::TxConflict(waited)) if attempt < retries => {
                    attempt += 1;
                    debug!(attempt, ?waited, "store busy, retrying build");
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(Error::TxConflict(_)) => {
                    warn!(attempts = attempt + 1, "store busy, giving up on build");
                    return Err(Error::TooManyOperations);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute(&self, op: &mut dyn Operation) -> Result<()> {
        if let Err(e) = self.set_status(op.id(), PendingStatus::InProgress) {
            error!(error = %e, "{} could not be started, rolling back", op.label());
            return Err(self.rollback(op, e).await);
        }
        match op.exec(&self.commands).await {
            Ok(()) => self.finalize(op).await,
            Err(Error::Retry(err)) if op.max_retries() > 0 => self.retry(op, *err).await,
            Err(err) => {
                error!(error = %err, "{} exec failed, rolling back", op.label());
                Err(self.rollback(op, unwrap_retry(err)).await)
            }
        }
    }

    /// Roll back, rebuild and re-run while exec keeps asking for a retry
    async fn retry(&self, op: &mut dyn Operation, first: Error) -> Result<()> {
        let mut last = first;
        for attempt in 1..=op.max_retries() {
            warn!(attempt, error = %last, "{} asked for a retry", op.label());
            self.metrics.operation_retried(op.kind());

            if let Err(rollback) = op.rollback(&self.commands).await {
                return Err(self.left_stale(op, last, rollback).await);
            }
            op.build()?;
            if let Err(e) = self.set_status(op.id(), PendingStatus::InProgress) {
                last = e;
                break;
            }

            match op.exec(&self.commands).await {
                Ok(()) => return self.finalize(op).await,
                Err(Error::Retry(err)) => last = *err,
                Err(err) => {
                    last = err;
                    break;
                }
            }
        }
        error!(error = %last, "{} failed after retries, rolling back", op.label());
        Err(self.rollback(op, last).await)
    }

    async fn finalize(&self, op: &mut dyn Operation) -> Result<()> {
        match op.finalize() {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "{} finalize failed", op.label());
                self.mark_terminal(op.id(), PendingStatus::Failed).await;
                Err(e)
            }
        }
    }

    /// Undo a failed exec; the returned error is what the caller sees
    async fn rollback(&self, op: &mut dyn Operation, original: Error) -> Error {
        match op.rollback(&self.commands).await {
            Ok(()) => {
                info!("{} rolled back", op.label());
                original
            }
            Err(rollback) => self.left_stale(op, original, rollback).await,
        }
    }

    async fn left_stale(&self, op: &mut dyn Operation, original: Error, rollback: Error) -> Error {
        error!(
            error = %original,
            rollback_error = %rollback,
            "{} rollback failed, leaving operation stale",
            op.label()
        );
        self.mark_terminal(op.id(), PendingStatus::Stale).await;
        Error::Rollback {
            original: Box::new(original),
            rollback: Box::new(rollback),
        }
    }

    /// Update a record's status; a record that does not exist is ignored
    fn set_status(&self, id: &str, status: PendingStatus) -> Result<()> {
        let result = self.ctx.store.update(|tx| {
            tx.get_mut::<PendingOperationEntry>(id)?.status = status;
            Ok(())
        });
        match result {
            Err(Error::NotFound { .. }) => Ok(()),
            other => other,
        }
    }

    /// Write a Stale or Failed status, retrying with backoff on store
    /// contention. A write that still fails is kept for the next clean pass.
    async fn mark_terminal(&self, id: &str, status: PendingStatus) {
        let retries = self.ctx.config.build_retries;
        let mut backoff = self.ctx.config.build_retry_backoff();
        let mut attempt = 0;
        loop {
            match self.set_status(id, status) {
                Ok(()) => {
                    self.unsettled.remove(id);
                    return;
                }
                Err(Error::TxConflict(_)) if attempt < retries => {
                    attempt += 1;
                    debug!(op = %id, attempt, %status, "store busy, retrying status write");
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(
                        op = %id,
                        %status,
                        error = %e,
                        "unable to write status, deferring to the cleaner"
                    );
                    self.unsettled.insert(id.to_string(), status);
                    return;
                }
            }
        }
    }

    /// Replay deferred status writes; returns how many are still deferred
    fn settle_unsettled(&self) -> usize {
        let deferred: Vec<(String, PendingStatus)> = self
            .unsettled
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (id, status) in deferred {
            if self.inflight.contains_key(&id) {
                continue;
            }
            match self.set_status(&id, status) {
                Ok(()) => {
                    info!(op = %id, %status, "deferred status written");
                    self.unsettled.remove(&id);
                }
                Err(e) => warn!(op = %id, %status, error = %e, "deferred status still not written"),
            }
        }
        self.unsettled.len()
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Mark every record not owned by this process as stale. Called once at
    /// startup, before any operation runs.
    pub fn mark_pending_stale(&self) -> Result<usize> {
        let marked = self.ctx.store.update(|tx| {
            let mut marked = 0;
            for id in tx.keys::<PendingOperationEntry>() {
                let entry = tx.get_mut::<PendingOperationEntry>(&id)?;
                if matches!(entry.status, PendingStatus::New | PendingStatus::InProgress) {
                    entry.status = PendingStatus::Stale;
                    marked += 1;
                }
            }
            Ok(marked)
        })?;
        if marked > 0 {
            warn!(marked, "pending operations from a previous run marked stale");
        }
        self.refresh_pending_gauge();
        Ok(marked)
    }

    /// Startup gate: refuse to serve with leftover records unless configured
    /// to ignore them
    pub fn check_stale(&self) -> Result<usize> {
        self.mark_pending_stale()?;
        let stale = self
            .pending_operations()?
            .iter()
            .filter(|op| op.status.is_cleanable())
            .count();
        if stale > 0 && !self.ctx.config.ignore_stale_operations {
            return Err(Error::InvalidRequest(format!(
                "{} stale pending operations found; run cleanup or set ignore_stale_operations",
                stale
            )));
        }
        Ok(stale)
    }

    /// Reconcile every Stale or Failed record.
    ///
    /// Children whose parent record exists are left to the parent. Errors are
    /// logged and the pass moves on.
    #[instrument(skip(self))]
    pub async fn clean_pending(&self) -> Result<CleanReport> {
        let deferred = self.settle_unsettled();
        if deferred > 0 {
            warn!(deferred, "some operations are still waiting for their status");
        }
        let candidates: Vec<PendingOperationEntry> = self.ctx.store.view(|tx| {
            Ok(tx
                .list::<PendingOperationEntry>()
                .into_iter()
                .filter(|e| e.status.is_cleanable())
                .filter(|e| {
                    e.parent()
                        .map_or(true, |p| !tx.contains::<PendingOperationEntry>(p))
                })
                .collect())
        })?;

        let mut report = CleanReport::default();
        for entry in candidates {
            let id = entry.id.clone();
            if self.inflight.contains_key(&id) {
                report.skipped += 1;
                continue;
            }
            let kind = entry.kind;
            let mut op = match load_operation(self.ctx.clone(), entry) {
                Ok(op) => op,
                Err(e) => {
                    warn!(op = %id, error = %e, "unable to load pending operation, skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            self.inflight.insert(
                id.clone(),
                Inflight {
                    kind,
                    started_at: Utc::now(),
                },
            );
            let result = match op.clean(&self.commands).await {
                Ok(()) => op.clean_done(),
                Err(e) => Err(e),
            };
            self.inflight.remove(&id);

            match result {
                Ok(()) => {
                    info!(op = %id, kind = %kind, "pending operation cleaned");
                    report.cleaned += 1;
                }
                Err(e) => {
                    error!(op = %id, kind = %kind, error = %e, "unable to clean pending operation");
                    report.failed += 1;
                }
            }
        }

        self.metrics.cleaner_pass(report.cleaned, report.failed);
        self.refresh_pending_gauge();
        Ok(report)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn pending_operations(&self) -> Result<Vec<PendingOperationInfo>> {
        self.ctx.store.view(|tx| {
            Ok(tx
                .list::<PendingOperationEntry>()
                .iter()
                .map(PendingOperationEntry::info)
                .collect())
        })
    }

    pub fn pending_report(&self) -> Result<Vec<PendingReport>> {
        self.ctx.store.view(|tx| {
            Ok(tx
                .list::<PendingOperationEntry>()
                .iter()
                .map(|entry| PendingReport {
                    operation: entry.info(),
                    problems: consistency_check(tx, entry),
                })
                .collect())
        })
    }

    pub fn status_counts(&self) -> Result<Vec<(PendingStatus, usize)>> {
        let ops = self.pending_operations()?;
        Ok([
            PendingStatus::New,
            PendingStatus::InProgress,
            PendingStatus::Stale,
            PendingStatus::Failed,
        ]
        .into_iter()
        .map(|status| (status, ops.iter().filter(|o| o.status == status).count()))
        .collect())
    }

    fn refresh_pending_gauge(&self) {
        match self.status_counts() {
            Ok(counts) => self.metrics.set_pending(&counts),
            Err(e) => debug!(error = %e, "unable to count pending operations"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, OperationsConfig};
    use crate::executor::FakeCluster;
    use crate::model::ChangeType;
    use crate::store::Store;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Operation whose steps are scripted by the test
    struct Scripted {
        entry: PendingOperationEntry,
        store: Store,
        exec_errors: Vec<Error>,
        rollback_fails: bool,
        finalize_fails: bool,
        retries: usize,
        builds: usize,
        exec_delay: Option<Duration>,
        hold_after_build: Option<Duration>,
        hold_after_finalize: Option<Duration>,
        holder: Option<std::thread::JoinHandle<()>>,
    }

    impl Scripted {
        fn new(store: &Store) -> Self {
            Self {
                entry: PendingOperationEntry::new(OperationKind::VolumeCreate),
                store: store.clone(),
                exec_errors: Vec::new(),
                rollback_fails: false,
                finalize_fails: false,
                retries: 0,
                builds: 0,
                exec_delay: None,
                hold_after_build: None,
                hold_after_finalize: None,
                holder: None,
            }
        }

        fn release(&mut self) {
            if let Some(holder) = self.holder.take() {
                holder.join().unwrap();
            }
        }

        fn delete(&self) -> Result<()> {
            self.store
                .update(|tx| tx.delete::<PendingOperationEntry>(&self.entry.id).map(|_| ()))
        }
    }

    #[async_trait]
    impl Operation for Scripted {
        fn id(&self) -> &str {
            &self.entry.id
        }
        fn label(&self) -> &'static str {
            "Scripted"
        }
        fn kind(&self) -> OperationKind {
            self.entry.kind
        }
        fn max_retries(&self) -> usize {
            self.retries
        }
        fn build(&mut self) -> Result<()> {
            self.builds += 1;
            let entry = self.entry.clone();
            self.store.update(|tx| tx.insert(entry))?;
            if let Some(hold) = self.hold_after_build.take() {
                self.holder = Some(hold_store(&self.store, hold));
            }
            Ok(())
        }
        async fn exec(&mut self, _: &StorageCommands) -> Result<()> {
            if let Some(delay) = self.exec_delay {
                tokio::time::sleep(delay).await;
            }
            match self.exec_errors.pop() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        fn finalize(&mut self) -> Result<()> {
            if let Some(hold) = self.hold_after_finalize.take() {
                self.holder = Some(hold_store(&self.store, hold));
            }
            if self.finalize_fails {
                return Err(Error::Internal("finalize refused".into()));
            }
            self.delete()
        }
        async fn rollback(&mut self, _: &StorageCommands) -> Result<()> {
            if self.rollback_fails {
                return Err(Error::command("h1", "lvremove", "device busy"));
            }
            self.delete()
        }
        async fn clean(&mut self, _: &StorageCommands) -> Result<()> {
            Ok(())
        }
        fn clean_done(&mut self) -> Result<()> {
            self.delete()
        }
    }

    /// Hold the store write lock from another thread for `hold`
    fn hold_store(store: &Store, hold: Duration) -> std::thread::JoinHandle<()> {
        let store = store.clone();
        let (locked, wait) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _ = store.update(|_| {
                let _ = locked.send(());
                std::thread::sleep(hold);
                Ok(())
            });
        });
        let _ = wait.recv();
        holder
    }

    fn contended() -> OperationsConfig {
        OperationsConfig {
            build_retries: 2,
            build_retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn manager(store: &Store, config: OperationsConfig) -> Arc<OperationManager> {
        let ctx = OperationContext::new(store.clone(), &config);
        let commands = StorageCommands::new(Arc::new(FakeCluster::new()), ExecutorConfig::default());
        OperationManager::new(ctx, commands, Metrics::unregistered().unwrap())
    }

    fn store() -> Store {
        Store::in_memory(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_success_leaves_no_record() {
        let store = store();
        let mgr = manager(&store, OperationsConfig::default());
        let mut op = Scripted::new(&store);
        mgr.run(&mut op).await.unwrap();
        assert!(store.snapshot().pending_operations.is_empty());
        assert_eq!(mgr.inflight_count(), 0);
        assert_eq!(
            mgr.metrics()
                .operations_total(OperationKind::VolumeCreate, Outcome::Success),
            1
        );
    }

    #[tokio::test]
    async fn test_exec_failure_returns_original_error() {
        let store = store();
        let mgr = manager(&store, OperationsConfig::default());
        let mut op = Scripted::new(&store);
        op.exec_errors.push(Error::command("h1", "mkfs.xfs", "boom"));
        let err = mgr.run(&mut op).await.unwrap_err();
        assert_matches!(err, Error::Command { command, .. } if command == "mkfs.xfs");
        assert!(store.snapshot().pending_operations.is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_leaves_stale() {
        let store = store();
        let mgr = manager(&store, OperationsConfig::default());
        let mut op = Scripted::new(&store);
        op.exec_errors.push(Error::command("h1", "mkfs.xfs", "boom"));
        op.rollback_fails = true;
        let err = mgr.run(&mut op).await.unwrap_err();
        assert_matches!(err, Error::Rollback { .. });
        assert_eq!(
            store.snapshot().pending_operations[op.id()].status,
            PendingStatus::Stale
        );

        // no volume behind the record, so the cleaner cannot load it
        let report = mgr.clean_pending().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(store.snapshot().pending_operations.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let store = store();
        let mgr = manager(&store, OperationsConfig::default());
        let mut op = Scripted::new(&store);
        op.retries = 2;
        op.exec_errors
            .push(Error::Retry(Box::new(Error::command("h1", "lvcreate", "no"))));
        mgr.run(&mut op).await.unwrap();
        assert_eq!(op.builds, 2);
        assert!(store.snapshot().pending_operations.is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_inner_error() {
        let store = store();
        let mgr = manager(&store, OperationsConfig::default());
        let mut op = Scripted::new(&store);
        op.retries = 1;
        for _ in 0..2 {
            op.exec_errors
                .push(Error::Retry(Box::new(Error::command("h1", "lvcreate", "no"))));
        }
        let err = mgr.run(&mut op).await.unwrap_err();
        assert_matches!(err, Error::Command { .. });
        assert_eq!(op.builds, 2);
        assert!(store.snapshot().pending_operations.is_empty());
    }

    #[tokio::test]
    async fn test_retry_without_budget_is_plain_failure() {
        let store = store();
        let mgr = manager(&store, OperationsConfig::default());
        let mut op = Scripted::new(&store);
        op.exec_errors
            .push(Error::Retry(Box::new(Error::command("h1", "lvcreate", "no"))));
        let err = mgr.run(&mut op).await.unwrap_err();
        assert_matches!(err, Error::Command { .. });
        assert_eq!(op.builds, 1);
    }

    #[tokio::test]
    async fn test_inflight_limit() {
        let store = store();
        let config = OperationsConfig {
            max_inflight: 1,
            ..Default::default()
        };
        let mgr = manager(&store, config);
        let _busy = mgr.admission.try_acquire().unwrap();
        let mut op = Scripted::new(&store);
        assert_matches!(mgr.run(&mut op).await, Err(Error::TooManyOperations));
        assert!(store.snapshot().pending_operations.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_inflight_limit_holds_under_concurrency() {
        let store = Store::in_memory(Duration::from_secs(1));
        let config = OperationsConfig {
            max_inflight: 2,
            ..Default::default()
        };
        let mgr = manager(&store, config);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                let mut op = Scripted::new(&store);
                op.exec_delay = Some(Duration::from_millis(300));
                tokio::spawn(async move { mgr.run(&mut op).await })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;

        let ok = results.iter().filter(|r| matches!(r, Ok(Ok(())))).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(Error::TooManyOperations))))
            .count();
        assert!((1..=2).contains(&ok), "{} operations admitted", ok);
        assert_eq!(ok + busy, 8);
        assert!(store.snapshot().pending_operations.is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back_and_settles_later() {
        let store = store();
        let mgr = manager(&store, contended());
        let mut op = Scripted::new(&store);
        op.hold_after_build = Some(Duration::from_secs(1));

        let err = mgr.run(&mut op).await.unwrap_err();
        assert_matches!(err, Error::Rollback { .. });
        assert_eq!(op.builds, 1);
        assert_eq!(mgr.unsettled_count(), 1);
        assert_eq!(
            store.snapshot().pending_operations[op.id()].status,
            PendingStatus::New
        );

        op.release();
        let report = mgr.clean_pending().await.unwrap();
        assert_eq!(mgr.unsettled_count(), 0);
        assert_eq!(
            store.snapshot().pending_operations[op.id()].status,
            PendingStatus::Stale
        );
        // the record is cleanable now, but nothing real sits behind it
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_finalize_failure_marks_failed() {
        let store = store();
        let mgr = manager(&store, OperationsConfig::default());
        let mut op = Scripted::new(&store);
        op.finalize_fails = true;

        assert_matches!(mgr.run(&mut op).await, Err(Error::Internal(_)));
        assert_eq!(mgr.unsettled_count(), 0);
        assert_eq!(
            store.snapshot().pending_operations[op.id()].status,
            PendingStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_finalize_failure_on_busy_store_settles_later() {
        let store = store();
        let mgr = manager(&store, contended());
        let mut op = Scripted::new(&store);
        op.finalize_fails = true;
        op.hold_after_finalize = Some(Duration::from_secs(1));

        assert_matches!(mgr.run(&mut op).await, Err(Error::Internal(_)));
        assert_eq!(mgr.unsettled_count(), 1);
        assert_eq!(
            store.snapshot().pending_operations[op.id()].status,
            PendingStatus::InProgress
        );

        op.release();
        mgr.clean_pending().await.unwrap();
        assert_eq!(mgr.unsettled_count(), 0);
        assert_eq!(
            store.snapshot().pending_operations[op.id()].status,
            PendingStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_build_lock_contention_becomes_busy() {
        let store = store();
        let config = OperationsConfig {
            build_retries: 2,
            build_retry_backoff_ms: 1,
            ..Default::default()
        };
        let mgr = manager(&store, config);
        let mut op = Scripted::new(&store);

        // hold the write lock for the whole run
        let held = store.clone();
        let mgr2 = mgr.clone();
        let result = tokio::task::spawn_blocking(move || {
            held.update(|_| {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .map_err(Error::from)?;
                Ok(rt.block_on(mgr2.run(&mut op)))
            })
        })
        .await
        .unwrap()
        .unwrap();
        assert_matches!(result, Err(Error::TooManyOperations));
    }

    #[test]
    fn test_mark_pending_stale_and_gate() {
        let store = store();
        let mgr = manager(&store, OperationsConfig::default());
        let mut entry = PendingOperationEntry::new(OperationKind::VolumeDelete);
        entry.status = PendingStatus::InProgress;
        store.update(|tx| tx.insert(entry)).unwrap();

        assert_matches!(mgr.check_stale(), Err(Error::InvalidRequest(_)));
        let counts = mgr.status_counts().unwrap();
        assert!(counts.contains(&(PendingStatus::Stale, 1)));
        assert_eq!(mgr.mark_pending_stale().unwrap(), 0);

        let lenient = manager(
            &store,
            OperationsConfig {
                ignore_stale_operations: true,
                ..Default::default()
            },
        );
        assert_eq!(lenient.check_stale().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clean_skips_children_of_live_parent() {
        let store = store();
        let mgr = manager(&store, OperationsConfig::default());
        let mut parent = PendingOperationEntry::new(OperationKind::DeviceRemove);
        parent.status = PendingStatus::InProgress;
        let mut child = PendingOperationEntry::new(OperationKind::BrickEvict);
        child.status = PendingStatus::Stale;
        child.record(ChangeType::DeleteBrick, "b1");
        child.record(ChangeType::ParentOperation, &parent.id);
        store
            .update(|tx| {
                tx.insert(parent)?;
                tx.insert(child)
            })
            .unwrap();

        let report = mgr.clean_pending().await.unwrap();
        assert_eq!(report, CleanReport::default());
        assert_eq!(store.snapshot().pending_operations.len(), 2);
    }
}
