//! Prometheus metrics for the operation engine
//!
//! The binary registers into the default registry so the `/metrics`
//! endpoint can use `prometheus::gather()`. Tests register into a private
//! [`Registry`] each.

use crate::error::{Error, Result};
use crate::model::{OperationKind, PendingStatus};
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Outcome label of a finished operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Failed, store restored by rollback
    RolledBack,
    /// Failed and rollback failed too; record left stale
    Stale,
    /// Build rejected the request
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RolledBack => "rolled_back",
            Outcome::Stale => "stale",
            Outcome::Rejected => "rejected",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    operations: IntCounterVec,
    retries: IntCounterVec,
    inflight: IntGauge,
    pending: IntGaugeVec,
    cleaner_passes: IntCounter,
    cleaned: IntCounterVec,
}

fn prom(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl Metrics {
    /// Create the metrics and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let operations = IntCounterVec::new(
            Opts::new(
                "brickyard_operations_total",
                "Operations run to completion, by kind and outcome",
            ),
            &["kind", "outcome"],
        )
        .map_err(prom)?;
        let retries = IntCounterVec::new(
            Opts::new(
                "brickyard_operation_retries_total",
                "Rollback and rebuild cycles requested by exec",
            ),
            &["kind"],
        )
        .map_err(prom)?;
        let inflight = IntGauge::new(
            "brickyard_operations_inflight",
            "Operations currently between build and finalize",
        )
        .map_err(prom)?;
        let pending = IntGaugeVec::new(
            Opts::new(
                "brickyard_pending_operations",
                "Pending operation records in the store, by status",
            ),
            &["status"],
        )
        .map_err(prom)?;
        let cleaner_passes =
            IntCounter::new("brickyard_cleaner_passes_total", "Cleaner passes run")
                .map_err(prom)?;
        let cleaned = IntCounterVec::new(
            Opts::new(
                "brickyard_cleaned_operations_total",
                "Operations handled by the cleaner, by result",
            ),
            &["result"],
        )
        .map_err(prom)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(prom)?;
        registry.register(Box::new(retries.clone())).map_err(prom)?;
        registry.register(Box::new(inflight.clone())).map_err(prom)?;
        registry.register(Box::new(pending.clone())).map_err(prom)?;
        registry
            .register(Box::new(cleaner_passes.clone()))
            .map_err(prom)?;
        registry.register(Box::new(cleaned.clone())).map_err(prom)?;

        Ok(Self {
            operations,
            retries,
            inflight,
            pending,
            cleaner_passes,
            cleaned,
        })
    }

    /// Metrics in a throwaway registry
    pub fn unregistered() -> Result<Self> {
        Self::new(&Registry::new())
    }

    pub fn operation_finished(&self, kind: OperationKind, outcome: Outcome) {
        self.operations
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .inc();
    }

    pub fn operation_retried(&self, kind: OperationKind) {
        self.retries.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn set_inflight(&self, count: usize) {
        self.inflight.set(count as i64);
    }

    pub fn set_pending(&self, counts: &[(PendingStatus, usize)]) {
        for (status, count) in counts {
            self.pending
                .with_label_values(&[status.as_str()])
                .set(*count as i64);
        }
    }

    pub fn cleaner_pass(&self, cleaned: usize, failed: usize) {
        self.cleaner_passes.inc();
        self.cleaned
            .with_label_values(&["cleaned"])
            .inc_by(cleaned as u64);
        self.cleaned
            .with_label_values(&["failed"])
            .inc_by(failed as u64);
    }

    pub fn operations_total(&self, kind: OperationKind, outcome: Outcome) -> u64 {
        self.operations
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .get()
    }
}
