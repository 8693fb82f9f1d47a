//! Orchestrator façade.
//!
//! `JobService` is the single entry point the transport layer talks to. It
//! composes the store, the broadcaster, and the runner, and owns the shutdown
//! trigger. Every method is cheap; the long-running work happens in the
//! runner's worker slots.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use crate::broadcast::{LogBroadcaster, LogLine, LogSubscription};
use crate::job::{InvocationSpec, JobRecord, JobStatus, new_job_id};
use crate::package::{self, ExportFormat, PackageError};
use crate::runner::{CancelOutcome, EnqueueError, JobRunner};
use crate::store::{JobStore, ListOrder, StoreError};

/// Faults surfaced synchronously to callers. Faults of the asynchronous
/// execution itself (launch failure, process failure, orphaned on restart)
/// are never raised here; they land in the job's `error_detail`.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no such job: {0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotReady(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Internal(other.into()),
        }
    }
}

impl From<PackageError> for ServiceError {
    fn from(e: PackageError) -> Self {
        Self::Internal(e.into())
    }
}

/// Assembled result bundle, ready to hand to a download response.
pub struct ResultPackage {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStats {
    pub jobs: usize,
    pub worker_slots: usize,
    pub queue_capacity: usize,
}

pub struct JobService {
    store: Arc<JobStore>,
    broadcaster: Arc<LogBroadcaster>,
    runner: Arc<JobRunner>,
    stats: ServiceStats,
    shutdown_tx: watch::Sender<bool>,
}

impl JobService {
    pub fn new(
        store: Arc<JobStore>,
        broadcaster: Arc<LogBroadcaster>,
        runner: Arc<JobRunner>,
        worker_slots: usize,
        queue_capacity: usize,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            stats: ServiceStats {
                jobs: 0,
                worker_slots,
                queue_capacity,
            },
            store,
            broadcaster,
            runner,
            shutdown_tx,
        }
    }

    /// Accept a job: validate, persist a pending record, hand it to the
    /// runner. Returns the new record immediately; execution is asynchronous.
    /// If the runner refuses the job the pending record is rolled back, so a
    /// submitted job is always either executable or rejected.
    pub fn submit(&self, spec: InvocationSpec) -> Result<JobRecord, ServiceError> {
        spec.validate().map_err(ServiceError::InvalidInput)?;

        let mut id = new_job_id();
        while self.store.contains(&id) {
            id = new_job_id();
        }

        let record = JobRecord::new(id.clone(), &spec);
        self.store
            .create(record.clone())
            .map_err(|e| ServiceError::Internal(e.into()))?;
        tracing::info!(target: "ocrlet::job", job_id = %id, file = %record.source_file_name, "Job submitted");

        if let Err(e) = self.runner.enqueue(&id, spec) {
            if let Err(rollback) = self.store.delete(&id) {
                tracing::error!(job_id = %id, error = %rollback, "Failed to roll back rejected job");
            }
            self.broadcaster.remove(&id);
            return Err(match e {
                EnqueueError::QueueFull => {
                    ServiceError::Conflict("work queue is full, retry later".to_string())
                }
                EnqueueError::Closed => ServiceError::Internal(e.into()),
            });
        }

        Ok(record)
    }

    pub fn status(&self, id: &str) -> Result<JobRecord, ServiceError> {
        self.store
            .get(id)
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// History snapshot plus live subscription, gapless and duplicate-free.
    /// Valid for any known job, terminal ones included (history only).
    pub fn subscribe_logs(
        &self,
        id: &str,
    ) -> Result<(Vec<LogLine>, LogSubscription), ServiceError> {
        if !self.store.contains(id) {
            return Err(ServiceError::NotFound(id.to_string()));
        }
        Ok(self.broadcaster.subscribe(id))
    }

    /// Best-effort cancellation; returns the record as of the request. A
    /// running job transitions to `cancelled` asynchronously once its process
    /// is gone.
    pub fn cancel(&self, id: &str) -> Result<JobRecord, ServiceError> {
        let outcome = self.runner.cancel(id)?;
        if let CancelOutcome::AlreadyTerminal(status) = outcome {
            tracing::debug!(job_id = %id, %status, "Cancel ignored, job already terminal");
        }
        self.status(id)
    }

    pub fn list(&self, filter: Option<JobStatus>, order: ListOrder) -> Vec<JobRecord> {
        self.store.list(filter, order)
    }

    /// Remove a terminal job: its record, its result artifacts, and its log
    /// history. Non-terminal jobs must be cancelled first.
    pub fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let record = self.status(id)?;
        if !record.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "job is {}, cancel it before deleting",
                record.status
            )));
        }

        self.store.delete(id)?;
        self.broadcaster.remove(id);
        if let Some(dir) = record.result_location {
            if let Err(e) = remove_dir_if_present(&dir) {
                tracing::warn!(job_id = %id, error = %e, "Failed to remove result directory");
            }
        }
        tracing::info!(target: "ocrlet::job", job_id = %id, "Job deleted");
        Ok(())
    }

    /// ZIP of the job's result directory. Only available once the job is
    /// `finished`.
    pub fn fetch_result_package(
        &self,
        id: &str,
        format: ExportFormat,
    ) -> Result<ResultPackage, ServiceError> {
        let record = self.status(id)?;
        if record.status != JobStatus::Finished {
            return Err(ServiceError::NotReady(format!(
                "job is {}, results are only available once finished",
                record.status
            )));
        }
        let dir = record.result_location.ok_or_else(|| {
            ServiceError::Internal(anyhow::anyhow!("finished job has no result location"))
        })?;

        let bytes = package::bundle(&dir, format)?;
        Ok(ResultPackage {
            file_name: package::bundle_file_name(id),
            bytes,
        })
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            jobs: self.store.len(),
            ..self.stats.clone()
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

fn remove_dir_if_present(dir: &PathBuf) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
