//! Job Runner - owns the external inference process lifecycle.
//!
//! Flow:
//! 1. `enqueue` pushes the job onto a bounded queue
//! 2. A worker slot dequeues it, marks the record running
//! 3. The launcher spawns the external process; stdout/stderr stream into
//!    the log broadcaster line by line
//! 4. On exit (or cancellation) the outcome is classified and written back
//!    to the store, and the job's log stream is closed
//!
//! Reconciliation runs before any worker starts: persisted `running` (and
//! `pending`) records from a previous process are forced to `error`, since
//! their underlying work is gone.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::LogBroadcaster;
use crate::job::{InvocationSpec, JobStatus};
use crate::store::{JobStore, ListOrder, StoreError};

/// Stderr lines retained as the diagnostic tail for `error_detail`.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Builds and spawns the external inference process for a job.
///
/// Extension point so tests substitute a shell launcher for the real OCR
/// entrypoints. The launcher must pipe stdout and stderr.
pub trait JobLauncher: Send + Sync {
    fn launch(&self, spec: &InvocationSpec, output_dir: &Path) -> Result<Child, LaunchError>;
}

/// Production launcher: runs the PDF or image OCR entrypoint (selected by
/// artifact extension) with artifact, output directory, and prompt on the
/// command line.
pub struct OcrLauncher {
    python_bin: PathBuf,
    pdf_script: PathBuf,
    image_script: PathBuf,
}

impl OcrLauncher {
    pub fn new(
        python_bin: impl Into<PathBuf>,
        pdf_script: impl Into<PathBuf>,
        image_script: impl Into<PathBuf>,
    ) -> Self {
        Self {
            python_bin: python_bin.into(),
            pdf_script: pdf_script.into(),
            image_script: image_script.into(),
        }
    }

    fn script_for(&self, spec: &InvocationSpec) -> &Path {
        let is_pdf = spec
            .artifact
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if is_pdf {
            &self.pdf_script
        } else {
            &self.image_script
        }
    }
}

impl JobLauncher for OcrLauncher {
    fn launch(&self, spec: &InvocationSpec, output_dir: &Path) -> Result<Child, LaunchError> {
        let script = self.script_for(spec);
        let child = Command::new(&self.python_bin)
            .arg(script)
            .arg("--input")
            .arg(&spec.artifact)
            .arg("--output")
            .arg(output_dir)
            .arg("--prompt")
            .arg(&spec.prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("work queue is full")]
    QueueFull,
    #[error("runner is shut down")]
    Closed,
}

/// What `cancel` observed. Cancellation of a running job is best-effort and
/// asynchronous: the caller polls status for the eventual transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Pending job cancelled; no process was ever started.
    CancelledBeforeStart,
    /// Termination signalled to a running job.
    CancelRequested,
    /// Job already terminal; status unchanged.
    AlreadyTerminal(JobStatus),
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Fixed number of concurrent execution slots. 1 matches a single shared
    /// inference device downstream.
    pub worker_slots: usize,
    pub queue_capacity: usize,
    /// Directory under which per-job result directories are created.
    pub results_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_slots: 1,
            queue_capacity: 256,
            results_dir: PathBuf::from("data/results"),
        }
    }
}

struct QueuedJob {
    id: String,
    spec: InvocationSpec,
    token: CancellationToken,
}

enum Outcome {
    Finished(PathBuf),
    Error(String),
    Cancelled,
}

pub struct JobRunner {
    store: Arc<JobStore>,
    broadcaster: Arc<LogBroadcaster>,
    queue_tx: mpsc::Sender<QueuedJob>,
    tokens: DashMap<String, CancellationToken>,
    results_dir: PathBuf,
}

impl JobRunner {
    /// Reconcile orphaned records, then spawn the worker pool. Must be called
    /// from within a tokio runtime.
    pub fn start(
        config: RunnerConfig,
        store: Arc<JobStore>,
        broadcaster: Arc<LogBroadcaster>,
        launcher: Arc<dyn JobLauncher>,
    ) -> Result<Arc<Self>, StoreError> {
        reconcile(&store)?;

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let runner = Arc::new(Self {
            store,
            broadcaster,
            queue_tx,
            tokens: DashMap::new(),
            results_dir: config.results_dir,
        });

        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        for slot in 0..config.worker_slots.max(1) {
            let runner = Arc::clone(&runner);
            let launcher = Arc::clone(&launcher);
            let queue_rx = Arc::clone(&queue_rx);
            tokio::spawn(async move {
                loop {
                    let job = { queue_rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    runner.run_one(slot, launcher.as_ref(), job).await;
                }
                tracing::debug!(slot, "Worker slot exiting");
            });
        }

        Ok(runner)
    }

    /// Accept a job for asynchronous execution. Returns immediately; arrival
    /// order is preserved through the queue.
    pub fn enqueue(&self, id: &str, spec: InvocationSpec) -> Result<(), EnqueueError> {
        let token = CancellationToken::new();
        self.tokens.insert(id.to_string(), token.clone());

        let queued = QueuedJob {
            id: id.to_string(),
            spec,
            token,
        };
        match self.queue_tx.try_send(queued) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.tokens.remove(id);
                Err(EnqueueError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.tokens.remove(id);
                Err(EnqueueError::Closed)
            }
        }
    }

    /// Cancel a job. Pending jobs transition to `cancelled` directly, never
    /// starting a process; running jobs get their process killed, and the
    /// recorded outcome is `cancelled` regardless of the exit code.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome, StoreError> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(record.status));
        }

        if let Some(token) = self.tokens.get(id) {
            token.cancel();
        }

        if record.status == JobStatus::Pending {
            let updated = self.store.update(id, |r| {
                r.advance(JobStatus::Cancelled);
            })?;
            // The worker may have raced it to running; in that case the
            // cancelled token takes over and we fall through below.
            if updated.status == JobStatus::Cancelled {
                tracing::info!(target: "ocrlet::job", job_id = %id, "Cancelled before start");
                self.tokens.remove(id);
                self.broadcaster.close(id);
                return Ok(CancelOutcome::CancelledBeforeStart);
            }
        }

        tracing::info!(target: "ocrlet::job", job_id = %id, "Cancel requested");
        Ok(CancelOutcome::CancelRequested)
    }

    async fn run_one(&self, slot: usize, launcher: &dyn JobLauncher, job: QueuedJob) {
        let QueuedJob { id, spec, token } = job;

        // Cancelled (or otherwise resolved) while still queued: nothing to run.
        let current = self.store.get(&id).map(|r| r.status);
        if token.is_cancelled() || current != Some(JobStatus::Pending) {
            self.tokens.remove(&id);
            return;
        }

        if let Err(e) = self.store.update(&id, |r| {
            r.advance(JobStatus::Running);
        }) {
            tracing::error!(job_id = %id, error = %e, "Failed to mark job running");
            self.tokens.remove(&id);
            return;
        }
        tracing::info!(target: "ocrlet::job", job_id = %id, slot, "Starting job");

        let outcome = self.execute(launcher, &id, &spec, &token).await;
        self.finish(&id, outcome);
        self.tokens.remove(&id);
        self.broadcaster.close(&id);
    }

    async fn execute(
        &self,
        launcher: &dyn JobLauncher,
        id: &str,
        spec: &InvocationSpec,
        token: &CancellationToken,
    ) -> Outcome {
        // Artifact existence is deliberately checked here, not at submit time.
        if !spec.artifact.exists() {
            return Outcome::Error(format!(
                "input artifact not found: {}",
                spec.artifact.display()
            ));
        }

        let output_dir = self.results_dir.join(id);
        if let Err(e) = std::fs::create_dir_all(&output_dir) {
            return Outcome::Error(format!("failed to create result directory: {e}"));
        }

        let mut child = match launcher.launch(spec, &output_dir) {
            Ok(child) => child,
            Err(e) => {
                return Outcome::Error(format!("failed to launch inference process: {e}"));
            }
        };

        let stderr_tail: Arc<StdMutex<VecDeque<String>>> = Arc::default();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                id.to_string(),
                Arc::clone(&self.broadcaster),
                None,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                id.to_string(),
                Arc::clone(&self.broadcaster),
                Some(Arc::clone(&stderr_tail)),
            )));
        }

        let mut exit = None;
        tokio::select! {
            result = child.wait() => exit = Some(result),
            _ = token.cancelled() => {
                tracing::info!(target: "ocrlet::job", job_id = %id, "Killing process on cancel");
            }
        }
        let exit = match exit {
            Some(result) => result,
            None => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(job_id = %id, error = %e, "Failed to kill process");
                }
                child.wait().await
            }
        };

        // Readers end on pipe EOF once the process is gone.
        for reader in readers {
            let _ = reader.await;
        }

        let exit = match exit {
            Ok(status) => status,
            Err(e) => {
                return Outcome::Error(format!("failed to wait for inference process: {e}"));
            }
        };

        // Cancellation intent takes precedence over whatever exit state the
        // killed process reports.
        if token.is_cancelled() {
            return Outcome::Cancelled;
        }

        if !exit.success() {
            let tail = drain_tail(&stderr_tail);
            let detail = if tail.is_empty() {
                format!("inference process exited abnormally ({exit})")
            } else {
                tail
            };
            return Outcome::Error(detail);
        }

        if !contains_file(&output_dir) {
            return Outcome::Error(
                "inference process exited cleanly but produced no result artifact".to_string(),
            );
        }

        Outcome::Finished(output_dir)
    }

    fn finish(&self, id: &str, outcome: Outcome) {
        let result = self.store.update(id, |r| match &outcome {
            Outcome::Finished(dir) => {
                if r.advance(JobStatus::Finished) {
                    r.result_location = Some(dir.clone());
                }
            }
            Outcome::Error(detail) => {
                if r.advance(JobStatus::Error) {
                    r.error_detail = Some(detail.clone());
                }
            }
            Outcome::Cancelled => {
                r.advance(JobStatus::Cancelled);
            }
        });

        match result {
            Ok(record) => {
                tracing::info!(
                    target: "ocrlet::job",
                    job_id = %id,
                    status = %record.status,
                    runtime_secs = record.runtime().map(|d| d.num_seconds()),
                    "Job finished"
                );
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Failed to record job outcome");
            }
        }
    }
}

/// Force records left `running` (or `pending`) by a previous process into
/// `error`: their process or queue entry is gone and cannot be recovered.
fn reconcile(store: &JobStore) -> Result<(), StoreError> {
    for record in store.list(None, ListOrder::Submitted) {
        let diagnostic = match record.status {
            JobStatus::Running => "inference process was lost in a restart and is not recoverable",
            JobStatus::Pending => "queued job was lost in a restart before it started",
            _ => continue,
        };
        tracing::warn!(job_id = %record.id, status = %record.status, "Reconciling orphaned job");
        store.update(&record.id, |r| {
            if r.advance(JobStatus::Error) {
                r.error_detail = Some(diagnostic.to_string());
            }
        })?;
    }
    Ok(())
}

async fn forward_lines<R>(
    reader: R,
    job_id: String,
    broadcaster: Arc<LogBroadcaster>,
    tail: Option<Arc<StdMutex<VecDeque<String>>>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(ref tail) = tail
            && !line.trim().is_empty()
        {
            let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
            tail.push_back(line.clone());
            while tail.len() > STDERR_TAIL_LINES {
                tail.pop_front();
            }
        }
        broadcaster.append(&job_id, line);
    }
}

fn drain_tail(tail: &StdMutex<VecDeque<String>>) -> String {
    let tail = tail.lock().unwrap_or_else(|p| p.into_inner());
    tail.iter().cloned().collect::<Vec<_>>().join("\n")
}

fn contains_file(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            return true;
        }
        if path.is_dir() && contains_file(&path) {
            return true;
        }
    }
    false
}
