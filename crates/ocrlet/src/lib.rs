//! ocrlet: job orchestration and live-output server for OCR inference.

pub mod broadcast;
pub mod config;
pub mod job;
pub mod package;
pub mod runner;
pub mod service;
pub mod store;
pub mod transport;

pub use broadcast::{LogBroadcaster, LogLine, LogSubscription};
pub use config::Config;
pub use job::{InvocationSpec, JobRecord, JobStatus};
pub use package::ExportFormat;
pub use runner::{CancelOutcome, JobLauncher, JobRunner, OcrLauncher, RunnerConfig};
pub use service::{JobService, ResultPackage, ServiceError};
pub use store::{JobStore, ListOrder, StoreError};
