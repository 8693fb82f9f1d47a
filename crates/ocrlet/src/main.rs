use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ocrlet::transport::{ServerConfig, serve};
use ocrlet::{Config, JobRunner, JobService, JobStore, LogBroadcaster, OcrLauncher, RunnerConfig};

/// Initialize tracing with OCRLET_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("OCRLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("ocrlet={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        worker_slots = config.worker_slots,
        "Starting ocrlet"
    );

    let store = Arc::new(JobStore::open(&config.data_dir)?);
    let broadcaster = Arc::new(LogBroadcaster::new(
        config.log_buffer,
        config.log_retention,
    ));
    let launcher = Arc::new(OcrLauncher::new(
        config.python_bin.clone(),
        config.pdf_script.clone(),
        config.image_script.clone(),
    ));

    let runner = JobRunner::start(
        RunnerConfig {
            worker_slots: config.worker_slots,
            queue_capacity: config.queue_capacity,
            results_dir: config.results_dir.clone(),
        },
        Arc::clone(&store),
        Arc::clone(&broadcaster),
        launcher,
    )?;

    let service = Arc::new(JobService::new(
        store,
        broadcaster,
        runner,
        config.worker_slots,
        config.queue_capacity,
    ));

    serve(
        ServerConfig {
            host: config.host.to_string(),
            port: config.port,
        },
        service,
    )
    .await
}
