use std::fmt::Debug;
use std::fmt::Display;

use pagw::configuration::get_configuration;
use pagw::idempotency::init_expiry_worker;
use pagw::outbox::init_publisher;
use pagw::startup::Application;
use pagw::telemetry::get_subscriber;
use pagw::telemetry::init_subscriber;
use pagw::worker::init_stage_workers;
use tokio::task::JoinError;

fn report_exit(
    name: &str,
    outcome: Result<Result<(), impl Debug + Display>, JoinError>,
) {
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("{name} exited gracefully")
        }
        Ok(Err(e)) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} failed"
            )
        }
        Err(e) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} task panicked or was cancelled"
            )
        }
    }
}

/// Initialise telemetry, load config, then run the API alongside the
/// background workers: stage consumers, the outbox publisher and the
/// idempotency expiry sweep. The first one to exit brings the process
/// down so the orchestrator restarts it whole.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("pagw", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cfg = get_configuration().expect("failed to read configuration");

    // building the application also runs migrations; keep it first so
    // the workers never see an unmigrated database
    let server = Application::build(cfg.clone()).await?.run_until_stopped();
    let stage_workers = init_stage_workers(cfg.clone());
    let publisher = init_publisher(cfg.clone());
    let expiry_worker = init_expiry_worker(cfg);

    let server_task = tokio::spawn(server);
    let stage_worker_task = tokio::spawn(stage_workers);
    let publisher_task = tokio::spawn(publisher);
    let expiry_task = tokio::spawn(expiry_worker);

    tokio::select! {
        o = server_task => report_exit("API", o),
        o = stage_worker_task => report_exit("stage workers", o),
        o = publisher_task => report_exit("outbox publisher", o),
        o = expiry_task => report_exit("idempotency expiry worker", o),
    }

    Ok(())
}
