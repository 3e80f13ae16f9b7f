use std::{process, sync::Arc};

use tiercache::{
    config::{self, Settings},
    error::AppError,
    runtime::CacheRuntime,
    telemetry,
    workers::WorkerSet,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings).await
        }
        config::Command::CheckConfig(_) => {
            println!("{settings:#?}");
            Ok(())
        }
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let runtime = Arc::new(CacheRuntime::from_settings(&settings)?);
    let workers = WorkerSet::spawn(Arc::clone(&runtime));

    info!(
        layers = ?runtime.orchestrator().layer_names(),
        workers = workers.len(),
        "tiercache serving; press Ctrl-C to stop"
    );

    let result = tokio::signal::ctrl_c().await.map_err(AppError::from);

    workers.shutdown().await;
    let metrics = runtime.orchestrator().metrics();
    let stats = runtime.coordinator().stats();
    info!(
        hits = metrics.hits,
        misses = metrics.misses,
        invalidations = stats.processed,
        "tiercache stopped"
    );

    result
}
