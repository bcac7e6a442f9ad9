// Local crates
use crate::{
    deliverer::{
        deliverer::{DeliverySettings, WriterFactory},
        printer::PreviewOutput,
    },
    enricher::geoip::GeoEnricher,
    helpers::{
        load_config::Config,
        shutdown::{Shutdown, listen_for_signals},
    },
    metrics::http::start_metrics_server,
    orchestrator::orchestrator::{Orchestrator, RunOutcome},
    parser::parser::LineParser,
    sink::influx::{InfluxSink, InfluxSinkFactory},
};

// External crates
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::instrument;

/// Pick the writer for every file: preview printing or batched Influx delivery.
///
/// Influx settings are checked once here so a bad URL fails the run instead of
/// every file.
pub fn writer_factory(config: &Config, preview_output: PreviewOutput) -> Result<WriterFactory> {
    if config.output.preview {
        return Ok(WriterFactory::Print {
            format: config.output.format,
            output: preview_output,
        });
    }

    InfluxSink::new(&config.influx).context("Invalid influx settings")?;
    Ok(WriterFactory::Deliver {
        sinks: Arc::new(InfluxSinkFactory::new(config.influx.clone())),
        settings: DeliverySettings::from_config(config),
    })
}

/// Run the pipeline until it completes, aborts or a signal stops it.
#[instrument(
    name = "request_shipper_runtime::run_shipper",
    target = "runtime::runtime",
    skip_all,
    level = "info"
)]
pub async fn run_shipper(config: Config) -> Result<RunOutcome> {
    tracing::debug!(
        pattern = %config.files.path,
        daemon = config.files.daemon,
        poll = config.files.poll,
        preview = config.output.preview,
        format = %config.output.format,
        "Starting request shipper"
    );

    if let Some(listen) = config.metrics.listen.clone() {
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&listen).await {
                tracing::error!(error = %e, "Metrics server stopped");
            }
        });
    }

    let parser = Arc::new(LineParser::new().context("Failed to build access log parser")?);
    let enricher = GeoEnricher::from_path(&config.geoip.database);
    let writers = writer_factory(&config, PreviewOutput::stdout())?;
    let orchestrator = Orchestrator::new(&config, parser, enricher, writers)?;

    let shutdown = Shutdown::new();
    tokio::spawn(listen_for_signals(shutdown.clone()));

    let outcome = orchestrator.run(shutdown.wait_for_shutdown()).await?;
    match outcome {
        RunOutcome::Completed => tracing::info!("Finished"),
        RunOutcome::Interrupted => tracing::info!("Stopped by signal"),
        RunOutcome::Aborted => tracing::error!("Aborted, no writer left to deliver records"),
    }
    Ok(outcome)
}
