//! Consumer side of a file's data channel.
//!
//! Each file gets one writer. In print mode it renders records to the preview
//! output. In delivery mode a [`BatchDeliverer`] probes its own sink, then
//! batches points and flushes them when the batch is full, when the flush
//! timer fires and when the channel closes. A monitor task re-checks the sink
//! every health-check interval; losing it ends the session.

// Local crates
use crate::{
    deliverer::printer::{PreviewOutput, Printer},
    helpers::{
        load_config::{Config, OutputFormat},
        retry::{Backoff, RetryPolicy, retry},
    },
    metrics::metrics::{FLUSH_DURATION_SECONDS, FLUSH_FAILURES, POINTS_FLUSHED, observe_duration},
    parser::models::Request,
    point::point::Point,
    sink::sink::{MetricsSink, SinkError, SinkFactory},
};

// External crates
use std::{fmt, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// How a writer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The data channel closed and everything buffered was handled.
    Drained,
    /// The initial sink probe exhausted its retries.
    SinkUnavailable,
    /// The connectivity monitor gave up on the sink.
    ConnectionLost,
    /// A batch could not be written.
    FlushFailed,
    /// The preview output could not be written.
    OutputFailed,
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self {
            Self::Drained => "drained",
            Self::SinkUnavailable => "sink unavailable",
            Self::ConnectionLost => "connection lost",
            Self::FlushFailed => "flush failed",
            Self::OutputFailed => "output failed",
        };
        f.write_str(outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub health_check_interval: Duration,
    /// Initial probe and every health check.
    pub connect_policy: RetryPolicy,
    /// Connection check preceding each write.
    pub flush_policy: RetryPolicy,
}

impl DeliverySettings {
    pub fn from_config(config: &Config) -> Self {
        let backoff = Backoff::Linear {
            initial: config.influx.retry_initial(),
            step: config.influx.retry_step(),
        };
        Self {
            batch_size: config.output.batch_size,
            flush_interval: config.output.flush_interval(),
            health_check_interval: config.influx.health_check_interval(),
            connect_policy: RetryPolicy::new(config.influx.connect_retries, backoff),
            flush_policy: RetryPolicy::new(1, backoff),
        }
    }
}

#[derive(Debug)]
pub struct BatchDeliverer {
    path: PathBuf,
    sink: Arc<dyn MetricsSink>,
    settings: DeliverySettings,
    batch: Vec<Point>,
}

impl BatchDeliverer {
    pub fn new(path: PathBuf, sink: Arc<dyn MetricsSink>, settings: DeliverySettings) -> Self {
        Self {
            path,
            sink,
            settings,
            batch: Vec::with_capacity(settings.batch_size.min(4096)),
        }
    }

    #[instrument(
        name = "request_shipper_deliverer::run",
        target = "deliverer::deliverer::BatchDeliverer",
        skip_all,
        fields(file = %self.path.display()),
        level = "debug"
    )]
    pub async fn run(mut self, mut data: mpsc::Receiver<Request>) -> DeliveryOutcome {
        let sink = self.sink.clone();
        if let Err(e) = retry(self.settings.connect_policy, "sink connect", || sink.connect()).await {
            tracing::error!(file = %self.path.display(), error = %e, "Failed to connect to sink");
            sink.close().await;
            return DeliveryOutcome::SinkUnavailable;
        }

        let lost = CancellationToken::new();
        let stop_monitor = CancellationToken::new();
        let monitor = tokio::spawn(monitor_connectivity(
            sink.clone(),
            self.settings.health_check_interval,
            self.settings.connect_policy,
            lost.clone(),
            stop_monitor.clone(),
        ));

        let outcome = self.deliver(&mut data, &lost).await;

        stop_monitor.cancel();
        if let Err(e) = monitor.await {
            tracing::warn!(error = %e, "Connectivity monitor ended abnormally");
        }
        sink.close().await;

        tracing::debug!(file = %self.path.display(), outcome = %outcome, "Closed writer");
        outcome
    }

    async fn deliver(
        &mut self,
        data: &mut mpsc::Receiver<Request>,
        lost: &CancellationToken,
    ) -> DeliveryOutcome {
        let period = self.settings.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = lost.cancelled() => {
                    tracing::error!(file = %self.path.display(), "Lost connection to sink");
                    if !self.batch.is_empty() && self.flush().await.is_err() {
                        tracing::warn!(file = %self.path.display(), "Final batch dropped after losing the sink");
                    }
                    return DeliveryOutcome::ConnectionLost;
                }
                _ = ticker.tick() => {
                    tracing::info!(points = self.batch.len(), "Sync: sending points");
                    if !self.batch.is_empty() && self.flush().await.is_err() {
                        return DeliveryOutcome::FlushFailed;
                    }
                }
                received = data.recv() => match received {
                    Some(request) => {
                        match Point::from_request(&request) {
                            Ok(point) => self.batch.push(point),
                            Err(e) => {
                                tracing::warn!(error = %e, "Dropping record that cannot become a point");
                                continue;
                            }
                        }
                        if self.batch.len() >= self.settings.batch_size {
                            tracing::info!(points = self.batch.len(), "Running batch: sending points");
                            if self.flush().await.is_err() {
                                return DeliveryOutcome::FlushFailed;
                            }
                        }
                    }
                    None => {
                        if !self.batch.is_empty() {
                            tracing::info!(points = self.batch.len(), "Finalizing batch: sending points");
                            if self.flush().await.is_err() {
                                return DeliveryOutcome::FlushFailed;
                            }
                        }
                        return DeliveryOutcome::Drained;
                    }
                },
            }
        }
    }

    /// Connection check then write. The batch is cleared whatever the result.
    async fn flush(&mut self) -> Result<(), SinkError> {
        let start = std::time::Instant::now();
        let sink = &self.sink;
        let result = match retry(self.settings.flush_policy, "sink connect", || sink.connect()).await {
            Ok(()) => sink.write(&self.batch).await,
            Err(e) => Err(e),
        };
        observe_duration(&FLUSH_DURATION_SECONDS, start);

        let points = self.batch.len();
        self.batch.clear();
        match &result {
            Ok(()) => {
                POINTS_FLUSHED.inc_by(points as u64);
                tracing::debug!(file = %self.path.display(), points, "Flushed batch");
            }
            Err(e) => {
                FLUSH_FAILURES.inc();
                tracing::error!(
                    file = %self.path.display(),
                    points,
                    error = %e,
                    "Failed to flush batch, points dropped"
                );
            }
        }
        result
    }
}

/// Re-check the sink every `interval`; cancel `lost` once a check exhausts `policy`.
async fn monitor_connectivity(
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    policy: RetryPolicy,
    lost: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                tokio::select! {
                    biased;

                    _ = stop.cancelled() => return,
                    checked = retry(policy, "sink health check", || sink.connect()) => {
                        if checked.is_err() {
                            lost.cancel();
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Consumer for one file, as selected by the output settings.
#[derive(Debug)]
pub enum Writer {
    Print(Printer),
    Deliver(BatchDeliverer),
}

impl Writer {
    pub async fn run(self, data: mpsc::Receiver<Request>) -> DeliveryOutcome {
        match self {
            Self::Print(printer) => printer.run(data).await,
            Self::Deliver(deliverer) => deliverer.run(data).await,
        }
    }
}

/// Builds the writer for each newly discovered file.
#[derive(Debug, Clone)]
pub enum WriterFactory {
    Print {
        format: OutputFormat,
        output: PreviewOutput,
    },
    Deliver {
        sinks: Arc<dyn SinkFactory>,
        settings: DeliverySettings,
    },
}

impl WriterFactory {
    pub fn create(&self, path: PathBuf) -> Result<Writer, SinkError> {
        match self {
            Self::Print { format, output } => {
                Ok(Writer::Print(Printer::new(*format, output.clone())))
            }
            Self::Deliver { sinks, settings } => Ok(Writer::Deliver(BatchDeliverer::new(
                path,
                sinks.create()?,
                *settings,
            ))),
        }
    }
}
