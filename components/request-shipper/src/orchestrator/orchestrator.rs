//! Discovery, spawning and shutdown of the per-file reader/writer pairs.
//!
//! Every file matching the configured glob gets a [`FileTailer`] (reader) and a
//! [`Writer`] connected through its registry entry. The run loop merges reader
//! completions, writer completions, rescans and the shutdown signal into one
//! `select!`:
//!
//! - all readers done: wait for every writer, then complete;
//! - all writers gone while files are still registered: stop every reader and abort;
//! - shutdown: stop every reader, wait for every writer to flush, then return.

// Local crates
use crate::{
    deliverer::deliverer::{DeliveryOutcome, Writer, WriterFactory},
    enricher::geoip::GeoEnricher,
    helpers::load_config::Config,
    parser::parser::LineParser,
    registry::registry::{ControlEnds, FileRegistry},
    tailer::tailer::{CloseReason, FileTailer, TailerSettings},
};

// External crates
use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    task::{JoinError, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tracing::instrument;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid file pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every reader closed and every writer drained.
    Completed,
    /// Every writer exited while readers were still registered.
    Aborted,
    /// A shutdown signal stopped the pipeline.
    Interrupted,
}

#[derive(Debug)]
pub struct Orchestrator {
    pattern: String,
    daemon: bool,
    rescan_interval: Duration,
    tailer_settings: TailerSettings,
    registry: FileRegistry,
    parser: Arc<LineParser>,
    enricher: GeoEnricher,
    writers_factory: WriterFactory,
    readers: JoinSet<(PathBuf, CloseReason)>,
    writers: JoinSet<(PathBuf, DeliveryOutcome)>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        parser: Arc<LineParser>,
        enricher: GeoEnricher,
        writers_factory: WriterFactory,
    ) -> Result<Self, OrchestratorError> {
        let pattern = config.files.path.clone();
        glob::Pattern::new(&pattern).map_err(|source| OrchestratorError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;

        Ok(Self {
            pattern,
            daemon: config.files.daemon,
            rescan_interval: config.files.rescan_interval(),
            tailer_settings: TailerSettings::from(&config.files),
            registry: FileRegistry::new(),
            parser,
            enricher,
            writers_factory,
            readers: JoinSet::new(),
            writers: JoinSet::new(),
        })
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    /// Expand the glob and start a reader/writer pair for every new file.
    /// Returns how many pairs were started.
    #[instrument(
        name = "request_shipper_orchestrator::discover",
        target = "orchestrator::orchestrator::Orchestrator",
        skip_all,
        level = "debug"
    )]
    pub fn discover(&mut self) -> Result<usize, OrchestratorError> {
        let paths = glob::glob(&self.pattern).map_err(|source| OrchestratorError::Pattern {
            pattern: self.pattern.clone(),
            source,
        })?;

        let mut new_files = 0;
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable glob match");
                    continue;
                }
            };
            if path.is_dir() || self.registry.contains(&path) {
                continue;
            }

            if self.spawn_pair(path) {
                new_files += 1;
            }
        }

        tracing::debug!(
            new_files,
            registered = self.registry.len(),
            "New files to analyze"
        );
        Ok(new_files)
    }

    fn spawn_pair(&mut self, path: PathBuf) -> bool {
        let writer: Writer = match self.writers_factory.create(path.clone()) {
            Ok(writer) => writer,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "Creating writer");
                return false;
            }
        };
        let ControlEnds {
            registration,
            stop,
            data_tx,
            data_rx,
        } = match self.registry.add(&path) {
            Ok(ends) => ends,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "Creating control channels");
                return false;
            }
        };

        let tailer = FileTailer::new(
            path.clone(),
            self.tailer_settings,
            self.parser.clone(),
            self.enricher.clone(),
            stop,
            data_tx,
            registration,
        );
        let reader_path = path.clone();
        self.readers
            .spawn(async move { (reader_path, tailer.run().await) });
        self.writers
            .spawn(async move { (path, writer.run(data_rx).await) });
        true
    }

    /// Run until the readers finish, the writers give up, or `shutdown` resolves.
    #[instrument(
        name = "request_shipper_orchestrator::run",
        target = "orchestrator::orchestrator::Orchestrator",
        skip_all,
        fields(pattern = %self.pattern, daemon = self.daemon),
        level = "info"
    )]
    pub async fn run(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunOutcome, OrchestratorError> {
        self.discover()?;

        tokio::pin!(shutdown);
        let period = self.rescan_interval;
        let mut rescan = tokio::time::interval_at(Instant::now() + period, period);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.readers.is_empty() {
                tracing::info!("All readers closed, waiting for writers");
                self.join_writers().await;
                return Ok(RunOutcome::Completed);
            }
            if self.writers.is_empty() && !self.registry.is_empty() {
                tracing::error!(
                    registered = self.registry.len(),
                    "Aborting, every writer has exited"
                );
                self.registry.send_all();
                return Ok(RunOutcome::Aborted);
            }

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Exit signal detected, closing");
                    self.registry.send_all();
                    tracing::info!("Waiting for writers to close");
                    self.join_writers().await;
                    return Ok(RunOutcome::Interrupted);
                }
                _ = rescan.tick(), if self.daemon => {
                    tracing::info!("Refreshing files");
                    if let Err(e) = self.discover() {
                        tracing::warn!(error = %e, "File rescan failed");
                    }
                }
                Some(joined) = self.readers.join_next() => log_reader(joined),
                Some(joined) = self.writers.join_next() => log_writer(joined),
            }
        }
    }

    async fn join_writers(&mut self) {
        while let Some(joined) = self.writers.join_next().await {
            log_writer(joined);
        }
    }
}

fn log_reader(joined: Result<(PathBuf, CloseReason), JoinError>) {
    match joined {
        Ok((path, reason)) => {
            tracing::debug!(file = %path.display(), reason = %reason, "Closed reader");
        }
        Err(e) => tracing::error!(error = %e, "Reader task failed"),
    }
}

fn log_writer(joined: Result<(PathBuf, DeliveryOutcome), JoinError>) {
    match joined {
        Ok((path, outcome)) => {
            tracing::debug!(file = %path.display(), outcome = %outcome, "Closed writer");
        }
        Err(e) => tracing::error!(error = %e, "Writer task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deliverer::{
            deliverer::{
                DeliverySettings,
                tests::{MockSink, MockSinkFactory},
            },
            printer::PreviewOutput,
        },
        helpers::{
            load_config::OutputFormat,
            retry::{Backoff, RetryPolicy},
            shutdown::Shutdown,
        },
    };
    use std::{
        io::{self, Write},
        path::Path,
        sync::{Mutex, atomic::Ordering},
    };

    const LINE: &str = r#"[21/Mar/2016:02:33:29 +0000] example.com 10.0.0.1 - "GET /index.html HTTP/1.1" 200 512 "-" "curl/7.0" 0.001 - "uid-1""#;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn line_count(&self) -> usize {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .count()
        }
    }

    fn write_log(path: &Path, count: usize) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for _ in 0..count {
            writeln!(file, "{LINE}").unwrap();
        }
    }

    fn config(dir: &Path, daemon: bool) -> Config {
        let mut config = Config::default();
        config.files.path = dir.join("*.log").to_string_lossy().into_owned();
        config.files.daemon = daemon;
        config.files.poll = true;
        config.files.poll_interval_ms = 10;
        config.files.rescan_interval_secs = 1;
        config
    }

    fn printer(buffer: &SharedBuffer) -> WriterFactory {
        WriterFactory::Print {
            format: OutputFormat::Json,
            output: PreviewOutput::new(buffer.clone()),
        }
    }

    fn orchestrator(config: &Config, writers: WriterFactory) -> Orchestrator {
        Orchestrator::new(
            config,
            Arc::new(LineParser::new().unwrap()),
            GeoEnricher::disabled(),
            writers,
        )
        .unwrap()
    }

    fn fast_settings(batch_size: usize) -> DeliverySettings {
        let backoff = Backoff::Constant(Duration::from_millis(10));
        DeliverySettings {
            batch_size,
            flush_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(60),
            connect_policy: RetryPolicy::new(1, backoff),
            flush_policy: RetryPolicy::new(1, backoff),
        }
    }

    async fn within<F: Future>(future: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(10), future)
            .await
            .expect("pipeline did not finish in time")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        within(async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_completes_after_reading_every_file() {
        let dir = tempfile::tempdir().unwrap();
        write_log(&dir.path().join("a.log"), 3);
        write_log(&dir.path().join("b.log"), 2);
        std::fs::create_dir(dir.path().join("nested.log")).unwrap();

        let buffer = SharedBuffer::default();
        let orchestrator = orchestrator(&config(dir.path(), false), printer(&buffer));
        let registry = orchestrator.registry().clone();

        let outcome = within(orchestrator.run(std::future::pending())).await;

        assert_eq!(outcome.unwrap(), RunOutcome::Completed);
        assert_eq!(buffer.line_count(), 5);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_delivers_batches_per_file() {
        let dir = tempfile::tempdir().unwrap();
        write_log(&dir.path().join("a.log"), 3);

        let factory = MockSinkFactory::default();
        let sink = factory.sink.clone();
        let writers = WriterFactory::Deliver {
            sinks: Arc::new(factory),
            settings: fast_settings(2),
        };
        let orchestrator = orchestrator(&config(dir.path(), false), writers);

        let outcome = within(orchestrator.run(std::future::pending())).await;

        assert_eq!(outcome.unwrap(), RunOutcome::Completed);
        assert_eq!(sink.writes(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_aborts_when_every_writer_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        write_log(&dir.path().join("a.log"), 1);

        let sink = Arc::new(MockSink::default());
        sink.fail_connect.store(true, Ordering::SeqCst);
        let writers = WriterFactory::Deliver {
            sinks: Arc::new(MockSinkFactory { sink: sink.clone() }),
            settings: fast_settings(10),
        };
        let orchestrator = orchestrator(&config(dir.path(), true), writers);

        let outcome = within(orchestrator.run(std::future::pending())).await;

        assert_eq!(outcome.unwrap(), RunOutcome::Aborted);
        assert!(sink.writes().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_followers_and_drains_writers() {
        let dir = tempfile::tempdir().unwrap();
        write_log(&dir.path().join("a.log"), 2);
        write_log(&dir.path().join("b.log"), 1);

        let buffer = SharedBuffer::default();
        let orchestrator = orchestrator(&config(dir.path(), true), printer(&buffer));
        let registry = orchestrator.registry().clone();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(orchestrator.run(shutdown.wait_for_shutdown()));

        let printed = buffer.clone();
        wait_until(|| printed.line_count() == 3).await;
        assert_eq!(registry.len(), 2);
        shutdown.trigger();

        let outcome = within(task).await.unwrap();
        assert_eq!(outcome.unwrap(), RunOutcome::Interrupted);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_rescan_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        write_log(&dir.path().join("a.log"), 1);

        let buffer = SharedBuffer::default();
        let orchestrator = orchestrator(&config(dir.path(), true), printer(&buffer));
        let registry = orchestrator.registry().clone();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(orchestrator.run(shutdown.wait_for_shutdown()));

        let printed = buffer.clone();
        wait_until(|| printed.line_count() == 1).await;

        write_log(&dir.path().join("b.log"), 2);
        let printed = buffer.clone();
        wait_until(|| printed.line_count() == 3).await;
        assert_eq!(registry.len(), 2);

        shutdown.trigger();
        assert_eq!(within(task).await.unwrap().unwrap(), RunOutcome::Interrupted);
    }

    #[tokio::test]
    async fn test_no_matching_files_completes() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = SharedBuffer::default();
        let orchestrator = orchestrator(&config(dir.path(), false), printer(&buffer));

        let outcome = within(orchestrator.run(std::future::pending())).await;

        assert_eq!(outcome.unwrap(), RunOutcome::Completed);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let mut config = Config::default();
        config.files.path = "/var/log/[".to_string();

        let result = Orchestrator::new(
            &config,
            Arc::new(LineParser::new().unwrap()),
            GeoEnricher::disabled(),
            printer(&SharedBuffer::default()),
        );

        assert!(matches!(result, Err(OrchestratorError::Pattern { .. })));
    }
}
