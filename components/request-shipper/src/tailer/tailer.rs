//! One tailer per discovered file.
//!
//! A tailer moves through `Opening -> Following -> Closed`. While following it
//! parses and enriches every line, pushes the record onto its file's data
//! channel and periodically checks whether the file is gone or finished.
//! Whatever the reason for closing, dropping the tailer removes its registry
//! entry, which closes the data channel and lets the paired deliverer drain.

// Local crates
use crate::{
    enricher::geoip::GeoEnricher,
    helpers::load_config::FilesConfig,
    metrics::metrics::{ACTIVE_FILES, LINES_EXPIRED, LINES_READ, LINES_REJECTED, RECORDS_FORWARDED},
    parser::{models::Request, parser::LineParser},
    registry::registry::Registration,
    tailer::follower::{FollowMode, LineFollower},
};

// External crates
use chrono::Utc;
use std::{
    fmt,
    fs::Metadata,
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tracing::instrument;

/// Why a tailer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The file could not be stat'ed or opened.
    Unreadable,
    /// Not modified within the staleness threshold; never opened.
    Stale,
    /// The path disappeared while following.
    Removed,
    /// Fully read and not modified within the staleness threshold.
    Drained,
    /// A stop token was received.
    Stopped,
    /// Non-daemon mode reached the end of the file.
    EndOfFile,
    /// The deliverer is gone.
    PeerClosed,
    ReadError,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Unreadable => "unreadable",
            Self::Stale => "stale",
            Self::Removed => "removed",
            Self::Drained => "drained",
            Self::Stopped => "stopped",
            Self::EndOfFile => "end of file",
            Self::PeerClosed => "deliverer closed",
            Self::ReadError => "read error",
        };
        f.write_str(reason)
    }
}

#[derive(Debug)]
pub enum TailerState {
    Opening,
    Following(LineFollower),
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailerSettings {
    pub daemon: bool,
    pub poll: bool,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub stale_check_interval: Duration,
    pub max_line_age: Option<Duration>,
}

impl From<&FilesConfig> for TailerSettings {
    fn from(files: &FilesConfig) -> Self {
        Self {
            daemon: files.daemon,
            poll: files.poll,
            poll_interval: files.poll_interval(),
            stale_after: files.stale_after(),
            stale_check_interval: files.stale_check_interval(),
            max_line_age: files.max_line_age(),
        }
    }
}

impl TailerSettings {
    fn follow_mode(&self) -> FollowMode {
        if self.daemon {
            FollowMode::Follow {
                poll: self.poll,
                interval: self.poll_interval,
            }
        } else {
            FollowMode::ToEnd
        }
    }
}

fn age(metadata: &Metadata) -> Duration {
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

#[derive(Debug)]
pub struct FileTailer {
    path: PathBuf,
    settings: TailerSettings,
    parser: Arc<LineParser>,
    enricher: GeoEnricher,
    stop: mpsc::Receiver<()>,
    data: mpsc::Sender<Request>,
    // Dropped last, once the tailer is done with the data sender.
    _registration: Registration,
}

impl FileTailer {
    pub fn new(
        path: PathBuf,
        settings: TailerSettings,
        parser: Arc<LineParser>,
        enricher: GeoEnricher,
        stop: mpsc::Receiver<()>,
        data: mpsc::Sender<Request>,
        registration: Registration,
    ) -> Self {
        Self {
            path,
            settings,
            parser,
            enricher,
            stop,
            data,
            _registration: registration,
        }
    }

    /// Drive the tailer until it closes.
    #[instrument(
        name = "request_shipper_tailer::run",
        target = "tailer::tailer::FileTailer",
        skip_all,
        fields(file = %self.path.display()),
        level = "debug"
    )]
    pub async fn run(mut self) -> CloseReason {
        let mut state = TailerState::Opening;
        loop {
            state = match state {
                TailerState::Opening => self.open().await,
                TailerState::Following(follower) => {
                    ACTIVE_FILES.inc();
                    let next = self.follow(follower).await;
                    ACTIVE_FILES.dec();
                    next
                }
                TailerState::Closed(reason) => {
                    tracing::info!(file = %self.path.display(), reason = %reason, "Closed file");
                    return reason;
                }
            };
        }
    }

    async fn open(&self) -> TailerState {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::info!(file = %self.path.display(), error = %e, "Error accessing file, skipping");
                return TailerState::Closed(CloseReason::Unreadable);
            }
        };

        if age(&metadata) > self.settings.stale_after {
            tracing::info!(
                file = %self.path.display(),
                stale_after_secs = self.settings.stale_after.as_secs(),
                "File is older than the staleness threshold, skipping"
            );
            return TailerState::Closed(CloseReason::Stale);
        }

        match LineFollower::open(&self.path, self.settings.follow_mode()).await {
            Ok(follower) => {
                tracing::info!(file = %self.path.display(), "Analyzing file");
                TailerState::Following(follower)
            }
            Err(e) => {
                tracing::error!(file = %self.path.display(), error = %e, "Could not open file");
                TailerState::Closed(CloseReason::Unreadable)
            }
        }
    }

    async fn follow(&mut self, mut follower: LineFollower) -> TailerState {
        let period = self.settings.stale_check_interval;
        let mut staleness = tokio::time::interval_at(Instant::now() + period, period);
        staleness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                // A closed stop channel means the registration is gone too.
                _ = self.stop.recv() => {
                    return TailerState::Closed(CloseReason::Stopped);
                }
                _ = staleness.tick() => {
                    if let Some(reason) = self.check_staleness(follower.offset()).await {
                        return TailerState::Closed(reason);
                    }
                }
                line = follower.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Err(reason) = self.forward(&line).await {
                            return TailerState::Closed(reason);
                        }
                    }
                    Ok(None) => return TailerState::Closed(CloseReason::EndOfFile),
                    Err(e) => {
                        tracing::error!(file = %self.path.display(), error = %e, "Failed to read file");
                        return TailerState::Closed(CloseReason::ReadError);
                    }
                },
            }
        }
    }

    async fn check_staleness(&self, offset: u64) -> Option<CloseReason> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(file = %self.path.display(), "File does not exist, closing");
                return Some(CloseReason::Removed);
            }
            Err(e) => {
                tracing::warn!(file = %self.path.display(), error = %e, "Could not stat file");
                return None;
            }
        };

        let size = metadata.len();
        if size == 0 {
            return None;
        }

        let processed = offset.saturating_mul(100) / size;
        if processed >= 100 && age(&metadata) > self.settings.stale_after {
            tracing::info!(
                file = %self.path.display(),
                stale_after_secs = self.settings.stale_after.as_secs(),
                "File processed and older than the staleness threshold, closing"
            );
            return Some(CloseReason::Drained);
        }

        tracing::info!(file = %self.path.display(), processed, "File processed {processed}%");
        None
    }

    /// Parse, enrich and push one line. Rejected and expired lines are skipped.
    async fn forward(&mut self, line: &str) -> Result<(), CloseReason> {
        LINES_READ.inc();

        let Some(mut request) = self.parser.parse(line) else {
            LINES_REJECTED.inc();
            return Ok(());
        };

        if let Some(max_age) = self.settings.max_line_age {
            let age = Utc::now().signed_duration_since(request.timestamp);
            if age.to_std().is_ok_and(|age| age > max_age) {
                LINES_EXPIRED.inc();
                tracing::trace!(file = %self.path.display(), "Skipping expired line");
                return Ok(());
            }
        }

        self.enricher.enrich(&mut request);

        // Blocks while the deliverer is busy; a stop token still wins.
        tokio::select! {
            biased;

            _ = self.stop.recv() => Err(CloseReason::Stopped),
            sent = self.data.send(request) => match sent {
                Ok(()) => {
                    RECORDS_FORWARDED.inc();
                    Ok(())
                }
                Err(_) => {
                    tracing::warn!(file = %self.path.display(), "Deliverer closed, stopping reader");
                    Err(CloseReason::PeerClosed)
                }
            },
        }
    }
}
