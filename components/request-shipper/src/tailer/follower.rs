//! Line-oriented file following.
//!
//! [`LineFollower`] turns a path into a stream of lines. It reads from the
//! beginning of the file, splits on `\n` and, when following, survives
//! rotation (a new file behind the same path), truncation and the path being
//! briefly absent.

// Local crates
use crate::metrics::metrics::FILE_ROTATIONS;

// External crates
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::VecDeque,
    fs::Metadata,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{fs::File, io::AsyncReadExt, sync::mpsc};

/// Size of a single read.
const READ_CHUNK: usize = 64 * 1024;
/// Lines longer than this are split.
pub const MAX_LINE_BYTES: usize = 256 * 1024;
/// Wakeup when relying on filesystem events, in case one is missed.
const NOTIFY_FALLBACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowMode {
    /// Read what is currently in the file, then report end of input.
    ToEnd,
    /// Keep waiting for new data. With `poll` the file is re-read every
    /// `interval`, otherwise filesystem events wake the follower up.
    Follow { poll: bool, interval: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn identity(metadata: &Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: metadata.dev(),
        ino: metadata.ino(),
    })
}

#[cfg(not(unix))]
fn identity(_metadata: &Metadata) -> Option<FileIdentity> {
    None
}

enum Growth {
    Poll(Duration),
    Notify {
        _watcher: RecommendedWatcher,
        events: mpsc::Receiver<()>,
    },
}

impl std::fmt::Debug for Growth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Poll(interval) => f.debug_tuple("Poll").field(interval).finish(),
            Self::Notify { .. } => f.write_str("Notify"),
        }
    }
}

impl Growth {
    fn new(path: &Path, poll: bool, interval: Duration) -> Self {
        if poll {
            return Self::Poll(interval);
        }
        match Self::watch(path) {
            Ok(growth) => growth,
            Err(e) => {
                tracing::warn!(
                    file = %path.display(),
                    error = %e,
                    "Filesystem notifications unavailable, polling instead"
                );
                Self::Poll(interval)
            }
        }
    }

    fn watch(path: &Path) -> notify::Result<Self> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = path.file_name().map(|name| name.to_os_string());

        let (tx, events) = mpsc::channel(1);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let relevant = event
                    .paths
                    .iter()
                    .any(|p| name.is_none() || p.file_name() == name.as_deref());
                if relevant {
                    // A pending wakeup already covers this event.
                    let _ = tx.try_send(());
                }
            }
        })?;
        // The parent directory also sees the file being recreated.
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        Ok(Self::Notify {
            _watcher: watcher,
            events,
        })
    }

    async fn wait(&mut self) {
        match self {
            Self::Poll(interval) => tokio::time::sleep(*interval).await,
            Self::Notify { events, .. } => {
                tokio::select! {
                    received = events.recv() => {
                        if received.is_none() {
                            tokio::time::sleep(NOTIFY_FALLBACK).await;
                        }
                    }
                    _ = tokio::time::sleep(NOTIFY_FALLBACK) => {}
                }
            }
        }
    }
}

/// Reads complete lines from a file, following it when asked to.
///
/// [`LineFollower::next_line`] is cancel safe: state only changes after an
/// awaited operation completes, so it can sit in a `tokio::select!` branch.
#[derive(Debug)]
pub struct LineFollower {
    path: PathBuf,
    mode: FollowMode,
    growth: Option<Growth>,
    file: Option<File>,
    identity: Option<FileIdentity>,
    offset: u64,
    pending: Vec<u8>,
    ready: VecDeque<String>,
    chunk: Vec<u8>,
    finished: bool,
}

impl LineFollower {
    /// Open `path` from its first byte.
    pub async fn open(path: impl Into<PathBuf>, mode: FollowMode) -> io::Result<Self> {
        let path = path.into();
        let growth = match mode {
            FollowMode::ToEnd => None,
            FollowMode::Follow { poll, interval } => Some(Growth::new(&path, poll, interval)),
        };

        let mut follower = Self {
            path,
            mode,
            growth,
            file: None,
            identity: None,
            offset: 0,
            pending: Vec::new(),
            ready: VecDeque::new(),
            chunk: vec![0; READ_CHUNK],
            finished: false,
        };
        follower.reopen().await?;
        Ok(follower)
    }

    /// Bytes read from the current file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    async fn reopen(&mut self) -> io::Result<()> {
        let file = File::open(&self.path).await?;
        let metadata = file.metadata().await?;

        self.identity = identity(&metadata);
        self.file = Some(file);
        self.offset = 0;
        Ok(())
    }

    /// Next non-empty line, or `None` once the input has ended.
    ///
    /// Only [`FollowMode::ToEnd`] ever ends; a follower keeps waiting.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.finished {
                return Ok(None);
            }

            if self.file.is_none() {
                match self.reopen().await {
                    Ok(()) => {
                        tracing::info!(file = %self.path.display(), "Reopened file");
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound && self.growth.is_some() => {
                        self.wait().await;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let Some(file) = self.file.as_mut() else {
                continue;
            };
            let read = file.read(&mut self.chunk).await?;
            if read > 0 {
                self.offset += read as u64;
                self.split(read);
                continue;
            }

            match self.mode {
                FollowMode::ToEnd => {
                    self.take_pending();
                    self.finished = true;
                }
                FollowMode::Follow { .. } => {
                    if !self.detect_rotation().await? {
                        self.wait().await;
                    }
                }
            }
        }
    }

    async fn wait(&mut self) {
        if let Some(growth) = self.growth.as_mut() {
            growth.wait().await;
        }
    }

    /// At end of file: has the path moved on to another file, or been truncated?
    async fn detect_rotation(&mut self) -> io::Result<bool> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            // Rotated away and not recreated yet; the old handle stays open.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        let current = identity(&metadata);
        if current.is_some() && current != self.identity {
            tracing::info!(file = %self.path.display(), "File rotated, following the new file");
            // The old file is fully drained; its unterminated tail is a line.
            self.take_pending();
            self.file = None;
            FILE_ROTATIONS.inc();
            return Ok(true);
        }

        if metadata.len() < self.offset {
            tracing::info!(
                file = %self.path.display(),
                size = metadata.len(),
                offset = self.offset,
                "File truncated, reading from the start"
            );
            self.pending.clear();
            self.file = None;
            FILE_ROTATIONS.inc();
            return Ok(true);
        }

        Ok(false)
    }

    fn split(&mut self, read: usize) {
        self.pending.extend_from_slice(&self.chunk[..read]);

        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            push_line(&mut self.ready, &self.pending[start..end]);
            start = end + 1;
        }
        self.pending.drain(..start);

        while self.pending.len() >= MAX_LINE_BYTES {
            tracing::warn!(file = %self.path.display(), "Line too long, splitting");
            let rest = self.pending.split_off(MAX_LINE_BYTES);
            push_line(&mut self.ready, &self.pending);
            self.pending = rest;
        }
    }

    fn take_pending(&mut self) {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            push_line(&mut self.ready, &pending);
        }
    }
}

fn push_line(ready: &mut VecDeque<String>, raw: &[u8]) {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if !raw.is_empty() {
        ready.push_back(String::from_utf8_lossy(raw).into_owned());
    }
}
