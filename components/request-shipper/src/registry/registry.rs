//! Per-file control and data channels.
//!
//! Every discovered file owns exactly one entry: a stop channel used to tell its
//! tailer to close, and the data channel connecting the tailer to its
//! deliverer. Both have capacity 1, so a slow deliverer stalls its tailer.
//!
//! The registry keeps only the *sending* halves. Removing an entry drops them,
//! which closes the stop channel for the tailer and, once the tailer's own
//! data sender is gone too, the data channel for the deliverer.

// Local crates
use crate::parser::models::Request;

// External crates
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Depth of both per-file channels.
pub const CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("cannot register an empty path")]
    EmptyPath,

    #[error("{0} is already registered")]
    AlreadyRegistered(PathBuf),
}

/// Sending halves kept by the registry for one path.
#[derive(Debug, Clone)]
pub struct ControlPair {
    pub stop: mpsc::Sender<()>,
    pub data: mpsc::Sender<Request>,
}

/// Everything a new tailer/deliverer pair needs, handed out by [`FileRegistry::add`].
#[derive(Debug)]
pub struct ControlEnds {
    /// Cleanup guard; dropping it removes the path from the registry.
    pub registration: Registration,
    /// Tailer side: stop tokens.
    pub stop: mpsc::Receiver<()>,
    /// Tailer side: where records go.
    pub data_tx: mpsc::Sender<Request>,
    /// Deliverer side.
    pub data_rx: mpsc::Receiver<Request>,
}

#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    inner: Arc<Mutex<HashMap<PathBuf, ControlPair>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map half-updated.
    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, ControlPair>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and register the channel pair for `path`.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<ControlEnds, RegistryError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(RegistryError::EmptyPath);
        }

        let mut entries = self.entries();
        if entries.contains_key(path) {
            return Err(RegistryError::AlreadyRegistered(path.to_path_buf()));
        }

        let (stop_tx, stop_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(CHANNEL_CAPACITY);
        entries.insert(
            path.to_path_buf(),
            ControlPair {
                stop: stop_tx,
                data: data_tx.clone(),
            },
        );
        drop(entries);

        tracing::debug!(file = %path.display(), "Registered control channels");

        Ok(ControlEnds {
            registration: Registration {
                registry: self.clone(),
                path: path.to_path_buf(),
            },
            stop: stop_rx,
            data_tx,
            data_rx,
        })
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<ControlPair> {
        self.entries().get(path.as_ref()).cloned()
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.entries().contains_key(path.as_ref())
    }

    /// Remove `path` and close its channels. No-op when absent.
    pub fn delete(&self, path: impl AsRef<Path>) {
        let removed = self.entries().remove(path.as_ref());
        if removed.is_some() {
            tracing::debug!(file = %path.as_ref().display(), "Removed control channels");
        }
    }

    /// Post a stop token to `path`'s tailer. A token already pending is not duplicated.
    pub fn send(&self, path: impl AsRef<Path>) {
        let Some(pair) = self.get(path.as_ref()) else {
            return;
        };
        match pair.stop.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => {
                tracing::trace!(file = %path.as_ref().display(), "Tailer already stopped");
            }
        }
    }

    /// Post a stop token to every registered path.
    pub fn send_all(&self) {
        let stops: Vec<(PathBuf, mpsc::Sender<()>)> = self
            .entries()
            .iter()
            .map(|(path, pair)| (path.clone(), pair.stop.clone()))
            .collect();

        tracing::debug!(files = stops.len(), "Stopping every registered file");
        for (path, stop) in stops {
            if let Err(TrySendError::Closed(())) = stop.try_send(()) {
                tracing::trace!(file = %path.display(), "Tailer already stopped");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries().keys().cloned().collect()
    }
}

/// Removes its path from the registry when dropped.
#[derive(Debug)]
pub struct Registration {
    registry: FileRegistry,
    path: PathBuf,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.delete(&self.path);
    }
}
