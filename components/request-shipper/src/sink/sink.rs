//! Metrics sink contract.
//!
//! A sink is owned by exactly one deliverer. The deliverer probes it with
//! `connect`, writes whole batches with `write` and calls `close` once on exit.

// Local crates
use crate::point::point::Point;

// External crates
use async_trait::async_trait;
use hyper::StatusCode;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid sink url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid database name {0:?}")]
    InvalidDatabase(String),

    #[error("failed to build request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("transport error: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read response body: {0}")]
    Body(#[from] hyper::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("sink is closed")]
    Closed,

    /// Failures from sinks that are not HTTP based.
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Check the sink is reachable and ready to accept writes.
    async fn connect(&self) -> Result<(), SinkError>;

    /// Round-trip time of a liveness probe.
    async fn ping(&self) -> Result<Duration, SinkError>;

    /// Write one batch. Points are not retried by the sink.
    async fn write(&self, points: &[Point]) -> Result<(), SinkError>;

    /// Release the sink. Later calls fail with [`SinkError::Closed`].
    async fn close(&self);
}

/// Creates one sink per delivery session.
pub trait SinkFactory: Send + Sync + fmt::Debug {
    fn create(&self) -> Result<Arc<dyn MetricsSink>, SinkError>;
}
