//! Request shipper: tails web-server access logs, enriches every request with
//! geolocation data and ships the resulting points to InfluxDB (or prints them).
//!
//! ```text
//! Orchestrator -> FileTailer -> LineParser -> GeoEnricher -> data channel
//!                                                               |
//!                                   Sink <- RecordPoint <- BatchDeliverer
//! ```

pub mod cli;
pub mod deliverer;
pub mod enricher;
pub mod helpers;
pub mod instrumentation;
pub mod metrics;
pub mod orchestrator;
pub mod parser;
pub mod point;
pub mod registry;
pub mod runtime;
pub mod sink;
pub mod tailer;
