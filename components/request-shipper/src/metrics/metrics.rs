// External crates
use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntGauge, register_histogram, register_int_counter, register_int_gauge,
};
use std::time::Instant;

/// Helper to observe histogram duration
pub fn observe_duration(hist: &Histogram, start: Instant) {
    let elapsed = start.elapsed().as_secs_f64();
    hist.observe(elapsed);
}

lazy_static! {
    // ======== Ingestion ========

    /// Raw lines read from every followed file
    pub static ref LINES_READ: IntCounter = register_int_counter!(
        "request_shipper_lines_read_total",
        "Raw lines read from access-log files"
    ).unwrap();

    /// Lines matching neither log grammar, or with a local host
    pub static ref LINES_REJECTED: IntCounter = register_int_counter!(
        "request_shipper_lines_rejected_total",
        "Lines rejected by the parser"
    ).unwrap();

    /// Lines dropped for being older than the configured line age
    pub static ref LINES_EXPIRED: IntCounter = register_int_counter!(
        "request_shipper_lines_expired_total",
        "Lines dropped for exceeding the maximum line age"
    ).unwrap();

    /// Records pushed onto a data channel
    pub static ref RECORDS_FORWARDED: IntCounter = register_int_counter!(
        "request_shipper_records_forwarded_total",
        "Parsed records handed to a deliverer"
    ).unwrap();

    /// Files currently followed by a tailer
    pub static ref ACTIVE_FILES: IntGauge = register_int_gauge!(
        "request_shipper_active_files",
        "Files currently being tailed"
    ).unwrap();

    /// Rotations and truncations detected while following
    pub static ref FILE_ROTATIONS: IntCounter = register_int_counter!(
        "request_shipper_file_rotations_total",
        "File rotations or truncations detected"
    ).unwrap();

    // ======== Delivery ========

    /// Points successfully written to the sink
    pub static ref POINTS_FLUSHED: IntCounter = register_int_counter!(
        "request_shipper_points_flushed_total",
        "Points written to the metrics sink"
    ).unwrap();

    /// Batches lost to a failed flush
    pub static ref FLUSH_FAILURES: IntCounter = register_int_counter!(
        "request_shipper_flush_failures_total",
        "Batch flushes that failed"
    ).unwrap();

    /// Wall time of a flush, connection check included
    pub static ref FLUSH_DURATION_SECONDS: Histogram = register_histogram!(
        "request_shipper_flush_duration_seconds",
        "Histogram of batch flush durations in seconds",
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();
}
