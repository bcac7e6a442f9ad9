//! Sink-ready metric points and their InfluxDB line-protocol form.
//!
//! Every request becomes one point in the `requests` measurement. Tags and
//! fields are kept in ordered maps so the wire form is deterministic.

// Local crates
use crate::parser::models::Request;

// External crates
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, fmt::Write};
use thiserror::Error;

pub const REQUESTS_MEASUREMENT: &str = "requests";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PointError {
    #[error("point measurement is empty")]
    EmptyMeasurement,

    #[error("point has an empty tag or field key")]
    EmptyKey,

    #[error("point has no fields")]
    NoFields,

    #[error("tag {0:?} contains a newline")]
    NewlineInTag(String),

    #[error("timestamp {0} cannot be represented in nanoseconds")]
    TimestampOutOfRange(DateTime<Utc>),
}

/// Timestamp precision of the rendered line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Nanoseconds,
    Seconds,
}

impl Precision {
    /// Query-string value understood by the InfluxDB write endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nanoseconds => "ns",
            Self::Seconds => "s",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(
        measurement: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, PointError> {
        let measurement = measurement.into();
        if measurement.is_empty() {
            return Err(PointError::EmptyMeasurement);
        }
        if fields.is_empty() {
            return Err(PointError::NoFields);
        }
        if tags.keys().chain(fields.keys()).any(String::is_empty) {
            return Err(PointError::EmptyKey);
        }
        if let Some((key, _)) = tags
            .iter()
            .find(|(key, value)| key.contains('\n') || value.contains('\n'))
        {
            return Err(PointError::NewlineInTag(key.clone()));
        }
        if timestamp.timestamp_nanos_opt().is_none() {
            return Err(PointError::TimestampOutOfRange(timestamp));
        }

        Ok(Self {
            measurement,
            tags,
            fields,
            timestamp,
        })
    }

    /// Project a request onto the `requests` measurement.
    pub fn from_request(request: &Request) -> Result<Self, PointError> {
        let tags = BTreeMap::from([
            ("host".to_string(), request.host.clone()),
            ("ip".to_string(), request.ip.clone()),
            ("uid".to_string(), request.uid.clone()),
            ("method".to_string(), request.method.clone()),
            ("path".to_string(), request.path.clone()),
            ("status".to_string(), request.status.clone()),
            ("city".to_string(), request.location.city.clone()),
            ("country".to_string(), request.location.country.name.clone()),
            (
                "country_isocode".to_string(),
                request.location.country.iso_code.clone(),
            ),
        ]);
        let fields = BTreeMap::from([
            ("ip".to_string(), request.ip.clone()),
            ("uid".to_string(), request.uid.clone()),
        ]);

        Self::new(REQUESTS_MEASUREMENT, tags, fields, request.timestamp)
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Render one line of line protocol, without the trailing newline.
    /// Tags with empty values are omitted.
    pub fn to_line_protocol(&self, precision: Precision) -> String {
        let mut line = String::with_capacity(128);
        escape_into(&mut line, &self.measurement, &[',', ' ']);

        for (key, value) in self.tags.iter().filter(|(_, v)| !v.is_empty()) {
            line.push(',');
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, value, &[',', '=', ' ']);
        }

        let mut separator = ' ';
        for (key, value) in &self.fields {
            line.push(separator);
            separator = ',';
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push_str("=\"");
            escape_into(&mut line, value, &['"', '\\']);
            line.push('"');
        }

        let timestamp = match precision {
            // Range checked in `Point::new`.
            Precision::Nanoseconds => self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            Precision::Seconds => self.timestamp.timestamp(),
        };
        let _ = write!(line, " {timestamp}");

        line
    }
}

fn escape_into(out: &mut String, value: &str, special: &[char]) {
    for c in value.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}
