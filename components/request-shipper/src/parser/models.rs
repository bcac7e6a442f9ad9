// External crates
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Country portion of a request's location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ISOCode")]
    pub iso_code: String,
}

/// Remote IP location, filled in by the `GeoEnricher`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub city: String,
    pub country: Country,
}

impl Location {
    /// True when no lookup has populated any field yet.
    pub fn is_empty(&self) -> bool {
        self.city.is_empty() && self.country.name.is_empty() && self.country.iso_code.is_empty()
    }
}

/// One access-log request, built from a single raw line.
///
/// A `Request` is immutable once it has been pushed onto a file's data
/// channel; the writer side consumes it exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Remote IP address of the client
    pub ip: String,
    /// HTTP protocol
    pub proto: String,
    /// Request method (GET, POST, etc)
    pub method: String,
    /// Requested hostname
    pub host: String,
    /// Requested path
    pub path: String,
    /// Response status code, kept verbatim ("200", "-", ...)
    pub status: String,
    /// Referer (usually "-")
    pub referer: String,
    /// User agent string
    pub agent: String,
    /// Client install/session identifier
    pub uid: String,
    /// Remote IP location
    pub location: Location,
    /// Request timestamp (UTC), Unix epoch when the log timestamp was unparseable
    pub timestamp: DateTime<Utc>,
}
