//! Best-effort IP geolocation.
//!
//! The MaxMind database is opened once and shared read-only between every
//! tailer. Lookups are independent of each other: a failed lookup leaves the
//! record's location empty and never affects the shared handle.

// Local crates
use crate::parser::models::{Country, Location, Request};

// External crates
use maxminddb::{MaxMindDbError, Reader, geoip2};
use std::{
    fmt,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("failed to open geoip database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: MaxMindDbError,
    },

    #[error("invalid ip address {0:?}")]
    InvalidIp(String),

    #[error("geoip lookup failed: {0}")]
    Lookup(#[from] MaxMindDbError),

    #[error("no geoip record for {0}")]
    NotFound(IpAddr),
}

/// Resolves an IP address to a [`Location`].
pub trait GeoLookup: Send + Sync + fmt::Debug {
    fn lookup(&self, ip: IpAddr) -> Result<Location, GeoError>;
}

/// City database lookup, English names plus the country ISO code.
#[derive(Clone)]
pub struct MaxMindLookup {
    path: PathBuf,
    reader: Arc<Reader<Vec<u8>>>,
}

impl MaxMindLookup {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GeoError> {
        let path = path.as_ref().to_path_buf();
        let reader = Reader::open_readfile(&path).map_err(|source| GeoError::Open {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(
            database = %path.display(),
            database_type = %reader.metadata.database_type,
            "Opened geoip database"
        );

        Ok(Self {
            path,
            reader: Arc::new(reader),
        })
    }
}

impl fmt::Debug for MaxMindLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaxMindLookup")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl GeoLookup for MaxMindLookup {
    fn lookup(&self, ip: IpAddr) -> Result<Location, GeoError> {
        let result = self.reader.lookup(ip)?;
        let city = result
            .decode::<geoip2::City>()?
            .ok_or(GeoError::NotFound(ip))?;

        Ok(Location {
            city: city.city.names.english.unwrap_or_default().to_string(),
            country: Country {
                name: city.country.names.english.unwrap_or_default().to_string(),
                iso_code: city.country.iso_code.unwrap_or_default().to_string(),
            },
        })
    }
}

/// Fills in `Request::location`. Never fails; a missing database disables it.
#[derive(Debug, Clone, Default)]
pub struct GeoEnricher {
    lookup: Option<Arc<dyn GeoLookup>>,
}

impl GeoEnricher {
    pub fn new(lookup: Arc<dyn GeoLookup>) -> Self {
        Self {
            lookup: Some(lookup),
        }
    }

    /// Enricher that leaves every location empty.
    pub fn disabled() -> Self {
        Self { lookup: None }
    }

    /// Open the database at `path`, or fall back to a disabled enricher.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match MaxMindLookup::open(path) {
            Ok(lookup) => Self::new(Arc::new(lookup)),
            Err(e) => {
                tracing::warn!(error = %e, "GeoIP enrichment disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lookup.is_some()
    }

    #[instrument(
        name = "request_shipper_enricher::enrich",
        target = "enricher::geoip::GeoEnricher",
        skip_all,
        level = "trace"
    )]
    pub fn enrich(&self, request: &mut Request) {
        let Some(lookup) = &self.lookup else {
            return;
        };

        let located = request
            .ip
            .parse::<IpAddr>()
            .map_err(|_| GeoError::InvalidIp(request.ip.clone()))
            .and_then(|ip| lookup.lookup(ip));

        match located {
            Ok(location) => request.location = location,
            Err(e) => tracing::warn!(ip = %request.ip, error = %e, "Could not locate ip"),
        }
    }
}
