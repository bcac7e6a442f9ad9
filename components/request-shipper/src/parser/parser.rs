//! Access-log line parsing.
//!
//! Two nginx `log_format` layouts are supported. The newer one (V2) carries the
//! proxy address behind the forwarded-for header:
//!
//! ```text
//! '[$time_local] $http_host $remote_addr $http_x_forwarded_for, $proxy_address '
//! '"$request" $status $body_bytes_sent "$http_referer" '
//! '"$http_user_agent" $request_time $upstream_response_time "$http_x_install_uuid"'
//! ```
//!
//! The older one (V1) is the same layout for direct connections, without
//! `, $proxy_address`. V2 is always tried first.
//!
//! Lines matching neither layout, and lines whose host is `-` or `localhost`,
//! are rejected: [`LineParser::parse`] returns `None` and callers skip them
//! silently. Failures in individual fields (request line, timestamp) are
//! logged and degrade only that field.

// Local crates
use crate::parser::models::Request;

// External crates
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use thiserror::Error;
use tracing::instrument;

/// nginx `$time_local` format, e.g. `21/Mar/2016:02:33:29 +0000`.
pub const TIME_LOCAL_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

const LOG_FORMAT_V2: &str = r#"^\[([^\]]+)\] ([^ ]+) ([^ ]+) ([^ ]+), ([^ ]+) "([^"]*)" ([^ ]+) ([^ ]+) "([^"]*)" "([^"]*)" ([^ ]+) ([^ ]+) "([^"]*)""#;
const LOG_FORMAT_V1: &str = r#"^\[([^\]]+)\] ([^ ]+) ([^ ]+) ([^ ]+) "([^"]*)" ([^ ]+) ([^ ]+) "([^"]*)" "([^"]*)" ([^ ]+) ([^ ]+) "([^"]*)""#;

/// Forwarded-for values shorter than this are treated as absent ("-", "").
const MIN_FORWARDED_LEN: usize = 7;

/// Capture slots shared by both layouts.
const SLOT_TIME: usize = 1;
const SLOT_HOST: usize = 2;
const SLOT_REMOTE_ADDR: usize = 3;
const SLOT_FORWARDED_FOR: usize = 4;
/// Newer layout only: the hop that appended itself to the forwarded chain.
const SLOT_PROXY_ADDR: usize = 5;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid log grammar: {0}")]
    Grammar(#[from] regex::Error),

    #[error("invalid request format: {0:?}")]
    RequestLine(String),

    #[error("invalid timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Supported access-log layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    V1,
    V2,
}

/// Version-specific capture positions.
#[derive(Debug, Clone, Copy)]
struct Slots {
    request: usize,
    status: usize,
    referer: usize,
    agent: usize,
    uid: usize,
}

impl LogFormat {
    /// Layout for a given number of capture slots (the whole match included).
    /// Any other arity is a rejection.
    pub fn from_arity(arity: usize) -> Option<Self> {
        match arity {
            14 => Some(Self::V2),
            13 => Some(Self::V1),
            _ => None,
        }
    }

    fn slots(self) -> Slots {
        match self {
            Self::V2 => Slots {
                request: 6,
                status: 7,
                referer: 9,
                agent: 10,
                uid: 13,
            },
            Self::V1 => Slots {
                request: 5,
                status: 6,
                referer: 8,
                agent: 9,
                uid: 12,
            },
        }
    }
}

/// Stateless matcher for the two supported access-log grammars.
///
/// The regexes are compiled once; a single parser is shared by every tailer.
#[derive(Debug)]
pub struct LineParser {
    v2: Regex,
    v1: Regex,
}

impl LineParser {
    pub fn new() -> Result<Self, ParseError> {
        Ok(Self {
            v2: Regex::new(LOG_FORMAT_V2)?,
            v1: Regex::new(LOG_FORMAT_V1)?,
        })
    }

    /// Parse one raw line into a [`Request`], or `None` if the line is rejected.
    ///
    /// Location is left empty; enrichment happens downstream.
    #[instrument(
        name = "request_shipper_parser::parse",
        target = "parser::parser::LineParser",
        skip_all,
        level = "trace"
    )]
    pub fn parse(&self, line: &str) -> Option<Request> {
        let captures = self
            .v2
            .captures(line)
            .or_else(|| self.v1.captures(line))?;

        let format = LogFormat::from_arity(captures.len())?;
        let host = slot(&captures, SLOT_HOST);
        if host == "-" || host == "localhost" {
            tracing::trace!(host = %host, "Rejecting request line for local host");
            return None;
        }

        // An unset forwarded-for must not let the proxy hop stand in for the client.
        let forwarded = slot(&captures, SLOT_FORWARDED_FOR);
        let forwarded_for = match format {
            LogFormat::V2 if forwarded.len() >= MIN_FORWARDED_LEN => {
                format!("{forwarded}, {}", slot(&captures, SLOT_PROXY_ADDR))
            }
            _ => forwarded.to_string(),
        };

        let slots = format.slots();
        let mut request = Request {
            ip: client_ip(slot(&captures, SLOT_REMOTE_ADDR), &forwarded_for),
            host: host.to_string(),
            status: slot(&captures, slots.status).to_string(),
            referer: slot(&captures, slots.referer).to_string(),
            agent: slot(&captures, slots.agent).to_string(),
            uid: slot(&captures, slots.uid).to_string(),
            ..Default::default()
        };

        match parse_timestamp(slot(&captures, SLOT_TIME)) {
            Ok(timestamp) => request.timestamp = timestamp,
            Err(e) => tracing::error!(error = %e, "Could not parse timestamp"),
        }

        match parse_request_line(slot(&captures, slots.request)) {
            Ok((method, path, proto)) => {
                request.method = method.to_string();
                request.path = path.to_string();
                request.proto = proto.to_string();
            }
            Err(e) => tracing::error!(error = %e, "Could not parse request"),
        }

        Some(request)
    }
}

fn slot<'h>(captures: &Captures<'h>, index: usize) -> &'h str {
    captures.get(index).map_or("", |m| m.as_str())
}

/// Prefer a populated forwarded-for value over the remote address. A forwarded
/// chain keeps only its last element, the closest hop.
pub fn client_ip(remote_addr: &str, forwarded_for: &str) -> String {
    let chosen = if forwarded_for.len() < MIN_FORWARDED_LEN {
        remote_addr
    } else {
        forwarded_for
    };

    chosen
        .rsplit(',')
        .next()
        .unwrap_or(chosen)
        .trim()
        .to_string()
}

/// Split `"GET /index.html HTTP/1.1"` into method, path and protocol.
pub fn parse_request_line(value: &str) -> Result<(&str, &str, &str), ParseError> {
    let chunks: Vec<&str> = value.split(' ').collect();
    match chunks.as_slice() {
        [method, path, proto] => Ok((method, path, proto)),
        _ => Err(ParseError::RequestLine(value.to_string())),
    }
}

/// Parse an nginx `$time_local` value into UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_str(value, TIME_LOCAL_FORMAT)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| ParseError::Timestamp {
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LINE_V1: &str = r#"[21/Mar/2016:02:33:29 +0000] example.com 10.0.0.1 - "GET /index.html HTTP/1.1" 200 512 "-" "curl/7.0" 0.001 - "uid-1""#;

    fn parser() -> LineParser {
        LineParser::new().unwrap()
    }

    #[test]
    fn test_parse_v1_line() {
        let request = parser().parse(LINE_V1).unwrap();

        assert_eq!(request.host, "example.com");
        assert_eq!(request.ip, "10.0.0.1");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/index.html");
        assert_eq!(request.proto, "HTTP/1.1");
        assert_eq!(request.status, "200");
        assert_eq!(request.referer, "-");
        assert_eq!(request.agent, "curl/7.0");
        assert_eq!(request.uid, "uid-1");
        assert_eq!(
            request.timestamp,
            Utc.with_ymd_and_hms(2016, 3, 21, 2, 33, 29).unwrap()
        );
        assert!(request.location.is_empty());
    }

    #[test]
    fn test_parse_v1_forwarded_chain_uses_last_hop() {
        let line = r#"[21/Mar/2016:02:33:29 +0000] example.com 10.0.0.9 203.0.113.5,10.0.0.1 "GET /index.html HTTP/1.1" 200 512 "-" "curl/7.0" 0.001 - "uid-1""#;
        let request = parser().parse(line).unwrap();

        assert_eq!(request.ip, "10.0.0.1");
    }

    #[test]
    fn test_parse_v2_line() {
        let line = r#"[21/Mar/2016:02:33:29 +0100] shop.example.com 172.16.0.4 198.51.100.23, 162.158.1.1 "POST /api/cart HTTP/2.0" 201 48 "https://shop.example.com/" "Mozilla/5.0" 0.120 0.118 "install-42""#;
        let request = parser().parse(line).unwrap();

        assert_eq!(request.host, "shop.example.com");
        assert_eq!(request.ip, "162.158.1.1");
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/api/cart");
        assert_eq!(request.proto, "HTTP/2.0");
        assert_eq!(request.status, "201");
        assert_eq!(request.referer, "https://shop.example.com/");
        assert_eq!(request.agent, "Mozilla/5.0");
        assert_eq!(request.uid, "install-42");
        assert_eq!(
            request.timestamp,
            Utc.with_ymd_and_hms(2016, 3, 21, 1, 33, 29).unwrap()
        );
    }

    #[test]
    fn test_parse_v2_forwarded_chain_uses_last_hop() {
        let line = r#"[21/Mar/2016:02:33:29 +0000] example.com 10.0.0.9 203.0.113.5, 10.0.0.1 "GET / HTTP/1.1" 200 512 "-" "curl/7.0" 0.001 0.001 "uid-2""#;
        let request = parser().parse(line).unwrap();

        assert_eq!(request.ip, "10.0.0.1");
        assert_eq!(request.uid, "uid-2");

        let longer = r#"[21/Mar/2016:02:33:29 +0000] example.com 10.0.0.9 203.0.113.5,10.0.0.1, 172.16.0.1 "GET / HTTP/1.1" 200 512 "-" "curl/7.0" 0.001 0.001 "uid-2""#;
        assert_eq!(parser().parse(longer).unwrap().ip, "172.16.0.1");
    }

    #[test]
    fn test_parse_v2_unset_forwarded_for_uses_remote_addr() {
        let line = r#"[21/Mar/2016:02:33:29 +0000] example.com 10.0.0.9 -, 162.158.1.1 "GET / HTTP/1.1" 200 512 "-" "curl/7.0" 0.001 0.001 "uid-2""#;
        let request = parser().parse(line).unwrap();

        assert_eq!(request.ip, "10.0.0.9");
        assert_eq!(request.uid, "uid-2");
    }

    #[test]
    fn test_short_forwarded_for_falls_back_to_remote_addr() {
        assert_eq!(client_ip("10.0.0.1", "-"), "10.0.0.1");
        assert_eq!(client_ip("10.0.0.1", "1.2.3"), "10.0.0.1");
        assert_eq!(client_ip("10.0.0.1", "1.2.3.4"), "1.2.3.4");
        assert_eq!(client_ip("10.0.0.1", "203.0.113.5, 10.0.0.7"), "10.0.0.7");
    }

    #[test]
    fn test_rejects_local_hosts() {
        let dash = LINE_V1.replace("example.com", "-");
        let localhost = LINE_V1.replace("example.com", "localhost");

        assert!(parser().parse(&dash).is_none());
        assert!(parser().parse(&localhost).is_none());
    }

    #[test]
    fn test_rejects_unknown_layout() {
        let combined = r#"192.168.1.1 - - [17/Dec/2025:10:15:32 +0000] "GET /api/users HTTP/1.1" 200 1234 "-" "Mozilla/5.0""#;

        assert!(parser().parse(combined).is_none());
        assert!(parser().parse("").is_none());
    }

    #[test]
    fn test_arity_selects_layout() {
        assert_eq!(LogFormat::from_arity(14), Some(LogFormat::V2));
        assert_eq!(LogFormat::from_arity(13), Some(LogFormat::V1));
        assert_eq!(LogFormat::from_arity(12), None);
        assert_eq!(LogFormat::from_arity(15), None);
    }

    #[test]
    fn test_bad_request_line_keeps_record() {
        let line = LINE_V1.replace("GET /index.html HTTP/1.1", "GARBAGE");
        let request = parser().parse(&line).unwrap();

        assert_eq!(request.method, "");
        assert_eq!(request.path, "");
        assert_eq!(request.proto, "");
        assert_eq!(request.status, "200");
    }

    #[test]
    fn test_bad_timestamp_keeps_zero_value() {
        let line = LINE_V1.replace("21/Mar/2016:02:33:29 +0000", "yesterday");
        let request = parser().parse(&line).unwrap();

        assert_eq!(request.timestamp, DateTime::<Utc>::default());
        assert_eq!(request.host, "example.com");
    }

    #[test]
    fn test_status_kept_verbatim() {
        let line = LINE_V1.replace(" 200 512 ", " - 0 ");
        let request = parser().parse(&line).unwrap();

        assert_eq!(request.status, "-");
    }

    #[test]
    fn test_parse_request_line_arity() {
        assert!(parse_request_line("GET / HTTP/1.1").is_ok());
        assert!(parse_request_line("GET /").is_err());
        assert!(parse_request_line("GET / HTTP/1.1 extra").is_err());
    }
}
