//! InfluxDB 1.x HTTP sink.
//!
//! Speaks the three endpoints the shipper needs: `GET /ping` for liveness,
//! `POST /query` to create the target database once, and `POST /write` with a
//! line-protocol body in seconds precision. Plain HTTP only.

// Local crates
use crate::{
    helpers::load_config::InfluxConfig,
    point::point::{Point, Precision},
    sink::sink::{MetricsSink, SinkError, SinkFactory},
};

// External crates
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Uri,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue},
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::instrument;

/// Longest response body kept in an error.
const MAX_ERROR_BODY: usize = 512;

fn valid_database(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub struct InfluxSink {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    database: String,
    auth: Option<HeaderValue>,
    timeout: Duration,
    database_ready: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for InfluxSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxSink")
            .field("base_url", &self.base_url)
            .field("database", &self.database)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let base_url = config.url.trim().trim_end_matches('/').to_string();
        let invalid = |reason: &str| SinkError::InvalidUrl {
            url: config.url.clone(),
            reason: reason.to_string(),
        };

        let uri: Uri = base_url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(invalid(&format!("unsupported scheme {other}"))),
            None => return Err(invalid("missing scheme")),
        }
        if uri.host().is_none() {
            return Err(invalid("missing host"));
        }

        if !valid_database(&config.database) {
            return Err(SinkError::InvalidDatabase(config.database.clone()));
        }

        let auth = if config.username.is_empty() {
            None
        } else {
            let credentials = STANDARD.encode(format!("{}:{}", config.username, config.password));
            let mut value = HeaderValue::from_str(&format!("Basic {credentials}"))
                .map_err(|e| invalid(&e.to_string()))?;
            value.set_sensitive(true);
            Some(value)
        };

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url,
            database: config.database.clone(),
            auth,
            timeout: config.timeout(),
            database_ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        Ok(())
    }

    /// Send one request and return the response body of a 2xx answer.
    async fn send(
        &self,
        method: Method,
        path_and_query: &str,
        body: Bytes,
    ) -> Result<Bytes, SinkError> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base_url, path_and_query));
        if let Some(auth) = &self.auth {
            builder = builder.header(AUTHORIZATION, auth.clone());
        }
        if !body.is_empty() {
            builder = builder.header(CONTENT_TYPE, "text/plain; charset=utf-8");
        }
        let request = builder.body(Full::new(body))?;

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, SinkError>((status, body))
        };
        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| SinkError::Timeout(self.timeout))??;

        if !status.is_success() {
            let shown = &body[..body.len().min(MAX_ERROR_BODY)];
            return Err(SinkError::Status {
                status,
                body: String::from_utf8_lossy(shown).trim().to_string(),
            });
        }
        Ok(body)
    }

    async fn create_database(&self) -> Result<(), SinkError> {
        tracing::debug!(database = %self.database, "Creating Influx database if not exists");
        let query = format!("/query?q=CREATE%20DATABASE%20%22{}%22", self.database);
        self.send(Method::POST, &query, Bytes::new()).await?;
        tracing::debug!(database = %self.database, "Influx database created");
        Ok(())
    }
}

#[async_trait]
impl MetricsSink for InfluxSink {
    #[instrument(
        name = "request_shipper_influx::connect",
        target = "sink::influx::InfluxSink",
        skip_all,
        level = "debug"
    )]
    async fn connect(&self) -> Result<(), SinkError> {
        self.ensure_open()?;
        let latency = self.ping().await?;
        tracing::debug!(latency_ms = latency.as_millis() as u64, "Influx response time");

        if !self.database_ready.load(Ordering::Acquire) {
            self.create_database().await?;
            self.database_ready.store(true, Ordering::Release);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, SinkError> {
        self.ensure_open()?;
        let start = Instant::now();
        self.send(Method::GET, "/ping", Bytes::new()).await?;
        Ok(start.elapsed())
    }

    #[instrument(
        name = "request_shipper_influx::write",
        target = "sink::influx::InfluxSink",
        skip_all,
        fields(points = points.len()),
        level = "debug"
    )]
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        self.ensure_open()?;
        if points.is_empty() {
            return Ok(());
        }

        let body = points
            .iter()
            .map(|point| point.to_line_protocol(Precision::Seconds))
            .collect::<Vec<_>>()
            .join("\n");
        let path = format!(
            "/write?db={}&precision={}",
            self.database,
            Precision::Seconds.as_str()
        );

        let start = Instant::now();
        self.send(Method::POST, &path, Bytes::from(body)).await?;
        tracing::debug!(
            points = points.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Wrote batch points"
        );
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Closing Influx connection");
        }
    }
}

/// Builds one [`InfluxSink`] per delivery session.
#[derive(Debug, Clone)]
pub struct InfluxSinkFactory {
    config: InfluxConfig,
}

impl InfluxSinkFactory {
    pub fn new(config: InfluxConfig) -> Self {
        Self { config }
    }
}

impl SinkFactory for InfluxSinkFactory {
    fn create(&self) -> Result<Arc<dyn MetricsSink>, SinkError> {
        Ok(Arc::new(InfluxSink::new(&self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::Request as AccessRequest;
    use chrono::{TimeZone, Utc};
    use hyper::{Response, StatusCode, body::Incoming, service::service_fn};
    use hyper_util::{rt::TokioIo, server::conn::auto::Builder as HyperServerBuilder};
    use std::{convert::Infallible, sync::Mutex};
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct Recorded {
        method: Method,
        uri: String,
        auth: Option<String>,
        body: String,
    }

    type Seen = Arc<Mutex<Vec<Recorded>>>;

    /// Minimal InfluxDB stand-in answering with `write_status` on `/write`.
    async fn spawn_influx(write_status: StatusCode) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Seen = Arc::default();

        let recorder = seen.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let recorder = recorder.clone();
                let service = service_fn(move |req: hyper::Request<Incoming>| {
                    let recorder = recorder.clone();
                    async move {
                        let method = req.method().clone();
                        let uri = req.uri().to_string();
                        let auth = req
                            .headers()
                            .get(AUTHORIZATION)
                            .map(|v| v.to_str().unwrap().to_string());
                        let body = req.into_body().collect().await.unwrap().to_bytes();

                        let status = match uri.split('?').next() {
                            Some("/ping") => StatusCode::NO_CONTENT,
                            Some("/query") => StatusCode::OK,
                            Some("/write") => write_status,
                            _ => StatusCode::NOT_FOUND,
                        };
                        recorder.lock().unwrap().push(Recorded {
                            method,
                            uri,
                            auth,
                            body: String::from_utf8(body.to_vec()).unwrap(),
                        });

                        let mut response = Response::new(Full::new(Bytes::from_static(
                            b"{\"error\":\"boom\"}",
                        )));
                        *response.status_mut() = status;
                        Ok::<_, Infallible>(response)
                    }
                });
                tokio::spawn(async move {
                    let _ = HyperServerBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (format!("http://{addr}/"), seen)
    }

    fn config(url: &str) -> InfluxConfig {
        InfluxConfig {
            url: url.to_string(),
            database: "requests".to_string(),
            timeout_ms: 2_000,
            ..Default::default()
        }
    }

    fn point(uid: &str) -> Point {
        Point::from_request(&AccessRequest {
            ip: "10.0.0.1".to_string(),
            host: "example.com".to_string(),
            uid: uid.to_string(),
            timestamp: Utc.with_ymd_and_hms(2016, 3, 21, 2, 33, 29).unwrap(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_creates_database_once() {
        let (url, seen) = spawn_influx(StatusCode::NO_CONTENT).await;
        let sink = InfluxSink::new(&config(&url)).unwrap();

        sink.connect().await.unwrap();
        sink.connect().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        let uris: Vec<&str> = seen.iter().map(|r| r.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec![
                "/ping",
                "/query?q=CREATE%20DATABASE%20%22requests%22",
                "/ping"
            ]
        );
        assert_eq!(seen[1].method, Method::POST);
        assert!(seen.iter().all(|r| r.auth.is_none()));
    }

    #[tokio::test]
    async fn test_write_sends_line_protocol_in_seconds() {
        let (url, seen) = spawn_influx(StatusCode::NO_CONTENT).await;
        let mut config = config(&url);
        config.username = "shipper".to_string();
        config.password = "secret".to_string();
        let sink = InfluxSink::new(&config).unwrap();

        sink.write(&[point("a"), point("b")]).await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].uri, "/write?db=requests&precision=s");
        assert_eq!(
            seen[0].auth.as_deref(),
            Some(format!("Basic {}", STANDARD.encode("shipper:secret")).as_str())
        );
        let lines: Vec<&str> = seen[0].body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" 1458527609"));
        assert!(lines[1].contains("uid=\"b\""));
    }

    #[tokio::test]
    async fn test_write_error_status_is_reported() {
        let (url, _seen) = spawn_influx(StatusCode::INTERNAL_SERVER_ERROR).await;
        let sink = InfluxSink::new(&config(&url)).unwrap();

        let err = sink.write(&[point("a")]).await.unwrap_err();

        match err {
            SinkError::Status { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert!(body.contains("boom"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_write_is_a_noop() {
        let (url, seen) = spawn_influx(StatusCode::NO_CONTENT).await;
        let sink = InfluxSink::new(&config(&url)).unwrap();

        sink.write(&[]).await.unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut config = config(&format!("http://{addr}"));
        config.timeout_ms = 100;
        let sink = InfluxSink::new(&config).unwrap();

        assert!(matches!(sink.ping().await, Err(SinkError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_calls() {
        let (url, seen) = spawn_influx(StatusCode::NO_CONTENT).await;
        let sink = InfluxSink::new(&config(&url)).unwrap();

        sink.close().await;

        assert!(matches!(sink.connect().await, Err(SinkError::Closed)));
        assert!(matches!(
            sink.write(&[point("a")]).await,
            Err(SinkError::Closed)
        ));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_settings() {
        assert!(matches!(
            InfluxSink::new(&config("https://influx.example.com")),
            Err(SinkError::InvalidUrl { .. })
        ));
        assert!(matches!(
            InfluxSink::new(&config("localhost:8086")),
            Err(SinkError::InvalidUrl { .. })
        ));

        let mut bad_db = config("http://localhost:8086");
        bad_db.database = "requests; DROP".to_string();
        assert!(matches!(
            InfluxSink::new(&bad_db),
            Err(SinkError::InvalidDatabase(_))
        ));
    }
}
