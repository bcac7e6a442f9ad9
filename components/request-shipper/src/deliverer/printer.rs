// Local crates
use crate::{
    deliverer::deliverer::DeliveryOutcome,
    helpers::load_config::OutputFormat,
    parser::models::Request,
    point::point::{Point, PointError, Precision},
};

// External crates
use std::{
    fmt,
    io::{self, Write},
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to encode request as json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to build point: {0}")]
    Point(#[from] PointError),
}

/// Shared line-oriented preview destination. Each line is written whole.
#[derive(Clone)]
pub struct PreviewOutput {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl fmt::Debug for PreviewOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewOutput").finish_non_exhaustive()
    }
}

impl PreviewOutput {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut out = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

/// Print-mode writer: one JSON document or nanosecond line-protocol point per record.
#[derive(Debug, Clone)]
pub struct Printer {
    format: OutputFormat,
    output: PreviewOutput,
}

impl Printer {
    pub fn new(format: OutputFormat, output: PreviewOutput) -> Self {
        Self { format, output }
    }

    pub fn render(&self, request: &Request) -> Result<String, RenderError> {
        match self.format {
            OutputFormat::Json => Ok(serde_json::to_string(request)?),
            OutputFormat::Influx => {
                Ok(Point::from_request(request)?.to_line_protocol(Precision::Nanoseconds))
            }
        }
    }

    #[instrument(
        name = "request_shipper_printer::run",
        target = "deliverer::printer::Printer",
        skip_all,
        level = "debug"
    )]
    pub async fn run(self, mut data: mpsc::Receiver<Request>) -> DeliveryOutcome {
        while let Some(request) = data.recv().await {
            let line = match self.render(&request) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping record that cannot be printed");
                    continue;
                }
            };
            if let Err(e) = self.output.write_line(&line) {
                tracing::error!(error = %e, "Failed to write preview output");
                return DeliveryOutcome::OutputFailed;
            }
        }
        DeliveryOutcome::Drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn request() -> Request {
        Request {
            ip: "10.0.0.1".to_string(),
            proto: "HTTP/1.1".to_string(),
            method: "GET".to_string(),
            host: "example.com".to_string(),
            path: "/index.html".to_string(),
            status: "200".to_string(),
            referer: "-".to_string(),
            agent: "curl/7.0".to_string(),
            uid: "uid-1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2016, 3, 21, 2, 33, 29).unwrap(),
            ..Default::default()
        }
    }

    async fn print(format: OutputFormat, requests: Vec<Request>) -> (DeliveryOutcome, String) {
        let buffer = SharedBuffer::default();
        let printer = Printer::new(format, PreviewOutput::new(buffer.clone()));
        let (tx, rx) = mpsc::channel(1);

        let task = tokio::spawn(printer.run(rx));
        for request in requests {
            tx.send(request).await.unwrap();
        }
        drop(tx);

        (task.await.unwrap(), buffer.contents())
    }

    #[tokio::test]
    async fn test_prints_json_lines() {
        let (outcome, out) = print(OutputFormat::Json, vec![request(), request()]).await;

        assert_eq!(outcome, DeliveryOutcome::Drained);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#"{"ip":"10.0.0.1","proto":"HTTP/1.1","method":"GET","host":"example.com","path":"/index.html","status":"200","referer":"-","agent":"curl/7.0","uid":"uid-1","location":{"city":"","country":{"Name":"","ISOCode":""}},"timestamp":"2016-03-21T02:33:29Z"}"#
        );
        assert_eq!(lines[0], lines[1]);
    }

    #[tokio::test]
    async fn test_prints_nanosecond_points() {
        let (outcome, out) = print(OutputFormat::Influx, vec![request()]).await;

        assert_eq!(outcome, DeliveryOutcome::Drained);
        assert_eq!(
            out,
            "requests,host=example.com,ip=10.0.0.1,method=GET,path=/index.html,status=200,uid=uid-1 \
             ip=\"10.0.0.1\",uid=\"uid-1\" 1458527609000000000\n"
        );
    }

    #[tokio::test]
    async fn test_unprintable_record_is_skipped() {
        let mut broken = request();
        broken.path = "/a\nb".to_string();

        let (outcome, out) = print(OutputFormat::Influx, vec![broken, request()]).await;

        assert_eq!(outcome, DeliveryOutcome::Drained);
        assert_eq!(out.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_output_failure_stops_printer() {
        let printer = Printer::new(OutputFormat::Json, PreviewOutput::new(BrokenPipe));
        let (tx, rx) = mpsc::channel(1);
        tx.send(request()).await.unwrap();

        assert_eq!(printer.run(rx).await, DeliveryOutcome::OutputFailed);
    }
}
