use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Main entrypoint simply delegates control to CLI layer.
    // The CLI parses user commands, loads configuration and installs tracing
    // before calling into the runtime.
    request_shipper::cli::cli::run().await
}
