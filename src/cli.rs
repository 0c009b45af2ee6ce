use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "probe-agent",
    version,
    about = "Host monitoring agent: runs sensors and ships batches to the collector"
)]
pub struct Args {
    /// Start the agent. Without this (or an action) the configuration is only validated.
    #[arg(short = 'r', long)]
    pub run: bool,

    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[arg(long = "webapi-url")]
    pub webapi_url: Option<String>,

    #[arg(long = "logs-max_size")]
    pub logs_max_size: Option<u64>,

    /// Generate a private key and signing request, then exit.
    #[arg(long)]
    pub initialize: bool,

    /// Submit the existing signing request to the collector.
    #[arg(long = "request-certificate-sign")]
    pub request_certificate_sign: bool,

    /// Poll once for the signed certificate and install it.
    #[arg(long = "fetch-certificate")]
    pub fetch_certificate: bool,

    /// Check TLS reachability and clock skew against the collector.
    #[arg(long = "check-connection")]
    pub check_connection: bool,

    /// Collect one sample from the named sensor and print it as JSON.
    #[arg(long = "test-sensor", value_name = "NAME")]
    pub test_sensor: Option<String>,
}

impl Args {
    pub fn has_action(&self) -> bool {
        self.initialize
            || self.request_certificate_sign
            || self.fetch_certificate
            || self.check_connection
            || self.test_sensor.is_some()
    }
}
