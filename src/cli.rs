use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Prometheus exporter reporting ICMP reachability and round trip times
#[derive(Parser, Debug, Clone)]
#[command(name = "ping_exporter")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Probe target config file (YAML)
    #[arg(long = "config", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    pub metrics_path: String,

    /// Base interval across which probe starts are spread
    #[arg(
        short = 'i',
        long = "ping.interval",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub interval: Duration,

    /// Address to listen on for HTTP requests
    #[arg(long = "web.listen-address", default_value = ":9375")]
    pub listen_address: String,

    /// Log filter directive for this exporter (overridden by RUST_LOG)
    #[arg(long = "log.level", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Listen address as a socket address; `:port` binds every interface.
    pub fn listen_addr(&self) -> Result<SocketAddr, String> {
        let addr = if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        };
        addr.parse()
            .map_err(|e| format!("Invalid listen address {}: {}", self.listen_address, e))
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("Ping interval must be positive".into());
        }

        if !self.metrics_path.starts_with('/') {
            return Err(format!(
                "Telemetry path must start with '/': {}",
                self.metrics_path
            ));
        }

        if self.metrics_path == "/" || self.metrics_path == crate::web::RELOAD_PATH {
            return Err(format!("Telemetry path {} is reserved", self.metrics_path));
        }

        self.listen_addr().map(|_| ())
    }
}
