//! Prometheus metrics for ping results.
//!
//! All series live on an explicit [`Registry`] created once in `main` and
//! shared with the web server for scraping.

mod bridge;

pub use bridge::*;

use prometheus::{Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

pub const NAMESPACE: &str = "ping";

/// Labels shared by every ping series.
pub const LABEL_NAMES: [&str; 5] = ["target", "ip", "broadcast", "name", "description"];

/// Labels of the loss series.
pub const LOSS_LABEL_NAMES: [&str; 6] = [
    "target",
    "ip",
    "broadcast",
    "name",
    "description",
    "loss_reason",
];

/// The four ping series.
#[derive(Clone)]
pub struct PingMetrics {
    pub sent_count: IntCounterVec,
    pub recv_count: IntCounterVec,
    pub last_rtt: GaugeVec,
    pub loss_count: IntCounterVec,
}

impl PingMetrics {
    /// Create the series and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent_count = IntCounterVec::new(
            Opts::new("sent_count", "The number of sent ping packets").namespace(NAMESPACE),
            &LABEL_NAMES,
        )?;
        let recv_count = IntCounterVec::new(
            Opts::new("recv_count", "The number of received ping packets").namespace(NAMESPACE),
            &LABEL_NAMES,
        )?;
        let last_rtt = GaugeVec::new(
            Opts::new("last_rtt", "Round trip time of the last reply in seconds")
                .namespace(NAMESPACE),
            &LABEL_NAMES,
        )?;
        let loss_count = IntCounterVec::new(
            Opts::new("loss_count", "The number of lost ping packets").namespace(NAMESPACE),
            &LOSS_LABEL_NAMES,
        )?;

        registry.register(Box::new(sent_count.clone()))?;
        registry.register(Box::new(recv_count.clone()))?;
        registry.register(Box::new(last_rtt.clone()))?;
        registry.register(Box::new(loss_count.clone()))?;

        Ok(Self {
            sent_count,
            recv_count,
            last_rtt,
            loss_count,
        })
    }
}

/// Register `ping_exporter_build_info{version}` with value 1.
pub fn register_build_info(registry: &Registry) -> Result<(), prometheus::Error> {
    let build_info = IntGaugeVec::new(
        Opts::new(
            "ping_exporter_build_info",
            "A metric with a constant '1' value labeled by version",
        ),
        &["version"],
    )?;
    build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1);
    registry.register(Box::new(build_info))
}

/// Render every series in `registry` in the text exposition format.
pub fn encode(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Text exposition content type.
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}
