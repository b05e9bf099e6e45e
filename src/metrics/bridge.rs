//! Maps pinger events onto the ping series.

use std::sync::Arc;

use super::PingMetrics;
use crate::config::Host;
use crate::probe::{Packet, PacketHandler, ProbeInstance};

pub fn broadcast_label(broadcast: bool) -> &'static str {
    if broadcast {
        "true"
    } else {
        "false"
    }
}

/// Records one host's events.
///
/// Losses only count when the report names the probed target itself.
/// Every other receive event counts as a reply when it comes from the
/// pinger's resolved address.
pub struct HostObserver {
    metrics: PingMetrics,
    host: Host,
}

impl HostObserver {
    pub fn new(metrics: PingMetrics, host: Host) -> Self {
        Self { metrics, host }
    }

    fn record_reply(&self, pkt: &Packet) {
        let ip = pkt.ip_addr.to_string();
        if pkt.addr != ip {
            return;
        }
        let labels = [
            pkt.target.as_str(),
            ip.as_str(),
            broadcast_label(self.host.broadcast),
            self.host.name.as_str(),
            self.host.description.as_str(),
        ];
        self.metrics.recv_count.with_label_values(&labels).inc();
        self.metrics
            .last_rtt
            .with_label_values(&labels)
            .set(pkt.rtt.as_secs_f64());
    }
}

impl PacketHandler for HostObserver {
    fn on_send(&self, pkt: &Packet) {
        let ip = pkt.ip_addr.to_string();
        self.metrics
            .sent_count
            .with_label_values(&[
                pkt.target.as_str(),
                ip.as_str(),
                broadcast_label(self.host.broadcast),
                self.host.name.as_str(),
                self.host.description.as_str(),
            ])
            .inc();
    }

    fn on_recv(&self, pkt: &Packet) {
        match pkt.loss {
            Some(reason) if pkt.target == pkt.addr => {
                self.metrics
                    .loss_count
                    .with_label_values(&[
                        pkt.target.as_str(),
                        pkt.addr.as_str(),
                        broadcast_label(self.host.broadcast),
                        self.host.name.as_str(),
                        self.host.description.as_str(),
                        reason.as_str(),
                    ])
                    .inc();
            }
            // Anything else is judged as a reply by its source address.
            _ => self.record_reply(pkt),
        }
    }

    fn on_duplicate_recv(&self, pkt: &Packet) {
        self.record_reply(pkt);
    }
}

/// Install a [`HostObserver`] on the instance's pinger.
///
/// Returns false if the pinger already had a handler.
pub fn attach(instance: &ProbeInstance, metrics: &PingMetrics) -> bool {
    let observer = HostObserver::new(metrics.clone(), instance.host.clone());
    instance.pinger.attach(Arc::new(observer))
}
