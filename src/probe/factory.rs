//! Builds probe instances from a config snapshot.

use std::sync::Arc;

use thiserror::Error;

use super::{Pinger, PingerOptions, ProbeError};
use crate::config::{Config, Host, Target};

/// A host that could not be turned into a pinger.
#[derive(Debug, Error)]
#[error("host {ip} ({name}): {source}")]
pub struct ConstructionError {
    pub ip: String,
    pub name: String,
    #[source]
    pub source: ProbeError,
}

/// A pinger bound to the host it probes.
#[derive(Debug, Clone)]
pub struct ProbeInstance {
    pub pinger: Arc<Pinger>,
    pub host: Host,
}

/// Pinger settings for `host` taken from its target.
pub fn pinger_options(target: &Target, host: &Host) -> Result<PingerOptions, ProbeError> {
    let privileged = match target.protocol.as_str() {
        "" | "icmp" => true,
        "udp" => false,
        other => return Err(ProbeError::Config(format!("unknown protocol: {}", other))),
    };

    Ok(PingerOptions {
        address: host.ip.clone(),
        size: target.size,
        network: target.network.clone(),
        interval: target.interval,
        timeout: target.timeout,
        privileged,
    })
}

/// Build one instance per host across all targets.
///
/// A host that fails to build is returned as an error and does not stop
/// the others from being built.
pub async fn build_instances(config: &Config) -> (Vec<ProbeInstance>, Vec<ConstructionError>) {
    let mut instances = Vec::with_capacity(config.host_count());
    let mut errors = Vec::new();

    for target in &config.targets {
        for host in &target.hosts {
            let built = match pinger_options(target, host) {
                Ok(options) => Pinger::new(options).await,
                Err(e) => Err(e),
            };

            match built {
                Ok(pinger) => instances.push(ProbeInstance {
                    pinger: Arc::new(pinger),
                    host: host.clone(),
                }),
                Err(source) => errors.push(ConstructionError {
                    ip: host.ip.clone(),
                    name: host.name.clone(),
                    source,
                }),
            }
        }
    }

    (instances, errors)
}
