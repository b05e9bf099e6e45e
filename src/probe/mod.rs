//! Probe module for network monitoring.
//!
//! Provides the native ICMP pinger, the event types it emits and the
//! factory that turns a config snapshot into probe instances.

mod factory;
pub mod icmp;
mod pinger;

pub use factory::*;
pub use pinger::*;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to resolve {address}: {reason}")]
    Resolve { address: String, reason: String },
    #[error("probe already started")]
    AlreadyStarted,
}

impl ProbeError {
    /// Whether this error should fail the process when a probe task ends with it.
    ///
    /// A run that ends because its deadline passed is a normal outcome.
    pub fn is_failure(&self) -> bool {
        !matches!(self, ProbeError::Timeout(_))
    }
}

/// Why a packet was counted as lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossReason {
    /// No reply arrived before the per-packet deadline.
    Timeout,
    /// An ICMP destination-unreachable quoting our request arrived.
    Unreachable,
}

impl LossReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossReason::Timeout => "timeout",
            LossReason::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single probe event.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// The address as configured.
    pub target: String,
    /// The resolved address the request was sent to.
    pub ip_addr: IpAddr,
    /// The address the reply or loss report came from.
    pub addr: String,
    pub rtt: Duration,
    pub seq: u16,
    pub nbytes: usize,
    pub loss: Option<LossReason>,
}

/// Receives a probe's lifecycle events.
///
/// Methods run on the probe's own send or receive path and must return
/// quickly without blocking.
pub trait PacketHandler: Send + Sync {
    fn on_send(&self, pkt: &Packet);
    fn on_recv(&self, pkt: &Packet);
    fn on_duplicate_recv(&self, pkt: &Packet);
}

/// Lifecycle of a probe instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

/// Atomic cell holding a [`ProbeState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(ProbeState::Created as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> ProbeState {
        match self.0.load(Ordering::Acquire) {
            0 => ProbeState::Created,
            1 => ProbeState::Running,
            2 => ProbeState::Stopping,
            _ => ProbeState::Stopped,
        }
    }

    pub fn set(&self, state: ProbeState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`, returning false if the current state differs.
    pub fn transition(&self, from: ProbeState, to: ProbeState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Resolves once `rx` holds `true` or its sender is gone.
pub async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// A long-running probe driven by the scheduler.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run the send loop until stopped or a fatal error occurs.
    async fn run(&self) -> Result<(), ProbeError>;

    /// Ask the send loop to exit. Idempotent; a no-op unless running.
    fn stop(&self);

    fn state(&self) -> ProbeState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let state = StateCell::default();
        assert_eq!(state.get(), ProbeState::Created);
        assert!(state.transition(ProbeState::Created, ProbeState::Running));
        assert!(!state.transition(ProbeState::Created, ProbeState::Running));
        assert_eq!(state.get(), ProbeState::Running);
        state.set(ProbeState::Stopped);
        assert_eq!(state.get(), ProbeState::Stopped);
    }

    #[test]
    fn test_timeout_is_not_failure() {
        assert!(!ProbeError::Timeout(Duration::from_secs(1)).is_failure());
        assert!(ProbeError::Network("boom".into()).is_failure());
        assert!(ProbeError::AlreadyStarted.is_failure());
    }

    #[test]
    fn test_loss_reason_labels() {
        assert_eq!(LossReason::Timeout.as_str(), "timeout");
        assert_eq!(LossReason::Unreachable.to_string(), "unreachable");
    }
}
