//! Scheduler module for starting and stopping probes.
//!
//! Probes are started one at a time, spaced `base_interval / N` apart so
//! their sends spread evenly across one interval instead of bursting.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::probe::{stop_requested, Probe, ProbeError, ProbeState};

/// How often shutdown re-signals probes that started after the first stop.
const STOP_RETRY: Duration = Duration::from_millis(50);

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("probe {name} failed: {source}")]
    Probe {
        name: String,
        #[source]
        source: ProbeError,
    },
    #[error("probe task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Delay between successive probe starts.
pub fn splay(base_interval: Duration, count: usize) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => base_interval / n,
        Err(_) => Duration::ZERO,
    }
}

/// Runs a fixed set of probes until shut down.
pub struct Scheduler {
    splay: Duration,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<Result<(), SchedulerError>>,
}

impl Scheduler {
    /// Spawn the dispatch task, which starts each probe in turn.
    pub fn start(probes: Vec<Arc<dyn Probe>>, base_interval: Duration) -> Self {
        let splay = splay(base_interval, probes.len());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            "Starting scheduler with {} probes, splay {:?}",
            probes.len(),
            splay
        );

        let dispatcher = tokio::spawn(dispatch(probes, splay, shutdown_rx));

        Self {
            splay,
            shutdown_tx,
            dispatcher,
        }
    }

    pub fn splay(&self) -> Duration {
        self.splay
    }

    /// Stop every started probe and wait for all of them to exit.
    ///
    /// Returns the first probe failure, if any. Probes that ended with a
    /// timeout or stopped cleanly are not failures.
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        self.shutdown_tx.send_replace(true);
        self.dispatcher.await?
    }
}

async fn dispatch(
    probes: Vec<Arc<dyn Probe>>,
    splay: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), SchedulerError> {
    let mut tasks = JoinSet::new();
    let mut started: Vec<Arc<dyn Probe>> = Vec::with_capacity(probes.len());
    let mut first_error: Option<SchedulerError> = None;

    for (i, probe) in probes.into_iter().enumerate() {
        if *shutdown_rx.borrow() {
            break;
        }
        if i > 0 {
            tokio::select! {
                _ = tokio::time::sleep(splay) => {}
                _ = stop_requested(&mut shutdown_rx) => break,
            }
        }

        tracing::debug!("Scheduler: starting probe {}", probe.name());
        started.push(probe.clone());
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if *shutdown.borrow() {
                return (probe.name().to_string(), Ok(()));
            }
            let result = probe.run().await;
            (probe.name().to_string(), result)
        });
    }

    // Wait for shutdown; probes that fail meanwhile are recorded and logged.
    let mut all_exited = false;
    loop {
        tokio::select! {
            _ = stop_requested(&mut shutdown_rx) => break,
            joined = tasks.join_next(), if !all_exited => match joined {
                Some(joined) => record(joined, &mut first_error),
                None => all_exited = true,
            },
        }
    }

    tracing::info!("Scheduler: stopping {} probes", started.len());
    for probe in &started {
        probe.stop();
    }
    // A task spawned just before shutdown may reach Running only after the
    // stop above, which it would ignore while still Created.
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(joined) => record(joined, &mut first_error),
                None => break,
            },
            _ = tokio::time::sleep(STOP_RETRY) => {
                for probe in started.iter().filter(|p| p.state() == ProbeState::Running) {
                    tracing::debug!("Scheduler: stopping late probe {}", probe.name());
                    probe.stop();
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn record(
    joined: Result<(String, Result<(), ProbeError>), tokio::task::JoinError>,
    first_error: &mut Option<SchedulerError>,
) {
    let error = match joined {
        Ok((_, Ok(()))) => return,
        Ok((name, Err(e))) if !e.is_failure() => {
            tracing::debug!("Scheduler: probe {} ended: {}", name, e);
            return;
        }
        Ok((name, Err(source))) => SchedulerError::Probe { name, source },
        Err(e) => SchedulerError::Join(e),
    };

    tracing::error!("Scheduler: {}", error);
    if first_error.is_none() {
        *first_error = Some(error);
    }
}
