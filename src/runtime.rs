//! Tokio scaffolding that drives a [`Transport`].
//!
//! One task owns the receive loop and the maintenance ticker. Receive
//! failures are socket-level only; the loop backs off and re-enters the
//! receive until `max_error_burst` consecutive failures, then stops.

use std::{future::Future, io, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError, Receiver, Sender},
        oneshot,
    },
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, warn};

use crate::{
    api::CloseReason,
    transport::{MaintenanceReport, Transport},
};

/// Parameters controlling how the transport task is driven.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interval between [`Transport::maintenance_tick`] calls.
    pub maintenance_interval: Duration,
    /// Capacity of the event channel surfaced to the caller.
    pub event_buffer: usize,
    /// Consecutive receive failures tolerated before the task stops. Zero never stops.
    pub max_error_burst: usize,
    /// Pause before re-entering the receive after a failure.
    pub error_backoff: Duration,
    /// Grace period allowed for the task to stop during [`TransportHandle::shutdown`].
    pub shutdown_grace: Duration,
}

impl RuntimeConfig {
    pub fn new(maintenance_interval: Duration) -> Self {
        Self {
            maintenance_interval,
            ..Self::default()
        }
    }

    /// Sets the event channel capacity.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Sets the maximum tolerated burst of consecutive receive errors.
    pub fn with_max_error_burst(mut self, burst: usize) -> Self {
        self.max_error_burst = burst;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Sets the grace period used when shutting down the task.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn normalize(&mut self) {
        if self.event_buffer == 0 {
            self.event_buffer = 1;
        }
        if self.maintenance_interval.is_zero() {
            self.maintenance_interval = Duration::from_secs(1);
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(1),
            event_buffer: 256,
            max_error_burst: 4,
            error_backoff: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Reason why the transport task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`TransportHandle::shutdown`] was called.
    Shutdown,
    /// The handle was dropped without a shutdown request.
    HandleDropped,
    /// The receive loop failed `max_error_burst` times in a row.
    Fatal,
}

/// Events emitted by a running transport task.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// The socket returned an error; the receive is retried.
    ReceiveError(io::Error),
    /// A maintenance tick removed something.
    Maintenance(MaintenanceReport),
    Fatal {
        /// Number of back-to-back errors encountered before termination.
        consecutive_errors: usize,
    },
    Stopped(StopReason),
}

/// Errors returned by [`TransportHandle::shutdown`].
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("transport task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("transport task shutdown timed out")]
    ShutdownTimeout,
}

/// Handle to a spawned transport task.
#[derive(Debug)]
pub struct TransportHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<StopReason>,
    config: Arc<RuntimeConfig>,
}

impl TransportHandle {
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stops the task, closing every session with [`CloseReason::Shutdown`].
    pub async fn shutdown(mut self) -> Result<StopReason, HandleError> {
        if let Some(tx) = self.shutdown.take() {
            // The task may already have stopped on its own.
            let _ = tx.send(());
        }
        if self.config.shutdown_grace.is_zero() {
            return Ok(self.join.await?);
        }
        match time::timeout(self.config.shutdown_grace, &mut self.join).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                self.join.abort();
                Err(HandleError::ShutdownTimeout)
            }
        }
    }
}

/// Operations the task needs from the endpoint it drives.
pub(crate) trait Driven: Send + Sync + 'static {
    fn recv_once(&self) -> impl Future<Output = io::Result<()>> + Send;

    fn maintenance_tick(&self, now: std::time::Instant) -> MaintenanceReport;

    fn on_receive_error(&self) {}

    fn stop(&self);
}

impl Driven for Transport {
    fn recv_once(&self) -> impl Future<Output = io::Result<()>> + Send {
        Transport::recv_once(self)
    }

    fn maintenance_tick(&self, now: std::time::Instant) -> MaintenanceReport {
        Transport::maintenance_tick(self, now)
    }

    fn on_receive_error(&self) {
        self.metrics().receive_restarts.inc();
    }

    fn stop(&self) {
        self.close_all(CloseReason::Shutdown);
    }
}

/// Spawns the receive loop and maintenance ticker for `transport`.
pub fn spawn_transport(transport: Arc<Transport>) -> (TransportHandle, Receiver<RuntimeEvent>) {
    spawn_transport_with_config(transport, RuntimeConfig::default())
}

pub fn spawn_transport_with_config(
    transport: Arc<Transport>,
    config: RuntimeConfig,
) -> (TransportHandle, Receiver<RuntimeEvent>) {
    spawn_driven(transport, config)
}

fn spawn_driven<D: Driven>(
    driven: Arc<D>,
    mut config: RuntimeConfig,
) -> (TransportHandle, Receiver<RuntimeEvent>) {
    config.normalize();
    let config = Arc::new(config);
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let join = tokio::spawn(run(driven, Arc::clone(&config), shutdown_rx, event_tx));
    let handle = TransportHandle {
        shutdown: Some(shutdown_tx),
        join,
        config,
    };
    (handle, event_rx)
}

enum LoopControl {
    Continue,
    Break(StopReason),
}

async fn run<D: Driven>(
    driven: Arc<D>,
    config: Arc<RuntimeConfig>,
    mut shutdown: oneshot::Receiver<()>,
    events: Sender<RuntimeEvent>,
) -> StopReason {
    let mut ticker = time::interval(config.maintenance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_errors = 0usize;

    let reason = loop {
        let control = tokio::select! {
            biased;
            requested = &mut shutdown => match requested {
                Ok(()) => LoopControl::Break(StopReason::Shutdown),
                Err(_) => LoopControl::Break(StopReason::HandleDropped),
            },
            _ = ticker.tick() => {
                let report = driven.maintenance_tick(time::Instant::now().into_std());
                if report != MaintenanceReport::default() {
                    push_event(&events, RuntimeEvent::Maintenance(report));
                }
                LoopControl::Continue
            }
            received = driven.recv_once() => match received {
                Ok(()) => {
                    consecutive_errors = 0;
                    LoopControl::Continue
                }
                Err(err) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    driven.on_receive_error();
                    warn!(?err, consecutive_errors, "receive failed");
                    push_event(&events, RuntimeEvent::ReceiveError(err));
                    if config.max_error_burst > 0 && consecutive_errors >= config.max_error_burst {
                        error!(consecutive_errors, "transport stopping after consecutive receive errors");
                        push_event(&events, RuntimeEvent::Fatal { consecutive_errors });
                        LoopControl::Break(StopReason::Fatal)
                    } else {
                        time::sleep(config.error_backoff).await;
                        LoopControl::Continue
                    }
                }
            },
        };

        if let LoopControl::Break(reason) = control {
            break reason;
        }
    };

    driven.stop();
    push_event(&events, RuntimeEvent::Stopped(reason));
    reason
}

fn push_event(events: &Sender<RuntimeEvent>, event: RuntimeEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(?event, "runtime event channel full; event dropped");
        }
        Err(TrySendError::Closed(_)) => {
            debug!("runtime event receiver gone");
        }
    }
}
