// metrics.rs - Prometheus counters for the transport
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Why an inbound datagram was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Malformed,
    ProjectMismatch,
    UnknownSession,
    EndpointMismatch,
    Cleartext,
    Replay,
    MacFailure,
    Handshake,
    Fragment,
    Oversized,
}

impl DropReason {
    pub const fn as_label(self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::ProjectMismatch => "project_mismatch",
            DropReason::UnknownSession => "unknown_session",
            DropReason::EndpointMismatch => "endpoint_mismatch",
            DropReason::Cleartext => "cleartext",
            DropReason::Replay => "replay",
            DropReason::MacFailure => "mac_failure",
            DropReason::Handshake => "handshake",
            DropReason::Fragment => "fragment",
            DropReason::Oversized => "oversized",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub datagrams_received: IntCounter,
    pub datagrams_sent: IntCounter,
    pub bytes_sent: IntCounter,
    pub send_errors: IntCounter,
    pub drops: IntCounterVec,
    pub mac_failures: IntCounter,
    pub replays: IntCounter,
    pub handshakes_started: IntCounter,
    pub handshakes_completed: IntCounter,
    pub handshakes_failed: IntCounter,
    pub connecting_overwrites: IntCounter,
    pub sessions_expired: IntCounter,
    pub fragments_reassembled: IntCounter,
    pub fragments_evicted: IntCounter,
    pub receive_restarts: IntCounter,
    pub active_sessions: IntGauge,
    pub pending_handshakes: IntGauge,
    pub send_queue_depth: IntGauge,
    pub message_bytes: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("guardport".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_counter_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let counter = IntCounterVec::new(prometheus::Opts::new($name, $help), $labels)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        macro_rules! register_histogram {
            ($name:expr, $help:expr, $buckets:expr) => {{
                let opts = HistogramOpts::new($name, $help).buckets($buckets.to_vec());
                let hist = Histogram::with_opts(opts)?;
                registry.register(Box::new(hist.clone()))?;
                hist
            }};
        }

        let datagrams_received =
            register_counter!("datagrams_received_total", "Datagrams read from the socket");
        let datagrams_sent = register_counter!("datagrams_sent_total", "Datagrams written to the socket");
        let bytes_sent = register_counter!("bytes_sent_total", "Envelope bytes written to the socket");
        let send_errors = register_counter!("send_errors_total", "Socket send failures");
        let drops = register_counter_vec!(
            "drops_total",
            "Inbound datagrams discarded, by reason",
            &["reason"]
        );
        let mac_failures = register_counter!("mac_failures_total", "Packet MAC verification failures");
        let replays = register_counter!("replays_total", "Packets rejected by the replay window");
        let handshakes_started = register_counter!("handshakes_started_total", "Handshakes initiated or accepted");
        let handshakes_completed =
            register_counter!("handshakes_completed_total", "Sessions that reached Established");
        let handshakes_failed = register_counter!("handshakes_failed_total", "Handshake messages rejected");
        let connecting_overwrites = register_counter!(
            "connecting_overwrites_total",
            "Pending handshakes overwritten by ring wraparound"
        );
        let sessions_expired =
            register_counter!("sessions_expired_total", "Sessions or handshakes removed by timeout");
        let fragments_reassembled =
            register_counter!("fragments_reassembled_total", "Fragmented messages completed");
        let fragments_evicted =
            register_counter!("fragments_evicted_total", "Partial messages discarded");
        let receive_restarts =
            register_counter!("receive_restarts_total", "Receive loop restarts after socket errors");
        let active_sessions = register_gauge!("active_sessions", "Established sessions");
        let pending_handshakes = register_gauge!("pending_handshakes", "Sessions in the connecting table");
        let send_queue_depth = register_gauge!("send_queue_depth", "Datagrams awaiting the drainer");
        let message_bytes = register_histogram!(
            "message_bytes",
            "Application payload sizes delivered to the handler",
            &[64.0, 256.0, 1024.0, 1348.0, 4096.0, 16384.0, 65536.0]
        );

        Ok(Self {
            registry,
            datagrams_received,
            datagrams_sent,
            bytes_sent,
            send_errors,
            drops,
            mac_failures,
            replays,
            handshakes_started,
            handshakes_completed,
            handshakes_failed,
            connecting_overwrites,
            sessions_expired,
            fragments_reassembled,
            fragments_evicted,
            receive_restarts,
            active_sessions,
            pending_handshakes,
            send_queue_depth,
            message_bytes,
        })
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.drops.with_label_values(&[reason.as_label()]).inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_metrics_registry() {
        let metrics = Metrics::new().expect("metrics");
        metrics.record_drop(DropReason::Replay);
        metrics.record_drop(DropReason::Replay);
        metrics.active_sessions.set(3);
        assert_eq!(
            metrics.drops.with_label_values(&[DropReason::Replay.as_label()]).get(),
            2
        );
        let families = metrics.gather();
        assert!(families
            .iter()
            .any(|family| family.get_name() == "guardport_drops_total"));
    }

    #[test]
    fn registries_are_isolated() {
        let a = Metrics::new().expect("a");
        let b = Metrics::new().expect("b");
        a.datagrams_sent.inc();
        assert_eq!(b.datagrams_sent.get(), 0);
    }
}
