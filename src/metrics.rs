//! Self-exposed Prometheus counters for the agent's own `/metrics` surface.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

use crate::error::{AgentError, Result};

pub struct Metrics {
    registry: Registry,
    pub metrics_received_total: IntCounter,
    pub metrics_received_cost_total: IntCounter,
    pub metrics_received_observability_total: IntCounter,
    pub metrics_dropped_total: IntCounter,
    pub shipped_total: IntCounter,
    pub ship_errors_total: IntCounter,
    pub replay_requests_total: IntCounter,
    pub abandoned_total: IntCounter,
    pub purged_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let metrics_received_total = IntCounter::new(
            "metrics_received_total",
            "Total samples decoded from remote-write requests",
        )
        .map_err(prom_err)?;
        let metrics_received_cost_total = IntCounter::new(
            "metrics_received_cost_total",
            "Samples classified into the cost sink",
        )
        .map_err(prom_err)?;
        let metrics_received_observability_total = IntCounter::new(
            "metrics_received_observability_total",
            "Samples classified into the observability sink",
        )
        .map_err(prom_err)?;
        let metrics_dropped_total = IntCounter::new(
            "metrics_dropped_total",
            "Samples classified into neither sink",
        )
        .map_err(prom_err)?;
        let shipped_total =
            IntCounter::new("shipped_total", "Segment files successfully uploaded").map_err(prom_err)?;
        let ship_errors_total =
            IntCounter::new("ship_errors_total", "Shipper cycle errors").map_err(prom_err)?;
        let replay_requests_total = IntCounter::new(
            "replay_requests_total",
            "Replay-request files processed",
        )
        .map_err(prom_err)?;
        let abandoned_total =
            IntCounter::new("abandoned_total", "Reference ids abandoned").map_err(prom_err)?;
        let purged_total =
            IntCounter::new("purged_total", "Files purged by the disk-pressure manager")
                .map_err(prom_err)?;

        for c in [
            &metrics_received_total,
            &metrics_received_cost_total,
            &metrics_received_observability_total,
            &metrics_dropped_total,
            &shipped_total,
            &ship_errors_total,
            &replay_requests_total,
            &abandoned_total,
            &purged_total,
        ] {
            registry.register(Box::new(c.clone())).map_err(prom_err)?;
        }

        Ok(Self {
            registry,
            metrics_received_total,
            metrics_received_cost_total,
            metrics_received_observability_total,
            metrics_dropped_total,
            shipped_total,
            ship_errors_total,
            replay_requests_total,
            abandoned_total,
            purged_total,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).map_err(prom_err)?;
        String::from_utf8(buf).map_err(|e| AgentError::Decode(e.to_string()))
    }
}

fn prom_err(e: prometheus::Error) -> AgentError {
    AgentError::InvalidInput(e.to_string())
}
