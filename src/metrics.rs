use axum::{debug_handler, extract::State, http::header, response::IntoResponse};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::AppResult;

/// Relay counters, registered on a registry owned by this instance.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub frames_dropped: IntCounter,
    pub messages_ingested: IntCounter,
    pub publishes: IntCounter,
    pub admission_denied: IntCounter,
    pub connections_active: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let frames_dropped = IntCounter::new(
            "relay_frames_dropped_total",
            "Inbound frames dropped as malformed or oversized",
        )?;
        let messages_ingested = IntCounter::new(
            "relay_messages_ingested_total",
            "Messages persisted and fanned out",
        )?;
        let publishes = IntCounter::new(
            "relay_publishes_total",
            "Per-member publishes on the fan-out bus",
        )?;
        let admission_denied = IntCounter::new(
            "relay_admission_denied_total",
            "Requests rejected by the per-IP admission gate",
        )?;
        let connections_active = IntGauge::new(
            "relay_connections_active",
            "Currently open websocket sessions",
        )?;

        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(messages_ingested.clone()))?;
        registry.register(Box::new(publishes.clone()))?;
        registry.register(Box::new(admission_denied.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;

        Ok(Self {
            registry,
            frames_dropped,
            messages_ingested,
            publishes,
            admission_denied,
            connections_active,
        })
    }

    pub fn gather(&self) -> anyhow::Result<String> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn metrics(State(metrics): State<Metrics>) -> AppResult<impl IntoResponse> {
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.gather()?,
    ))
}
