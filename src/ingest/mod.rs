//! Ingestion pipeline: decode, stamp, classify, fan out (spec.md §4.C).

pub mod wire;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::filter::FilterConfig;
use crate::metrics::Metrics;
use crate::model::Sample;
use crate::segment::SegmentStore;

const MEDIA_TYPE_PROTOBUF: &str = "application/x-protobuf";
const PROTO_V2: &str = "io.prometheus.write.v2.request";
const PROTO_V1: &str = "prometheus.writerequest";
const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoVersion {
    V1,
    V2,
}

/// Parse a `Content-Type` header into its media type and `proto=` version.
/// Unrecognized parameters other than `proto` are ignored, per the wire
/// format's parameter extensibility; an absent `proto` implies v1.
pub fn parse_content_type(content_type: &str) -> Result<ProtoVersion> {
    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    if media_type != MEDIA_TYPE_PROTOBUF {
        return Err(AgentError::InvalidInput(format!(
            "unsupported media type: {media_type}"
        )));
    }
    let mut proto_param: Option<String> = None;
    for param in parts {
        let mut kv = param.splitn(2, '=');
        let key = kv.next().unwrap_or("").trim();
        let value = kv.next().unwrap_or("").trim();
        if key.eq_ignore_ascii_case("proto") {
            proto_param = Some(value.trim_matches('"').to_ascii_lowercase());
        }
        // Other parameters (e.g. charset) are accepted and ignored.
    }
    match proto_param.as_deref() {
        None => Ok(ProtoVersion::V1),
        Some(v) if v == PROTO_V1 => Ok(ProtoVersion::V1),
        Some(v) if v == PROTO_V2 => Ok(ProtoVersion::V2),
        Some(other) => Err(AgentError::InvalidInput(format!(
            "unrecognized proto parameter: {other}"
        ))),
    }
}

fn decode_body(content_encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>> {
    match content_encoding {
        Some(enc) if enc.eq_ignore_ascii_case("snappy") => snap::raw::Decoder::new()
            .decompress_vec(body)
            .map_err(|e| AgentError::Decode(e.to_string())),
        _ => Ok(body.to_vec()),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct IngestStats {
    pub samples: u64,
    pub histograms: u64,
    pub exemplars: u64,
    pub confirmed: bool,
}

/// Identity used to stamp every sample; resolved once at startup from the
/// collector's environment.
#[derive(Debug, Clone)]
pub struct CollectorIdentity {
    pub cluster_name: String,
    pub cloud_account_id: String,
    pub node_name: String,
}

pub struct IngestPipeline {
    identity: CollectorIdentity,
    filter: FilterConfig,
    cost_store: Arc<SegmentStore>,
    observability_store: Arc<SegmentStore>,
    metrics: Arc<Metrics>,
    first_cost_flush_done: AtomicBool,
}

impl IngestPipeline {
    pub fn new(
        identity: CollectorIdentity,
        filter: FilterConfig,
        cost_store: Arc<SegmentStore>,
        observability_store: Arc<SegmentStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            identity,
            filter,
            cost_store,
            observability_store,
            metrics,
            first_cost_flush_done: AtomicBool::new(false),
        }
    }

    pub fn max_payload_bytes() -> usize {
        MAX_PAYLOAD_BYTES
    }

    pub fn put_metrics(
        &self,
        content_type: &str,
        content_encoding: Option<&str>,
        body: &[u8],
    ) -> Result<IngestStats> {
        if body.len() > MAX_PAYLOAD_BYTES {
            return Err(AgentError::InvalidInput("payload too large".into()));
        }
        let proto_version = parse_content_type(content_type)?;
        let decoded = decode_body(content_encoding, body)?;

        let (wire_samples, wire_stats, confirmed) = match proto_version {
            ProtoVersion::V1 => {
                let (samples, stats) = wire::decode_v1(&decoded)?;
                (samples, stats, false)
            }
            ProtoVersion::V2 => {
                let (samples, stats) = wire::decode_v2(&decoded)?;
                (samples, stats, true)
            }
        };

        let now = Utc::now();
        let samples: Vec<Sample> = wire_samples
            .into_iter()
            .filter(|w| !w.metric_name.is_empty())
            .map(|w| {
                let timestamp = DateTime::from_timestamp_millis(w.timestamp_ms).unwrap_or(now);
                let labels: HashMap<String, String> = w.labels.into_iter().collect();
                Sample {
                    id: Uuid::new_v4(),
                    metric_name: w.metric_name,
                    cluster_name: self.identity.cluster_name.clone(),
                    cloud_account_id: self.identity.cloud_account_id.clone(),
                    node_name: self.identity.node_name.clone(),
                    labels,
                    value: w.value.to_string(),
                    created_at: now,
                    timestamp,
                }
            })
            .collect();

        let classified = self.filter.classify(&samples);

        if !classified.cost.is_empty() {
            self.cost_store.put(&classified.cost)?;
        }
        if !classified.observability.is_empty() {
            self.observability_store.put(&classified.observability)?;
        }

        self.metrics
            .metrics_received_total
            .inc_by(samples.len() as u64);
        self.metrics
            .metrics_received_cost_total
            .inc_by(classified.cost.len() as u64);
        self.metrics
            .metrics_received_observability_total
            .inc_by(classified.observability.len() as u64);
        self.metrics
            .metrics_dropped_total
            .inc_by(classified.dropped.len() as u64);

        if !classified.cost.is_empty() && self.first_cost_flush_done.compare_exchange(
            false,
            true,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ).is_ok()
        {
            self.cost_store.flush()?;
        }

        Ok(IngestStats {
            samples: wire_stats.samples,
            histograms: wire_stats.histograms,
            exemplars: wire_stats.exemplars,
            confirmed,
        })
    }
}
