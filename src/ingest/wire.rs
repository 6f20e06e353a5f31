//! Remote-write wire types and decoders, v1 and v2.
//!
//! Hand-authored `prost::Message` types rather than a `build.rs`-generated
//! module: the wire shape is small and stable, and this keeps the crate
//! free of a protoc build dependency.

use prost::Message;

use crate::error::{AgentError, Result};

/// A decoded `(metric_name, labels, value, timestamp_ms)` tuple, before
/// collector stamping and classification.
#[derive(Debug, Clone, PartialEq)]
pub struct WireSample {
    pub metric_name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct WireStats {
    pub samples: u64,
    pub histograms: u64,
    pub exemplars: u64,
}

const METRIC_NAME_LABEL: &str = "__name__";

// ---- v1 ----

#[derive(Clone, PartialEq, Message)]
pub struct LabelV1 {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SampleV1 {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeriesV1 {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<LabelV1>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<SampleV1>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequestV1 {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeriesV1>,
}

pub fn decode_v1(body: &[u8]) -> Result<(Vec<WireSample>, WireStats)> {
    let req = WriteRequestV1::decode(body).map_err(|e| AgentError::Decode(e.to_string()))?;
    let mut out = Vec::new();
    for series in req.timeseries {
        let metric_name = series
            .labels
            .iter()
            .find(|l| l.name == METRIC_NAME_LABEL)
            .map(|l| l.value.clone())
            .unwrap_or_default();
        let labels: Vec<(String, String)> = series
            .labels
            .into_iter()
            .map(|l| (l.name, l.value))
            .collect();
        for sample in series.samples {
            out.push(WireSample {
                metric_name: metric_name.clone(),
                labels: labels.clone(),
                value: sample.value,
                timestamp_ms: sample.timestamp,
            });
        }
    }
    let stats = WireStats {
        samples: out.len() as u64,
        histograms: 0,
        exemplars: 0,
    };
    Ok((out, stats))
}

// ---- v2 ----
//
// v2 series reference labels through a process-wide symbol table: each
// series carries a flat list of `(name_ref, value_ref)` pairs indexing
// into the request's `symbols` table. Histograms and exemplars are
// counted in stats but not translated into samples (no sink schema for
// them yet).

#[derive(Clone, PartialEq, Message)]
pub struct SampleV2 {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ExemplarV2 {
    #[prost(uint32, repeated, tag = "1")]
    pub label_refs: Vec<u32>,
    #[prost(double, tag = "2")]
    pub value: f64,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct HistogramV2 {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeriesV2 {
    #[prost(uint32, repeated, tag = "1")]
    pub label_refs: Vec<u32>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<SampleV2>,
    #[prost(message, repeated, tag = "3")]
    pub exemplars: Vec<ExemplarV2>,
    #[prost(message, repeated, tag = "4")]
    pub histograms: Vec<HistogramV2>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RequestV2 {
    #[prost(string, repeated, tag = "1")]
    pub symbols: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub timeseries: Vec<TimeSeriesV2>,
}

fn resolve_labels(symbols: &[String], label_refs: &[u32]) -> Result<Vec<(String, String)>> {
    if label_refs.len() % 2 != 0 {
        return Err(AgentError::Decode("odd label_refs length".into()));
    }
    let mut out = Vec::with_capacity(label_refs.len() / 2);
    for pair in label_refs.chunks_exact(2) {
        let name = symbols
            .get(pair[0] as usize)
            .ok_or_else(|| AgentError::Decode(format!("label ref {} out of range", pair[0])))?;
        let value = symbols
            .get(pair[1] as usize)
            .ok_or_else(|| AgentError::Decode(format!("label ref {} out of range", pair[1])))?;
        out.push((name.clone(), value.clone()));
    }
    Ok(out)
}

pub fn decode_v2(body: &[u8]) -> Result<(Vec<WireSample>, WireStats)> {
    let req = RequestV2::decode(body).map_err(|e| AgentError::Decode(e.to_string()))?;
    let mut out = Vec::new();
    let mut stats = WireStats::default();
    for series in req.timeseries {
        let labels = resolve_labels(&req.symbols, &series.label_refs)?;
        let metric_name = labels
            .iter()
            .find(|(k, _)| k == METRIC_NAME_LABEL)
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        stats.histograms += series.histograms.len() as u64;
        stats.exemplars += series.exemplars.len() as u64;
        for sample in series.samples {
            out.push(WireSample {
                metric_name: metric_name.clone(),
                labels: labels.clone(),
                value: sample.value,
                timestamp_ms: sample.timestamp,
            });
        }
    }
    stats.samples = out.len() as u64;
    Ok((out, stats))
}
