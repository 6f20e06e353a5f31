//! Core data model: samples, filter rules, replay requests, store usage.
//!
//! Mirrors spec.md §3. Kept free of I/O so it can be unit tested in
//! isolation from the store and shipper.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A classified measurement, stamped with collector identity and clock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub id: Uuid,
    pub metric_name: String,
    pub cluster_name: String,
    pub cloud_account_id: String,
    pub node_name: String,
    pub labels: HashMap<String, String>,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Content kind governs filename prefix and rotation interval (spec.md §3/§4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Metrics,
    Observability,
    Logs,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Metrics => "metrics",
            ContentKind::Observability => "observability",
            ContentKind::Logs => "logs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metrics" => Some(ContentKind::Metrics),
            "observability" => Some(ContentKind::Observability),
            "logs" => Some(ContentKind::Logs),
            _ => None,
        }
    }
}

/// How a filter rule's pattern is matched against a metric name or label key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Prefix,
    Substring,
    Regex,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterRule {
    pub pattern: String,
    #[serde(rename = "match")]
    pub match_kind: MatchKind,
}

/// A replay request persisted under `replay/replay-<millis>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub filepath: String,
    pub reference_ids: Vec<String>,
}

/// `(segment-file, pre-signed-URL)` pair, plus the derived reference id.
#[derive(Debug, Clone)]
pub struct UploadUnit {
    pub segment_path: std::path::PathBuf,
    pub reference_id: String,
    pub presigned_url: String,
}

/// Disk usage snapshot, optionally rescaled against a configured cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub percent_used: f64,
    pub block_size: u64,
}

impl StoreUsage {
    /// Rescale so `total == limit`, recomputing `percent_used` and `available`.
    /// A `limit` of 0 means "uncapped" — returned unchanged.
    pub fn capped(self, limit: u64) -> Self {
        if limit == 0 || limit >= self.total {
            return self;
        }
        let used = self.used.min(limit);
        let available = limit.saturating_sub(used);
        let percent_used = if limit == 0 {
            0.0
        } else {
            (used as f64 / limit as f64) * 100.0
        };
        StoreUsage {
            total: limit,
            used,
            available,
            percent_used,
            block_size: self.block_size,
        }
    }
}

/// Derive the remote reference id for a sealed segment file: `<unique-id>.parquet`.
pub fn reference_id_for(unique_id: &str) -> String {
    format!("{unique_id}.parquet")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_kind_roundtrips() {
        for k in [ContentKind::Metrics, ContentKind::Observability, ContentKind::Logs] {
            assert_eq!(ContentKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(ContentKind::parse("bogus"), None);
    }

    #[test]
    fn usage_cap_rescales() {
        let usage = StoreUsage {
            total: 1000,
            used: 100,
            available: 900,
            percent_used: 10.0,
            block_size: 4096,
        };
        let capped = usage.capped(200);
        assert_eq!(capped.total, 200);
        assert_eq!(capped.used, 100);
        assert_eq!(capped.available, 100);
        assert_eq!(capped.percent_used, 50.0);
    }

    #[test]
    fn usage_cap_noop_when_above_total() {
        let usage = StoreUsage {
            total: 1000,
            used: 100,
            available: 900,
            percent_used: 10.0,
            block_size: 4096,
        };
        let capped = usage.capped(5000);
        assert_eq!(capped, usage);
    }

    #[test]
    fn reference_id_suffix() {
        assert_eq!(reference_id_for("abc"), "abc.parquet");
    }
}
