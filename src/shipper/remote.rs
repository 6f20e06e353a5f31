//! HTTP calls the shipper makes to the remote ingestion endpoint
//! (spec.md §4.E allocation/upload/abandon, §6 wire shape).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::client::{is_expired_url_body, RetryingClient, SendError};
use crate::error::AgentError;

const SHIPPER_ID_HEADER: &str = "X-CloudZero-Shipper-ID";
const VERSION_HEADER: &str = "X-CloudZero-Version";
const REPLAY_HEADER: &str = "X-CloudZero-Replay";
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const EXPIRATION_SECONDS: &str = "43200";

#[derive(Debug, Clone)]
pub struct RemoteContext {
    pub base_url: String,
    pub api_key: String,
    pub cluster_name: String,
    pub cloud_account_id: String,
    pub region: String,
    pub shipper_id: String,
}

#[derive(Serialize)]
struct FileRef<'a> {
    reference_id: &'a str,
}

#[derive(Serialize)]
struct AllocateBody<'a> {
    files: Vec<FileRef<'a>>,
}

#[derive(Deserialize)]
struct ReplayEntry {
    ref_id: String,
}

#[derive(Serialize)]
struct AbandonEntry<'a> {
    reference_id: &'a str,
    reason: &'a str,
}

pub struct AllocateResult {
    pub urls: HashMap<String, String>,
    pub replay_ref_ids: Option<Vec<String>>,
}

pub enum UploadOutcome {
    Uploaded,
    Expired(AgentError),
    Failed(AgentError),
}

/// `POST <remote>/upload`. Empty input short-circuits to an empty result
/// without a network call.
pub async fn allocate(
    retry: &RetryingClient,
    http: &Client,
    ctx: &RemoteContext,
    reference_ids: &[String],
    cancelled: &AtomicBool,
) -> Result<AllocateResult, SendError> {
    if reference_ids.is_empty() {
        return Ok(AllocateResult {
            urls: HashMap::new(),
            replay_ref_ids: None,
        });
    }

    let url = format!("{}/upload", ctx.base_url.trim_end_matches('/'));
    let body = AllocateBody {
        files: reference_ids.iter().map(|r| FileRef { reference_id: r }).collect(),
    };
    let body_bytes = serde_json::to_vec(&body).map_err(|e| SendError {
        error: AgentError::Decode(e.to_string()),
        last_response: None,
    })?;

    let count = reference_ids.len().to_string();
    let factory = || {
        http.post(&url)
            .query(&[
                ("count", count.as_str()),
                ("expiration", EXPIRATION_SECONDS),
                ("cloud_account_id", ctx.cloud_account_id.as_str()),
                ("cluster_name", ctx.cluster_name.as_str()),
                ("region", ctx.region.as_str()),
            ])
            .header("Content-Type", "application/json")
            .header("Authorization", &ctx.api_key)
            .header(SHIPPER_ID_HEADER, &ctx.shipper_id)
            .header(VERSION_HEADER, AGENT_VERSION)
            .body(body_bytes.clone())
            .build()
            .map_err(|e| AgentError::InvalidInput(e.to_string()))
    };

    let resp = retry.send(factory, || cancelled.load(Ordering::SeqCst)).await?;
    let replay_header = resp
        .headers()
        .get(REPLAY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let urls: HashMap<String, String> = resp.json().await.map_err(|e| SendError {
        error: AgentError::Decode(e.to_string()),
        last_response: None,
    })?;

    let replay_ref_ids = replay_header.and_then(|raw| {
        serde_json::from_str::<Vec<ReplayEntry>>(&raw)
            .ok()
            .map(|entries| entries.into_iter().map(|e| e.ref_id).collect())
    });

    Ok(AllocateResult { urls, replay_ref_ids })
}

/// `POST <remote>/abandon`. Empty input is a no-op — no request is sent.
pub async fn abandon(
    retry: &RetryingClient,
    http: &Client,
    ctx: &RemoteContext,
    entries: &[(String, String)],
    cancelled: &AtomicBool,
) -> Result<(), SendError> {
    if entries.is_empty() {
        return Ok(());
    }

    let url = format!("{}/abandon", ctx.base_url.trim_end_matches('/'));
    let body: Vec<AbandonEntry> = entries
        .iter()
        .map(|(id, reason)| AbandonEntry {
            reference_id: id,
            reason,
        })
        .collect();
    let body_bytes = serde_json::to_vec(&body).map_err(|e| SendError {
        error: AgentError::Decode(e.to_string()),
        last_response: None,
    })?;

    let count = entries.len().to_string();
    let factory = || {
        http.post(&url)
            .query(&[
                ("count", count.as_str()),
                ("cluster_name", ctx.cluster_name.as_str()),
                ("cloud_account_id", ctx.cloud_account_id.as_str()),
                ("region", ctx.region.as_str()),
                ("shipper_id", ctx.shipper_id.as_str()),
            ])
            .header("Content-Type", "application/json")
            .header("Authorization", &ctx.api_key)
            .header(SHIPPER_ID_HEADER, &ctx.shipper_id)
            .header(VERSION_HEADER, AGENT_VERSION)
            .body(body_bytes.clone())
            .build()
            .map_err(|e| AgentError::InvalidInput(e.to_string()))
    };

    retry.send(factory, || cancelled.load(Ordering::SeqCst)).await?;
    Ok(())
}

/// `PUT` the file's bytes to a pre-signed URL.
pub async fn upload(
    retry: &RetryingClient,
    http: &Client,
    url: &str,
    bytes: Vec<u8>,
    timeout: Duration,
    cancelled: &AtomicBool,
) -> UploadOutcome {
    let factory = || {
        http.put(url)
            .timeout(timeout)
            .body(bytes.clone())
            .build()
            .map_err(|e| AgentError::InvalidInput(e.to_string()))
    };

    match retry.send(factory, || cancelled.load(Ordering::SeqCst)).await {
        Ok(_resp) => UploadOutcome::Uploaded,
        Err(send_err) => {
            if let Some(resp) = send_err.last_response {
                if resp.status() == reqwest::StatusCode::FORBIDDEN {
                    let text = resp.text().await.unwrap_or_default();
                    if is_expired_url_body(&text) {
                        return UploadOutcome::Expired(AgentError::RemoteExpired);
                    }
                }
            }
            UploadOutcome::Failed(send_err.error)
        }
    }
}
