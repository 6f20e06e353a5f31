//! Shipper (spec.md §4.E): discovers sealed segments, uploads them in
//! bounded parallel under pre-signed URLs, and drives replay/abandon.

pub mod lock;
pub mod remote;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::client::{RetryPolicy, RetryingClient};
use crate::error::{AgentError, Result};
use crate::metrics::Metrics;
use crate::model::{reference_id_for, ReplayRequest};
use crate::segment::SegmentStore;
use lock::FileLock;
use remote::{allocate, abandon, upload, RemoteContext, UploadOutcome};

const CHUNK_SIZE: usize = 200;
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const LOCK_MAX_RETRIES: u32 = 60;
const SHIPPER_ID_FILE: &str = ".shipperid";
const UPLOADED_DIR: &str = "uploaded";
const REPLAY_DIR: &str = "replay";

#[derive(Debug, Clone)]
pub struct ShipperConfig {
    pub base_dir: PathBuf,
    pub remote_base_url: String,
    pub api_key: String,
    pub cluster_name: String,
    pub cloud_account_id: String,
    pub region: String,
    pub send_timeout: Duration,
    pub purge_older_than: Duration,
}

pub struct Shipper {
    cfg: ShipperConfig,
    store: Arc<SegmentStore>,
    http: Client,
    retry: RetryingClient,
    shipper_id: String,
    metrics: Arc<Metrics>,
    max_parallel: usize,
    cancelled: Arc<AtomicBool>,
}

fn unique_id_of(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim_end_matches(".json.br").to_string())
        .unwrap_or_default()
}

fn resolve_shipper_id(base_dir: &Path) -> Result<String> {
    let id_path = base_dir.join(SHIPPER_ID_FILE);
    if let Ok(existing) = fs::read_to_string(&id_path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return Ok(hostname);
        }
    }
    let generated = Uuid::new_v4().to_string();
    fs::write(&id_path, &generated)?;
    Ok(generated)
}

impl Shipper {
    /// `cancelled` is shared with the process's shutdown handler: once set,
    /// every in-flight and future `retry.send` call in this shipper bails
    /// out immediately instead of retrying (spec.md §5).
    pub fn new(
        cfg: ShipperConfig,
        store: Arc<SegmentStore>,
        metrics: Arc<Metrics>,
        cancelled: Arc<AtomicBool>,
    ) -> Result<Self> {
        fs::create_dir_all(&cfg.base_dir)?;
        let shipper_id = resolve_shipper_id(&cfg.base_dir)?;
        let http = Client::builder()
            .build()
            .map_err(|e| AgentError::InvalidInput(e.to_string()))?;
        let retry = RetryingClient::new(http.clone(), RetryPolicy::default());
        let max_parallel = num_cpus::get().min(10).max(1);
        Ok(Self {
            cfg,
            store,
            http,
            retry,
            shipper_id,
            metrics,
            max_parallel,
            cancelled,
        })
    }

    pub fn shipper_id(&self) -> &str {
        &self.shipper_id
    }

    fn remote_ctx(&self) -> RemoteContext {
        RemoteContext {
            base_url: self.cfg.remote_base_url.clone(),
            api_key: self.cfg.api_key.clone(),
            cluster_name: self.cfg.cluster_name.clone(),
            cloud_account_id: self.cfg.cloud_account_id.clone(),
            region: self.cfg.region.clone(),
            shipper_id: self.shipper_id.clone(),
        }
    }

    /// One full shipper cycle: upload new sealed segments, process replay
    /// requests, then run the disk-pressure cleanup pass.
    pub async fn run_cycle(&self) -> Result<()> {
        {
            let base_lock = FileLock::acquire(
                self.cfg.base_dir.join(".lock"),
                LOCK_STALE_AFTER,
                LOCK_RETRY_INTERVAL,
                LOCK_MAX_RETRIES,
            )
            .await?;

            let sealed = self.store.list_sealed("")?;
            for chunk in sealed.chunks(CHUNK_SIZE) {
                self.ship_chunk(chunk).await?;
            }
            drop(base_lock);
        }

        {
            let replay_dir = self.cfg.base_dir.join(REPLAY_DIR);
            fs::create_dir_all(&replay_dir)?;
            let replay_lock = FileLock::acquire(
                replay_dir.join(".lock"),
                LOCK_STALE_AFTER,
                LOCK_RETRY_INTERVAL,
                LOCK_MAX_RETRIES,
            )
            .await?;
            self.process_replay_requests(&replay_dir).await;
            drop(replay_lock);
        }

        let uploaded_dir = self.cfg.base_dir.join(UPLOADED_DIR);
        fs::create_dir_all(&uploaded_dir)?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.cfg.purge_older_than).unwrap_or(chrono::Duration::zero());
        match crate::pressure::run_cleanup_cycle(&uploaded_dir, cutoff) {
            Ok(report) => {
                self.metrics.purged_total.inc_by(report.files_removed);
                info!(
                    files_removed = report.files_removed,
                    bytes_before = report.bytes_before,
                    bytes_after = report.bytes_after,
                    "disk pressure cleanup snapshot"
                );
            }
            Err(e) => warn!(error = %e, "disk pressure cleanup failed"),
        }

        info!("Successfully ran the shipper application");
        Ok(())
    }

    /// Allocate URLs for `files` and upload them with bounded parallelism.
    /// A single file-level failure aborts the chunk (and propagates to the
    /// caller, which aborts the remaining chunks in the cycle).
    async fn ship_chunk(&self, files: &[PathBuf]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let reference_ids: Vec<String> = files
            .iter()
            .map(|p| reference_id_for(&unique_id_of(p)))
            .collect();
        let ctx = self.remote_ctx();
        let alloc = allocate(&self.retry, &self.http, &ctx, &reference_ids, &self.cancelled)
            .await
            .map_err(|e| e.error)?;

        if let Some(replay_ids) = alloc.replay_ref_ids {
            if !replay_ids.is_empty() {
                self.persist_replay_request(&replay_ids)?;
            }
        }

        let max_parallel = self.max_parallel;
        let results: Vec<Result<()>> = stream::iter(files.iter().zip(reference_ids.iter()))
            .map(|(path, reference_id)| {
                let url = alloc.urls.get(reference_id).cloned();
                async move {
                    let Some(url) = url else {
                        // No URL allocated for this reference id: leave the
                        // file for the next discovery pass.
                        return Ok(());
                    };
                    let bytes = tokio::fs::read(path).await.map_err(AgentError::Storage)?;
                    match upload(
                        &self.retry,
                        &self.http,
                        &url,
                        bytes,
                        self.cfg.send_timeout,
                        &self.cancelled,
                    )
                    .await
                    {
                        UploadOutcome::Uploaded => {
                            self.mark_uploaded(path)?;
                            self.metrics.shipped_total.inc();
                            Ok(())
                        }
                        UploadOutcome::Expired(e) => {
                            warn!(error = %e, path = %path.display(), "pre-signed url expired, deferring to next cycle");
                            Ok(())
                        }
                        UploadOutcome::Failed(e) => Err(e),
                    }
                }
            })
            .buffer_unordered(max_parallel)
            .collect()
            .await;

        for result in results {
            result?;
        }
        Ok(())
    }

    /// If the file path already contains `uploaded/`, this is a no-op.
    fn mark_uploaded(&self, path: &Path) -> Result<()> {
        if path.components().any(|c| c.as_os_str() == UPLOADED_DIR) {
            return Ok(());
        }
        let uploaded_dir = self.cfg.base_dir.join(UPLOADED_DIR);
        fs::create_dir_all(&uploaded_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&uploaded_dir, fs::Permissions::from_mode(0o755))?;
        }
        let dest = uploaded_dir.join(path.file_name().ok_or_else(|| {
            AgentError::InvalidInput(format!("segment path has no filename: {}", path.display()))
        })?);
        fs::rename(path, dest)?;
        Ok(())
    }

    fn persist_replay_request(&self, reference_ids: &[String]) -> Result<()> {
        let millis = Utc::now().timestamp_millis();
        let replay_dir = self.cfg.base_dir.join(REPLAY_DIR);
        fs::create_dir_all(&replay_dir)?;
        let path = replay_dir.join(format!("replay-{millis}.json"));
        let req = ReplayRequest {
            filepath: self.cfg.base_dir.to_string_lossy().to_string(),
            reference_ids: reference_ids.to_vec(),
        };
        let bytes = serde_json::to_vec(&req).map_err(|e| AgentError::Decode(e.to_string()))?;
        fs::write(path, bytes)?;
        Ok(())
    }

    async fn process_replay_requests(&self, replay_dir: &Path) {
        let Ok(entries) = fs::read_dir(replay_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !(name.starts_with("replay-") && name.ends_with(".json")) {
                continue;
            }
            if let Err(e) = self.process_one_replay(&path).await {
                warn!(file = %path.display(), error = %e, "replay request processing failed, retrying next cycle");
            }
        }
    }

    async fn process_one_replay(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        let req: ReplayRequest =
            serde_json::from_str(&text).map_err(|e| AgentError::Decode(e.to_string()))?;

        let mut found = Vec::new();
        let mut found_ids: HashSet<String> = HashSet::new();
        for dir in [self.cfg.base_dir.clone(), self.cfg.base_dir.join(UPLOADED_DIR)] {
            for entry in WalkDir::new(&dir)
                .max_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let p = entry.into_path();
                if !p.to_string_lossy().ends_with(".json.br") {
                    continue;
                }
                let rid = reference_id_for(&unique_id_of(&p));
                if req.reference_ids.contains(&rid) && found_ids.insert(rid) {
                    found.push(p);
                }
            }
        }

        let missing: Vec<String> = req
            .reference_ids
            .iter()
            .filter(|id| !found_ids.contains(*id))
            .cloned()
            .collect();

        if !missing.is_empty() {
            let ctx = self.remote_ctx();
            let entries: Vec<(String, String)> = missing
                .iter()
                .map(|id| (id.clone(), "not found".to_string()))
                .collect();
            abandon(&self.retry, &self.http, &ctx, &entries, &self.cancelled)
                .await
                .map_err(|e| e.error)?;
            self.metrics.abandoned_total.inc_by(missing.len() as u64);
        }

        for chunk in found.chunks(CHUNK_SIZE) {
            self.ship_chunk(chunk).await?;
        }

        fs::remove_file(path)?;
        self.metrics.replay_requests_total.inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentKind;
    use crate::segment::SegmentStoreConfig;

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    #[test]
    fn shipper_id_persists_generated_value() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var("HOSTNAME");
        let first = resolve_shipper_id(dir.path()).unwrap();
        let second = resolve_shipper_id(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn mark_uploaded_is_idempotent_on_already_uploaded_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SegmentStore::new(
                dir.path().join("store"),
                ContentKind::Metrics,
                "writer",
                SegmentStoreConfig::default(),
            )
            .unwrap(),
        );
        let cfg = ShipperConfig {
            base_dir: dir.path().join("store"),
            remote_base_url: "https://example.com".into(),
            api_key: "key".into(),
            cluster_name: "cluster".into(),
            cloud_account_id: "acct".into(),
            region: "us-east-1".into(),
            send_timeout: Duration::from_secs(30),
            purge_older_than: Duration::from_secs(7 * 24 * 3600),
        };
        let shipper = Shipper::new(cfg, store, metrics(), Arc::new(AtomicBool::new(false))).unwrap();
        let already_uploaded = shipper
            .cfg
            .base_dir
            .join(UPLOADED_DIR)
            .join("metrics_1_2.json.br");
        assert!(shipper.mark_uploaded(&already_uploaded).is_ok());
        assert!(!already_uploaded.exists());
    }

    fn test_shipper(base_dir: PathBuf, remote_base_url: String) -> (Shipper, Arc<Metrics>) {
        let store = Arc::new(
            SegmentStore::new(
                base_dir.clone(),
                ContentKind::Metrics,
                "writer",
                SegmentStoreConfig::default(),
            )
            .unwrap(),
        );
        let cfg = ShipperConfig {
            base_dir,
            remote_base_url,
            api_key: "key".into(),
            cluster_name: "cluster".into(),
            cloud_account_id: "acct".into(),
            region: "us-east-1".into(),
            send_timeout: Duration::from_secs(30),
            purge_older_than: Duration::from_secs(7 * 24 * 3600),
        };
        let metrics = metrics();
        let shipper = Shipper::new(cfg, store.clone(), metrics.clone(), Arc::new(AtomicBool::new(false))).unwrap();
        (shipper, metrics)
    }

    /// Body the shipper's `allocate()` POSTs: `{"files": [{"reference_id": "..."}]}`.
    #[derive(serde::Deserialize)]
    struct AllocateRequestBody {
        files: Vec<AllocateRequestFile>,
    }
    #[derive(serde::Deserialize)]
    struct AllocateRequestFile {
        reference_id: String,
    }

    /// Maps every requested reference id to a `PUT` URL on the same mock
    /// server, optionally announcing unrelated ids via the replay header.
    struct AllocateResponder {
        base_url: String,
        replay_ref_ids: Vec<String>,
    }

    impl wiremock::Respond for AllocateResponder {
        fn respond(&self, request: &wiremock::Request) -> wiremock::ResponseTemplate {
            let body: AllocateRequestBody = serde_json::from_slice(&request.body).unwrap();
            let urls: std::collections::HashMap<String, String> = body
                .files
                .into_iter()
                .map(|f| {
                    let url = format!("{}/put/{}", self.base_url, f.reference_id);
                    (f.reference_id, url)
                })
                .collect();
            let mut template = wiremock::ResponseTemplate::new(200).set_body_json(&urls);
            if !self.replay_ref_ids.is_empty() {
                let header = serde_json::to_string(
                    &self
                        .replay_ref_ids
                        .iter()
                        .map(|id| serde_json::json!({ "ref_id": id }))
                        .collect::<Vec<_>>(),
                )
                .unwrap();
                template = template.append_header("X-CloudZero-Replay", header.as_str());
            }
            template
        }
    }

    /// Scenario 3 (spec.md §8): two sealed files, both allocated and
    /// uploaded successfully.
    #[tokio::test]
    async fn allocation_and_upload_happy_path() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer};

        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(AllocateResponder {
                base_url: server.uri(),
                replay_ref_ids: vec![],
            })
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (shipper, metrics) = test_shipper(dir.path().to_path_buf(), server.uri());
        shipper.store.put(&[sample("a"), sample("b")]).unwrap();
        shipper.store.flush().unwrap();
        assert_eq!(shipper.store.list_sealed("").unwrap().len(), 1);

        shipper.run_cycle().await.unwrap();

        assert!(shipper.store.list_sealed("").unwrap().is_empty());
        let uploaded_dir = dir.path().join(UPLOADED_DIR);
        let uploaded: Vec<_> = std::fs::read_dir(&uploaded_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(uploaded.len(), 1);
        assert_eq!(metrics.shipped_total.get(), 1);
    }

    /// Scenario 5 (spec.md §8): an expired pre-signed URL leaves the file
    /// in place for the next cycle instead of being treated as a failure.
    #[tokio::test]
    async fn expired_url_leaves_file_in_place() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer};

        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(AllocateResponder {
                base_url: server.uri(),
                replay_ref_ids: vec![],
            })
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(
                wiremock::ResponseTemplate::new(403)
                    .set_body_string("<Error>Request has expired</Error>"),
            )
            .mount(&server)
            .await;

        let (shipper, metrics) = test_shipper(dir.path().to_path_buf(), server.uri());
        shipper.store.put(&[sample("a")]).unwrap();
        shipper.store.flush().unwrap();

        shipper.run_cycle().await.unwrap();

        assert_eq!(shipper.store.list_sealed("").unwrap().len(), 1);
        assert!(!dir.path().join(UPLOADED_DIR).exists());
        assert_eq!(metrics.shipped_total.get(), 0);
    }

    /// Scenario 4 (spec.md §8): a replay id announced via the response
    /// header that doesn't correspond to any file on disk is abandoned in
    /// the same cycle, and the replay request file is removed afterward.
    #[tokio::test]
    async fn replay_header_abandons_missing_file() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer};

        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(AllocateResponder {
                base_url: server.uri(),
                replay_ref_ids: vec!["missing.parquet".to_string()],
            })
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/abandon"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (shipper, metrics) = test_shipper(dir.path().to_path_buf(), server.uri());
        shipper.store.put(&[sample("a")]).unwrap();
        shipper.store.flush().unwrap();

        shipper.run_cycle().await.unwrap();

        assert_eq!(metrics.abandoned_total.get(), 1);
        let replay_dir = dir.path().join(REPLAY_DIR);
        let remaining: Vec<_> = std::fs::read_dir(&replay_dir)
            .map(|it| it.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(remaining.is_empty());
    }

    fn sample(name: &str) -> crate::model::Sample {
        crate::model::Sample {
            id: uuid::Uuid::new_v4(),
            metric_name: name.to_string(),
            cluster_name: "cluster".into(),
            cloud_account_id: "acct".into(),
            node_name: "node".into(),
            labels: std::collections::HashMap::new(),
            value: "1".into(),
            created_at: chrono::Utc::now(),
            timestamp: chrono::Utc::now(),
        }
    }
}
