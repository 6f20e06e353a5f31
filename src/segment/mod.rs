//! Segmented append-only sample store (spec.md §4.A).
//!
//! One active segment per `(store directory, content-kind)`, serialized
//! through a single mutex. Sealing is rename-based so a reader never
//! observes a torn file.

pub mod usage;

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use brotli::{CompressorWriter, Decompressor};
use chrono::Utc;
use walkdir::WalkDir;

use crate::error::{AgentError, Result};
use crate::model::{ContentKind, Sample, StoreUsage};

const BROTLI_BUFFER_SIZE: usize = 1 << 16;
const BROTLI_LGWIN: u32 = 22;

pub const DEFAULT_ROW_LIMIT: usize = 1_500_000;
pub const DEFAULT_COST_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_OBSERVABILITY_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct SegmentStoreConfig {
    pub row_limit: usize,
    pub max_interval: Duration,
    pub compression_level: u32,
}

impl Default for SegmentStoreConfig {
    fn default() -> Self {
        Self {
            row_limit: DEFAULT_ROW_LIMIT,
            max_interval: DEFAULT_COST_INTERVAL,
            compression_level: 9,
        }
    }
}

struct ActiveSegment {
    path: PathBuf,
    open_millis: i64,
    writer: CompressorWriter<BufWriter<File>>,
    rows: usize,
    wrote_any: bool,
    opened_at: Instant,
}

/// Owns one content-kind's worth of segments under `root`.
pub struct SegmentStore {
    root: PathBuf,
    content_kind: ContentKind,
    writer_id: String,
    config: SegmentStoreConfig,
    active: Mutex<Option<ActiveSegment>>,
}

impl SegmentStore {
    pub fn new(
        root: impl Into<PathBuf>,
        content_kind: ContentKind,
        writer_id: impl Into<String>,
        config: SegmentStoreConfig,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            content_kind,
            writer_id: writer_id.into(),
            config,
            active: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_kind(&self) -> ContentKind {
        self.content_kind
    }

    fn open_new(&self) -> Result<ActiveSegment> {
        let open_millis = Utc::now().timestamp_millis();
        let path = self.root.join(format!("{}.{open_millis}", self.writer_id));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = CompressorWriter::new(
            BufWriter::new(file),
            BROTLI_BUFFER_SIZE,
            self.config.compression_level,
            BROTLI_LGWIN,
        );
        writer.write_all(b"[")?;
        Ok(ActiveSegment {
            path,
            open_millis,
            writer,
            rows: 0,
            wrote_any: false,
            opened_at: Instant::now(),
        })
    }

    fn seal(&self, mut seg: ActiveSegment) -> Result<()> {
        seg.writer.write_all(b"]")?;
        seg.writer.flush()?;
        drop(seg.writer);
        let close_millis = Utc::now().timestamp_millis();
        let sealed_name = format!(
            "{}_{}_{}.json.br",
            self.content_kind.as_str(),
            seg.open_millis,
            close_millis
        );
        let sealed_path = self.root.join(sealed_name);
        fs::rename(&seg.path, &sealed_path)?;
        Ok(())
    }

    /// Append `samples` to the active segment, sealing and rotating if the
    /// row limit is reached. Thread-safe across concurrent callers.
    pub fn put(&self, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut guard = self.active.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.open_new()?);
        }
        {
            let seg = guard.as_mut().expect("just populated");
            for s in samples {
                if seg.wrote_any {
                    seg.writer.write_all(b",")?;
                }
                serde_json::to_writer(&mut seg.writer, s)
                    .map_err(|e| AgentError::Decode(e.to_string()))?;
                seg.wrote_any = true;
                seg.rows += 1;
            }
        }
        if guard.as_ref().expect("just populated").rows >= self.config.row_limit {
            let seg = guard.take().expect("just populated");
            self.seal(seg)?;
        }
        Ok(())
    }

    /// Seal the active segment if it holds any rows, then open a new one.
    /// A no-op when there is nothing to flush.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.active.lock().unwrap();
        if let Some(seg) = guard.take() {
            if seg.rows > 0 {
                self.seal(seg)?;
            }
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.active.lock().unwrap().as_ref().map_or(0, |s| s.rows)
    }

    pub fn elapsed_time(&self) -> Duration {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map_or(Duration::ZERO, |s| s.opened_at.elapsed())
    }

    /// Called from the background rotation ticker: seal if the active
    /// segment has been open longer than `max_interval`.
    pub fn rotate_if_due(&self) -> Result<()> {
        let due = {
            let guard = self.active.lock().unwrap();
            guard
                .as_ref()
                .map_or(false, |s| s.opened_at.elapsed() >= self.config.max_interval)
        };
        if due {
            self.flush()?;
        }
        Ok(())
    }

    /// Enumerate sealed files matching `<content-kind>_*_*.json.br` under
    /// `root.join(sub)`. Non-recursive: `sub` names a single directory.
    pub fn list_sealed(&self, sub: &str) -> Result<Vec<PathBuf>> {
        let dir = if sub.is_empty() {
            self.root.clone()
        } else {
            self.root.join(sub)
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", self.content_kind.as_str());
        let mut out: Vec<PathBuf> = WalkDir::new(&dir)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                let name = e.file_name().to_string_lossy();
                name.starts_with(&prefix) && name.ends_with(".json.br")
            })
            .map(|e| e.into_path())
            .collect();
        out.sort();
        Ok(out)
    }

    pub fn usage(&self, limit: u64, sub: &str) -> Result<StoreUsage> {
        let dir = if sub.is_empty() {
            self.root.clone()
        } else {
            self.root.join(sub)
        };
        Ok(usage::disk_usage(&dir)?.capped(limit))
    }

    /// Stream-decode a sealed segment back into samples.
    pub fn read_segment(&self, path: &Path) -> Result<Vec<Sample>> {
        let file = File::open(path)?;
        let mut decoder = Decompressor::new(file, BROTLI_BUFFER_SIZE);
        let mut buf = Vec::new();
        decoder.read_to_end(&mut buf)?;
        serde_json::from_slice(&buf).map_err(|e| AgentError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentKind;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn sample(name: &str) -> Sample {
        Sample {
            id: Uuid::new_v4(),
            metric_name: name.to_string(),
            cluster_name: "cluster".into(),
            cloud_account_id: "acct".into(),
            node_name: "node".into(),
            labels: HashMap::new(),
            value: "1".into(),
            created_at: Utc::now(),
            timestamp: Utc::now(),
        }
    }

    fn store(dir: &Path, row_limit: usize) -> SegmentStore {
        SegmentStore::new(
            dir,
            ContentKind::Metrics,
            "writer-a",
            SegmentStoreConfig {
                row_limit,
                max_interval: Duration::from_secs(600),
                compression_level: 5,
            },
        )
        .unwrap()
    }

    #[test]
    fn put_then_flush_roundtrips() {
        use pretty_assertions::assert_eq;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1_000);
        let samples = vec![sample("a"), sample("b")];
        store.put(&samples).unwrap();
        assert_eq!(store.pending(), 2);
        store.flush().unwrap();
        assert_eq!(store.pending(), 0);

        let sealed = store.list_sealed("").unwrap();
        assert_eq!(sealed.len(), 1);
        let back = store.read_segment(&sealed[0]).unwrap();
        assert_eq!(back, samples);
    }

    #[test]
    fn flush_on_empty_store_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1_000);
        store.flush().unwrap();
        assert!(store.list_sealed("").unwrap().is_empty());
    }

    #[test]
    fn row_limit_triggers_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 2);
        store.put(&[sample("a"), sample("b")]).unwrap();
        assert_eq!(store.pending(), 0);
        assert_eq!(store.list_sealed("").unwrap().len(), 1);
    }

    #[test]
    fn sealed_filename_matches_naming_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1);
        store.put(&[sample("a")]).unwrap();
        let sealed = store.list_sealed("").unwrap();
        let name = sealed[0].file_name().unwrap().to_string_lossy().to_string();
        let parts: Vec<&str> = name.trim_end_matches(".json.br").split('_').collect();
        assert_eq!(parts[0], "metrics");
        assert!(parts[1].parse::<i64>().is_ok());
        assert!(parts[2].parse::<i64>().is_ok());
    }
}
