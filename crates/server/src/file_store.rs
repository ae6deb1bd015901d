// File storage for document snapshots

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// Checkpointed document state; the log continues from `version`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub doc_id: String,
    pub content: String,
    pub version: u64,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// File store for snapshot persistence
pub struct FileStore {
    root_dir: PathBuf,
}

impl FileStore {
    // Create a new file store
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();

        // Create root directory if it doesn't exist
        fs::create_dir_all(&root_dir)
            .await
            .context("Failed to create file store directory")?;

        Ok(FileStore { root_dir })
    }

    // Document ids come from clients, so anything outside [A-Za-z0-9_-] is hex-escaped
    fn snapshot_path(&self, doc_id: &str) -> PathBuf {
        let mut name = String::with_capacity(doc_id.len());
        for c in doc_id.chars() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                name.push(c);
            } else {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    name.push_str(&format!("%{byte:02x}"));
                }
            }
        }
        self.root_dir.join(format!("{name}.json"))
    }

    // Save snapshot to disk
    pub async fn save_snapshot(&self, snapshot: &StoredSnapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.doc_id);

        let json =
            serde_json::to_string_pretty(snapshot).context("Failed to serialize snapshot")?;

        // Write to temporary file first, then rename (atomic operation)
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .context("Failed to create temp file")?;

        file.write_all(json.as_bytes())
            .await
            .context("Failed to write snapshot")?;

        file.sync_all().await.context("Failed to sync file")?;
        drop(file);

        fs::rename(&temp_path, &path)
            .await
            .context("Failed to rename temp file")?;

        tracing::debug!(
            "Saved snapshot of {} at v{}",
            snapshot.doc_id,
            snapshot.version
        );
        Ok(())
    }

    // Load snapshot from disk, None if the document was never checkpointed
    pub async fn load_snapshot(&self, doc_id: &str) -> Result<Option<StoredSnapshot>> {
        let path = self.snapshot_path(doc_id);
        if !self.snapshot_exists(doc_id).await {
            return Ok(None);
        }

        let mut file = fs::File::open(&path)
            .await
            .context("Failed to open snapshot file")?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .await
            .context("Failed to read snapshot file")?;

        let snapshot: StoredSnapshot =
            serde_json::from_str(&contents).context("Failed to deserialize snapshot")?;

        tracing::debug!("Loaded snapshot of {} at v{}", doc_id, snapshot.version);
        Ok(Some(snapshot))
    }

    // Check if snapshot exists
    pub async fn snapshot_exists(&self, doc_id: &str) -> bool {
        fs::metadata(self.snapshot_path(doc_id)).await.is_ok()
    }
}
