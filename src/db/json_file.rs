use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{StateDocument, StateStore};

/// One pretty-printed JSON file per session under `dir`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            bail!("invalid session id {:?}", session_id);
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self, session_id: &str) -> Result<Option<StateDocument>> {
        let path = self.path_for(session_id)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            info!(path = %path.display(), "No saved state, starting fresh");
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)
            .await
            .context("Failed to read state file")?;
        let document = StateDocument::from_json(&contents)
            .with_context(|| format!("Failed to parse state file {}", path.display()))?;

        debug!(path = %path.display(), "Loaded state");
        Ok(Some(document))
    }

    async fn save(&self, document: &StateDocument) -> Result<()> {
        let path = self.path_for(&document.session_id)?;
        fs::create_dir_all(&self.dir)
            .await
            .context("Failed to create state directory")?;

        let contents = document.to_json().context("Failed to serialize state")?;

        // Readers see either the old file or the new one, and the new one
        // is on disk before it replaces the old
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .context("Failed to create temp state file")?;
        file.write_all(contents.as_bytes())
            .await
            .context("Failed to write temp state file")?;
        file.sync_all().await.context("Failed to sync temp state file")?;
        drop(file);
        fs::rename(&temp_path, &path)
            .await
            .context("Failed to rename state file")?;

        Ok(())
    }

    async fn session_ids(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read state directory"),
        };

        let mut sessions: Vec<(SystemTime, String)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified = entry.metadata().await?.modified()?;
            sessions.push((modified, id.to_string()));
        }

        sessions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(sessions.into_iter().map(|(_, id)| id).collect())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.dir.display())
    }
}
