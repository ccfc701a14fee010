use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use declarative::{Fqn, Stage, StateRecord, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const EXTENSION: &str = "json";

/// On-disk document: the record plus when it was last written
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    updated_at: DateTime<Utc>,
    #[serde(flatten)]
    record: StateRecord,
}

/// One pretty-printed JSON file per FQN
///
/// `app/dev/site/bucket` lives at `<root>/app/dev/site/bucket.json`. Writes
/// go to a temp file that is renamed into place, so a crash never leaves a
/// half-written record behind.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Store rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, fqn: &Fqn) -> PathBuf {
        let mut path = self.root.clone();
        for segment in fqn.segments() {
            path.push(segment);
        }
        path.set_file_name(format!("{}.{EXTENSION}", fqn.name()));
        path
    }

    /// Remove empty directories between `dir` and the store root
    fn prune(&self, mut dir: Option<&Path>) {
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            if std::fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, fqn: &Fqn) -> Result<Option<StateRecord>> {
        let path = self.path_for(fqn);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state file: {}", path.display()));
            }
        };
        let stored: StoredRecord = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
        Ok(Some(stored.record))
    }

    async fn put(&self, fqn: &Fqn, record: &StateRecord) -> Result<()> {
        let path = self.path_for(fqn);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        let stored = StoredRecord {
            updated_at: Utc::now(),
            record: record.clone(),
        };
        let content =
            serde_json::to_string_pretty(&stored).context("Failed to serialize state record")?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move state file into place: {}", path.display()))?;

        log::debug!("Saved state for {fqn} to {}", path.display());
        Ok(())
    }

    async fn delete(&self, fqn: &Fqn) -> Result<()> {
        let path = self.path_for(fqn);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove state file: {}", path.display()));
            }
        }
        self.prune(path.parent());
        log::debug!("Removed state for {fqn}");
        Ok(())
    }

    async fn list_all(&self, stage: &Stage) -> Result<BTreeSet<Fqn>> {
        let base = self.root.join(&stage.app).join(&stage.name);
        if !base.exists() {
            return Ok(BTreeSet::new());
        }

        let mut fqns = BTreeSet::new();
        for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|e| e.to_str()) != Some(EXTENSION)
            {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let Some(relative) = relative.to_str() else {
                log::warn!("Skipping non UTF-8 state file: {}", entry.path().display());
                continue;
            };
            let relative = relative.replace(std::path::MAIN_SEPARATOR, "/");
            if let Some(fqn) = relative.strip_suffix(".json") {
                fqns.insert(Fqn::from(fqn));
            }
        }
        Ok(fqns)
    }
}
