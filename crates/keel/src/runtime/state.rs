//! Container record persistence.

use std::path::PathBuf;

use keel_common::paths::CONTAINER_CONFIG;
use keel_common::{KeelError, KeelResult};

use super::record::ContainerRecord;

/// Stores one record per container under `<state_dir>/<name>/config.json`.
#[derive(Debug, Clone)]
pub struct StateManager {
    /// Base path for container directories.
    state_dir: PathBuf,
}

impl StateManager {
    /// Create a new state manager.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Directory owned by a container.
    #[must_use]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }

    /// Get the path to a container's record.
    #[must_use]
    pub fn state_path(&self, name: &str) -> PathBuf {
        self.container_dir(name).join(CONTAINER_CONFIG)
    }

    /// Save a record, replacing any previous one.
    pub fn save(&self, record: &ContainerRecord) -> KeelResult<()> {
        let dir = self.container_dir(&record.name);
        std::fs::create_dir_all(&dir)?;

        let path = self.state_path(&record.name);
        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer(tmp.as_file(), record)?;
        tmp.persist(&path).map_err(|e| KeelError::Io(e.error))?;

        tracing::debug!(
            container = %record.name,
            path = %path.display(),
            "Saved container record"
        );
        Ok(())
    }

    /// Load a record by container name.
    pub fn load(&self, name: &str) -> KeelResult<ContainerRecord> {
        let path = self.state_path(name);

        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeelError::ContainerNotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_str(&json)?)
    }

    /// Delete a container's directory.
    pub fn delete(&self, name: &str) -> KeelResult<()> {
        let dir = self.container_dir(name);

        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            tracing::debug!(container = %name, path = %dir.display(), "Deleted container record");
        }

        Ok(())
    }

    /// Load every readable record, sorted by name.
    ///
    /// Unreadable records are logged and skipped.
    pub fn list(&self) -> KeelResult<Vec<ContainerRecord>> {
        let mut records = Vec::new();

        if !self.state_dir.exists() {
            return Ok(records);
        }

        for entry in std::fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            if !entry.path().join(CONTAINER_CONFIG).exists() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load(&name) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(container = %name, error = %e, "Skipping unreadable record"),
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Check if a container exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.state_path(name).exists()
    }
}
