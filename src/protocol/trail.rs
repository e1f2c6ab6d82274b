//! Append-only protocol artifact trail.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::artifacts::{ProtocolArtifact, serialize_artifact};
use crate::error::{FlyError, Result};

/// Receives every artifact produced while flying a waypoint.
pub trait ArtifactLog: Send + Sync {
    fn append(&self, artifact: &ProtocolArtifact) -> Result<()>;
}

/// Writes one compact JSON line per artifact to `{dir}/{waypoint_id}.jsonl`.
pub struct JsonlArtifactLog {
    base_path: PathBuf,
}

impl JsonlArtifactLog {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    /// Default location under a project root
    pub fn for_project(project_root: &Path) -> Result<Self> {
        Self::new(project_root.join(".waypoints").join("protocol"))
    }

    fn waypoint_path(&self, waypoint_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", waypoint_id))
    }
}

impl ArtifactLog for JsonlArtifactLog {
    fn append(&self, artifact: &ProtocolArtifact) -> Result<()> {
        let path = self.waypoint_path(&artifact.meta().waypoint_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serialize_artifact(artifact)?)?;
        Ok(())
    }
}

/// Keeps artifacts in memory.
#[derive(Default)]
pub struct MemoryArtifactLog {
    entries: Mutex<Vec<ProtocolArtifact>>,
}

impl MemoryArtifactLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ProtocolArtifact> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of artifacts of the given `artifact_type`
    pub fn count_of(&self, artifact_type: &str) -> usize {
        self.entries()
            .iter()
            .filter(|a| a.meta().artifact_type == artifact_type)
            .count()
    }
}

impl ArtifactLog for MemoryArtifactLog {
    fn append(&self, artifact: &ProtocolArtifact) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|e| FlyError::Storage(e.to_string()))?;
        entries.push(artifact.clone());
        Ok(())
    }
}
