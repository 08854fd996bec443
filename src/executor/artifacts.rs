//! Run artifact files.
//!
//! Layout: `{root}/{project_id}/{run_id}/{task_id}-{timestamp_ms}.{ext}`,
//! served under `{base_url}/{project_id}/{run_id}/{file}`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Screenshot,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "screenshot",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "png",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "screenshot" => ArtifactKind::Screenshot,
            other => anyhow::bail!("unknown artifact kind '{other}'"),
        })
    }
}

/// Typed reference to a file produced by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub task_id: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub url: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    base_url: String,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` into the run's artifact directory.
    pub async fn write(
        &self,
        project_id: &str,
        run_id: &str,
        task_id: &str,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<Artifact> {
        let project = sanitize(project_id);
        let run = sanitize(run_id);
        let created_at = Utc::now();
        let file = format!(
            "{}-{}.{}",
            sanitize(task_id),
            created_at.timestamp_millis(),
            kind.extension()
        );

        let dir = self.root.join(&project).join(&run);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create artifact dir {}", dir.display()))?;
        let path = dir.join(&file);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write artifact {}", path.display()))?;

        debug!(path = %path.display(), size = bytes.len(), "artifact written");

        Ok(Artifact {
            task_id: task_id.to_string(),
            kind,
            url: format!("{}/{project}/{run}/{file}", self.base_url),
            path,
            size_bytes: bytes.len() as u64,
            created_at,
        })
    }
}

/// Keep ids usable as single path segments.
fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
