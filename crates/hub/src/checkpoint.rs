//! Auto-dosing checkpoint: a small JSON file that lets an active session
//! survive a restart. Written on start, deleted on stop.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::dosing::DoseTarget;

/// Checkpoints older than this are stale and never restored.
pub const MAX_AGE: Duration = Duration::hours(24);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default)]
    pub active: bool,
    #[serde(rename = "targetEC", default)]
    pub target_ec: Option<f64>,
    #[serde(default)]
    pub check_interval: Option<u64>,
    #[serde(default)]
    pub dispensing_delay: Option<u64>,
    #[serde(default)]
    pub water_volume: Option<f64>,
    #[serde(default)]
    pub fertilizers: Option<Vec<DoseTarget>>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Checkpoint {
    /// Active, with a target, and younger than [`MAX_AGE`].
    pub fn is_restorable(&self, now: OffsetDateTime) -> bool {
        self.active && self.target_ec.is_some() && now - self.timestamp < MAX_AGE
    }
}

pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write through a sibling temp file so a crash never leaves half a
    /// document behind.
    pub async fn save(&self, cp: &Checkpoint) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let doc = serde_json::to_vec_pretty(cp).context("failed to encode checkpoint")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, doc)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// `None` when no checkpoint exists.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let doc = match tokio::fs::read(&self.path).await {
            Ok(doc) => doc,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let cp = serde_json::from_slice(&doc)
            .with_context(|| format!("invalid checkpoint {}", self.path.display()))?;
        Ok(Some(cp))
    }

    /// Removing a checkpoint that is already gone is fine.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
