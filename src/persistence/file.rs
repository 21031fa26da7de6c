use super::{StateStore, SupervisorState, TradeJournal};
use crate::models::TradeDecision;
use crate::{Result, TraderError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Supervisor state as a single JSON document
///
/// Writes go to a sibling `.tmp` file which is then renamed over the target, so a
/// crash mid-write leaves the previous state intact.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Option<SupervisorState>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No state file at {:?}, starting fresh", self.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let state: SupervisorState = serde_json::from_str(&contents).map_err(|e| {
            TraderError::Persistence(format!("corrupt state file {:?}: {}", self.path, e))
        })?;

        tracing::info!(
            "Loaded state: last candle {:?}, failures {}",
            state.last_processed_candle_timestamp,
            state.consecutive_failure_count
        );

        Ok(Some(state))
    }

    async fn save(&self, state: &SupervisorState) -> Result<()> {
        ensure_parent(&self.path).await?;

        let contents = serde_json::to_string_pretty(state)?;
        let temp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;

        tracing::debug!("State saved to {:?}", self.path);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One JSON object per line
pub struct JsonLinesJournal {
    path: PathBuf,
}

impl JsonLinesJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TradeJournal for JsonLinesJournal {
    async fn append(&self, decision: &TradeDecision) -> Result<()> {
        ensure_parent(&self.path).await?;

        let mut line = serde_json::to_string(decision)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<TradeDecision>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut decisions = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeDecision>(line) {
                Ok(decision) => decisions.push(decision),
                // A torn final line after a crash; skip it
                Err(e) => tracing::warn!("Skipping journal line {}: {}", number + 1, e),
            }
        }

        let skip = decisions.len().saturating_sub(limit);
        Ok(decisions.split_off(skip))
    }
}
