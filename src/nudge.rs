use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Why a nudge is waiting. Serialized exactly as the banner spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NudgeReason {
    #[serde(rename = "urgent priority")]
    UrgentPriority,
    #[serde(rename = "high priority")]
    HighPriority,
    #[serde(rename = "worker_done")]
    WorkerDone,
}

impl NudgeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UrgentPriority => "urgent priority",
            Self::HighPriority => "high priority",
            Self::WorkerDone => "worker_done",
        }
    }
}

/// Single-slot marker: the latest qualifying message for a recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NudgeMarker {
    pub recipient: String,
    pub sender: String,
    pub subject: String,
    pub message_id: i64,
    pub reason: NudgeReason,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum NudgeError {
    #[error("nudge registry io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("nudge marker corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// File-per-recipient registry under `.overstory/pending-nudges/`.
/// Lock-free: last write wins, which is exactly the single-slot contract.
pub struct NudgeRegistry {
    dir: PathBuf,
}

impl NudgeRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn marker_path(&self, recipient: &str) -> PathBuf {
        self.dir.join(format!("{recipient}.json"))
    }

    /// Overwrite the recipient's slot with this marker.
    pub fn set(&self, marker: &NudgeMarker) -> Result<(), NudgeError> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(marker)?;
        std::fs::write(self.marker_path(&marker.recipient), json)?;
        Ok(())
    }

    /// Absent file (or absent directory) means no pending nudge.
    pub fn get(&self, recipient: &str) -> Result<Option<NudgeMarker>, NudgeError> {
        let content = match std::fs::read_to_string(self.marker_path(recipient)) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Clearing an empty slot is a no-op.
    pub fn clear(&self, recipient: &str) -> Result<(), NudgeError> {
        match std::fs::remove_file(self.marker_path(recipient)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
