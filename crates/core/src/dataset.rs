use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::job::DatasetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    New,
    Upload,
    Queued,
    Running,
    SettingMetadata,
    Ok,
    Empty,
    Error,
    FailedMetadata,
    Paused,
    Deferred,
    Discarded,
}

impl DatasetState {
    /// Terminal states a consuming job may start from.
    pub fn is_ready(&self) -> bool {
        matches!(self, DatasetState::Ok | DatasetState::Empty)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, DatasetState::Error | DatasetState::FailedMetadata)
    }
}

impl std::fmt::Display for DatasetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DatasetState::New => "new",
            DatasetState::Upload => "upload",
            DatasetState::Queued => "queued",
            DatasetState::Running => "running",
            DatasetState::SettingMetadata => "setting_metadata",
            DatasetState::Ok => "ok",
            DatasetState::Empty => "empty",
            DatasetState::Error => "error",
            DatasetState::FailedMetadata => "failed_metadata",
            DatasetState::Paused => "paused",
            DatasetState::Deferred => "deferred",
            DatasetState::Discarded => "discarded",
        };
        write!(f, "{}", s)
    }
}

/// A dataset a job reads or writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    /// User-facing display number within its history.
    pub hid: u32,
    pub name: String,
    pub state: DatasetState,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub file_size: u64,
    /// Line/sequence count, when known.
    #[serde(default)]
    pub records: Option<u64>,
    pub file_path: PathBuf,
    #[serde(default)]
    pub info: Option<String>,
}

impl Dataset {
    pub fn new(id: DatasetId, hid: u32, name: impl Into<String>, state: DatasetState) -> Self {
        let name = name.into();
        Self {
            id,
            hid,
            file_path: PathBuf::from(format!("datasets/dataset_{}.dat", id)),
            name,
            state,
            deleted: false,
            file_size: 0,
            records: None,
            info: None,
        }
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.file_size = bytes;
        self
    }

    pub fn with_records(mut self, records: u64) -> Self {
        self.records = Some(records);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = path.into();
        self
    }

    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }
}

/// Named link from a job to one of its datasets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetAssociation {
    pub name: String,
    pub dataset_id: DatasetId,
}

impl DatasetAssociation {
    pub fn new(name: impl Into<String>, dataset_id: DatasetId) -> Self {
        Self {
            name: name.into(),
            dataset_id,
        }
    }
}
