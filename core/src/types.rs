use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type SnapshotID = String;

/// A snapshot as reported by `restic snapshots --json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotID,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub tree: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
}

impl Snapshot {
    pub fn short_id(&self) -> String {
        match &self.short_id {
            Some(id) => id.clone(),
            None => self.id.chars().take(8).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub total_files: u64,
    pub new_files: u64,
    pub modified_files: u64,
    pub unmodified_files: u64,
}

/// Result of backing up one target into one repository.
///
/// Sizes are byte counts and the processing time is in seconds, exactly as the
/// tool reported them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub name: String,
    pub path: String,
    pub total_size: u64,
    pub uploaded: u64,
    pub processing_time: f64,
    pub file_stats: FileStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostBackupPhase {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostBackupStats {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<HostBackupPhase>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostBackupStats {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    /// Replaces the entry with the same snapshot name, or appends a new one.
    pub fn upsert_snapshot_stats(&mut self, stats: SnapshotStats) {
        match self.snapshots.iter_mut().find(|s| s.name == stats.name) {
            Some(existing) => *existing = stats,
            None => self.snapshots.push(stats),
        }
    }
}

/// Backup results for one repository, one entry per host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupOutput {
    pub stats: Vec<HostBackupStats>,
}

impl BackupOutput {
    /// Replaces the entry for the same host, or appends a new one.
    pub fn upsert_host_backup_stats(&mut self, stats: HostBackupStats) {
        match self.stats.iter_mut().find(|s| s.hostname == stats.hostname) {
            Some(existing) => *existing = stats,
            None => self.stats.push(stats),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub integrity: bool,
    pub size: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostRestorePhase {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRestoreStats {
    pub hostname: String,
    pub phase: HostRestorePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Metadata of one repository lock, as printed by `restic cat lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

/// One entry of `restic key list --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: String,
    #[serde(default)]
    pub current: bool,
    #[serde(default, rename = "userName")]
    pub user_name: String,
    #[serde(default, rename = "hostName")]
    pub host_name: String,
    #[serde(default)]
    pub created: String,
}
