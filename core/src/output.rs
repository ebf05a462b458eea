//! Extraction of typed results from the backup tool's output.

use crate::{Error, FileStats, KeyInfo, LockStats, Result, Snapshot, SnapshotStats};
use serde::Deserialize;

const CHECK_SUCCESS_MARKER: &str = "no errors were found";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BackupMessage {
    message_type: String,
    files_new: u64,
    files_changed: u64,
    files_unmodified: u64,
    data_added: u64,
    total_files_processed: u64,
    total_bytes_processed: u64,
    total_duration: f64,
    snapshot_id: String,
}

#[derive(Debug, Deserialize)]
struct RawDataStats {
    total_size: u64,
}

/// Collects one `SnapshotStats` per `summary` message, in output order.
///
/// A backup fanned out to several repositories prints one summary per repository,
/// so the position of an entry identifies the repository it belongs to.
pub fn extract_backup_info(output: &[u8], path: &str) -> Result<Vec<SnapshotStats>> {
    let text = String::from_utf8_lossy(output);
    let mut stats = Vec::new();

    for line in text.lines().map(str::trim) {
        if !line.starts_with('{') {
            continue;
        }
        let message: BackupMessage = serde_json::from_str(line).map_err(|source| Error::Parse {
            operation: format!("backup of {path}"),
            source,
        })?;
        if message.message_type != "summary" {
            continue;
        }
        stats.push(SnapshotStats {
            name: message.snapshot_id,
            path: path.to_string(),
            total_size: message.total_bytes_processed,
            uploaded: message.data_added,
            processing_time: message.total_duration,
            file_stats: FileStats {
                total_files: message.total_files_processed,
                new_files: message.files_new,
                modified_files: message.files_changed,
                unmodified_files: message.files_unmodified,
            },
            time: None,
        });
    }

    Ok(stats)
}

pub fn extract_check_info(output: &[u8]) -> bool {
    String::from_utf8_lossy(output)
        .lines()
        .any(|line| line.contains(CHECK_SUCCESS_MARKER))
}

/// Reads the repository size from `stats --mode raw-data --json` output.
pub fn extract_stats_info(output: &[u8]) -> Result<String> {
    let stats: RawDataStats = serde_json::from_slice(output).map_err(|source| Error::Parse {
        operation: "stats".to_string(),
        source,
    })?;
    Ok(stats.total_size.to_string())
}

pub fn extract_snapshots(output: &[u8]) -> Result<Vec<Snapshot>> {
    serde_json::from_slice(output).map_err(|source| Error::Parse {
        operation: "snapshots".to_string(),
        source,
    })
}

/// One lock ID per non-empty line.
pub fn extract_lock_ids(output: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn extract_lock_stats(output: &[u8]) -> Result<LockStats> {
    serde_json::from_slice(output).map_err(|source| Error::Parse {
        operation: "cat lock".to_string(),
        source,
    })
}

pub fn extract_keys(output: &[u8]) -> Result<Vec<KeyInfo>> {
    serde_json::from_slice(output).map_err(|source| Error::Parse {
        operation: "key list".to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_REPOSITORY_BACKUP: &str = r#"{"message_type":"status","percent_done":0.5,"total_files":3}
{"message_type":"summary","files_new":2,"files_changed":1,"files_unmodified":7,"dirs_new":0,"data_added":2048,"total_files_processed":10,"total_bytes_processed":40960,"total_duration":1.25,"snapshot_id":"aaaa1111"}
some text the tool printed
{"message_type":"summary","files_new":10,"files_changed":0,"files_unmodified":0,"data_added":40960,"total_files_processed":10,"total_bytes_processed":40960,"total_duration":3.5,"snapshot_id":"bbbb2222"}
"#;

    #[test]
    fn test_backup_summary_per_repository() {
        let stats = extract_backup_info(TWO_REPOSITORY_BACKUP.as_bytes(), "/data").unwrap();

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "aaaa1111");
        assert_eq!(stats[0].path, "/data");
        assert_eq!(stats[0].uploaded, 2048);
        assert_eq!(stats[0].file_stats.modified_files, 1);
        assert_eq!(stats[1].name, "bbbb2222");
        assert_eq!(stats[1].processing_time, 3.5);
    }

    #[test]
    fn test_backup_without_summary_is_empty() {
        let stats = extract_backup_info(b"", "/data").unwrap();
        assert!(stats.is_empty());
    }

    #[test]
    fn test_malformed_backup_json_is_an_error() {
        let err = extract_backup_info(b"{\"message_type\":", "/data").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.to_string().contains("backup of /data"));
    }

    #[test]
    fn test_check_and_stats() {
        assert!(extract_check_info(b"load indexes\nno errors were found\n"));
        assert!(!extract_check_info(b"error: pack 1234 damaged\n"));

        let size = extract_stats_info(br#"{"total_size":123456,"snapshots_count":4}"#).unwrap();
        assert_eq!(size, "123456");
        assert!(extract_stats_info(b"not json").is_err());
    }

    #[test]
    fn test_lock_parsing() {
        let ids = extract_lock_ids(b"lockA\n\n  lockB  \n");
        assert_eq!(ids, vec!["lockA", "lockB"]);

        let stats = extract_lock_stats(
            br#"{"time":"2024-05-01T12:00:00Z","exclusive":true,"hostname":"pod-1","username":"root","pid":17}"#,
        )
        .unwrap();
        assert!(stats.exclusive);
        assert_eq!(stats.hostname, "pod-1");
        assert_eq!(stats.pid, 17);
    }

    #[test]
    fn test_snapshot_listing() {
        assert!(extract_snapshots(b"[]").unwrap().is_empty());
        assert!(matches!(extract_snapshots(b"oops"), Err(Error::Parse { .. })));
    }
}
