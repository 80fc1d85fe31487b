//! Naming and listing of per-lifetime worker log files.
//!
//! Files are named `<prefix>-YYYYmmdd-HHMMSS.log` after the worker's start time.
//! A second worker started within the same second gets `-1`, `-2`, ... appended
//! to the stamp so no lifetime ever reuses another one's file.

use anyhow::Context;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};

use crate::error::WardenError;

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Create a fresh log file for a worker started at `started_at`.
///
/// Files are opened with `create_new`, so an existing log is never reused or
/// truncated even when another supervisor shares the directory.
pub async fn create_log_file(
    dir: &Path,
    prefix: &str,
    started_at: DateTime<Local>,
) -> std::io::Result<(PathBuf, File)> {
    let stamp = started_at.format(STAMP_FORMAT).to_string();
    let mut seq = 0u32;
    loop {
        let name = match seq {
            0 => format!("{prefix}-{stamp}.log"),
            _ => format!("{prefix}-{stamp}-{seq}.log"),
        };
        let path = dir.join(name);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                seq = seq.checked_add(1).ok_or_else(|| {
                    std::io::Error::other(format!("no free log name for stamp {stamp}"))
                })?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// File name component used in status reports
pub fn log_file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Archived log file names in `dir`, newest first
pub async fn list_logs(dir: &Path, prefix: &str) -> Result<Vec<String>, WardenError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to read log directory {}", dir.display()))
                .into());
        }
    };

    let mut logs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to read log directory {}", dir.display()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(key) = parse_log_name(&name, prefix) {
            logs.push((key, name));
        }
    }

    logs.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(logs.into_iter().map(|(_, name)| name).collect())
}

/// Sort key `(stamp, sequence)` of a log file name produced by `create_log_file`
fn parse_log_name(name: &str, prefix: &str) -> Option<(String, u32)> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(".log")?;

    // YYYYmmdd-HHMMSS is 15 bytes
    if rest.len() < 15 || !rest.is_char_boundary(15) {
        return None;
    }
    let (stamp, suffix) = rest.split_at(15);
    let (date, time) = stamp.split_once('-')?;
    if date.len() != 8
        || time.len() != 6
        || !date.bytes().all(|b| b.is_ascii_digit())
        || !time.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let seq = match suffix {
        "" => 0,
        _ => suffix.strip_prefix('-')?.parse().ok()?,
    };
    Some((stamp.to_string(), seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("warden-logs-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_create_appends_sequence_on_collision() {
        let dir = scratch_dir("collision");
        let at = Local.with_ymd_and_hms(2026, 2, 14, 9, 47, 3).unwrap();

        let (first, _) = create_log_file(&dir, "app", at).await.unwrap();
        assert_eq!(log_file_name(&first), "app-20260214-094703.log");

        let (second, _) = create_log_file(&dir, "app", at).await.unwrap();
        assert_eq!(log_file_name(&second), "app-20260214-094703-1.log");

        let (third, _) = create_log_file(&dir, "app", at).await.unwrap();
        assert_eq!(log_file_name(&third), "app-20260214-094703-2.log");
        assert_eq!(list_logs(&dir, "app").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_create_never_truncates_existing_log() {
        let dir = scratch_dir("no-truncate");
        let at = Local.with_ymd_and_hms(2026, 2, 14, 9, 47, 3).unwrap();
        let taken = dir.join("app-20260214-094703.log");
        std::fs::write(&taken, "earlier lifetime\n").unwrap();

        let (path, _) = create_log_file(&dir, "app", at).await.unwrap();
        assert_eq!(log_file_name(&path), "app-20260214-094703-1.log");
        assert_eq!(
            std::fs::read_to_string(&taken).unwrap(),
            "earlier lifetime\n"
        );
    }

    #[test]
    fn test_parse_log_name() {
        assert_eq!(
            parse_log_name("app-20260214-094703.log", "app"),
            Some(("20260214-094703".to_string(), 0))
        );
        assert_eq!(
            parse_log_name("app-20260214-094703-12.log", "app"),
            Some(("20260214-094703".to_string(), 12))
        );
        assert_eq!(parse_log_name("web-20260214-094703.log", "app"), None);
        assert_eq!(parse_log_name("app-notes.log", "app"), None);
        assert_eq!(parse_log_name("app-20260214-094703.txt", "app"), None);
    }

    #[tokio::test]
    async fn test_list_logs_newest_first() {
        let dir = scratch_dir("list");
        for name in [
            "app-20260214-094703.log",
            "app-20260214-094703-1.log",
            "app-20260101-000000.log",
            "other-20270101-000000.log",
            "readme.txt",
        ] {
            std::fs::write(dir.join(name), "").unwrap();
        }

        let logs = list_logs(&dir, "app").await.unwrap();
        assert_eq!(
            logs,
            vec![
                "app-20260214-094703-1.log",
                "app-20260214-094703.log",
                "app-20260101-000000.log",
            ]
        );
    }

    #[tokio::test]
    async fn test_list_logs_missing_directory_is_empty() {
        let dir = std::env::temp_dir().join("warden-logs-does-not-exist");
        assert!(list_logs(&dir, "app").await.unwrap().is_empty());
    }
}
