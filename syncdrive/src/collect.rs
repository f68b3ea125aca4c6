// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::warn;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    /// Leaf filename, also used as the name on the USB image.
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Collect the log files currently present in `dir`. A missing or
/// non-directory path yields an empty set. Entries that fail to stat are
/// skipped with a warning. The result is sorted by path so that successive
/// scans of an unchanged directory are identical.
pub fn collect_logs(dir: &Path, recursive: bool) -> Vec<LogEntry> {
    let mut logs = vec![];

    if !dir.is_dir() {
        return logs;
    }

    collect_into(dir, recursive, &mut logs);

    logs.sort_by(|a, b| a.path.cmp(&b.path));
    logs
}

fn collect_into(dir: &Path, recursive: bool, logs: &mut Vec<LogEntry>) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("Failed to read log directory: {dir:?}: {e}");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Failed to read log directory entry: {dir:?}: {e}");
                continue;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to stat log file: {path:?}: {e}");
                continue;
            }
        };

        if metadata.is_dir() {
            if recursive {
                collect_into(&path, recursive, logs);
            }
        } else if metadata.is_file() {
            logs.push(LogEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                size: metadata.len(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    #[test]
    fn missing_directory_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let missing = temp_dir.path().join("nope");

        assert!(super::collect_logs(&missing, true).is_empty());
    }

    #[test]
    fn flat_and_recursive() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("a.log"), b"aaaa").unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("sub/b.log"), b"bb").unwrap();

        let flat = super::collect_logs(temp_dir.path(), false);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].name, "a.log");
        assert_eq!(flat[0].size, 4);

        let all = super::collect_logs(temp_dir.path(), true);
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|l| l.name == "b.log" && l.size == 2));
    }
}
