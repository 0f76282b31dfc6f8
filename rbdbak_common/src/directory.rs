// rbdbak_common is the shared library implementing the backup orchestration engine.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::command::run_command;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Wraps one local directory root. Does not cache directory contents or space
/// figures in memory: callers ask for fresh numbers whenever they need them
/// (spec.md §4.4).
pub struct BackupDirectoryManager {
    root: PathBuf,
}

impl BackupDirectoryManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates `root/a/b/c/...` lazily, joining every component, and returns the path.
    pub fn add(&self, components: &[&str]) -> io::Result<PathBuf> {
        let mut path = self.root.clone();
        for component in components {
            path.push(component);
        }

        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Reports free bytes in the backup directory by invoking `df`, matching
    /// the original's host-utility-based approach rather than a raw `statvfs`
    /// call (spec.md §4.4).
    pub fn available_bytes(&self) -> io::Result<u64> {
        self.df_field(3)
    }

    /// Reports used bytes in the backup directory by invoking `df`.
    pub fn used_bytes(&self) -> io::Result<u64> {
        self.df_field(2)
    }

    fn df_field(&self, field: usize) -> io::Result<u64> {
        let out = run_command(
            "df",
            &[
                "--output=used,avail".to_string(),
                "--block-size=1".to_string(),
                self.root.to_string_lossy().into_owned(),
            ],
        )?;

        let text = String::from_utf8_lossy(&out.stdout);
        let data_line = text
            .lines()
            .nth(1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unexpected df output"))?;

        let columns: Vec<&str> = data_line.split_whitespace().collect();
        // `field` is 2 for used (first data column) or 3 for avail (second data column);
        // df's own header columns are used/avail, offset by the 1-indexed convention above.
        let index = field - 2;
        columns
            .get(index)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unexpected df output"))
    }

    /// Lists the immediate children of `path`. When `count_only` is set, the
    /// returned vector is empty and only its length (via the caller's
    /// `.len()`) is meaningful -- callers that only need the count should
    /// prefer that mode to avoid building path strings they discard.
    pub fn list(&self, path: &Path, show_files: bool, count_only: bool) -> io::Result<Vec<String>> {
        let mut names = Vec::new();

        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let is_file = entry.file_type()?.is_file();

            if is_file && !show_files {
                continue;
            }

            if !count_only {
                names.push(entry.file_name().to_string_lossy().into_owned());
            } else {
                names.push(String::new());
            }
        }

        Ok(names)
    }

    /// Deletes the named entry (file or directory) under `path`.
    pub fn delete(&self, path: &Path, name: &str) -> io::Result<()> {
        let target = path.join(name);

        if target.is_dir() {
            fs::remove_dir_all(target)
        } else {
            fs::remove_file(target)
        }
    }

    /// Resolves `path.join(name)` and reports whether it exists.
    pub fn exists(&self, path: &Path, name: &str) -> bool {
        path.join(name).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_creates_nested_directories() {
        let root = tempdir().unwrap();
        let manager = BackupDirectoryManager::new(root.path());

        let created = manager.add(&["cluster1", "poolA", "img1"]).unwrap();
        assert!(created.is_dir());
        assert_eq!(created, root.path().join("cluster1").join("poolA").join("img1"));
    }

    #[test]
    fn delete_removes_directory_and_file() {
        let root = tempdir().unwrap();
        let manager = BackupDirectoryManager::new(root.path());

        let dir = manager.add(&["cluster1"]).unwrap();
        manager.delete(root.path(), "cluster1").unwrap();
        assert!(!dir.exists());

        fs::write(root.path().join("f.txt"), b"hi").unwrap();
        manager.delete(root.path(), "f.txt").unwrap();
        assert!(!root.path().join("f.txt").exists());
    }

    #[test]
    fn list_filters_files_when_not_requested() {
        let root = tempdir().unwrap();
        let manager = BackupDirectoryManager::new(root.path());

        manager.add(&["subdir"]).unwrap();
        fs::write(root.path().join("file.txt"), b"hi").unwrap();

        let dirs_only = manager.list(root.path(), false, false).unwrap();
        assert_eq!(dirs_only, vec!["subdir".to_string()]);
    }
}
