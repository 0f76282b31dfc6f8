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

use crate::engine::ImageDescriptor;
use crate::error::MetadataResult;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// The four named documents held by the durable metadata store (spec.md §3/§6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Document {
    BackupInfo,
    RbdInfoList,
    SnapshotMaintainList,
    BackupCirculationList,
}

impl Document {
    pub const ALL: [Document; 4] = [
        Document::BackupInfo,
        Document::RbdInfoList,
        Document::SnapshotMaintainList,
        Document::BackupCirculationList,
    ];

    fn suffix(self) -> &'static str {
        match self {
            Document::BackupInfo => "meta.backup_info",
            Document::RbdInfoList => "meta.rbd_info_list",
            Document::SnapshotMaintainList => "meta.rbd_snapshot_maintain_list",
            Document::BackupCirculationList => "meta.rbd_backup_circulation_list",
        }
    }
}

/// Run-scoped summary written at S1 and rewritten at S6 with plan totals.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackupInfo {
    pub run_timestamp: Option<NaiveDateTime>,
    pub cluster_fsid: String,
    pub cluster_name: String,
    pub dir_free_bytes: u64,
    pub dir_used_bytes: u64,
    pub total_image_count: Option<usize>,
    pub total_full_bytes: Option<u64>,
    pub total_used_bytes: Option<u64>,
}

/// `image_id -> ordered list` maps used by [`Document::SnapshotMaintainList`]
/// and [`Document::BackupCirculationList`]. Newest/oldest ordering is defined
/// per spec.md §3 per document; this type only carries the ordered strings.
pub type IdOrderedList = HashMap<String, Vec<String>>;

/// A thin typed layer over the four JSON documents, atomic at document
/// granularity via temp-file-then-rename (spec.md §4.5). A missing or
/// unreadable document is always treated as "no history" rather than a
/// hard error, which keeps invariants I1-I5 conservative: everything
/// demotes to FULL.
pub struct MetadataStore {
    backup_root: PathBuf,
    cluster_name: String,
}

impl MetadataStore {
    pub fn new(backup_root: impl Into<PathBuf>, cluster_name: impl Into<String>) -> Self {
        Self {
            backup_root: backup_root.into(),
            cluster_name: cluster_name.into(),
        }
    }

    fn cluster_dir(&self) -> PathBuf {
        self.backup_root.join(&self.cluster_name)
    }

    fn doc_path(&self, doc: Document) -> PathBuf {
        self.cluster_dir()
            .join(format!("{}.{}", self.cluster_name, doc.suffix()))
    }

    /// Ensures the cluster directory and every document file exist, creating
    /// empty documents where absent.
    pub fn initialize(&self) -> MetadataResult<()> {
        fs::create_dir_all(self.cluster_dir())?;

        for doc in Document::ALL {
            let path = self.doc_path(doc);
            if !path.exists() {
                File::create(&path)?;
            }
        }

        Ok(())
    }

    /// Reads `doc`, falling back to `T::default()` on a missing or malformed
    /// file. Malformed documents are logged, not propagated.
    pub fn read<T: Default + for<'de> Deserialize<'de>>(&self, doc: Document) -> T {
        let path = self.doc_path(doc);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return T::default(),
        };

        if bytes.is_empty() {
            return T::default();
        }

        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(doc = doc.suffix(), error = %e, "malformed metadata document, treating as empty");
                T::default()
            }
        }
    }

    /// Serializes `value` to a temp file in the same directory, `fsync`s it,
    /// then renames it over the final document path so a crash never leaves
    /// a half-written document (spec.md §4.5).
    pub fn write<T: Serialize>(&self, doc: Document, value: &T) -> MetadataResult<()> {
        let path = self.doc_path(doc);
        let tmp_path = path.with_extension("tmp");

        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| crate::error::MetadataError::Malformed(doc.suffix().to_string(), e))?;

        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&json)?;
            tmp_file.sync_all()?;
        }

        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Read-modify-write of one document under a closure, still a single
    /// atomic write (spec.md §4.5's "update" operation).
    pub fn update<T, F>(&self, doc: Document, f: F) -> MetadataResult<()>
    where
        T: Default + Serialize + for<'de> Deserialize<'de>,
        F: FnOnce(&mut T),
    {
        let mut value: T = self.read(doc);
        f(&mut value);
        self.write(doc, &value)
    }

    /// Truncates `doc` back to "no history".
    pub fn clear(&self, doc: Document) -> MetadataResult<()> {
        let path = self.doc_path(doc);
        File::create(path)?;
        Ok(())
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn root(&self) -> &Path {
        &self.backup_root
    }
}

/// Convenience type alias: the persisted plan snapshot written at S2.
pub type RbdInfoList = Vec<ImageDescriptor>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_write_then_read() {
        let root = tempdir().unwrap();
        let store = MetadataStore::new(root.path(), "cluster1");
        store.initialize().unwrap();

        let mut maintain: IdOrderedList = HashMap::new();
        maintain.insert("cluster1|poolA|img1".to_string(), vec!["s1".to_string(), "s2".to_string()]);

        store.write(Document::SnapshotMaintainList, &maintain).unwrap();
        let read_back: IdOrderedList = store.read(Document::SnapshotMaintainList);

        assert_eq!(read_back, maintain);
    }

    #[test]
    fn missing_document_reads_as_default() {
        let root = tempdir().unwrap();
        let store = MetadataStore::new(root.path(), "cluster1");

        let list: IdOrderedList = store.read(Document::BackupCirculationList);
        assert!(list.is_empty());
    }

    #[test]
    fn malformed_document_reads_as_default_not_error() {
        let root = tempdir().unwrap();
        let store = MetadataStore::new(root.path(), "cluster1");
        store.initialize().unwrap();

        fs::write(store.doc_path(Document::BackupInfo), b"not json").unwrap();

        let info: BackupInfo = store.read(Document::BackupInfo);
        assert_eq!(info.cluster_name, "");
    }

    #[test]
    fn update_is_read_modify_write() {
        let root = tempdir().unwrap();
        let store = MetadataStore::new(root.path(), "cluster1");
        store.initialize().unwrap();

        store
            .update(Document::SnapshotMaintainList, |list: &mut IdOrderedList| {
                list.entry("img1".to_string()).or_default().push("s1".to_string());
            })
            .unwrap();
        store
            .update(Document::SnapshotMaintainList, |list: &mut IdOrderedList| {
                list.entry("img1".to_string()).or_default().push("s2".to_string());
            })
            .unwrap();

        let list: IdOrderedList = store.read(Document::SnapshotMaintainList);
        assert_eq!(list["img1"], vec!["s1".to_string(), "s2".to_string()]);
    }
}
