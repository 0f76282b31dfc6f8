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

//! End-to-end engine scenarios, driven through the public `BackupEngine::run`
//! API against the fakes in `rbdbak_common::testing` rather than a real Ceph
//! cluster or `rbd` binary.

use rbdbak_common::cluster::ClusterSession;
use rbdbak_common::config::{
    BackupConfig, BackupPolicy, CacheConfig, ClusterConfig, DropCacheLevel, LogFormat, LoggingConfig, MappingConfig,
    MonitorConfig, SnapshotPolicy,
};
use rbdbak_common::engine::{BackupEngine, SessionFactory, SizeOrder};
use rbdbak_common::inventory::StaticInventory;
use rbdbak_common::metadata::{Document, IdOrderedList, MetadataStore};
use rbdbak_common::testing::{FakeClusterSession, FakeCommandRunner, FakeImage};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tempfile::tempdir;

struct FakeFactory {
    sessions: Arc<Mutex<HashMap<String, FakeClusterSession>>>,
}

impl SessionFactory for FakeFactory {
    fn open(&self, pool_name: &str) -> Box<dyn ClusterSession> {
        let session = self.sessions.lock().unwrap().remove(pool_name).unwrap_or_default();
        Box::new(session)
    }
}

fn factory_for(pool: &str, session: FakeClusterSession) -> FakeFactory {
    let mut sessions = HashMap::new();
    sessions.insert(pool.to_string(), session);
    FakeFactory {
        sessions: Arc::new(Mutex::new(sessions)),
    }
}

fn write_inventory(yaml_path: &Path, pool: &str, images: &[&str]) {
    let mut body = format!("{pool}:\n");
    for image in images {
        body.push_str(&format!("  - {image}\n"));
    }
    std::fs::write(yaml_path, body).unwrap();
}

/// `weekday_mode`: `Some(true)` forces a FULL run today, `Some(false)` forces
/// a DIFF run today, `None` makes today a no-run day for both lists.
fn base_config(backup_root: &Path, yaml_path: &Path, weekday_mode: Option<bool>) -> BackupConfig {
    let (full_weekday, incr_weekday) = match weekday_mode {
        Some(true) => ((1..=7).collect(), Vec::new()),
        Some(false) => (Vec::new(), (1..=7).collect()),
        None => (Vec::new(), Vec::new()),
    };

    BackupConfig {
        logging: LoggingConfig {
            log_file: "rbdbak.log".to_string(),
            log_path: "/tmp".to_string(),
            log_level: "info".to_string(),
            log_max_bytes: 1024,
            log_format_type: LogFormat::Compact,
            log_backup_count: 1,
            log_delay: 0,
        },
        cluster: ClusterConfig {
            ceph_conffile: None,
            ceph_cluster_name: "testcl".to_string(),
        },
        backup: BackupPolicy {
            backup_path: backup_root.to_string_lossy().into_owned(),
            backup_retain_count: 2,
            backup_yaml_filepath: yaml_path.to_string_lossy().into_owned(),
            backup_yaml_section_name: "backup".to_string(),
            backup_concurrent_worker_count: 2,
            backup_small_size_first: SizeOrder::Natural,
            backup_full_weekday: full_weekday,
            backup_incr_weekday: incr_weekday,
        },
        snapshot: SnapshotPolicy {
            snapshot_retain_count: 2,
            snapshot_protect: false,
        },
        monitor: MonitorConfig {
            monitor_interval: 0,
            monitor_record_path: String::new(),
            monitor_network_io: false,
            monitor_disk_io: false,
            monitor_memory_io: false,
        },
        cache: CacheConfig {
            drop_cache_level: DropCacheLevel::PageCache,
            flush_file_system_buffer: false,
        },
        mapping: MappingConfig {
            openstack_enable_mapping: false,
            openstack_yaml_filepath: None,
            openstack_section_name: None,
            openstack_distribution: None,
            openstack_pool_name: None,
        },
    }
}

/// Reads a persisted document back off disk through a fresh `MetadataStore`
/// pointed at the same backup root, since `BackupEngine::metadata` is private.
fn read_doc<T: Default + for<'de> serde::Deserialize<'de>>(backup_root: &Path, doc: Document) -> T {
    MetadataStore::new(backup_root, "testcl").read(doc)
}

#[test]
fn e1_first_ever_run_is_a_full_backup() {
    let backup_root = tempdir().unwrap();
    let yaml = tempdir().unwrap().path().join("inv.yaml");
    write_inventory(&yaml, "poolA", &["img1"]);

    let session = FakeClusterSession::with_image(
        "img1",
        FakeImage {
            size: 10 * 1024 * 1024,
            ..Default::default()
        },
    );
    let runner = session.command_runner();

    let config = base_config(backup_root.path(), &yaml, Some(true));
    let factory = factory_for("poolA", session);
    let inventory = StaticInventory::new(&yaml);

    let mut engine =
        BackupEngine::with_command_runner(config, Box::new(factory), Box::new(inventory), "fsid-1".to_string(), Arc::new(runner));
    let summary = engine.run().unwrap();

    assert!(!summary.no_run_today);
    assert_eq!(summary.images_snapshotted, 1);
    assert_eq!(summary.images_exported, 1);

    let circulation: IdOrderedList = read_doc(backup_root.path(), Document::BackupCirculationList);
    assert_eq!(circulation["testcl|poolA|img1"].len(), 1);

    let maintain: IdOrderedList = read_doc(backup_root.path(), Document::SnapshotMaintainList);
    assert_eq!(maintain["testcl|poolA|img1"].len(), 1);
}

#[test]
fn e2_incremental_follows_a_full_when_history_is_intact() {
    let backup_root = tempdir().unwrap();
    let yaml = tempdir().unwrap().path().join("inv.yaml");
    write_inventory(&yaml, "poolA", &["img1"]);

    let session = FakeClusterSession::with_image(
        "img1",
        FakeImage {
            size: 1024 * 1024,
            ..Default::default()
        },
    );
    let images_handle = session.images.clone();
    let runner = session.command_runner();

    let config = base_config(backup_root.path(), &yaml, Some(true));
    let factory = factory_for("poolA", session);
    let inventory = StaticInventory::new(&yaml);
    let mut engine =
        BackupEngine::with_command_runner(config, Box::new(factory), Box::new(inventory), "fsid-1".to_string(), Arc::new(runner));
    let summary1 = engine.run().unwrap();
    assert_eq!(summary1.images_snapshotted, 1);
    assert_eq!(summary1.images_exported, 1);

    // The CREATE task ran through the shared FakeCommandRunner, so the new
    // snapshot is already visible on `images_handle` without manual mirroring.
    assert_eq!(images_handle.lock().unwrap()["img1"].snapshots.len(), 1);

    let session2 = FakeClusterSession {
        images: images_handle.clone(),
    };
    let runner2 = FakeCommandRunner::new(images_handle.clone());
    let config2 = base_config(backup_root.path(), &yaml, Some(false));
    let factory2 = factory_for("poolA", session2);
    let inventory2 = StaticInventory::new(&yaml);
    let mut engine2 = BackupEngine::with_command_runner(
        config2,
        Box::new(factory2),
        Box::new(inventory2),
        "fsid-1".to_string(),
        Arc::new(runner2),
    );
    let summary2 = engine2.run().unwrap();

    assert_eq!(summary2.images_snapshotted, 1);
    assert_eq!(summary2.images_exported, 1);

    let circulation: IdOrderedList = read_doc(backup_root.path(), Document::BackupCirculationList);
    assert_eq!(circulation["testcl|poolA|img1"].len(), 1, "no new FULL should have been recorded");

    let maintain: IdOrderedList = read_doc(backup_root.path(), Document::SnapshotMaintainList);
    assert_eq!(maintain["testcl|poolA|img1"].len(), 2);
}

#[test]
fn e3_snapshot_retention_bound_holds_across_runs() {
    let backup_root = tempdir().unwrap();
    let yaml = tempdir().unwrap().path().join("inv.yaml");
    write_inventory(&yaml, "poolA", &["img1"]);

    let seed = FakeClusterSession::with_image(
        "img1",
        FakeImage {
            size: 1024,
            ..Default::default()
        },
    );
    let images_handle = seed.images.clone();

    for _ in 0..4 {
        // The factory drains its session map on `open`, so each run needs a
        // fresh `FakeClusterSession` wrapper over the same shared table.
        let session = FakeClusterSession {
            images: images_handle.clone(),
        };
        let runner = FakeCommandRunner::new(images_handle.clone());

        let config = base_config(backup_root.path(), &yaml, Some(true));
        let factory = factory_for("poolA", session);
        let inventory = StaticInventory::new(&yaml);
        let mut engine = BackupEngine::with_command_runner(
            config,
            Box::new(factory),
            Box::new(inventory),
            "fsid-1".to_string(),
            Arc::new(runner),
        );
        engine.run().unwrap();
    }

    let maintain: IdOrderedList = read_doc(backup_root.path(), Document::SnapshotMaintainList);
    assert!(maintain["testcl|poolA|img1"].len() <= 2);
    assert!(images_handle.lock().unwrap()["img1"].snapshots.len() <= 2);
}

#[test]
fn e4_missing_prev_snapshot_demotes_to_full() {
    let backup_root = tempdir().unwrap();
    let yaml = tempdir().unwrap().path().join("inv.yaml");
    write_inventory(&yaml, "poolA", &["img1"]);

    let session = FakeClusterSession::with_image(
        "img1",
        FakeImage {
            size: 1024,
            ..Default::default()
        },
    );
    let images_handle = session.images.clone();
    let runner = session.command_runner();

    let config = base_config(backup_root.path(), &yaml, Some(true));
    let factory = factory_for("poolA", session);
    let inventory = StaticInventory::new(&yaml);
    let mut engine =
        BackupEngine::with_command_runner(config, Box::new(factory), Box::new(inventory), "fsid-1".to_string(), Arc::new(runner));
    engine.run().unwrap();

    // Simulate the snapshot having disappeared from the cluster out of band
    // (e.g. removed by an operator) between the two runs.
    images_handle.lock().unwrap().get_mut("img1").unwrap().snapshots.clear();

    let session2 = FakeClusterSession {
        images: images_handle.clone(),
    };
    let runner2 = FakeCommandRunner::new(images_handle.clone());
    let config2 = base_config(backup_root.path(), &yaml, Some(false));
    let factory2 = factory_for("poolA", session2);
    let inventory2 = StaticInventory::new(&yaml);
    let mut engine2 = BackupEngine::with_command_runner(
        config2,
        Box::new(factory2),
        Box::new(inventory2),
        "fsid-1".to_string(),
        Arc::new(runner2),
    );
    let summary2 = engine2.run().unwrap();

    assert_eq!(summary2.images_exported, 1);

    let circulation: IdOrderedList = read_doc(backup_root.path(), Document::BackupCirculationList);
    assert_eq!(
        circulation["testcl|poolA|img1"].len(),
        2,
        "missing prev snapshot should demote to a second FULL, not an illegitimate diff"
    );
}

#[test]
fn e5_one_images_snapshot_failure_does_not_affect_another() {
    let backup_root = tempdir().unwrap();
    let yaml = tempdir().unwrap().path().join("inv.yaml");
    write_inventory(&yaml, "poolA", &["img_good", "img_bad"]);

    let session = FakeClusterSession::default();
    {
        let mut images = session.images.lock().unwrap();
        images.insert(
            "img_good".to_string(),
            FakeImage {
                size: 1024,
                ..Default::default()
            },
        );
        images.insert(
            "img_bad".to_string(),
            FakeImage {
                size: 1024,
                ..Default::default()
            },
        );
    }
    let runner = FakeCommandRunner::failing(session.images.clone(), &["img_bad"]);

    let config = base_config(backup_root.path(), &yaml, Some(true));
    let factory = factory_for("poolA", session);
    let inventory = StaticInventory::new(&yaml);
    let mut engine =
        BackupEngine::with_command_runner(config, Box::new(factory), Box::new(inventory), "fsid-1".to_string(), Arc::new(runner));
    let summary = engine.run().unwrap();

    assert_eq!(summary.images_planned, 2);
    assert_eq!(summary.images_snapshotted, 1);
    assert_eq!(summary.images_dropped, 1);
    assert_eq!(summary.images_exported, 1);

    let maintain: IdOrderedList = read_doc(backup_root.path(), Document::SnapshotMaintainList);
    assert!(maintain.contains_key("testcl|poolA|img_good"));
    assert!(!maintain.contains_key("testcl|poolA|img_bad"));
}

#[test]
fn e6_insufficient_space_aborts_before_any_snapshot() {
    let backup_root = tempdir().unwrap();
    let yaml = tempdir().unwrap().path().join("inv.yaml");
    write_inventory(&yaml, "poolA", &["img1"]);

    let session = FakeClusterSession::with_image(
        "img1",
        FakeImage {
            size: u64::MAX / 2,
            ..Default::default()
        },
    );

    let config = base_config(backup_root.path(), &yaml, Some(true));
    let factory = factory_for("poolA", session);
    let inventory = StaticInventory::new(&yaml);
    let mut engine = BackupEngine::new(config, Box::new(factory), Box::new(inventory), "fsid-1".to_string());
    let summary = engine.run().unwrap();

    assert!(summary.aborted_insufficient_space);
    assert_eq!(summary.images_snapshotted, 0);
    assert_eq!(summary.images_exported, 0);

    let maintain: IdOrderedList = read_doc(backup_root.path(), Document::SnapshotMaintainList);
    assert!(maintain.is_empty());
}
