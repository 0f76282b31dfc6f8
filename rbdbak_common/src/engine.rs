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

use crate::cache;
use crate::cluster::{ClusterSession, PoolAdapter};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::config::BackupConfig;
use crate::directory::BackupDirectoryManager;
use crate::dispatcher::WorkerPool;
use crate::error::EngineResult;
use crate::inventory::VolumeInventory;
use crate::metadata::{BackupInfo, Document, IdOrderedList, MetadataStore};
use crate::rbd_tasks::{ExportMode, ExportTask, SnapshotAction, SnapshotTask};
use crate::task::TaskStatus;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Datelike, Utc};

/// Whether an image's backup this run is a complete export or an
/// incremental attached to a prior full (spec.md §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BackupMode {
    Full,
    Diff,
}

/// Tri-valued `backup_small_size_first` (spec.md §9): `Natural` preserves
/// whatever order the plan was built in rather than defaulting to either sort.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SizeOrder {
    SmallFirst,
    LargeFirst,
    Natural,
}

/// One image to back up this run (spec.md §3). Built in S2, enriched in S5/S6,
/// discarded at run end.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ImageDescriptor {
    pub image_id: String,
    pub pool_name: String,
    pub image_name: String,
    pub volume_alias: Option<String>,
    pub full_size_bytes: u64,
    pub used_size_bytes: Option<u64>,
    pub features: u64,
    pub cluster_snapshots: Vec<String>,
    pub backup_mode: BackupMode,
    pub prev_snapshot_name: Option<String>,
    pub prev_full_backup_name: Option<String>,
    pub new_snapshot_name: Option<String>,
}

fn image_id(cluster: &str, pool: &str, image: &str) -> String {
    format!("{cluster}|{pool}|{image}")
}

/// Per-run counters returned by [`BackupEngine::run`], used for logging and
/// tests rather than control flow.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub no_run_today: bool,
    pub aborted_insufficient_space: bool,
    pub images_planned: usize,
    pub images_snapshotted: usize,
    pub images_dropped: usize,
    pub images_exported: usize,
    pub export_failures: usize,
    pub snapshots_pruned: usize,
    pub backups_pruned: usize,
}

/// Creates a [`ClusterSession`] for one pool. Injected so tests can hand the
/// engine a `FakeClusterSession` factory without a real cluster or `rbd`.
pub trait SessionFactory: Send {
    fn open(&self, pool_name: &str) -> Box<dyn ClusterSession>;
}

/// Multi-stage orchestrator (spec.md §4.8, S1-S10). Each stage is a private
/// method so unit tests can drive it in isolation against an in-memory
/// [`MetadataStore`] and fake cluster session.
pub struct BackupEngine {
    config: BackupConfig,
    metadata: MetadataStore,
    directory: BackupDirectoryManager,
    session_factory: Box<dyn SessionFactory>,
    inventory: Box<dyn VolumeInventory>,
    pools: HashMap<String, PoolAdapter>,
    cluster_fsid: String,
    command_runner: Arc<dyn CommandRunner>,
}

impl BackupEngine {
    pub fn new(
        config: BackupConfig,
        session_factory: Box<dyn SessionFactory>,
        inventory: Box<dyn VolumeInventory>,
        cluster_fsid: String,
    ) -> Self {
        Self::with_command_runner(config, session_factory, inventory, cluster_fsid, Arc::new(SystemCommandRunner))
    }

    /// Like [`BackupEngine::new`] but with an injectable [`CommandRunner`],
    /// used by tests to drive snapshot/export tasks without a real `rbd`.
    pub fn with_command_runner(
        config: BackupConfig,
        session_factory: Box<dyn SessionFactory>,
        inventory: Box<dyn VolumeInventory>,
        cluster_fsid: String,
        command_runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let directory = BackupDirectoryManager::new(PathBuf::from(&config.backup.backup_path));
        let metadata = MetadataStore::new(&config.backup.backup_path, config.cluster.ceph_cluster_name.clone());

        Self {
            config,
            metadata,
            directory,
            session_factory,
            inventory,
            pools: HashMap::new(),
            cluster_fsid,
            command_runner,
        }
    }

    fn pool(&mut self, pool_name: &str) -> &mut PoolAdapter {
        if !self.pools.contains_key(pool_name) {
            let session = self.session_factory.open(pool_name);
            self.pools
                .insert(pool_name.to_string(), PoolAdapter::new(pool_name.to_string(), session));
        }
        self.pools.get_mut(pool_name).unwrap()
    }

    pub fn run(&mut self) -> EngineResult<RunSummary> {
        let mut summary = RunSummary::default();

        self.stage1_init_backup_dir()?;

        if self.config.cache.flush_file_system_buffer {
            cache::flush(self.config.cache.drop_cache_level, true);
        }

        let mode = match self.weekday_mode() {
            Some(mode) => mode,
            None => {
                summary.no_run_today = true;
                return Ok(summary);
            }
        };

        let mut plan = self.stage2_plan(mode, &mut summary)?;
        if summary.aborted_insufficient_space {
            self.stage10_finalize(None);
            return Ok(summary);
        }

        summary.images_planned = plan.len();
        if plan.is_empty() {
            self.stage10_finalize(None);
            return Ok(summary);
        }

        let pool = self.stage3_worker_pool_up();

        self.stage4_and_5_snapshot_stage(&pool, &mut plan, &mut summary);

        if !plan.is_empty() {
            self.stage6_plan_export_tasks(&mut plan);
            self.stage7_execute_export_stage(&pool, &mut plan, &mut summary);
        }

        self.stage8_prune_snapshots(&pool, &plan, &mut summary);
        self.stage9_prune_backup_files(&mut summary);

        self.stage10_finalize(Some(pool));

        Ok(summary)
    }

    /// S1: create the backup directory tree, initialize the metadata store
    /// and write the run's opening `backup_info`.
    fn stage1_init_backup_dir(&mut self) -> EngineResult<()> {
        self.directory.add(&[&self.config.cluster.ceph_cluster_name])?;
        self.metadata.initialize()?;

        let info = BackupInfo {
            run_timestamp: Some(Utc::now().naive_utc()),
            cluster_fsid: self.cluster_fsid.clone(),
            cluster_name: self.config.cluster.ceph_cluster_name.clone(),
            dir_free_bytes: self.directory.available_bytes().unwrap_or(0),
            dir_used_bytes: self.directory.used_bytes().unwrap_or(0),
            total_image_count: None,
            total_full_bytes: None,
            total_used_bytes: None,
        };
        self.metadata.write(Document::BackupInfo, &info)?;

        Ok(())
    }

    fn weekday_mode(&self) -> Option<BackupMode> {
        let today = Utc::now().naive_utc().date().weekday().number_from_monday() as u8;

        if self.config.backup.backup_full_weekday.contains(&today) {
            Some(BackupMode::Full)
        } else if self.config.backup.backup_incr_weekday.contains(&today) {
            Some(BackupMode::Diff)
        } else {
            None
        }
    }

    /// S2: build the per-image plan, demote to FULL where history is
    /// missing or stale, and abort the run if total full size would not fit.
    fn stage2_plan(&mut self, mode: BackupMode, summary: &mut RunSummary) -> EngineResult<Vec<ImageDescriptor>> {
        let snapshot_maintain: IdOrderedList = self.metadata.read(Document::SnapshotMaintainList);
        let backup_circulation: IdOrderedList = self.metadata.read(Document::BackupCirculationList);

        let global_mode = if snapshot_maintain.is_empty() || backup_circulation.is_empty() {
            BackupMode::Full
        } else {
            mode
        };

        let pool_images = self.inventory.pool_images()?;

        let mut plan = Vec::new();
        for (pool_name, images) in pool_images {
            for image_name in images {
                let id = image_id(&self.config.cluster.ceph_cluster_name, &pool_name, &image_name);
                let adapter = self.pool(&pool_name);
                let full_size_bytes = adapter.image_size(&image_name);
                if full_size_bytes < 0 {
                    tracing::warn!(image = %id, "skipping image: cluster query failed");
                    continue;
                }
                let features = adapter.image_features(&image_name).max(0) as u64;
                let cluster_snapshots = adapter.snapshot_names(&image_name);

                let mut descriptor = ImageDescriptor {
                    image_id: id.clone(),
                    pool_name: pool_name.clone(),
                    image_name: image_name.clone(),
                    volume_alias: None,
                    full_size_bytes: full_size_bytes as u64,
                    used_size_bytes: None,
                    features,
                    cluster_snapshots: cluster_snapshots.clone(),
                    backup_mode: global_mode,
                    prev_snapshot_name: None,
                    prev_full_backup_name: None,
                    new_snapshot_name: None,
                };

                if global_mode == BackupMode::Diff {
                    let prev_snapshot = snapshot_maintain.get(&id).and_then(|v| v.last()).cloned();
                    let prev_full = backup_circulation.get(&id).and_then(|v| v.last()).cloned();

                    let snapshot_still_present = prev_snapshot
                        .as_ref()
                        .map(|s| cluster_snapshots.contains(s))
                        .unwrap_or(false);
                    let full_dir_present = prev_full
                        .as_ref()
                        .map(|name| {
                            self.directory
                                .exists(&self.directory.root().join(&self.config.cluster.ceph_cluster_name).join(&pool_name).join(&image_name), name)
                        })
                        .unwrap_or(false);

                    if snapshot_still_present && full_dir_present {
                        descriptor.backup_mode = BackupMode::Diff;
                        descriptor.prev_snapshot_name = prev_snapshot;
                        descriptor.prev_full_backup_name = prev_full;
                    } else {
                        descriptor.backup_mode = BackupMode::Full;
                    }
                }

                plan.push(descriptor);
            }
        }

        let total_full: u64 = plan.iter().map(|d| d.full_size_bytes).sum();
        let available = self.directory.available_bytes().unwrap_or(0);

        self.metadata.update(Document::BackupInfo, |info: &mut BackupInfo| {
            info.total_image_count = Some(plan.len());
            info.total_full_bytes = Some(total_full);
        })?;

        if total_full > available {
            summary.aborted_insufficient_space = true;
            return Ok(Vec::new());
        }

        sort_by(&mut plan, self.config.backup.backup_small_size_first, |d| d.full_size_bytes);

        self.metadata.write(Document::RbdInfoList, &plan)?;

        Ok(plan)
    }

    /// S3: bring up the worker pool.
    fn stage3_worker_pool_up(&self) -> WorkerPool {
        WorkerPool::new(self.config.backup.backup_concurrent_worker_count, 256)
    }

    /// S4 + S5: submit one CREATE task per descriptor, drain completions,
    /// append successful snapshot names to `snapshot_maintain_list`, and
    /// drop any image whose CREATE task errored.
    fn stage4_and_5_snapshot_stage(&mut self, pool: &WorkerPool, plan: &mut Vec<ImageDescriptor>, summary: &mut RunSummary) {
        for descriptor in plan.iter() {
            let task = SnapshotTask::with_runner(
                self.config.cluster.ceph_cluster_name.clone(),
                descriptor.pool_name.clone(),
                descriptor.image_name.clone(),
                descriptor.image_id.clone(),
                SnapshotAction::Create,
                String::new(),
                self.config.snapshot.snapshot_protect,
                self.config.cluster.ceph_conffile.clone(),
                self.command_runner.clone(),
            );
            pool.submit(Box::new(task));
        }

        let submitted = plan.len();
        let mut results = HashMap::new();
        for _ in 0..submitted {
            if let Some(result) = pool.recv_result() {
                results.insert(result.task_id.clone(), result);
            }
        }

        let mut maintain: IdOrderedList = self.metadata.read(Document::SnapshotMaintainList);

        plan.retain_mut(|descriptor| {
            let Some(result) = results.get(&descriptor.image_id) else {
                return false;
            };

            if result.status == TaskStatus::Complete {
                let snap_name = result.snap_name.clone().unwrap_or_default();
                maintain.entry(descriptor.image_id.clone()).or_default().push(snap_name.clone());
                descriptor.new_snapshot_name = Some(snap_name);
                summary.images_snapshotted += 1;
                true
            } else {
                tracing::warn!(image = %descriptor.image_id, error = ?result.error_message, "snapshot task failed, dropping image for this run");
                summary.images_dropped += 1;
                false
            }
        });

        if let Err(e) = self.metadata.write(Document::SnapshotMaintainList, &maintain) {
            tracing::error!(error = %e, "failed to persist snapshot_maintain_list");
        }
    }

    /// S6: measure used size, compute destination paths, re-sort, and
    /// rewrite `backup_info` with run totals.
    fn stage6_plan_export_tasks(&mut self, plan: &mut Vec<ImageDescriptor>) {
        for descriptor in plan.iter_mut() {
            let to_snap = descriptor.new_snapshot_name.clone();
            let from_snap = descriptor.prev_snapshot_name.clone();
            let used = self
                .pool(&descriptor.pool_name)
                .used_bytes(&descriptor.image_name, from_snap.as_deref(), to_snap.as_deref());
            descriptor.used_size_bytes = Some(used.max(0) as u64);
        }

        sort_by(plan, self.config.backup.backup_small_size_first, |d| d.used_size_bytes.unwrap_or(0));

        let total_used: u64 = plan.iter().filter_map(|d| d.used_size_bytes).sum();
        if let Err(e) = self.metadata.update(Document::BackupInfo, |info: &mut BackupInfo| {
            info.total_used_bytes = Some(total_used);
        }) {
            tracing::error!(error = %e, "failed to persist backup_info totals");
        }
    }

    fn export_dest_path(&self, descriptor: &ImageDescriptor) -> PathBuf {
        let root = self.directory.root()
            .join(&self.config.cluster.ceph_cluster_name)
            .join(&descriptor.pool_name)
            .join(&descriptor.image_name);

        match descriptor.backup_mode {
            BackupMode::Full => {
                let new_snap = descriptor.new_snapshot_name.as_deref().unwrap_or("unknown");
                root.join(new_snap).join(new_snap)
            }
            BackupMode::Diff => {
                let prev_full = descriptor.prev_full_backup_name.as_deref().unwrap_or("unknown");
                let prev_snap = descriptor.prev_snapshot_name.as_deref().unwrap_or("unknown");
                let new_snap = descriptor.new_snapshot_name.as_deref().unwrap_or("unknown");
                root.join(prev_full).join(format!("{prev_snap}_to_{new_snap}"))
            }
        }
    }

    /// S7: submit export tasks, drain, record circulation list additions.
    fn stage7_execute_export_stage(&mut self, pool: &WorkerPool, plan: &mut Vec<ImageDescriptor>, summary: &mut RunSummary) {
        for descriptor in plan.iter() {
            let dest_path = self.export_dest_path(descriptor);
            if let Some(parent) = dest_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            let mode = match descriptor.backup_mode {
                BackupMode::Full => ExportMode::Full,
                BackupMode::Diff => ExportMode::Diff,
            };

            let task = ExportTask::with_runner(
                self.config.cluster.ceph_cluster_name.clone(),
                descriptor.pool_name.clone(),
                descriptor.image_name.clone(),
                descriptor.image_id.clone(),
                dest_path,
                mode,
                descriptor.prev_snapshot_name.clone(),
                descriptor.new_snapshot_name.clone(),
                self.config.cluster.ceph_conffile.clone(),
                self.command_runner.clone(),
            );
            pool.submit(Box::new(task));
        }

        let submitted = plan.len();
        let mut results = HashMap::new();
        for _ in 0..submitted {
            if let Some(result) = pool.recv_result() {
                results.insert(result.task_id.clone(), result);
            }
        }

        let mut circulation: IdOrderedList = self.metadata.read(Document::BackupCirculationList);

        for descriptor in plan.iter() {
            let Some(result) = results.get(&descriptor.image_id) else { continue };

            if result.status == TaskStatus::Complete {
                summary.images_exported += 1;
                if descriptor.backup_mode == BackupMode::Full {
                    if let Some(new_snap) = &descriptor.new_snapshot_name {
                        circulation.entry(descriptor.image_id.clone()).or_default().push(new_snap.clone());
                    }
                }
            } else {
                summary.export_failures += 1;
                tracing::warn!(image = %descriptor.image_id, error = ?result.error_message, "export task failed");
                // snapshot_maintain_list is left intact; next run will find a
                // prev-snapshot with no matching prev-full and demote to FULL.
            }
        }

        if let Err(e) = self.metadata.write(Document::BackupCirculationList, &circulation) {
            tracing::error!(error = %e, "failed to persist backup_circulation_list");
        }
    }

    /// S8: purge or prune in-cluster snapshots down to `snapshot_retain_count`.
    fn stage8_prune_snapshots(&mut self, pool: &WorkerPool, plan: &[ImageDescriptor], summary: &mut RunSummary) {
        let retain = self.config.snapshot.snapshot_retain_count;
        let mut maintain: IdOrderedList = self.metadata.read(Document::SnapshotMaintainList);

        if retain == 0 {
            let mut submitted = 0;
            for descriptor in plan {
                let task = SnapshotTask::with_runner(
                    self.config.cluster.ceph_cluster_name.clone(),
                    descriptor.pool_name.clone(),
                    descriptor.image_name.clone(),
                    descriptor.image_id.clone(),
                    SnapshotAction::Purge,
                    String::new(),
                    false,
                    self.config.cluster.ceph_conffile.clone(),
                    self.command_runner.clone(),
                );
                pool.submit(Box::new(task));
                submitted += 1;
            }
            for _ in 0..submitted {
                if let Some(result) = pool.recv_result() {
                    if result.status == TaskStatus::Complete {
                        maintain.remove(&result.task_id);
                        summary.snapshots_pruned += 1;
                    }
                }
            }
        } else {
            for descriptor in plan {
                let cluster_snaps = self.pool(&descriptor.pool_name).snapshot_names(&descriptor.image_name);
                let Some(known) = maintain.get(&descriptor.image_id) else { continue };

                let mut matched: Vec<String> = known.iter().filter(|s| cluster_snaps.contains(s)).cloned().collect();

                // One REMOVE at a time, attributing each result to the
                // snapshot that produced it. On ERROR the item is left in
                // place and `skip` advances past it, matching spec.md §4.8
                // S8's "leave it in the list and advance past it".
                let mut skip = 0;
                while matched.len().saturating_sub(skip) > retain {
                    let candidate = matched[skip].clone();

                    let task = SnapshotTask::with_runner(
                        self.config.cluster.ceph_cluster_name.clone(),
                        descriptor.pool_name.clone(),
                        descriptor.image_name.clone(),
                        descriptor.image_id.clone(),
                        SnapshotAction::Remove,
                        candidate,
                        false,
                        self.config.cluster.ceph_conffile.clone(),
                        self.command_runner.clone(),
                    );
                    pool.submit(Box::new(task));

                    match pool.recv_result() {
                        Some(result) if result.status == TaskStatus::Complete => {
                            matched.remove(skip);
                            summary.snapshots_pruned += 1;
                        }
                        _ => skip += 1,
                    }
                }

                maintain.insert(descriptor.image_id.clone(), matched);
            }
        }

        if let Err(e) = self.metadata.write(Document::SnapshotMaintainList, &maintain) {
            tracing::error!(error = %e, "failed to persist snapshot_maintain_list after prune");
        }
    }

    /// S9: delete the oldest backup directories down to `backup_retain_count`.
    fn stage9_prune_backup_files(&mut self, summary: &mut RunSummary) {
        let retain = self.config.backup.backup_retain_count.max(1);
        let mut circulation: IdOrderedList = self.metadata.read(Document::BackupCirculationList);

        for (image_id, entries) in circulation.iter_mut() {
            let parts: Vec<&str> = image_id.splitn(3, '|').collect();
            let [_, pool_name, image_name] = parts[..] else { continue };

            let image_dir = self
                .directory
                .root()
                .join(&self.config.cluster.ceph_cluster_name)
                .join(pool_name)
                .join(image_name);

            while entries.len() > retain {
                let oldest = entries[0].clone();
                match self.directory.delete(&image_dir, &oldest) {
                    Ok(()) => {
                        entries.remove(0);
                        summary.backups_pruned += 1;
                    }
                    Err(e) => {
                        tracing::warn!(image = %image_id, name = %oldest, error = %e, "failed to prune backup directory");
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.metadata.write(Document::BackupCirculationList, &circulation) {
            tracing::error!(error = %e, "failed to persist backup_circulation_list after prune");
        }
    }

    /// S10: stop the pool, close pool adapters. Host cache flush (if any)
    /// already happened at the start of S1.
    fn stage10_finalize(&mut self, pool: Option<WorkerPool>) {
        if let Some(pool) = pool {
            pool.shutdown(false);
        }

        for (_, adapter) in self.pools.drain() {
            let mut adapter = adapter;
            adapter.close();
        }
    }
}

fn sort_by<T>(items: &mut [T], order: SizeOrder, key: impl Fn(&T) -> u64) {
    match order {
        SizeOrder::SmallFirst => items.sort_by_key(|i| key(i)),
        SizeOrder::LargeFirst => items.sort_by_key(|i| std::cmp::Reverse(key(i))),
        SizeOrder::Natural => {}
    }
}
