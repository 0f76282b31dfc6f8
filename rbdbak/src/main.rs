// rbdbak is the CLI entry point for the RBD backup orchestration engine.
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

mod error;
use error::*;

use rbdbak_common::cluster::{cluster_fsid, CliClusterSession, ClusterSession};
use rbdbak_common::config::BackupConfig;
use rbdbak_common::engine::{BackupEngine, SessionFactory};
use rbdbak_common::inventory::{
    NullOpenStackInventory, OpenStackBackedInventory, StaticInventory, VolumeInventory,
};
use rbdbak_common::logging;
use rbdbak_common::monitor::Monitor;

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Run one scheduled backup pass of the configured Ceph RBD images.
struct Args {
    /// Path to the INI configuration file.
    #[arg(long, default_value = "./Config/backup.conf")]
    backup_config_file: PathBuf,
    /// Section of the configuration file to read.
    #[arg(long, default_value = "ceph")]
    backup_config_section: String,
    /// Overrides `ceph_conffile` from the configuration file.
    #[arg(long)]
    ceph_conffile: Option<String>,
    /// Overrides `ceph_cluster_name` from the configuration file.
    #[arg(long)]
    ceph_cluster_name: Option<String>,
}

/// Opens a [`CliClusterSession`] per pool, shelling out to `rbd`.
struct CliSessionFactory {
    cluster_name: String,
    conffile: Option<String>,
}

impl SessionFactory for CliSessionFactory {
    fn open(&self, pool_name: &str) -> Box<dyn ClusterSession> {
        Box::new(CliClusterSession::new(
            self.cluster_name.clone(),
            pool_name.to_string(),
            self.conffile.clone(),
        ))
    }
}

/// Builds the worklist source: the flat static YAML document, or, when
/// `openstack_enable_mapping` is set, an [`OpenStackBackedInventory`] over
/// the volume ids listed in `openstack_yaml_filepath`. No real Cinder/Nova
/// client ships with this crate, so the resolver is
/// [`NullOpenStackInventory`] until one is wired in.
fn build_inventory(config: &BackupConfig) -> Result<Box<dyn VolumeInventory>> {
    if !config.mapping.openstack_enable_mapping {
        return Ok(Box::new(StaticInventory::new(&config.backup.backup_yaml_filepath)));
    }

    let pool_name = config
        .mapping
        .openstack_pool_name
        .clone()
        .ok_or_else(|| rbdbak_common::ConfigError::MissingKey("openstack_pool_name".to_string()))?;
    let yaml_path = config
        .mapping
        .openstack_yaml_filepath
        .clone()
        .ok_or_else(|| rbdbak_common::ConfigError::MissingKey("openstack_yaml_filepath".to_string()))?;

    let text = fs::read_to_string(&yaml_path).map_err(rbdbak_common::ConfigError::Io)?;
    let volume_ids: Vec<String> = serde_yaml::from_str(&text).map_err(rbdbak_common::ConfigError::Yaml)?;

    Ok(Box::new(OpenStackBackedInventory::new(
        pool_name,
        volume_ids,
        Box::new(NullOpenStackInventory),
    )))
}

fn logic() -> Result<()> {
    let args = Args::parse();

    let mut config = BackupConfig::load(&args.backup_config_file, &args.backup_config_section)?;
    if let Some(conffile) = args.ceph_conffile {
        config.cluster.ceph_conffile = Some(conffile);
    }
    if let Some(cluster_name) = args.ceph_cluster_name {
        config.cluster.ceph_cluster_name = cluster_name;
    }

    logging::init(&config.logging)?;

    let fsid = cluster_fsid(
        &config.cluster.ceph_cluster_name,
        config.cluster.ceph_conffile.as_deref(),
    )?;

    let inventory = build_inventory(&config)?;

    let session_factory = Box::new(CliSessionFactory {
        cluster_name: config.cluster.ceph_cluster_name.clone(),
        conffile: config.cluster.ceph_conffile.clone(),
    });

    let monitor = Monitor::start(config.monitor.clone());

    let mut engine = BackupEngine::new(config, session_factory, inventory, fsid);
    let summary = engine.run()?;

    if let Some(monitor) = monitor {
        monitor.stop();
    }

    tracing::info!(
        planned = summary.images_planned,
        snapshotted = summary.images_snapshotted,
        dropped = summary.images_dropped,
        exported = summary.images_exported,
        export_failures = summary.export_failures,
        snapshots_pruned = summary.snapshots_pruned,
        backups_pruned = summary.backups_pruned,
        no_run_today = summary.no_run_today,
        aborted_insufficient_space = summary.aborted_insufficient_space,
        "backup run finished"
    );

    Ok(())
}

fn main() {
    if let Err(e) = logic() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
