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

use crate::error::{ConfigError, ConfigResult};
use crate::engine::SizeOrder;

use std::path::Path;

use ini::Ini;

/// `log_format_type` as recognised by [`crate::logging::init`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
    Full,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub log_file: String,
    pub log_path: String,
    pub log_level: String,
    pub log_max_bytes: u64,
    pub log_format_type: LogFormat,
    pub log_backup_count: u32,
    pub log_delay: u64,
}

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub ceph_conffile: Option<String>,
    pub ceph_cluster_name: String,
}

#[derive(Clone, Debug)]
pub struct BackupPolicy {
    pub backup_path: String,
    pub backup_retain_count: usize,
    pub backup_yaml_filepath: String,
    pub backup_yaml_section_name: String,
    pub backup_concurrent_worker_count: usize,
    pub backup_small_size_first: SizeOrder,
    pub backup_full_weekday: Vec<u8>,
    pub backup_incr_weekday: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct SnapshotPolicy {
    pub snapshot_retain_count: usize,
    pub snapshot_protect: bool,
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub monitor_interval: u64,
    pub monitor_record_path: String,
    pub monitor_network_io: bool,
    pub monitor_disk_io: bool,
    pub monitor_memory_io: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropCacheLevel {
    PageCache = 1,
    Dentries = 2,
    PageCacheAndDentries = 3,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub drop_cache_level: DropCacheLevel,
    pub flush_file_system_buffer: bool,
}

#[derive(Clone, Debug)]
pub struct MappingConfig {
    pub openstack_enable_mapping: bool,
    pub openstack_yaml_filepath: Option<String>,
    pub openstack_section_name: Option<String>,
    pub openstack_distribution: Option<String>,
    pub openstack_pool_name: Option<String>,
}

/// The fully parsed, typed configuration for one run, grouped the same way
/// spec.md §6 groups the INI keys.
#[derive(Clone, Debug)]
pub struct BackupConfig {
    pub logging: LoggingConfig,
    pub cluster: ClusterConfig,
    pub backup: BackupPolicy,
    pub snapshot: SnapshotPolicy,
    pub monitor: MonitorConfig,
    pub cache: CacheConfig,
    pub mapping: MappingConfig,
}

struct Section<'a> {
    name: &'a str,
    props: &'a ini::Properties,
}

impl<'a> Section<'a> {
    fn required(&self, key: &str) -> ConfigResult<&str> {
        self.props
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(format!("[{}] {key}", self.name)))
    }

    fn optional(&self, key: &str) -> Option<&str> {
        self.props.get(key)
    }

    fn required_parsed<T: std::str::FromStr>(&self, key: &str) -> ConfigResult<T> {
        let raw = self.required(key)?;
        raw.parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw.to_string()))
    }

    fn optional_parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> ConfigResult<T> {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw.to_string())),
            None => Ok(default),
        }
    }

    fn bool_value(&self, key: &str, default: bool) -> ConfigResult<bool> {
        match self.optional(key) {
            Some(raw) => match raw {
                "True" | "true" | "1" => Ok(true),
                "False" | "false" | "0" => Ok(false),
                other => Err(ConfigError::InvalidValue(key.to_string(), other.to_string())),
            },
            None => Ok(default),
        }
    }

    fn weekday_list(&self, key: &str) -> ConfigResult<Vec<u8>> {
        let raw = self.optional(key).unwrap_or("");
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u8>()
                    .ok()
                    .filter(|d| (1..=7).contains(d))
                    .ok_or_else(|| ConfigError::InvalidValue(key.to_string(), s.to_string()))
            })
            .collect()
    }
}

impl BackupConfig {
    /// Loads `section` from the INI document at `path`. Matches the layout
    /// of the original `configparser`-based config, grouped by prefix.
    pub fn load(path: &Path, section: &str) -> ConfigResult<Self> {
        let ini = Ini::load_from_file(path)?;
        let props = ini
            .section(Some(section))
            .ok_or_else(|| ConfigError::MissingSection(section.to_string()))?;
        let s = Section { name: section, props };

        let log_format_type = match s.optional_parsed::<u8>("log_format_type", 0)? {
            0 => LogFormat::Compact,
            1 => LogFormat::Pretty,
            2 => LogFormat::Json,
            3 => LogFormat::Full,
            other => {
                return Err(ConfigError::InvalidValue(
                    "log_format_type".to_string(),
                    other.to_string(),
                ))
            }
        };

        let logging = LoggingConfig {
            log_file: s.required("log_file")?.to_string(),
            log_path: s.required("log_path")?.to_string(),
            log_level: s.optional("log_level").unwrap_or("info").to_string(),
            log_max_bytes: s.optional_parsed("log_max_bytes", 10 * 1024 * 1024)?,
            log_format_type,
            log_backup_count: s.optional_parsed("log_backup_count", 5)?,
            log_delay: s.optional_parsed("log_delay", 0)?,
        };

        let cluster = ClusterConfig {
            ceph_conffile: s.optional("ceph_conffile").map(str::to_string),
            ceph_cluster_name: s.required("ceph_cluster_name")?.to_string(),
        };

        let small_first_raw = s.optional("backup_small_size_first");
        let backup_small_size_first = match small_first_raw {
            Some("True") | Some("true") => SizeOrder::SmallFirst,
            Some("False") | Some("false") => SizeOrder::LargeFirst,
            _ => SizeOrder::Natural,
        };

        let backup = BackupPolicy {
            backup_path: s.required("backup_path")?.to_string(),
            backup_retain_count: s.required_parsed("backup_retain_count")?,
            backup_yaml_filepath: s.required("backup_yaml_filepath")?.to_string(),
            backup_yaml_section_name: s.optional("backup_yaml_section_name").unwrap_or("backup").to_string(),
            backup_concurrent_worker_count: s.required_parsed("backup_concurrent_worker_count")?,
            backup_small_size_first,
            backup_full_weekday: s.weekday_list("backup_full_weekday")?,
            backup_incr_weekday: s.weekday_list("backup_incr_weekday")?,
        };

        let snapshot = SnapshotPolicy {
            snapshot_retain_count: s.required_parsed("snapshot_retain_count")?,
            snapshot_protect: s.bool_value("snapshot_protect", false)?,
        };

        let monitor = MonitorConfig {
            monitor_interval: s.optional_parsed("monitor_interval", 0)?,
            monitor_record_path: s.optional("monitor_record_path").unwrap_or("").to_string(),
            monitor_network_io: s.bool_value("monitor_network_io", false)?,
            monitor_disk_io: s.bool_value("monitor_disk_io", false)?,
            monitor_memory_io: s.bool_value("monitor_memory_io", false)?,
        };

        let drop_cache_level = match s.optional_parsed::<u8>("drop_cache_level", 1)? {
            1 => DropCacheLevel::PageCache,
            2 => DropCacheLevel::Dentries,
            3 => DropCacheLevel::PageCacheAndDentries,
            other => {
                return Err(ConfigError::InvalidValue(
                    "drop_cache_level".to_string(),
                    other.to_string(),
                ))
            }
        };

        let cache = CacheConfig {
            drop_cache_level,
            flush_file_system_buffer: s.bool_value("flush_file_system_buffer", false)?,
        };

        let mapping = MappingConfig {
            openstack_enable_mapping: s.bool_value("openstack_enable_mapping", false)?,
            openstack_yaml_filepath: s.optional("openstack_yaml_filepath").map(str::to_string),
            openstack_section_name: s.optional("openstack_section_name").map(str::to_string),
            openstack_distribution: s.optional("openstack_distribution").map(str::to_string),
            openstack_pool_name: s.optional("openstack_pool_name").map(str::to_string),
        };

        Ok(BackupConfig {
            logging,
            cluster,
            backup,
            snapshot,
            monitor,
            cache,
            mapping,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_conf(body: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_minimal_required_keys() {
        let f = write_conf(
            "[ceph]\n\
             log_file = rbdbak.log\n\
             log_path = /var/log/rbdbak\n\
             ceph_cluster_name = ceph\n\
             backup_path = /backups\n\
             backup_retain_count = 2\n\
             backup_yaml_filepath = /etc/rbdbak/inventory.yaml\n\
             backup_concurrent_worker_count = 4\n\
             snapshot_retain_count = 2\n",
        );

        let cfg = BackupConfig::load(f.path(), "ceph").unwrap();
        assert_eq!(cfg.backup.backup_retain_count, 2);
        assert_eq!(cfg.backup.backup_concurrent_worker_count, 4);
        assert_eq!(cfg.backup.backup_small_size_first, SizeOrder::Natural);
    }

    #[test]
    fn missing_section_is_config_error() {
        let f = write_conf("[other]\nlog_file = x\n");
        let err = BackupConfig::load(f.path(), "ceph").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection(_)));
    }

    #[test]
    fn weekday_list_parses_comma_separated_values() {
        let f = write_conf(
            "[ceph]\n\
             log_file = rbdbak.log\n\
             log_path = /var/log/rbdbak\n\
             ceph_cluster_name = ceph\n\
             backup_path = /backups\n\
             backup_retain_count = 2\n\
             backup_yaml_filepath = /etc/rbdbak/inventory.yaml\n\
             backup_concurrent_worker_count = 4\n\
             snapshot_retain_count = 2\n\
             backup_full_weekday = 6,7\n\
             backup_incr_weekday = 1,2,3,4,5\n",
        );

        let cfg = BackupConfig::load(f.path(), "ceph").unwrap();
        assert_eq!(cfg.backup.backup_full_weekday, vec![6, 7]);
        assert_eq!(cfg.backup.backup_incr_weekday, vec![1, 2, 3, 4, 5]);
    }
}
