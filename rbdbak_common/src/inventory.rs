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

use crate::error::ConfigResult;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Where the engine's `(pool, image)` worklist for a run comes from, either
/// a flat static document or an OpenStack-backed mapping (spec.md §1/§6).
pub trait VolumeInventory: Send {
    fn pool_images(&self) -> ConfigResult<Vec<(String, Vec<String>)>>;
}

/// Reads a YAML document mapping `pool_name -> [image_name, ...]`.
pub struct StaticInventory {
    path: PathBuf,
}

impl StaticInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VolumeInventory for StaticInventory {
    fn pool_images(&self) -> ConfigResult<Vec<(String, Vec<String>)>> {
        let text = fs::read_to_string(&self.path)?;
        let map: HashMap<String, Vec<String>> = serde_yaml::from_str(&text)?;
        Ok(map.into_iter().collect())
    }
}

/// The external volume-management inventory, specified only at its interface
/// (spec.md §1): translates an OpenStack volume id into the RBD image name
/// backing it. The real Cinder/Nova client lives outside this crate.
pub trait OpenStackInventory: Send {
    fn resolve(&self, volume_id: &str) -> Option<String>;
}

/// A no-op [`OpenStackInventory`] so the crate builds and runs without a real
/// OpenStack deployment configured.
pub struct NullOpenStackInventory;

impl OpenStackInventory for NullOpenStackInventory {
    fn resolve(&self, _volume_id: &str) -> Option<String> {
        None
    }
}

/// Adapts a list of OpenStack volume ids, all living in one pool, into the
/// same `(pool, images)` shape [`StaticInventory`] produces, via a resolver.
pub struct OpenStackBackedInventory {
    pool_name: String,
    volume_ids: Vec<String>,
    resolver: Box<dyn OpenStackInventory>,
}

impl OpenStackBackedInventory {
    pub fn new(pool_name: String, volume_ids: Vec<String>, resolver: Box<dyn OpenStackInventory>) -> Self {
        Self {
            pool_name,
            volume_ids,
            resolver,
        }
    }
}

impl VolumeInventory for OpenStackBackedInventory {
    fn pool_images(&self) -> ConfigResult<Vec<(String, Vec<String>)>> {
        let images: Vec<String> = self
            .volume_ids
            .iter()
            .filter_map(|id| {
                let resolved = self.resolver.resolve(id);
                if resolved.is_none() {
                    tracing::warn!(volume_id = %id, "could not resolve OpenStack volume to an RBD image");
                }
                resolved
            })
            .collect();

        Ok(vec![(self.pool_name.clone(), images)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    #[test]
    fn static_inventory_reads_pool_image_mapping() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "poolA:\n  - img1\n  - img2\npoolB:\n  - img3\n").unwrap();

        let inventory = StaticInventory::new(f.path());
        let mut result = inventory.pool_images().unwrap();
        result.sort();

        assert_eq!(
            result,
            vec![
                ("poolA".to_string(), vec!["img1".to_string(), "img2".to_string()]),
                ("poolB".to_string(), vec!["img3".to_string()]),
            ]
        );
    }

    #[test]
    fn null_openstack_inventory_never_resolves() {
        let inventory = OpenStackBackedInventory::new(
            "poolA".to_string(),
            vec!["vol-1".to_string()],
            Box::new(NullOpenStackInventory),
        );

        let result = inventory.pool_images().unwrap();
        assert_eq!(result, vec![("poolA".to_string(), Vec::new())]);
    }
}
