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

//! In-memory test doubles shared by this crate's own unit tests and by
//! `tests/engine.rs`. Kept outside `#[cfg(test)]` so an external integration
//! test binary, which links against the plain (non-test) build of this
//! library, can still see it.

use crate::cluster::{ClusterSession, Extent};
use crate::command::{CommandOutput, CommandRunner};
use crate::error::{ClusterError, ClusterResult};

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct FakeImage {
    pub size: u64,
    pub features: u64,
    pub snapshots: Vec<String>,
    /// Maps `(from, to)` to the extent length total that should be reported.
    pub diff_sizes: HashMap<(Option<String>, Option<String>), u64>,
}

/// An in-memory [`ClusterSession`] used by component and engine tests so the
/// pipeline can be driven without a real Ceph cluster or `rbd` binary. Shares
/// its image table behind an `Arc<Mutex<_>>` so a test can keep a handle
/// ([`FakeClusterSession::images`]) and mutate cluster state (e.g. the
/// snapshot list) between two [`crate::engine::BackupEngine::run`] calls even
/// after the session itself has been handed off to the engine, and so a
/// [`FakeCommandRunner`] built over the same table observes snapshots created
/// or removed by the task-execution path this session is queried from.
#[derive(Clone, Default)]
pub struct FakeClusterSession {
    pub images: Arc<Mutex<HashMap<String, FakeImage>>>,
}

impl FakeClusterSession {
    pub fn with_image(image: impl Into<String>, fake: FakeImage) -> Self {
        let session = Self::default();
        session.images.lock().unwrap().insert(image.into(), fake);
        session
    }

    /// A [`FakeCommandRunner`] that mutates this session's own image table,
    /// so snapshot creation/removal performed through a task is immediately
    /// visible to this session's `snapshot_names`.
    pub fn command_runner(&self) -> FakeCommandRunner {
        FakeCommandRunner::new(self.images.clone())
    }
}

impl ClusterSession for FakeClusterSession {
    fn list_images(&mut self) -> ClusterResult<Vec<String>> {
        Ok(self.images.lock().unwrap().keys().cloned().collect())
    }

    fn image_size(&mut self, image: &str) -> ClusterResult<u64> {
        self.images
            .lock()
            .unwrap()
            .get(image)
            .map(|i| i.size)
            .ok_or_else(|| ClusterError::QueryFailed(format!("no such image {image}")))
    }

    fn image_features(&mut self, image: &str) -> ClusterResult<u64> {
        self.images
            .lock()
            .unwrap()
            .get(image)
            .map(|i| i.features)
            .ok_or_else(|| ClusterError::QueryFailed(format!("no such image {image}")))
    }

    fn snapshot_names(&mut self, image: &str) -> ClusterResult<Vec<String>> {
        self.images
            .lock()
            .unwrap()
            .get(image)
            .map(|i| i.snapshots.clone())
            .ok_or_else(|| ClusterError::QueryFailed(format!("no such image {image}")))
    }

    fn diff_extents(
        &mut self,
        image: &str,
        from_snap: Option<&str>,
        to_snap: Option<&str>,
    ) -> ClusterResult<Vec<Extent>> {
        let images = self.images.lock().unwrap();
        let img = images
            .get(image)
            .ok_or_else(|| ClusterError::QueryFailed(format!("no such image {image}")))?;

        let key = (from_snap.map(str::to_string), to_snap.map(str::to_string));
        let length = img.diff_sizes.get(&key).copied().unwrap_or(img.size);

        Ok(vec![Extent { offset: 0, length }])
    }

    fn close(&mut self) {}
}

/// An in-memory [`CommandRunner`] standing in for the `rbd` binary that
/// [`crate::rbd_tasks`] tasks would otherwise shell out to. Parses just
/// enough of the `snap create`/`rm`/`purge` argument shapes to keep a shared
/// [`FakeImage`] table's snapshot list consistent with what those tasks did,
/// so a [`FakeClusterSession`] built over the same table reports them back
/// accurately. `export`/`export-diff` invocations are accepted as no-ops.
#[derive(Clone)]
pub struct FakeCommandRunner {
    images: Arc<Mutex<HashMap<String, FakeImage>>>,
    fail_if_arg_contains: Vec<String>,
}

impl FakeCommandRunner {
    pub fn new(images: Arc<Mutex<HashMap<String, FakeImage>>>) -> Self {
        Self {
            images,
            fail_if_arg_contains: Vec::new(),
        }
    }

    /// Fails (exit code 1, no state change) any invocation whose argument
    /// list contains one of `patterns` as a substring, so a single run can
    /// exercise both a succeeding and a failing image.
    pub fn failing(images: Arc<Mutex<HashMap<String, FakeImage>>>, patterns: &[&str]) -> Self {
        Self {
            images,
            fail_if_arg_contains: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Fails every invocation unconditionally.
    pub fn always_failing(images: Arc<Mutex<HashMap<String, FakeImage>>>) -> Self {
        Self {
            images,
            fail_if_arg_contains: vec![String::new()],
        }
    }
}

impl CommandRunner for FakeCommandRunner {
    fn run(&self, _program: &str, args: &[String]) -> io::Result<CommandOutput> {
        if self
            .fail_if_arg_contains
            .iter()
            .any(|pattern| args.iter().any(|arg| arg.contains(pattern.as_str())))
        {
            return Ok(CommandOutput {
                stdout: Vec::new(),
                exit_code: 1,
            });
        }

        if let Some(pos) = args.iter().position(|a| a == "snap") {
            let sub = args.get(pos + 1).map(String::as_str).unwrap_or("");
            let spec = args.last().cloned().unwrap_or_default();
            let (image, snap) = match spec.split_once('@') {
                Some((image, snap)) => (image.to_string(), Some(snap.to_string())),
                None => (spec, None),
            };

            let mut images = self.images.lock().unwrap();
            let entry = images.entry(image).or_default();
            match sub {
                "create" => {
                    if let Some(snap) = snap {
                        entry.snapshots.push(snap);
                    }
                }
                "rm" => {
                    if let Some(snap) = &snap {
                        entry.snapshots.retain(|s| s != snap);
                    }
                }
                "purge" => entry.snapshots.clear(),
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: Vec::new(),
            exit_code: 0,
        })
    }
}
