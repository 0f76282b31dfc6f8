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

use chrono::{Duration, NaiveDateTime, Utc};

/// The lifecycle status of a [`Task`]. A closed enumeration per spec.md §9
/// ("global constants for status enums" in the original is replaced by a
/// proper state machine type).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskStatus {
    Initial,
    Running,
    Complete,
    Error,
}

/// Identifies which concrete [`Task`] variant produced a [`TaskResult`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskKind {
    SnapshotCreate,
    SnapshotRemove,
    SnapshotPurge,
    ExportFull,
    ExportDiff,
}

/// The outcome of having run a [`Task`] to completion (or failure).
/// Produced by [`Task::execute`] and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct TaskResult {
    pub kind: TaskKind,
    pub name: String,
    pub worker_label: String,
    pub status: TaskStatus,
    pub command: Vec<String>,
    pub exit_code: Option<i32>,
    pub stdout_capture: Vec<u8>,
    pub error_message: Option<String>,
    pub init_ts: NaiveDateTime,
    pub start_ts: Option<NaiveDateTime>,
    pub complete_ts: Option<NaiveDateTime>,

    /// The image this task belongs to, equal to the owning descriptor's `image_id`.
    pub task_id: String,

    /// Snapshot name generated or operated on by this task, if any.
    /// Populated by [`crate::rbd_tasks::SnapshotTask`] on successful CREATE.
    pub snap_name: Option<String>,
    /// Destination path written by an export task, if any.
    pub dest_path: Option<std::path::PathBuf>,
}

impl TaskResult {
    /// Elapsed time between start and completion, or `None` if either
    /// timestamp is missing or completion precedes start (spec.md §4.1).
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.start_ts, self.complete_ts) {
            (Some(start), Some(complete)) if complete >= start => Some(complete - start),
            _ => None,
        }
    }
}

/// Uniform unit of work dispatched to a [`crate::dispatcher::WorkerPool`] worker.
///
/// Implementations must never panic or propagate an error out of `execute`;
/// failures are captured into the returned [`TaskResult`] with
/// `status = TaskStatus::Error` instead (spec.md §4.1).
pub trait Task: Send {
    fn execute(&mut self, worker_label: &str) -> TaskResult;
    fn name(&self) -> &str;
    fn status(&self) -> TaskStatus;
    /// The `image_id` this task was submitted for.
    fn task_id(&self) -> &str;
}

/// Shared bookkeeping every concrete task variant delegates to.
/// Grounded on the timestamp/status fields `spec.md` §4.1 requires of every task.
pub(crate) struct TaskState {
    pub status: TaskStatus,
    pub init_ts: NaiveDateTime,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            status: TaskStatus::Initial,
            init_ts: Utc::now().naive_utc(),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}
