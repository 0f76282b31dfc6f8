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
use crate::config::DropCacheLevel;

use std::fs;

/// Best-effort host cache flush, supplementing the core pipeline the same
/// way the original's `Common/Pool.py`/`Directory.py` flushed buffers before
/// a run: `sync`, then (if permitted) write `drop_cache_level` to
/// `/proc/sys/vm/drop_caches`. Never aborts the run; failures are logged.
pub fn flush(level: DropCacheLevel, flush_fs_buffer: bool) {
    if flush_fs_buffer {
        if let Err(e) = run_command("sync", &[]) {
            tracing::warn!(error = %e, "failed to run sync before cache flush");
        }
    }

    let value = match level {
        DropCacheLevel::PageCache => "1",
        DropCacheLevel::Dentries => "2",
        DropCacheLevel::PageCacheAndDentries => "3",
    };

    if let Err(e) = fs::write("/proc/sys/vm/drop_caches", value) {
        tracing::warn!(error = %e, "failed to drop host page cache, continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_never_panics_without_root_privileges() {
        // /proc/sys/vm/drop_caches is root-only; this must degrade silently.
        flush(DropCacheLevel::PageCache, true);
    }
}
