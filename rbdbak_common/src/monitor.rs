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

use crate::config::MonitorConfig;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One sample appended to `monitor_record_path`, gated field-by-field by the
/// corresponding `monitor_*_io` flags (spec.md §9's "optional host-process
/// I/O sampling", recovered from `Common/Monitor.py`). Never touches engine
/// state, task queues, or metadata.
struct Sample {
    timestamp: chrono::NaiveDateTime,
    network_rx_bytes: Option<u64>,
    network_tx_bytes: Option<u64>,
    disk_read_sectors: Option<u64>,
    disk_write_sectors: Option<u64>,
    mem_available_kb: Option<u64>,
}

impl Sample {
    fn to_line(&self) -> String {
        format!(
            "{} net_rx={} net_tx={} disk_r={} disk_w={} mem_avail={}\n",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            opt(self.network_rx_bytes),
            opt(self.network_tx_bytes),
            opt(self.disk_read_sectors),
            opt(self.disk_write_sectors),
            opt(self.mem_available_kb),
        )
    }
}

fn opt(v: Option<u64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn read_net_totals() -> Option<(u64, u64)> {
    let text = fs::read_to_string("/proc/net/dev").ok()?;
    let mut rx_total = 0u64;
    let mut tx_total = 0u64;

    for line in text.lines().skip(2) {
        let (_, rest) = line.split_once(':')?;
        let mut fields = rest.split_whitespace();
        rx_total += fields.next()?.parse::<u64>().ok()?;
        // tx bytes is the 9th whitespace-separated field after the colon
        let tx = fields.nth(7)?.parse::<u64>().ok()?;
        tx_total += tx;
    }

    Some((rx_total, tx_total))
}

fn read_disk_totals() -> Option<(u64, u64)> {
    let text = fs::read_to_string("/proc/diskstats").ok()?;
    let mut read_total = 0u64;
    let mut write_total = 0u64;

    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        read_total += fields[5].parse::<u64>().unwrap_or(0);
        write_total += fields[9].parse::<u64>().unwrap_or(0);
    }

    Some((read_total, write_total))
}

fn read_mem_available_kb() -> Option<u64> {
    let text = fs::read_to_string("/proc/meminfo").ok()?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

fn take_sample(cfg: &MonitorConfig) -> Sample {
    let (net_rx, net_tx) = if cfg.monitor_network_io {
        read_net_totals().map_or((None, None), |(r, t)| (Some(r), Some(t)))
    } else {
        (None, None)
    };

    let (disk_r, disk_w) = if cfg.monitor_disk_io {
        read_disk_totals().map_or((None, None), |(r, w)| (Some(r), Some(w)))
    } else {
        (None, None)
    };

    let mem = if cfg.monitor_memory_io { read_mem_available_kb() } else { None };

    Sample {
        timestamp: chrono::Utc::now().naive_utc(),
        network_rx_bytes: net_rx,
        network_tx_bytes: net_tx,
        disk_read_sectors: disk_r,
        disk_write_sectors: disk_w,
        mem_available_kb: mem,
    }
}

/// An out-of-band sampling thread, started with [`Monitor::start`] and ended
/// with [`Monitor::stop`]. Runs independently of the worker pool and engine
/// stages; it is never submitted to the dispatcher.
pub struct Monitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Returns `None` when `monitor_interval == 0` (monitoring disabled).
    pub fn start(cfg: MonitorConfig) -> Option<Self> {
        if cfg.monitor_interval == 0 {
            return None;
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop_flag = stop_flag.clone();
        let interval = Duration::from_secs(cfg.monitor_interval);
        let record_path = cfg.monitor_record_path.clone();

        let handle = thread::spawn(move || {
            while !thread_stop_flag.load(Ordering::Relaxed) {
                let sample = take_sample(&cfg);

                if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&record_path) {
                    let _ = file.write_all(sample.to_line().as_bytes());
                } else {
                    tracing::warn!(path = %record_path, "failed to open monitor record path");
                }

                thread::sleep(interval);
            }
        });

        Some(Self {
            stop_flag,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_interval_never_spawns_a_thread() {
        let cfg = MonitorConfig {
            monitor_interval: 0,
            monitor_record_path: String::new(),
            monitor_network_io: false,
            monitor_disk_io: false,
            monitor_memory_io: false,
        };

        assert!(Monitor::start(cfg).is_none());
    }

    #[test]
    fn sample_line_uses_dash_for_disabled_fields() {
        let cfg = MonitorConfig {
            monitor_interval: 1,
            monitor_record_path: String::new(),
            monitor_network_io: false,
            monitor_disk_io: false,
            monitor_memory_io: false,
        };

        let sample = take_sample(&cfg);
        let line = sample.to_line();
        assert!(line.contains("net_rx=-"));
        assert!(line.contains("disk_r=-"));
        assert!(line.contains("mem_avail=-"));
    }
}
