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

use crate::config::{LogFormat, LoggingConfig};

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// Rotates `<log_path>/<log_file>` to `.1` .. `.log_backup_count` once the
/// current file exceeds `log_max_bytes` (`tracing-appender::rolling` only
/// rotates on a time schedule, not size, so this is hand-written).
pub struct SizeRotatingWriter {
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
    written: u64,
    file: BufWriter<File>,
}

impl SizeRotatingWriter {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backup_count: u32) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes,
            backup_count,
            written,
            file: BufWriter::new(file),
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.backup_count > 0 {
            let oldest = self.path.with_extension(format!("log.{}", self.backup_count));
            let _ = fs::remove_file(&oldest);

            for n in (1..self.backup_count).rev() {
                let from = self.path.with_extension(format!("log.{n}"));
                let to = self.path.with_extension(format!("log.{}", n + 1));
                if from.exists() {
                    let _ = fs::rename(&from, &to);
                }
            }

            let first = self.path.with_extension("log.1");
            let _ = fs::rename(&self.path, &first);
        } else {
            let _ = fs::remove_file(&self.path);
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.file = BufWriter::new(file);
        self.written = 0;

        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written >= self.max_bytes && self.max_bytes > 0 {
            self.rotate()?;
        }

        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Wraps [`SizeRotatingWriter`] behind a mutex so it can implement
/// `tracing_subscriber`'s `MakeWriter`, which needs a fresh writer handle
/// per log event.
pub struct RotatingMakeWriter {
    inner: Mutex<SizeRotatingWriter>,
}

impl RotatingMakeWriter {
    pub fn new(writer: SizeRotatingWriter) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }
}

pub struct RotatingWriterGuard<'a> {
    inner: std::sync::MutexGuard<'a, SizeRotatingWriter>,
}

impl Write for RotatingWriterGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingMakeWriter {
    type Writer = RotatingWriterGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriterGuard {
            inner: self.inner.lock().expect("log writer mutex poisoned"),
        }
    }
}

fn parse_level(raw: &str) -> Level {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Builds and installs the global `tracing` subscriber from a [`LoggingConfig`].
/// `log_delay` (seconds) is honoured as a minimum gap between rotation checks
/// by the caller between runs, not inside the writer itself, since every
/// call here is a single process invocation (spec.md §6: `rbdbak` runs once
/// per cron/systemd invocation, it does not loop).
pub fn init(cfg: &LoggingConfig) -> io::Result<()> {
    let path = Path::new(&cfg.log_path).join(&cfg.log_file);
    let writer = SizeRotatingWriter::open(path, cfg.log_max_bytes, cfg.log_backup_count)?;
    let make_writer = RotatingMakeWriter::new(writer);

    let level = parse_level(&cfg.log_level);
    let builder = tracing_subscriber::fmt().with_max_level(level).with_writer(make_writer);

    let result = match cfg.log_format_type {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Full => builder.try_init(),
    };

    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rotates_when_exceeding_max_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rbdbak.log");

        let mut writer = SizeRotatingWriter::open(&path, 8, 2).unwrap();
        writer.write_all(b"12345678").unwrap();
        writer.flush().unwrap();
        writer.write_all(b"more").unwrap();
        writer.flush().unwrap();

        assert!(path.with_extension("log.1").exists());
    }

    #[test]
    fn does_not_rotate_under_the_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rbdbak.log");

        let mut writer = SizeRotatingWriter::open(&path, 1024, 2).unwrap();
        writer.write_all(b"small").unwrap();
        writer.flush().unwrap();

        assert!(!path.with_extension("log.1").exists());
    }
}
