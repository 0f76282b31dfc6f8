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

use std::io;
use std::process::{Command, Stdio};

/// The captured result of running an external command to completion.
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes an external program, abstracted so [`crate::rbd_tasks`] tasks can
/// be driven against an in-memory double in tests instead of a real `rbd`
/// binary.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// The production [`CommandRunner`], shelling out via [`run_command`].
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        run_command(program, args)
    }
}

/// Spawns `program` with pre-tokenised `args`, waits for completion and captures
/// stdout. No shell is ever invoked: callers must supply vetted argument tokens
/// rather than a single command string (spec.md §9 REDESIGN FLAGS). stdout is
/// returned uninterpreted; any parsing (e.g. `rbd diff` columns) is the
/// caller's responsibility.
pub fn run_command(program: &str, args: &[String]) -> io::Result<CommandOutput> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = if output.status.success() {
        output.stdout
    } else {
        // Record stderr as error context when the command failed, matching
        // spec.md §4.2's "task records stdout as error context" behaviour:
        // operators debugging a failed rbd invocation need the diagnostic text.
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        combined
    };

    Ok(CommandOutput { stdout, exit_code })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_captures_stdout_and_zero_exit_code() {
        let out = run_command("printf", &["%s".to_string(), "hello".to_string()]).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, b"hello");
    }

    #[test]
    fn failure_reports_nonzero_exit_code() {
        let out = run_command("false", &[]).unwrap();
        assert!(!out.success());
        assert_ne!(out.exit_code, 0);
    }

    #[test]
    fn missing_program_is_io_error_not_panic() {
        let result = run_command("rbdbak-definitely-not-a-real-binary", &[]);
        assert!(result.is_err());
    }
}
