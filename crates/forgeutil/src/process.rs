// forge: A general-purpose, change-driven build system.
// Copyright (C) 2024 International Digital Economy Academy
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
//
// For inquiries, you can contact us via e-mail at jichuruanjian@idea.edu.cn.

//! Child-process launching with explicit stdio wiring.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{bail, Context};
use tracing::debug;

use crate::shell;

/// Build a `Command` for the given program and argument list.
pub fn command(program: &Path, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Run a process to completion with stdout routed to our stderr. Compilers
/// sometimes diagnose on stdout; keeping the build's own stdout clean means
/// whatever they print still reaches the user as diagnostics.
pub fn run_stdout_to_stderr(cmd: &mut Command) -> anyhow::Result<ExitStatus> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("running {}", render(cmd));

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("unable to execute {}", program))?;

    if let Some(out) = child.stdout.take() {
        let mut reader = BufReader::new(out);
        let mut line = String::new();
        let mut err = std::io::stderr().lock();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let _ = err.write_all(line.as_bytes());
                }
                Err(_) => break,
            }
        }
    }

    child
        .wait()
        .with_context(|| format!("unable to wait for {}", program))
}

/// Fail with a diagnostic unless the process exited successfully.
pub fn check_status(program: &str, status: ExitStatus) -> anyhow::Result<()> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => bail!("{} exited with code {}", program, code),
        None => bail!("{} terminated abnormally", program),
    }
}

/// Render a `Command` for diagnostics.
pub fn render(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let args: Vec<String> = cmd
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    shell::render(&program, &args)
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    #[test]
    fn status_check() {
        let mut ok = Command::new("true");
        let st = ok.status().unwrap();
        assert!(check_status("true", st).is_ok());

        let mut not_ok = Command::new("false");
        let st = not_ok.status().unwrap();
        let err = check_status("false", st).unwrap_err();
        assert!(err.to_string().contains("exited with code"));
    }

    #[test]
    fn stdout_is_rerouted() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo to-stderr-please"]);
        let st = run_stdout_to_stderr(&mut cmd).unwrap();
        assert!(st.success());
    }
}
