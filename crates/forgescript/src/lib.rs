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

//! A small shell-like language for writing tests.
//!
//! Scripts consist of variable lines, test (command) lines, and control
//! lines (`if`/`elif`/`else`/`end`). Commands support pipes, logical
//! operators with exit-status comparisons, redirects with here-strings,
//! here-documents (optionally regex), file modes, and cleanups.
//!
//! Parsing is two-pass: the pre-parse tokenizes and records every line and
//! collects here-document bodies in input order; execution replays the
//! recorded tokens, expands variables, and runs the commands.

pub mod lexer;
pub mod parser;
pub mod runner;
pub mod syntax;
pub mod vars;

use std::path::Path;

use anyhow::Context as _;

pub use runner::{Outcome, TestEnv};

/// Pre-parse and run a script given as text.
pub fn run_text(name: &str, text: &str, env: &TestEnv) -> anyhow::Result<Outcome> {
    let script = parser::pre_parse(name, text)?;
    runner::Runner::new(env).run(&script)
}

/// Pre-parse and run a script file.
pub fn run_file(path: &Path, env: &TestEnv) -> anyhow::Result<Outcome> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("testscript")
        .to_string();
    run_text(&name, &text, env)
}
