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

use std::io::IsTerminal;

use clap::Parser;
use colored::Colorize;

mod buildspec;
mod cli;

/// Initialize logging: `RUST_LOG` filters the output, which goes to
/// stderr, colored only when stderr is a terminal.
fn init_tracing() {
    let log_env_set = std::env::var("RUST_LOG").is_ok();
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .from_env_lossy();

    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    if !log_env_set {
        fmt.with_target(false).without_time().init();
    } else {
        fmt.compact().init();
    }
}

fn main() {
    let cli = cli::ForgeCli::parse();

    init_tracing();

    use cli::ForgeSubcommands::*;
    let res = match cli.subcommand {
        Build(b) => cli::run_build(&cli.flags, &b),
        Clean(c) => cli::run_clean(&cli.flags, &c),
        Test(t) => cli::run_test(&cli.flags, &t),
        Version(v) => cli::run_version(&cli.flags, v),
    };

    match res {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}: {:?}", "error".red().bold(), e);
            std::process::exit(1);
        }
    }
}
