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

use super::UniversalFlags;

/// Print version information
#[derive(Debug, clap::Parser)]
pub struct VersionSubcommand {}

pub fn run_version(_flags: &UniversalFlags, _cmd: VersionSubcommand) -> anyhow::Result<i32> {
    println!("forge {}", env!("CARGO_PKG_VERSION"));
    Ok(0)
}
