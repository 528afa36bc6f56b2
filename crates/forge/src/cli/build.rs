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

use forgebuild::Op;

use super::UniversalFlags;
use crate::buildspec;

/// Bring targets up to date
#[derive(Debug, clap::Parser)]
pub struct BuildSubcommand {
    /// Targets (or buildspecs) to update; all declared targets if omitted
    pub targets: Vec<String>,
}

pub fn run_build(flags: &UniversalFlags, cmd: &BuildSubcommand) -> anyhow::Result<i32> {
    let specs = buildspec::parse(&cmd.targets, Op::Update)?;
    super::run_specs(flags, specs, "updating")
}
