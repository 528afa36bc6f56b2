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

pub mod build;
pub mod clean;
pub mod test;
pub mod version;

pub use build::*;
pub use clean::*;
pub use test::*;
pub use version::*;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use colored::Colorize;

use forgebuild::manifest;
use forgebuild::{BuildContext, Summary, Target};

use crate::buildspec::BuildSpec;

#[derive(Debug, clap::Parser)]
#[clap(name = "forge", about = "A general-purpose, change-driven build system.")]
pub struct ForgeCli {
    #[clap(subcommand)]
    pub subcommand: ForgeSubcommands,

    #[clap(flatten)]
    pub flags: UniversalFlags,
}

#[derive(Debug, clap::Parser)]
pub enum ForgeSubcommands {
    Build(BuildSubcommand),
    Clean(CleanSubcommand),
    Test(TestSubcommand),
    Version(VersionSubcommand),
}

#[derive(Debug, clap::Parser, Clone)]
pub struct UniversalFlags {
    /// Increase diagnostics verbosity (repeatable)
    #[clap(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all non-diagnostic output
    #[clap(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print the commands without executing them
    #[clap(long, global = true)]
    pub dry_run: bool,

    /// Set the max number of jobs to run in parallel
    #[clap(short = 'j', long, global = true)]
    pub jobs: Option<usize>,

    /// Operate in this directory instead of the current one
    #[clap(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,
}

/// Load the enclosing project and build a context per the flags.
pub fn make_context(flags: &UniversalFlags) -> anyhow::Result<(BuildContext, Vec<Arc<Target>>)> {
    let start = match &flags.directory {
        Some(d) => forgeutil::path::realize(d)
            .with_context(|| format!("invalid directory `{}`", d.display()))?,
        None => std::env::current_dir().context("unable to determine current directory")?,
    };
    let root = match manifest::find_project_root(&start) {
        Some(r) => r,
        None => bail!(
            "could not find `{}` in `{}` or any parent directory",
            manifest::FORGE_JSON,
            start.display()
        ),
    };

    let mut ctx = BuildContext::new(root.clone(), root.join("out"));
    ctx.verbosity = if flags.quiet { 0 } else { 1 + flags.verbose };
    ctx.dry_run = flags.dry_run;
    if let Some(jobs) = flags.jobs {
        ctx.jobs = jobs.max(1);
    }

    let declared = manifest::load_project(&ctx)?;
    Ok((ctx, declared))
}

/// Run a list of buildspecs against the project. Bare specs without
/// targets operate on every declared target.
pub fn run_specs(flags: &UniversalFlags, specs: Vec<BuildSpec>, mode: &str) -> anyhow::Result<i32> {
    let (ctx, declared) = make_context(flags)?;

    let mut worst = 0;
    for spec in specs {
        let roots: Vec<Arc<Target>> = if spec.targets.is_empty() {
            declared.clone()
        } else {
            let mut v = Vec::with_capacity(spec.targets.len());
            for s in &spec.targets {
                v.push(manifest::resolve_targetspec(&ctx, s)?);
            }
            v
        };
        let summary = forgebuild::perform(&ctx, spec.action, &roots)?;
        let code = render_result(&summary, flags.quiet, mode)?;
        worst = worst.max(code);
    }
    Ok(worst)
}

/// Summarize an action run the way users expect: silence about the
/// details, one line about the outcome.
pub fn render_result(summary: &Summary, quiet: bool, mode: &str) -> anyhow::Result<i32> {
    if summary.failed > 0 {
        bail!("failed when {}", mode);
    }
    if summary.ran == 0 {
        if !quiet {
            println!("{} forge: no work to do", "Finished.".bright_green().bold());
        }
    } else if !quiet {
        println!(
            "{} forge: ran {} task{}, now up to date",
            "Finished.".bright_green().bold(),
            summary.ran,
            if summary.ran == 1 { "" } else { "s" }
        );
    }
    Ok(0)
}
