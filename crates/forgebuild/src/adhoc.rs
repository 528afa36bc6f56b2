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

//! Ad hoc recipes: file targets produced by a user-declared command.
//!
//! A target carrying a `recipe` variable (a list of argv words) is built by
//! running that command, with `$out` standing for the target path and `$in`
//! expanding to the file prerequisites. This is how auto-generated sources
//! and headers enter the graph.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use tracing::debug;

use forgeutil::hash::Digest;
use forgeutil::timestamp::{self, Timestamp};
use forgeutil::{path, process, shell};

use crate::action::{Action, Op, PERFORM_CLEAN, PERFORM_UPDATE};
use crate::cc::{clean_files, depdb_path};
use crate::context::BuildContext;
use crate::depdb::DepDb;
use crate::recipe::Recipe;
use crate::rule::{Match, Rule};
use crate::sched;
use crate::target::{Target, TargetState};
use crate::types::{FILE, LIB};

pub struct AdhocRule;

impl Rule for AdhocRule {
    fn name(&self) -> &'static str {
        "adhoc"
    }

    fn matches(
        &self,
        ctx: &BuildContext,
        _a: Action,
        t: &Arc<Target>,
    ) -> anyhow::Result<Option<Match>> {
        if !t.is_a(&FILE) {
            return Ok(None);
        }
        match ctx.lookup(t, "recipe") {
            Some(v) if !v.to_strings().is_empty() => Ok(Some(Match::plain())),
            _ => Ok(None),
        }
    }

    fn apply(
        &self,
        ctx: &BuildContext,
        a: Action,
        t: &Arc<Target>,
        _m: &Match,
    ) -> anyhow::Result<Recipe> {
        t.derive_path(&ctx.exts, None)?;

        sched::inject_fsdir(ctx, a, t)?;

        for p in t.prerequisites.read().iter() {
            let pt = p.search(ctx)?;
            if a.op == Op::Clean && !path::sub(&pt.dir, &ctx.out_root) {
                continue;
            }
            sched::match_and_apply(ctx, a, &pt)?;
            t.push_prerequisite_target(pt);
        }

        if a == PERFORM_UPDATE && !ctx.dry_run {
            let tpath = t.path().expect("path derived above");
            let mut dd = DepDb::open(depdb_path(&tpath))?;

            if dd.expect("adhoc 1").mismatched() {
                debug!("rule mismatch forcing update of {}", t);
            }
            let argv = ctx.lookup(t, "recipe").expect("matched on recipe").to_strings();
            let mut cs = Digest::new();
            for w in &argv {
                cs.append(w);
            }
            if dd.expect(&cs.string()).mismatched() {
                debug!("command mismatch forcing update of {}", t);
            }
            for p in file_inputs(t) {
                let pp = p.path().with_context(|| format!("no path for {}", p))?;
                dd.expect(&pp.display().to_string());
            }

            if dd.writing() || dd.mtime() > t.load_mtime()? {
                t.set_mtime(Timestamp::Nonexistent);
            }
            dd.close()?;
        }

        if a == PERFORM_UPDATE {
            Ok(Recipe::exec(perform_update))
        } else if a == PERFORM_CLEAN {
            Ok(Recipe::exec(perform_clean))
        } else {
            Ok(Recipe::Noop)
        }
    }
}

fn file_inputs(t: &Target) -> Vec<Arc<Target>> {
    t.prerequisite_targets()
        .into_iter()
        .filter(|p| p.is_a(&FILE) && !p.is_a(&LIB))
        .collect()
}

/// Substitute `$out` and `$in` in the declared argv.
fn expand_argv(
    argv: &[String],
    out: &std::path::Path,
    inputs: &[Arc<Target>],
) -> anyhow::Result<Vec<String>> {
    let mut expanded = Vec::with_capacity(argv.len());
    for w in argv {
        match w.as_str() {
            "$out" => expanded.push(out.display().to_string()),
            "$in" => {
                for i in inputs {
                    expanded.push(i.path().expect("input path").display().to_string());
                }
            }
            _ => {
                let w = w.replace("$out", &out.display().to_string());
                expanded.push(w);
            }
        }
    }
    if expanded.is_empty() {
        bail!("empty recipe");
    }
    Ok(expanded)
}

fn perform_update(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
) -> anyhow::Result<TargetState> {
    let changed = match sched::execute_prerequisites_newer(ctx, a, t)? {
        None => return Ok(TargetState::Failed),
        Some(c) => c,
    };
    if !changed {
        return Ok(TargetState::Unchanged);
    }

    let tpath = t.path().expect("path derived during apply");
    let argv = ctx.lookup(t, "recipe").expect("matched on recipe").to_strings();
    let argv = expand_argv(&argv, &tpath, &file_inputs(t))?;

    let program = PathBuf::from(&argv[0]);
    let args = argv[1..].to_vec();

    let rendered = shell::render(&argv[0], &args);
    if ctx.dry_run {
        println!("{}", rendered);
        return Ok(TargetState::Changed);
    }
    if ctx.verbosity >= 2 {
        println!("{}", rendered);
    } else if ctx.verbosity == 1 {
        println!("gen {}", ctx.diag_path(&tpath));
    }

    let mut cmd = process::command(&program, &args);
    let status = process::run_stdout_to_stderr(&mut cmd)?;
    process::check_status(&argv[0], status)
        .with_context(|| format!("unable to generate {}", ctx.diag_path(&tpath)))?;

    t.set_mtime(timestamp::mtime(&tpath)?);
    Ok(TargetState::Changed)
}

fn perform_clean(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
) -> anyhow::Result<TargetState> {
    let tpath = t.path().expect("path derived during apply");
    let mut state = clean_files(ctx, t, &[depdb_path(&tpath), tpath])?;
    if sched::execute_prerequisites(ctx, a, t)? == TargetState::Changed
        && state == TargetState::Unchanged
    {
        state = TargetState::Changed;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_expansion() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > $out".to_string(),
        ];
        let out = expand_argv(&argv, std::path::Path::new("/p/out/gen.hxx"), &[]).unwrap();
        assert_eq!(out, vec!["sh", "-c", "cat > /p/out/gen.hxx"]);
    }
}
