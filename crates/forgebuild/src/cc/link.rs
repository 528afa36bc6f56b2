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

//! Linking executables from objects and libraries.

use std::sync::Arc;

use anyhow::Context as _;
use tracing::debug;

use forgeutil::hash::Digest;
use forgeutil::timestamp::{self, Timestamp};
use forgeutil::{path, process, shell};

use crate::action::{Action, Op, PERFORM_CLEAN, PERFORM_UPDATE};
use crate::context::BuildContext;
use crate::depdb::DepDb;
use crate::recipe::Recipe;
use crate::rule::{Match, Rule};
use crate::sched;
use crate::target::{Target, TargetState};
use crate::types::{EXE, LIB, OBJ};

use super::{clean_files, configure, depdb_path};

pub struct LinkRule;

impl Rule for LinkRule {
    fn name(&self) -> &'static str {
        "cc.link"
    }

    fn matches(
        &self,
        ctx: &BuildContext,
        _a: Action,
        t: &Arc<Target>,
    ) -> anyhow::Result<Option<Match>> {
        if !t.is_a(&EXE) || ctx.lookup(t, "recipe").is_some() {
            return Ok(None);
        }
        // There must be something to link.
        let has_input = t
            .prerequisites
            .read()
            .iter()
            .any(|p| p.ty.is_a(&OBJ) || p.ty.is_a(&LIB));
        if !has_input {
            debug!("no object or library input for target {}", t);
            return Ok(None);
        }
        Ok(Some(Match::plain()))
    }

    fn apply(
        &self,
        ctx: &BuildContext,
        a: Action,
        t: &Arc<Target>,
        _m: &Match,
    ) -> anyhow::Result<Recipe> {
        let cc = configure(ctx)?;

        let exe_ext = if cc.target_class == "windows" { "exe" } else { "" };
        t.derive_path(&ctx.exts, Some(exe_ext))?;

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
            let tpath = t.path().expect("executable path derived above");
            let mut dd = DepDb::open(depdb_path(&tpath))?;

            if dd.expect("cc.link 1").mismatched() {
                debug!("rule mismatch forcing update of {}", t);
            }
            if dd.expect(&cc.checksum).mismatched() {
                debug!("compiler mismatch forcing update of {}", t);
            }
            let mut cs = Digest::new();
            if let Some(v) = ctx.lookup(t, "cc.loptions") {
                for o in v.to_strings() {
                    cs.append(&o);
                }
            }
            if let Some(v) = ctx.lookup(t, "cc.libs") {
                for o in v.to_strings() {
                    cs.append(&o);
                }
            }
            if dd.expect(&cs.string()).mismatched() {
                debug!("options mismatch forcing update of {}", t);
            }
            // The input set, in link order.
            for i in link_inputs(t) {
                let p = i.path().with_context(|| format!("no path for {}", i))?;
                dd.expect(&p.display().to_string());
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

/// The file inputs to the link, in prerequisite order.
fn link_inputs(t: &Target) -> Vec<Arc<Target>> {
    t.prerequisite_targets()
        .into_iter()
        .filter(|p| p.is_a(&OBJ) || p.is_a(&LIB))
        .collect()
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

    let cc = configure(ctx)?;
    let tpath = t.path().expect("executable path derived during apply");

    let mut args: Vec<String> = Vec::new();
    if let Some(v) = ctx.lookup(t, "cc.loptions") {
        args.extend(v.to_strings());
    }
    if cc.msvc() {
        if ctx.verbosity < 3 {
            args.push("/nologo".to_string());
        }
        args.push(format!("/Fe:{}", tpath.display()));
    } else {
        args.push("-o".to_string());
        args.push(tpath.display().to_string());
    }
    for i in link_inputs(t) {
        args.push(i.path().expect("input path").display().to_string());
    }
    if let Some(v) = ctx.lookup(t, "cc.libs") {
        args.extend(v.to_strings());
    }

    let rendered = shell::render(&cc.path.display().to_string(), &args);
    if ctx.dry_run {
        println!("{}", rendered);
        return Ok(TargetState::Changed);
    }
    if ctx.verbosity >= 2 {
        println!("{}", rendered);
    } else if ctx.verbosity == 1 {
        println!("ld {}", ctx.diag_path(&tpath));
    }

    let mut cmd = process::command(&cc.path, &args);
    let status = process::run_stdout_to_stderr(&mut cmd)?;
    process::check_status(&cc.path.display().to_string(), status)
        .with_context(|| format!("unable to link {}", ctx.diag_path(&tpath)))?;

    t.set_mtime(timestamp::mtime(&tpath)?);
    Ok(TargetState::Changed)
}

fn perform_clean(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
) -> anyhow::Result<TargetState> {
    let tpath = t.path().expect("executable path derived during apply");
    let mut state = clean_files(ctx, t, &[depdb_path(&tpath), tpath])?;
    if sched::execute_prerequisites(ctx, a, t)? == TargetState::Changed
        && state == TargetState::Unchanged
    {
        state = TargetState::Changed;
    }
    Ok(state)
}
