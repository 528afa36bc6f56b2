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

//! The test rule.
//!
//! A target is testable when it carries `test = true` (an executable run
//! directly, with `test.options`/`test.arguments` and optional stdin
//! input and stdout comparison) or when it has a testscript prerequisite,
//! in which case the script runs in a per-test scratch directory with
//! `$*`/`$N` synthesized from the target.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use colored::Colorize;
use tracing::debug;

use forgescript::{Outcome, TestEnv};

use crate::action::Action;
use crate::context::BuildContext;
use crate::recipe::Recipe;
use crate::rule::{Match, Rule};
use crate::target::{Target, TargetState};
use crate::types::{FILE, TESTSCRIPT};

pub struct TestRule;

impl Rule for TestRule {
    fn name(&self) -> &'static str {
        "test"
    }

    fn matches(
        &self,
        _ctx: &BuildContext,
        _a: Action,
        _t: &Arc<Target>,
    ) -> anyhow::Result<Option<Match>> {
        // The test rule matches everything: non-testable targets get a
        // noop so a whole project can be tested wholesale.
        Ok(Some(Match::plain()))
    }

    fn apply(
        &self,
        ctx: &BuildContext,
        a: Action,
        t: &Arc<Target>,
        _m: &Match,
    ) -> anyhow::Result<Recipe> {
        if a != crate::action::PERFORM_TEST {
            return Ok(Recipe::Noop);
        }
        let flagged = ctx
            .lookup(t, "test")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let scripts = testscripts(ctx, t)?;
        if !flagged && scripts.is_empty() {
            debug!("{} is not testable", t);
            return Ok(Recipe::Noop);
        }
        Ok(Recipe::exec(perform_test))
    }
}

fn testscripts(ctx: &BuildContext, t: &Target) -> anyhow::Result<Vec<Arc<Target>>> {
    let mut out = Vec::new();
    for p in t.prerequisites.read().iter() {
        if p.ty.is_a(&TESTSCRIPT) {
            out.push(p.search(ctx)?);
        }
    }
    Ok(out)
}

fn perform_test(ctx: &BuildContext, _a: Action, t: &Arc<Target>) -> anyhow::Result<TargetState> {
    // The update pre-operation has already run; the target's path (when it
    // is file-based) is derived and up to date.
    let program = if t.is_a(&FILE) { t.path() } else { None };

    let options = ctx
        .lookup(t, "test.options")
        .map(|v| v.to_strings())
        .unwrap_or_default();
    let arguments = ctx
        .lookup(t, "test.arguments")
        .map(|v| v.to_strings())
        .unwrap_or_default();

    let scripts = testscripts(ctx, t)?;

    if ctx.dry_run {
        println!("test {}", t);
        return Ok(TargetState::Changed);
    }
    if ctx.verbosity >= 1 {
        println!("test {}", t);
    }

    // Scripts run in a scratch directory under the out tree, one per
    // target, recreated for every run.
    if !scripts.is_empty() {
        let scratch = ctx.out_root.join("test").join(&t.name);
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch)
                .with_context(|| format!("unable to clean {}", scratch.display()))?;
        }
        std::fs::create_dir_all(&scratch)
            .with_context(|| format!("unable to create {}", scratch.display()))?;

        for s in &scripts {
            let spath = s
                .path()
                .or_else(|| {
                    // The script is a plain source file; derive lazily.
                    s.derive_path(&ctx.exts, None).ok()
                })
                .with_context(|| format!("no path for testscript {}", s))?;
            let env = TestEnv {
                name: ctx.diag_path(&spath),
                program: program.clone(),
                options: options.clone(),
                arguments: arguments.clone(),
                cwd: scratch.clone(),
                vars: Vec::new(),
                // At chatty verbosity, passed-through script output is
                // traced into the diagnostics.
                trace: ctx.verbosity >= 2,
            };
            match forgescript::run_file(&spath, &env) {
                Ok(o) if o.success() => {}
                Ok(Outcome::Exited(code)) => {
                    eprintln!(
                        "{}: test {} exited with {}",
                        "failed".red().bold(),
                        t,
                        code
                    );
                    return Ok(TargetState::Failed);
                }
                Ok(Outcome::Completed) => unreachable!("completed is a success"),
                Err(e) => {
                    eprintln!("{}: test {}: {:#}", "failed".red().bold(), t, e);
                    return Ok(TargetState::Failed);
                }
            }
        }
        return Ok(TargetState::Changed);
    }

    // No script: run the target itself as the test.
    let program = program.with_context(|| format!("target {} is not executable", t))?;
    let mut args = options.clone();
    args.extend(arguments.clone());

    let mut cmd = std::process::Command::new(&program);
    cmd.args(&args).current_dir(&ctx.out_root);

    // Optional stdin and expected stdout, both scalars.
    let input = ctx
        .lookup(t, "test.input")
        .and_then(|v| v.as_str().map(str::to_owned));
    let expected = ctx
        .lookup(t, "test.output")
        .and_then(|v| v.as_str().map(str::to_owned));

    use std::process::Stdio;
    cmd.stdin(Stdio::null());
    cmd.stdout(if expected.is_some() {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });
    cmd.stderr(Stdio::inherit());
    if input.is_some() {
        cmd.stdin(Stdio::piped());
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("unable to execute {}", program.display()))?;
    if let Some(input) = input {
        use std::io::Write as _;
        let mut stdin = child.stdin.take().expect("piped stdin");
        stdin.write_all(input.as_bytes())?;
        drop(stdin);
    }
    let out = child
        .wait_with_output()
        .with_context(|| format!("unable to wait for {}", program.display()))?;

    if !out.status.success() {
        eprintln!(
            "{}: test {} exited with {:?}",
            "failed".red().bold(),
            t,
            out.status.code()
        );
        return Ok(TargetState::Failed);
    }
    if let Some(expected) = expected {
        let actual = String::from_utf8_lossy(&out.stdout);
        if actual != expected {
            eprintln!(
                "{}: test {}: unexpected output:\n  expected: {:?}\n  got:      {:?}",
                "failed".red().bold(),
                t,
                expected,
                actual
            );
            return Ok(TargetState::Failed);
        }
    }
    Ok(TargetState::Changed)
}
