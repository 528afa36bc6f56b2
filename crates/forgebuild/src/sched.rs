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

//! Match/apply/execute orchestration.
//!
//! The unit of scheduling is `(action, target)`. State transitions on a
//! single target are serialized: one worker holds the right to run its
//! match/apply/execute at a time, and a second worker asking for a busy
//! target joins by blocking on its completion. Prerequisites are offered to
//! the shared queue so idle workers pick them up, then joined in order.

use std::sync::Arc;

use anyhow::{bail, Context as _};
use colored::Colorize;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, trace};

use crate::action::{Action, Op};
use crate::context::BuildContext;
use crate::recipe::Recipe;
use crate::target::{RawState, Target, TargetState};
use crate::types::FSDIR;

pub type Job = (Action, Arc<Target>);

/// No rule matched a needed (action, target) pair. Fatal at the
/// meta-operation level, hence typed so the driver can tell it apart from
/// an ordinary target failure.
#[derive(Debug, thiserror::Error)]
#[error("no rule to {action} target {target}")]
pub struct NoRuleError {
    pub action: String,
    pub target: String,
}

/// The shared work queue. Workers steal from it while the thread that
/// needs a result joins on the target itself.
pub struct Scheduler {
    tx: Sender<Job>,
    rx: Receiver<Job>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        let (tx, rx) = unbounded();
        Scheduler { tx, rx }
    }

    pub fn enqueue(&self, a: Action, t: Arc<Target>) {
        {
            let mut b = t.build.lock();
            b.dependents += 1;
        }
        let _ = self.tx.send((a, t));
    }

    pub(crate) fn steal(&self) -> Option<Job> {
        self.rx.try_recv().ok()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Select a rule for `(action, target)` and run its apply step. Idempotent
/// for an already-matched equal action; a strictly stronger action (or one
/// overriding a noop recipe) re-matches.
pub fn match_and_apply(ctx: &BuildContext, a: Action, t: &Arc<Target>) -> anyhow::Result<()> {
    loop {
        let mut b = t.build.lock();
        let noop = b.recipe.as_ref().map(|r| r.is_noop());
        if let (Some(prev), Some(noop)) = (b.action, noop) {
            if prev == a {
                return Ok(());
            }
            if !a.overrides(prev) && !noop {
                // A weaker action rides on the stronger recipe.
                return Ok(());
            }
            // Re-match: the planned state belongs to the previous action.
            b.recipe = None;
            b.prerequisite_targets.clear();
            b.state = RawState::Unknown;
        }
        if b.busy {
            if b.owner == Some(std::thread::current().id()) {
                bail!("dependency cycle detected involving target {}", t);
            }
            t.done.wait(&mut b);
            continue;
        }
        b.busy = true;
        b.owner = Some(std::thread::current().id());
        break;
    }

    let result = (|| {
        for rule in ctx.rules.candidates(t.ty, a.op) {
            if let Some(m) = rule.matches(ctx, a, t)? {
                trace!("matched rule {} to {} for {}", rule.name(), t, a);
                let recipe = rule
                    .apply(ctx, a, t, &m)
                    .with_context(|| format!("while applying rule {} to {}", rule.name(), t))?;
                let mut b = t.build.lock();
                b.action = Some(a);
                b.recipe = Some(recipe);
                return Ok(());
            }
        }
        Err(NoRuleError {
            action: a.to_string(),
            target: t.to_string(),
        }
        .into())
    })();

    let mut b = t.build.lock();
    b.busy = false;
    b.owner = None;
    if result.is_err() {
        b.action = Some(a);
        b.state = RawState::Failed;
    }
    drop(b);
    t.done.notify_all();
    result
}

/// Run the target's recipe now and observe the result. A target being
/// executed by another worker is joined, not re-executed.
pub fn execute_direct(ctx: &BuildContext, a: Action, t: &Arc<Target>) -> anyhow::Result<TargetState> {
    let recipe = loop {
        let mut b = t.build.lock();
        match b.state {
            RawState::Unchanged => return Ok(TargetState::Unchanged),
            RawState::Changed => return Ok(TargetState::Changed),
            RawState::Failed => return Ok(TargetState::Failed),
            _ => {}
        }
        if b.busy {
            if b.owner == Some(std::thread::current().id()) {
                bail!("dependency cycle detected involving target {}", t);
            }
            t.done.wait(&mut b);
            continue;
        }
        match (b.action, b.recipe.clone()) {
            (Some(matched), Some(r)) if matched == a => {
                b.busy = true;
                b.owner = Some(std::thread::current().id());
                break r;
            }
            _ => bail!("target {} is not matched for {}", t, a),
        }
    };

    let state = match run_recipe(ctx, a, t, recipe) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: failed to {} {}: {:#}", "error".red().bold(), verb(a.op), t, e);
            TargetState::Failed
        }
    };

    let mut b = t.build.lock();
    debug_assert!(
        !b.state.is_final() || (b.state == RawState::Unchanged && state == TargetState::Changed),
        "non-monotonic state transition on {}",
        t
    );
    b.state = state.into();
    b.busy = false;
    b.owner = None;
    drop(b);
    t.done.notify_all();
    Ok(state)
}

fn verb(op: Op) -> &'static str {
    match op {
        Op::Default => "build",
        Op::Update => "update",
        Op::Clean => "clean",
        Op::Test => "test",
    }
}

fn run_recipe(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
    recipe: Recipe,
) -> anyhow::Result<TargetState> {
    match recipe {
        Recipe::Noop => Ok(TargetState::Unchanged),
        Recipe::Default | Recipe::Group => execute_prerequisites(ctx, a, t),
        Recipe::Exec(f) => f(ctx, a, t),
    }
}

/// Execute all resolved prerequisites of a target and fold their states.
/// A failed prerequisite poisons the dependent.
pub fn execute_prerequisites(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
) -> anyhow::Result<TargetState> {
    let prereqs = t.prerequisite_targets();
    execute_all(ctx, a, &prereqs)
}

/// Execute a set of targets: offer them to the queue for idle workers,
/// then join each in order.
pub fn execute_all(
    ctx: &BuildContext,
    a: Action,
    targets: &[Arc<Target>],
) -> anyhow::Result<TargetState> {
    for t in targets {
        if t.try_state().is_none() {
            ctx.sched.enqueue(a, Arc::clone(t));
        }
    }
    let mut state = TargetState::Unchanged;
    for t in targets {
        match execute_direct(ctx, a, t)? {
            TargetState::Failed => state = TargetState::Failed,
            TargetState::Changed if state != TargetState::Failed => {
                state = TargetState::Changed;
            }
            _ => {}
        }
    }
    Ok(state)
}

/// Execute the prerequisites and decide whether the dependent must
/// regenerate its output: yes when any prerequisite changed, the output
/// does not exist, or a file-based prerequisite is newer than the output.
/// `None` means a prerequisite failed and the dependent is poisoned.
pub fn execute_prerequisites_newer(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
) -> anyhow::Result<Option<bool>> {
    let prereqs = t.prerequisite_targets();
    let state = execute_all(ctx, a, &prereqs)?;
    if state == TargetState::Failed {
        return Ok(None);
    }
    let tmt = t.load_mtime()?;
    if state == TargetState::Changed || !tmt.exists() {
        return Ok(Some(true));
    }
    for p in &prereqs {
        if p.is_a(&crate::types::FILE) && p.load_mtime()? > tmt {
            return Ok(Some(true));
        }
    }
    Ok(Some(false))
}

/// Inject a dependency on the target's output directory and, on update,
/// create it right away: apply-time steps (header extraction, depdb
/// writes) need the directory to exist before any recipe runs.
pub fn inject_fsdir(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
) -> anyhow::Result<Option<Arc<Target>>> {
    if !forgeutil::path::sub(&t.dir, &ctx.out_root) {
        return Ok(None);
    }
    let (dt, _) = ctx.targets.insert(
        &FSDIR,
        t.dir.clone(),
        std::path::PathBuf::new(),
        String::new(),
        crate::extension::ExtState::Unknown,
    )?;
    match_and_apply(ctx, a, &dt)?;
    t.push_prerequisite_target(Arc::clone(&dt));
    if a.op == Op::Update {
        if execute_direct(ctx, a, &dt)? == TargetState::Failed {
            bail!("unable to create output directory {}", dt.dir.display());
        }
    }
    Ok(Some(dt))
}

/// A worker: steal queued jobs until the run is over.
pub(crate) fn worker_loop(ctx: &BuildContext, stop: &std::sync::atomic::AtomicBool) {
    use std::sync::atomic::Ordering;
    loop {
        match ctx.sched.steal() {
            Some((a, t)) => {
                debug!("worker picked up {} for {}", t, a);
                // Errors surface when the requester joins the target.
                let _ = execute_direct(ctx, a, &t);
            }
            None => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
    }
}
