// Copyright 2024 International Digital Economy Academy
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
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Driving an action over a set of root targets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use colored::Colorize;
use tracing::debug;

use crate::action::{Action, MetaOp};
use crate::context::BuildContext;
use crate::manifest;
use crate::sched::{self, worker_loop};
use crate::target::{Target, TargetState};

#[derive(Debug, Default, Clone, Copy)]
pub struct Summary {
    /// Targets whose recipe performed work.
    pub ran: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl Summary {
    pub fn ok(&self) -> bool {
        self.failed == 0
    }
}

/// Run an action over the given roots. An operation with a pre-operation
/// (test implies update) runs the pre-operation to completion first.
///
/// The configure meta-operation traverses the graph with noop recipes
/// (deriving paths and the compiler configuration along the way) and then
/// pins the derived configuration in the out tree; disfigure drops that
/// pin without traversing.
pub fn perform(
    ctx: &BuildContext,
    a: Action,
    roots: &[Arc<Target>],
) -> anyhow::Result<Summary> {
    // Per-action state from an earlier operation in this invocation must
    // not leak into this one, and neither may jobs left in the queue.
    ctx.targets.reset();
    while ctx.sched.steal().is_some() {}

    if a.meta == MetaOp::Disfigure {
        return disfigure(ctx);
    }

    if let Some(pre) = a.op.pre() {
        let s = perform_inner(ctx, Action::new(a.meta, pre), roots)?;
        if !s.ok() {
            return Ok(s);
        }
        ctx.targets.reset();
    }
    let mut s = perform_inner(ctx, a, roots)?;

    if a.meta == MetaOp::Configure && s.ok() && !ctx.dry_run {
        if manifest::save_config(ctx)? {
            if ctx.verbosity >= 1 {
                println!(
                    "config {}",
                    ctx.diag_path(&ctx.out_root.join(manifest::CONFIG_JSON))
                );
            }
            s.ran += 1;
        } else {
            s.unchanged += 1;
        }
    }
    Ok(s)
}

fn disfigure(ctx: &BuildContext) -> anyhow::Result<Summary> {
    let path = ctx.out_root.join(manifest::CONFIG_JSON);
    if ctx.dry_run {
        let ran = usize::from(path.exists());
        if ran == 1 {
            println!("rm {}", ctx.diag_path(&path));
        }
        return Ok(Summary {
            ran,
            ..Summary::default()
        });
    }
    let removed = manifest::remove_config(ctx)?;
    if removed && ctx.verbosity >= 1 {
        println!("rm {}", ctx.diag_path(&path));
    }
    Ok(Summary {
        ran: usize::from(removed),
        ..Summary::default()
    })
}

fn perform_inner(ctx: &BuildContext, a: Action, roots: &[Arc<Target>]) -> anyhow::Result<Summary> {
    debug!("{} over {} root target(s)", a, roots.len());

    // Plan: match and apply each root. A root that fails to plan is
    // recorded as failed; independent roots still proceed.
    let mut failed = 0usize;
    let mut runnable: Vec<Arc<Target>> = Vec::new();
    for t in roots {
        match sched::match_and_apply(ctx, a, t) {
            Ok(()) => runnable.push(Arc::clone(t)),
            Err(e) => {
                eprintln!("{}: {:#}", "error".red().bold(), e);
                failed += 1;
            }
        }
    }

    // Execute: offer roots to the queue and join them, with extra workers
    // stealing whatever becomes available.
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        for _ in 1..ctx.jobs.max(1) {
            s.spawn(|| worker_loop(ctx, &stop));
        }
        for t in &runnable {
            ctx.sched.enqueue(a, Arc::clone(t));
        }
        for t in &runnable {
            if let Err(e) = sched::execute_direct(ctx, a, t) {
                eprintln!("{}: {:#}", "error".red().bold(), e);
            }
        }
        stop.store(true, Ordering::SeqCst);
    });

    // Tally over everything this action touched.
    let mut summary = Summary {
        ran: 0,
        unchanged: 0,
        failed,
    };
    for t in ctx.targets.all() {
        if t.matched_action() != Some(a) {
            continue;
        }
        match t.try_state() {
            Some(TargetState::Changed) => summary.ran += 1,
            Some(TargetState::Unchanged) => summary.unchanged += 1,
            Some(TargetState::Failed) => summary.failed += 1,
            None => {}
        }
    }
    Ok(summary)
}
