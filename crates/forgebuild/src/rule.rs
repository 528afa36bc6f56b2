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

//! Rules: the match/apply pair registered against (target type, operation).
//!
//! `matches` is the cheap can-I-handle-this test; `apply` is the planning
//! step that resolves prerequisites, touches the filesystem where needed,
//! and picks the execution-time recipe.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::debug;

use forgeutil::path;

use crate::action::{Action, Op, PERFORM_CLEAN, PERFORM_UPDATE};
use crate::context::BuildContext;
use crate::recipe::Recipe;
use crate::sched;
use crate::target::{Target, TargetState};
use crate::types::{TargetType, TypePtr, ALIAS, EXE, FILE, FSDIR, LIB, OBJ, PATH_TARGET, TARGET};

/// What `matches` hands to `apply`: for source-driven rules, the
/// prerequisite that decided the match.
pub struct Match {
    pub source: Option<Arc<Target>>,
}

impl Match {
    pub fn plain() -> Match {
        Match { source: None }
    }

    pub fn with_source(source: Arc<Target>) -> Match {
        Match {
            source: Some(source),
        }
    }
}

pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(
        &self,
        ctx: &BuildContext,
        a: Action,
        t: &Arc<Target>,
    ) -> anyhow::Result<Option<Match>>;

    fn apply(
        &self,
        ctx: &BuildContext,
        a: Action,
        t: &Arc<Target>,
        m: &Match,
    ) -> anyhow::Result<Recipe>;
}

/// Rules registered per (target type, operation). Lookup walks the target's
/// base chain, most-derived type first, preserving registration order
/// within a type.
pub struct RuleMap {
    rules: HashMap<(TypePtr, Op), Vec<Arc<dyn Rule>>>,
}

impl RuleMap {
    pub fn new() -> RuleMap {
        RuleMap {
            rules: HashMap::new(),
        }
    }

    pub fn insert(&mut self, ty: &'static TargetType, op: Op, rule: Arc<dyn Rule>) {
        self.rules.entry((TypePtr(ty), op)).or_default().push(rule);
    }

    pub fn candidates(&self, ty: &'static TargetType, op: Op) -> Vec<Arc<dyn Rule>> {
        let mut out = Vec::new();
        let mut cur = Some(ty);
        while let Some(t) = cur {
            if let Some(v) = self.rules.get(&(TypePtr(t), op)) {
                out.extend(v.iter().cloned());
            }
            cur = t.base;
        }
        out
    }
}

impl Default for RuleMap {
    fn default() -> Self {
        Self::new()
    }
}

/// The builtin rule registrations.
pub fn builtin_rules() -> RuleMap {
    let mut m = RuleMap::new();

    let fsdir = Arc::new(FsdirRule);
    m.insert(&FSDIR, Op::Update, fsdir.clone());
    m.insert(&FSDIR, Op::Clean, fsdir);

    let alias = Arc::new(AliasRule);
    m.insert(&ALIAS, Op::Update, alias.clone());
    m.insert(&ALIAS, Op::Clean, alias.clone());
    m.insert(&ALIAS, Op::Test, alias);

    let compile = Arc::new(crate::cc::CompileRule);
    m.insert(&OBJ, Op::Update, compile.clone());
    m.insert(&OBJ, Op::Clean, compile);

    let link = Arc::new(crate::cc::link::LinkRule);
    m.insert(&EXE, Op::Update, link.clone());
    m.insert(&EXE, Op::Clean, link);

    let lib = Arc::new(LibRule);
    m.insert(&LIB, Op::Update, lib.clone());
    m.insert(&LIB, Op::Clean, lib);

    let adhoc = Arc::new(crate::adhoc::AdhocRule);
    m.insert(&FILE, Op::Update, adhoc.clone());
    m.insert(&FILE, Op::Clean, adhoc);

    // Fallback: an existing file with no producing rule is its own proof of
    // up-to-dateness.
    let file = Arc::new(FileRule);
    m.insert(&PATH_TARGET, Op::Update, file.clone());
    m.insert(&PATH_TARGET, Op::Clean, file);

    m.insert(&TARGET, Op::Test, Arc::new(crate::runtest::TestRule));

    m
}

/// The fallback rule for existing files. Returning a noop recipe keeps the
/// cached-header walk O(#headers) in syscalls: for an up-to-date file the
/// scheduler never has to do more than observe the unchanged state.
pub struct FileRule;

impl Rule for FileRule {
    fn name(&self) -> &'static str {
        "file"
    }

    fn matches(
        &self,
        ctx: &BuildContext,
        _a: Action,
        t: &Arc<Target>,
    ) -> anyhow::Result<Option<Match>> {
        if !t.is_a(&PATH_TARGET) {
            return Ok(None);
        }
        t.derive_path(&ctx.exts, None)?;
        if t.load_mtime()?.exists() {
            Ok(Some(Match::plain()))
        } else {
            debug!("file rule: {} does not exist", t);
            Ok(None)
        }
    }

    fn apply(
        &self,
        _ctx: &BuildContext,
        _a: Action,
        _t: &Arc<Target>,
        _m: &Match,
    ) -> anyhow::Result<Recipe> {
        Ok(Recipe::Noop)
    }
}

/// Creates output directories on update and prunes empty ones on clean.
pub struct FsdirRule;

impl Rule for FsdirRule {
    fn name(&self) -> &'static str {
        "fsdir"
    }

    fn matches(
        &self,
        _ctx: &BuildContext,
        _a: Action,
        t: &Arc<Target>,
    ) -> anyhow::Result<Option<Match>> {
        Ok(t.is_a(&FSDIR).then(Match::plain))
    }

    fn apply(
        &self,
        ctx: &BuildContext,
        a: Action,
        t: &Arc<Target>,
        _m: &Match,
    ) -> anyhow::Result<Recipe> {
        t.derive_path(&ctx.exts, None)?;
        if a == PERFORM_UPDATE {
            Ok(Recipe::exec(perform_mkdir))
        } else if a == PERFORM_CLEAN {
            Ok(Recipe::exec(perform_rmdir))
        } else {
            Ok(Recipe::Noop)
        }
    }
}

fn perform_mkdir(
    ctx: &BuildContext,
    _a: Action,
    t: &Arc<Target>,
) -> anyhow::Result<TargetState> {
    let dir = t.path().expect("fsdir path derived in apply");
    if dir.is_dir() {
        return Ok(TargetState::Unchanged);
    }
    if ctx.verbosity >= 1 || ctx.dry_run {
        println!("mkdir {}", ctx.diag_path(&dir));
    }
    if ctx.dry_run {
        return Ok(TargetState::Changed);
    }
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("unable to create directory {}", dir.display()))?;
    Ok(TargetState::Changed)
}

fn perform_rmdir(
    ctx: &BuildContext,
    _a: Action,
    t: &Arc<Target>,
) -> anyhow::Result<TargetState> {
    let dir = t.path().expect("fsdir path derived in apply");
    // Only remove directories we are responsible for.
    if !path::sub(&dir, &ctx.out_root) || !dir.is_dir() {
        return Ok(TargetState::Unchanged);
    }
    if ctx.dry_run {
        println!("rmdir {}", ctx.diag_path(&dir));
        return Ok(TargetState::Changed);
    }
    match std::fs::remove_dir(&dir) {
        Ok(()) => {
            if ctx.verbosity >= 1 {
                println!("rmdir {}", ctx.diag_path(&dir));
            }
            Ok(TargetState::Changed)
        }
        // A non-empty directory still holds files we did not make.
        Err(e) if e.raw_os_error() == Some(39) || e.raw_os_error() == Some(66) => {
            Ok(TargetState::Unchanged)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TargetState::Unchanged),
        Err(e) => {
            Err(e).with_context(|| format!("unable to remove directory {}", dir.display()))
        }
    }
}

/// Delegates to the prerequisites: an alias is up to date exactly when all
/// of its members are.
pub struct AliasRule;

impl Rule for AliasRule {
    fn name(&self) -> &'static str {
        "alias"
    }

    fn matches(
        &self,
        _ctx: &BuildContext,
        _a: Action,
        t: &Arc<Target>,
    ) -> anyhow::Result<Option<Match>> {
        Ok(t.is_a(&ALIAS).then(Match::plain))
    }

    fn apply(
        &self,
        ctx: &BuildContext,
        a: Action,
        t: &Arc<Target>,
        _m: &Match,
    ) -> anyhow::Result<Recipe> {
        for p in t.prerequisites.read().iter() {
            let pt = p.search(ctx)?;
            // When cleaning, targets outside our out-tree are not ours to
            // delete.
            if a.op == Op::Clean && !path::sub(&pt.dir, &ctx.out_root) {
                continue;
            }
            sched::match_and_apply(ctx, a, &pt)?;
            t.push_prerequisite_target(pt);
        }
        Ok(Recipe::Default)
    }
}

/// Imported libraries: the file must already exist; what matters is the
/// meta-information riding on the target (`cc.export.poptions`) and the
/// transitive library prerequisites, which apply resolves so dependents can
/// harvest them without sequencing the library before themselves.
pub struct LibRule;

impl Rule for LibRule {
    fn name(&self) -> &'static str {
        "lib"
    }

    fn matches(
        &self,
        _ctx: &BuildContext,
        _a: Action,
        t: &Arc<Target>,
    ) -> anyhow::Result<Option<Match>> {
        Ok(t.is_a(&LIB).then(Match::plain))
    }

    fn apply(
        &self,
        ctx: &BuildContext,
        a: Action,
        t: &Arc<Target>,
        _m: &Match,
    ) -> anyhow::Result<Recipe> {
        t.derive_path(&ctx.exts, None)?;
        for p in t.prerequisites.read().iter() {
            let pt = p.search(ctx)?;
            if pt.is_a(&LIB) {
                sched::match_and_apply(ctx, a, &pt)?;
                t.push_prerequisite_target(pt);
            }
        }
        Ok(Recipe::Noop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedRule(&'static str, bool);

    impl Rule for NamedRule {
        fn name(&self) -> &'static str {
            self.0
        }
        fn matches(
            &self,
            _ctx: &BuildContext,
            _a: Action,
            _t: &Arc<Target>,
        ) -> anyhow::Result<Option<Match>> {
            Ok(self.1.then(Match::plain))
        }
        fn apply(
            &self,
            _ctx: &BuildContext,
            _a: Action,
            _t: &Arc<Target>,
            _m: &Match,
        ) -> anyhow::Result<Recipe> {
            Ok(Recipe::Noop)
        }
    }

    #[test]
    fn candidates_walk_base_chain_most_derived_first() {
        let mut m = RuleMap::new();
        m.insert(&FILE, Op::Update, Arc::new(NamedRule("file-level", true)));
        m.insert(&OBJ, Op::Update, Arc::new(NamedRule("obj-level", true)));
        m.insert(&OBJ, Op::Update, Arc::new(NamedRule("obj-second", true)));

        let names: Vec<&str> = m
            .candidates(&crate::types::OBJS, Op::Update)
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(names, vec!["obj-level", "obj-second", "file-level"]);
    }
}
