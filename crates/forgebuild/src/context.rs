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

//! The build context: every piece of shared state, threaded explicitly
//! through match/apply/execute instead of living in process-wide globals.

use std::path::{Path, PathBuf};

use crate::extension::ExtensionPool;
use crate::rule::RuleMap;
use crate::sched::Scheduler;
use crate::scope::{ScopeId, ScopeTree, Value};
use crate::target::{Target, TargetSet};
use crate::types::TypeRegistry;

pub struct BuildContext {
    pub targets: TargetSet,
    pub exts: ExtensionPool,
    pub types: TypeRegistry,
    pub rules: RuleMap,
    pub scopes: ScopeTree,
    pub root_scope: ScopeId,
    pub src_root: PathBuf,
    pub out_root: PathBuf,
    pub sched: Scheduler,
    pub verbosity: u8,
    pub dry_run: bool,
    pub jobs: usize,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

impl BuildContext {
    pub fn new(src_root: PathBuf, out_root: PathBuf) -> BuildContext {
        let mut scopes = ScopeTree::new();
        let root_scope = scopes.create(None, out_root.clone(), src_root.clone(), true);
        BuildContext {
            targets: TargetSet::new(),
            exts: ExtensionPool::new(),
            types: TypeRegistry::builtin(),
            rules: crate::rule::builtin_rules(),
            scopes,
            root_scope,
            src_root,
            out_root,
            sched: Scheduler::new(),
            verbosity: 1,
            dry_run: false,
            jobs: default_parallelism(),
        }
    }

    /// The scope a target's directory falls into.
    pub fn base_scope(&self, t: &Target) -> ScopeId {
        self.scopes.find(&t.dir).unwrap_or(self.root_scope)
    }

    /// Variable lookup: the target's own map first, then its scope chain.
    pub fn lookup(&self, t: &Target, name: &str) -> Option<Value> {
        if let Some(v) = t.vars.read().get(name) {
            return Some(v.clone());
        }
        self.scopes.find_original(self.base_scope(t), name)
    }

    /// A project-level (root scope) variable.
    pub fn root_var(&self, name: &str) -> Option<Value> {
        self.scopes.find_original(self.root_scope, name)
    }

    /// Render a path for diagnostics, relative to the project where
    /// possible.
    pub fn diag_path(&self, p: &Path) -> String {
        for base in [&self.out_root, &self.src_root] {
            if let Some(parent) = base.parent() {
                if let Ok(rel) = p.strip_prefix(parent) {
                    return rel.display().to_string();
                }
            }
        }
        p.display().to_string()
    }
}
