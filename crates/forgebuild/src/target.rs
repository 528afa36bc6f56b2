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

//! Targets, target keys, and the target set.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::ThreadId;

use anyhow::{bail, Context as _};
use parking_lot::{Condvar, Mutex, RwLock};

use forgeutil::path;
use forgeutil::timestamp::{self, Timestamp};

use crate::action::Action;
use crate::context::BuildContext;
use crate::extension::{ExtState, ExtensionPool};
use crate::recipe::Recipe;
use crate::scope::VarMap;
use crate::types::{TargetType, TypePtr, C, CXX, FILE, H, HXX, IXX, TESTSCRIPT, TXX};

/// The state a target's traversal is in for the current action. Transitions
/// are monotonic: once a final state (unchanged, changed, failed) has been
/// observed it stays, with the single exception of unchanged becoming
/// changed when an `execute_direct` actually performed work.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RawState {
    Unknown,
    Postponed,
    Unchanged,
    Changed,
    Failed,
    Group,
}

impl RawState {
    pub fn is_final(self) -> bool {
        matches!(self, RawState::Unchanged | RawState::Changed | RawState::Failed)
    }
}

/// The result of running a recipe.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TargetState {
    Unchanged,
    Changed,
    Failed,
}

impl From<TargetState> for RawState {
    fn from(s: TargetState) -> RawState {
        match s {
            TargetState::Unchanged => RawState::Unchanged,
            TargetState::Changed => RawState::Changed,
            TargetState::Failed => RawState::Failed,
        }
    }
}

/// Per-action mutable state, serialized behind one lock. At most one worker
/// holds the right to run match/apply/execute on a target at a time; others
/// join on the condvar and observe the final state.
pub(crate) struct BuildData {
    pub action: Option<Action>,
    pub recipe: Option<Recipe>,
    pub state: RawState,
    pub busy: bool,
    pub owner: Option<ThreadId>,
    pub prerequisite_targets: Vec<Arc<Target>>,
    pub dependents: usize,
}

impl BuildData {
    fn new() -> BuildData {
        BuildData {
            action: None,
            recipe: None,
            state: RawState::Unknown,
            busy: false,
            owner: None,
            prerequisite_targets: Vec::new(),
            dependents: 0,
        }
    }
}

/// A node in the build graph, uniquely identified by
/// `(type, dir, out, name, ext)` and owned by the target set.
pub struct Target {
    pub ty: &'static TargetType,
    /// The out-tree directory of the target.
    pub dir: PathBuf,
    /// Non-empty only when the target is sourced from a distinct src tree,
    /// keeping same-named src- and out-track targets distinct.
    pub out: PathBuf,
    pub name: String,
    ext: RwLock<ExtState>,
    pub vars: RwLock<VarMap>,
    /// Declared prerequisite references; resolved pointers land in
    /// `prerequisite_targets` during apply.
    pub prerequisites: RwLock<Vec<Prerequisite>>,
    pub(crate) build: Mutex<BuildData>,
    pub(crate) done: Condvar,
    path: Mutex<Option<PathBuf>>,
    mtime: Mutex<Timestamp>,
}

impl Target {
    pub fn new(
        ty: &'static TargetType,
        dir: PathBuf,
        out: PathBuf,
        name: String,
        ext: ExtState,
    ) -> Target {
        Target {
            ty,
            dir,
            out,
            name,
            ext: RwLock::new(ext),
            vars: RwLock::new(VarMap::new()),
            prerequisites: RwLock::new(Vec::new()),
            build: Mutex::new(BuildData::new()),
            done: Condvar::new(),
            path: Mutex::new(None),
            mtime: Mutex::new(Timestamp::Unknown),
        }
    }

    pub fn ext(&self) -> ExtState {
        *self.ext.read()
    }

    pub fn is_a(&self, tt: &'static TargetType) -> bool {
        self.ty.is_a(tt)
    }

    /// Upgrade an undecided extension; a conflicting decided one is an
    /// identity error.
    pub(crate) fn reconcile_ext(&self, ext: ExtState) -> anyhow::Result<()> {
        let e = match ext {
            ExtState::Unknown => return Ok(()),
            ExtState::Decided(e) => e,
        };
        let mut cur = self.ext.write();
        match *cur {
            ExtState::Unknown => {
                *cur = ExtState::Decided(e);
                Ok(())
            }
            ExtState::Decided(c) if c == e => Ok(()),
            ExtState::Decided(c) => {
                bail!(
                    "conflicting extensions `{}` and `{}` for target {}{{{}}}",
                    c,
                    e,
                    self.ty.name,
                    self.name
                )
            }
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().clone()
    }

    /// Derive the target's filesystem path from its key, deciding the
    /// extension in the process. Deriving again with the same result is a
    /// no-op; a different result is a hard error.
    pub fn derive_path(
        &self,
        pool: &ExtensionPool,
        default_ext: Option<&str>,
    ) -> anyhow::Result<PathBuf> {
        let p = if self.ty.dir_based {
            self.dir.clone()
        } else {
            let ext = match self.ext() {
                ExtState::Decided(e) => e,
                ExtState::Unknown => {
                    let e = pool.intern(default_ext.or(self.ty.default_ext).unwrap_or(""));
                    self.reconcile_ext(ExtState::Decided(e))?;
                    e
                }
            };
            if ext.is_empty() {
                self.dir.join(&self.name)
            } else {
                self.dir.join(format!("{}.{}", self.name, ext.as_str()))
            }
        };
        self.assign_path(p.clone())?;
        Ok(p)
    }

    /// Assign an externally computed path (e.g. a discovered header's
    /// realized location), with the same at-most-once semantics.
    pub fn assign_path(&self, p: PathBuf) -> anyhow::Result<()> {
        let mut cur = self.path.lock();
        match &*cur {
            None => {
                *cur = Some(p);
                Ok(())
            }
            Some(existing) if *existing == p => Ok(()),
            Some(existing) => bail!(
                "conflicting paths `{}` and `{}` for target {}",
                existing.display(),
                p.display(),
                self
            ),
        }
    }

    pub fn mtime(&self) -> Timestamp {
        *self.mtime.lock()
    }

    pub fn set_mtime(&self, ts: Timestamp) {
        *self.mtime.lock() = ts;
    }

    /// The cached modification time, loading it from the filesystem on
    /// first use. Requires the path to have been derived.
    pub fn load_mtime(&self) -> anyhow::Result<Timestamp> {
        let mut mt = self.mtime.lock();
        if mt.is_unknown() {
            let p = self
                .path()
                .with_context(|| format!("no path derived for target {}", self))?;
            *mt = timestamp::mtime(&p)
                .with_context(|| format!("unable to stat {}", p.display()))?;
        }
        Ok(*mt)
    }

    /// The final state for the current action, if execution has finished.
    pub fn try_state(&self) -> Option<TargetState> {
        let b = self.build.lock();
        match b.state {
            RawState::Unchanged => Some(TargetState::Unchanged),
            RawState::Changed => Some(TargetState::Changed),
            RawState::Failed => Some(TargetState::Failed),
            _ => None,
        }
    }

    pub fn matched_action(&self) -> Option<Action> {
        self.build.lock().action
    }

    pub fn prerequisite_targets(&self) -> Vec<Arc<Target>> {
        self.build.lock().prerequisite_targets.clone()
    }

    pub(crate) fn push_prerequisite_target(&self, t: Arc<Target>) {
        self.build.lock().prerequisite_targets.push(t);
    }

    pub(crate) fn reset_build_state(&self) {
        let mut b = self.build.lock();
        b.action = None;
        b.recipe = None;
        b.state = RawState::Unknown;
        b.busy = false;
        b.owner = None;
        b.prerequisite_targets.clear();
        b.dependents = 0;
        *self.mtime.lock() = Timestamp::Unknown;
    }

    /// The textual form `[dir/]type{name[.ext]}[@out]`. Verbosity governs
    /// the extension: 0 hides it, 1 shows it when decided and non-empty,
    /// 2 shows `?` for undecided and `.` for the empty extension.
    pub fn format(&self, verbosity: u8) -> String {
        let mut s = String::new();
        if self.ty.dir_based {
            s.push_str(self.ty.name);
            s.push('{');
            s.push_str(&self.dir.display().to_string());
            s.push('}');
        } else {
            let dir = self.dir.display().to_string();
            if !dir.is_empty() {
                s.push_str(&dir);
                if !dir.ends_with('/') {
                    s.push('/');
                }
            }
            s.push_str(self.ty.name);
            s.push('{');
            s.push_str(&self.name);
            match (verbosity, self.ext()) {
                (0, _) => {}
                (1, ExtState::Decided(e)) if !e.is_empty() => {
                    s.push('.');
                    s.push_str(e.as_str());
                }
                (1, _) => {}
                (_, ExtState::Unknown) => s.push_str(".?"),
                (_, ExtState::Decided(e)) => {
                    s.push('.');
                    s.push_str(e.as_str());
                }
            }
            s.push('}');
        }
        if !self.out.as_os_str().is_empty() {
            s.push('@');
            s.push_str(&self.out.display().to_string());
        }
        s
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(1))
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.format(2))
    }
}

/// A declarative dependency reference: resolved to a target by `search`.
#[derive(Clone, Debug)]
pub struct Prerequisite {
    pub ty: &'static TargetType,
    pub dir: PathBuf,
    pub out: PathBuf,
    pub name: String,
    pub ext: ExtState,
}

impl Prerequisite {
    /// Parse the textual form `[dir/]type{name[.ext]}[@out]`, or a bare
    /// file name whose type is inferred from its extension.
    pub fn parse(
        types: &crate::types::TypeRegistry,
        pool: &ExtensionPool,
        spec: &str,
    ) -> anyhow::Result<Prerequisite> {
        let (spec, out) = match spec.rsplit_once('@') {
            Some((s, o)) => (s, PathBuf::from(o)),
            None => (spec, PathBuf::new()),
        };

        if let Some(open) = spec.find('{') {
            if !spec.ends_with('}') {
                bail!("invalid target name `{}`: missing `}}`", spec);
            }
            let head = &spec[..open];
            let inner = &spec[open + 1..spec.len() - 1];
            if inner.is_empty() {
                bail!("invalid target name `{}`: empty name", spec);
            }

            let (dir_prefix, ty_name) = match head.rsplit_once('/') {
                Some((d, t)) => (PathBuf::from(d), t),
                None => (PathBuf::new(), head),
            };
            let ty = types
                .find(ty_name)
                .with_context(|| format!("unknown target type `{}`", ty_name))?;

            let inner_path = Path::new(inner);
            let inner_dir = inner_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default();
            let leaf = inner_path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("invalid target name `{}`", spec))?;

            // The trailing-dot form pins the empty extension; no dot at all
            // leaves the extension undecided.
            let (name, ext) = match leaf.rsplit_once('.') {
                Some((base, "")) if !base.is_empty() => {
                    (base.to_string(), ExtState::Decided(pool.intern("")))
                }
                Some((base, e)) if !base.is_empty() => {
                    (base.to_string(), ExtState::Decided(pool.intern(e)))
                }
                _ => (leaf.to_string(), ExtState::Unknown),
            };

            Ok(Prerequisite {
                ty,
                dir: path::normalize(&dir_prefix.join(inner_dir)),
                out,
                name,
                ext,
            })
        } else {
            // A bare file name. Infer the type from the extension.
            let (dir, name, ext) = path::split_name(Path::new(spec))?;
            let candidates: [&'static TargetType; 7] =
                [&C, &CXX, &H, &HXX, &IXX, &TXX, &TESTSCRIPT];
            let ty = candidates
                .into_iter()
                .find(|tt| tt.default_ext == Some(ext.as_str()))
                .unwrap_or(&FILE);
            Ok(Prerequisite {
                ty,
                dir: path::normalize(&dir),
                out,
                name,
                ext: ExtState::Decided(pool.intern(&ext)),
            })
        }
    }

    /// Resolve the reference to a target in the set, creating it on first
    /// lookup. A relative directory resolves to the src tree when a file
    /// with the expected name exists there, and to the out tree otherwise.
    pub fn search(&self, ctx: &BuildContext) -> anyhow::Result<Arc<Target>> {
        let dir = if self.dir.is_absolute() {
            path::normalize(&self.dir)
        } else {
            let src_cand = path::absolute(&self.dir, &ctx.src_root);
            if src_cand.join(self.file_name()).exists() {
                src_cand
            } else {
                path::absolute(&self.dir, &ctx.out_root)
            }
        };
        let (t, _) = ctx.targets.insert(
            self.ty,
            dir,
            self.out.clone(),
            self.name.clone(),
            self.ext,
        )?;
        Ok(t)
    }

    fn file_name(&self) -> String {
        let ext = self
            .ext
            .decided()
            .map(|e| e.as_str().to_string())
            .or_else(|| self.ty.default_ext.map(str::to_string))
            .unwrap_or_default();
        if ext.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, ext)
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct SetKey {
    ty: TypePtr,
    dir: PathBuf,
    out: PathBuf,
    name: String,
}

/// The shared registry of targets. Insertion is idempotent: two inserts
/// with equal keys return the same target.
pub struct TargetSet {
    map: RwLock<HashMap<SetKey, Arc<Target>>>,
}

impl TargetSet {
    pub fn new() -> TargetSet {
        TargetSet {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(
        &self,
        ty: &'static TargetType,
        dir: PathBuf,
        out: PathBuf,
        name: String,
        ext: ExtState,
    ) -> anyhow::Result<(Arc<Target>, bool)> {
        let key = SetKey {
            ty: TypePtr(ty),
            dir: dir.clone(),
            out: out.clone(),
            name: name.clone(),
        };
        if let Some(t) = self.map.read().get(&key) {
            t.reconcile_ext(ext)?;
            return Ok((Arc::clone(t), false));
        }
        let mut map = self.map.write();
        if let Some(t) = map.get(&key) {
            t.reconcile_ext(ext)?;
            return Ok((Arc::clone(t), false));
        }
        let t = Arc::new((ty.factory)(ty, dir, out, name, ext));
        map.insert(key, Arc::clone(&t));
        Ok((t, true))
    }

    /// Look a target up without inserting, opportunistically upgrading an
    /// undecided extension when the caller supplies a more specific one.
    pub fn find(
        &self,
        ty: &'static TargetType,
        dir: &Path,
        out: &Path,
        name: &str,
        ext: ExtState,
    ) -> Option<Arc<Target>> {
        let key = SetKey {
            ty: TypePtr(ty),
            dir: dir.to_path_buf(),
            out: out.to_path_buf(),
            name: name.to_string(),
        };
        let t = self.map.read().get(&key).cloned()?;
        if t.ext().is_unknown() {
            let _ = t.reconcile_ext(ext);
        }
        Some(t)
    }

    pub fn all(&self) -> Vec<Arc<Target>> {
        self.map.read().values().cloned().collect()
    }

    /// Reset per-action state on every target. Recipes, resolved
    /// prerequisites, and cached mtimes do not survive between operations.
    pub fn reset(&self) {
        for t in self.map.read().values() {
            t.reset_build_state();
        }
    }
}

impl Default for TargetSet {
    fn default() -> Self {
        Self::new()
    }
}
