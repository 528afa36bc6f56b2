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

//! Scopes and variable lookup.
//!
//! The core only needs a thin interface here: `find_original` walking the
//! parent chain, `assign`, and `append`. Scopes map directories (out and src
//! paths) to variable maps; the deepest scope containing a directory is its
//! base scope.

use std::path::{Path, PathBuf};

use anyhow::bail;
use indexmap::IndexMap;
use parking_lot::RwLock;

/// A typed variable value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    String(String),
    Strings(Vec<String>),
    Path(PathBuf),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<PathBuf> {
        match self {
            Value::Path(p) => Some(p.clone()),
            Value::String(s) => Some(PathBuf::from(s)),
            _ => None,
        }
    }

    /// View the value as a list of words. A scalar string is a one-element
    /// list; anything else is an error at the call site.
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            Value::Strings(v) => v.clone(),
            Value::String(s) => vec![s.clone()],
            Value::Path(p) => vec![p.display().to_string()],
            Value::Bool(b) => vec![b.to_string()],
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Strings(v) => serde_json::Value::Array(
                v.iter()
                    .map(|s| serde_json::Value::String(s.clone()))
                    .collect(),
            ),
            Value::Path(p) => serde_json::Value::String(p.display().to_string()),
        }
    }

    pub fn from_json(v: &serde_json::Value) -> anyhow::Result<Value> {
        match v {
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for it in items {
                    match it {
                        serde_json::Value::String(s) => out.push(s.clone()),
                        _ => bail!("variable list elements must be strings"),
                    }
                }
                Ok(Value::Strings(out))
            }
            _ => bail!("unsupported variable value `{}`", v),
        }
    }
}

/// An ordered variable map. Order is observable (options are passed to
/// tools in assignment order), hence the index map.
#[derive(Default, Debug)]
pub struct VarMap {
    map: IndexMap<String, Value>,
}

impl VarMap {
    pub fn new() -> VarMap {
        VarMap::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.map.iter()
    }

    pub fn assign(&mut self, name: &str, value: Value) {
        self.map.insert(name.to_string(), value);
    }

    /// Append to a list value, converting a scalar into a list first.
    pub fn append(&mut self, name: &str, value: Value) {
        match self.map.get_mut(name) {
            None => self.assign(name, value),
            Some(existing) => {
                let mut words = existing.to_strings();
                words.extend(value.to_strings());
                *existing = Value::Strings(words);
            }
        }
    }

    /// Prepend to a list value.
    pub fn prepend(&mut self, name: &str, value: Value) {
        match self.map.get_mut(name) {
            None => self.assign(name, value),
            Some(existing) => {
                let mut words = value.to_strings();
                words.extend(existing.to_strings());
                *existing = Value::Strings(words);
            }
        }
    }
}

pub type ScopeId = usize;

pub struct ScopeData {
    pub parent: Option<ScopeId>,
    pub out_path: PathBuf,
    pub src_path: PathBuf,
    /// A root scope delimits a project; lookups for project-level
    /// configuration (`cc.path` and friends) land here.
    pub root: bool,
    vars: RwLock<VarMap>,
}

/// The scope tree. Created up front (single-threaded), then shared
/// read-only across workers; only the variable maps stay mutable.
pub struct ScopeTree {
    scopes: Vec<ScopeData>,
}

impl ScopeTree {
    pub fn new() -> ScopeTree {
        ScopeTree { scopes: Vec::new() }
    }

    pub fn create(
        &mut self,
        parent: Option<ScopeId>,
        out_path: PathBuf,
        src_path: PathBuf,
        root: bool,
    ) -> ScopeId {
        self.scopes.push(ScopeData {
            parent,
            out_path,
            src_path,
            root,
            vars: RwLock::new(VarMap::new()),
        });
        self.scopes.len() - 1
    }

    pub fn get(&self, id: ScopeId) -> &ScopeData {
        &self.scopes[id]
    }

    /// The deepest scope whose out or src path contains `dir`.
    pub fn find(&self, dir: &Path) -> Option<ScopeId> {
        let mut best: Option<(ScopeId, usize)> = None;
        for (id, s) in self.scopes.iter().enumerate() {
            for base in [&s.out_path, &s.src_path] {
                if dir.starts_with(base) {
                    let depth = base.components().count();
                    if best.map_or(true, |(_, d)| depth >= d) {
                        best = Some((id, depth));
                    }
                }
            }
        }
        best.map(|(id, _)| id)
    }

    /// The enclosing root (project) scope.
    pub fn root_of(&self, mut id: ScopeId) -> ScopeId {
        loop {
            if self.scopes[id].root {
                return id;
            }
            match self.scopes[id].parent {
                Some(p) => id = p,
                None => return id,
            }
        }
    }

    /// Look a variable up along the parent chain, returning the first
    /// (innermost) definition.
    pub fn find_original(&self, id: ScopeId, name: &str) -> Option<Value> {
        let mut cur = Some(id);
        while let Some(s) = cur {
            if let Some(v) = self.scopes[s].vars.read().get(name) {
                return Some(v.clone());
            }
            cur = self.scopes[s].parent;
        }
        None
    }

    pub fn assign(&self, id: ScopeId, name: &str, value: Value) {
        self.scopes[id].vars.write().assign(name, value);
    }

    pub fn append(&self, id: ScopeId, name: &str, value: Value) {
        self.scopes[id].vars.write().append(name, value);
    }

    /// Copy out this scope's own variables whose names carry the given
    /// prefix, in assignment order. Used to persist configuration.
    pub fn snapshot(&self, id: ScopeId, prefix: &str) -> Vec<(String, Value)> {
        self.scopes[id]
            .vars
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_lookup() {
        let mut tree = ScopeTree::new();
        let root = tree.create(None, "/p/out".into(), "/p".into(), true);
        let sub = tree.create(Some(root), "/p/out/sub".into(), "/p/sub".into(), false);

        tree.assign(root, "cc.std", Value::String("c++17".into()));
        assert_eq!(
            tree.find_original(sub, "cc.std"),
            Some(Value::String("c++17".into()))
        );

        // The inner definition shadows the outer one.
        tree.assign(sub, "cc.std", Value::String("c++20".into()));
        assert_eq!(
            tree.find_original(sub, "cc.std"),
            Some(Value::String("c++20".into()))
        );
        assert_eq!(
            tree.find_original(root, "cc.std"),
            Some(Value::String("c++17".into()))
        );
    }

    #[test]
    fn find_picks_deepest() {
        let mut tree = ScopeTree::new();
        let root = tree.create(None, "/p/out".into(), "/p".into(), true);
        let sub = tree.create(Some(root), "/p/out/sub".into(), "/p/sub".into(), false);

        assert_eq!(tree.find(Path::new("/p/out/sub/x")), Some(sub));
        assert_eq!(tree.find(Path::new("/p/out/other")), Some(root));
        assert_eq!(tree.find(Path::new("/p/sub/file.cxx")), Some(sub));
        assert_eq!(tree.find(Path::new("/elsewhere")), None);
        assert_eq!(tree.root_of(sub), root);
    }

    #[test]
    fn snapshot_filters_by_prefix() {
        let mut tree = ScopeTree::new();
        let root = tree.create(None, "/p/out".into(), "/p".into(), true);
        tree.assign(root, "cc.path", Value::String("/usr/bin/cc".into()));
        tree.assign(root, "cc.std", Value::String("c++17".into()));
        tree.assign(root, "other", Value::Bool(true));

        let snap = tree.snapshot(root, "cc.");
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].0, "cc.path");
        assert_eq!(snap[1].0, "cc.std");
    }

    #[test]
    fn json_round_trip() {
        let v = Value::Strings(vec!["-I".into(), "dir".into()]);
        assert_eq!(Value::from_json(&v.to_json()).unwrap(), v);
        let v = Value::String("c++17".into());
        assert_eq!(Value::from_json(&v.to_json()).unwrap(), v);
    }

    #[test]
    fn append_converts_scalars() {
        let mut m = VarMap::new();
        m.assign("opts", Value::String("-O2".into()));
        m.append("opts", Value::Strings(vec!["-DX".into()]));
        assert_eq!(
            m.get("opts").unwrap().to_strings(),
            vec!["-O2".to_string(), "-DX".to_string()]
        );

        m.prepend("opts", Value::String("-g".into()));
        assert_eq!(
            m.get("opts").unwrap().to_strings(),
            vec!["-g".to_string(), "-O2".into(), "-DX".into()]
        );
    }
}
