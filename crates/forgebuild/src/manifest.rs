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

//! The declarative build description: `forge.json`.
//!
//! A project declares its targets (in the textual key form), their
//! prerequisites, and scoped variables. The surface syntax is
//! deliberately plain JSON; the interesting machinery starts once the
//! declarations are resolved into the target set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use indexmap::IndexMap;
use petgraph::graph::DiGraph;
use serde::Deserialize;
use tracing::debug;

use forgeutil::path;

use crate::context::BuildContext;
use crate::scope::Value;
use crate::target::{Prerequisite, Target};

pub const FORGE_JSON: &str = "forge.json";

/// Where a configure run pins the derived configuration in the out tree.
pub const CONFIG_JSON: &str = "config.json";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub vars: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    pub targets: Vec<TargetDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetDecl {
    /// The target in textual key form, e.g. `exe{hello}` or
    /// `gen/hxx{config}`.
    pub name: String,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub vars: IndexMap<String, serde_json::Value>,
    /// An ad hoc command producing the target; `$out` and `$in` are
    /// substituted.
    #[serde(default)]
    pub recipe: Option<Vec<String>>,
    /// Mark the target as runnable by the test operation.
    #[serde(default)]
    pub test: Option<bool>,
}

/// Walk up from `start` to the closest directory holding a `forge.json`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(d) = cur {
        if d.join(FORGE_JSON).is_file() {
            return Some(d.to_path_buf());
        }
        cur = d.parent();
    }
    None
}

/// Read the project manifest, populate the root scope and the target set,
/// and return the declared targets in declaration order.
pub fn load_project(ctx: &BuildContext) -> anyhow::Result<Vec<Arc<Target>>> {
    let mpath = ctx.src_root.join(FORGE_JSON);
    let text = std::fs::read_to_string(&mpath)
        .with_context(|| format!("unable to read {}", mpath.display()))?;
    let m: Manifest = serde_json::from_str(&text)
        .with_context(|| format!("invalid project manifest {}", mpath.display()))?;
    debug!("loaded project `{}` from {}", m.name, mpath.display());

    for (k, v) in &m.vars {
        let v = Value::from_json(v)
            .with_context(|| format!("{}: variable `{}`", mpath.display(), k))?;
        ctx.scopes.assign(ctx.root_scope, k, v);
    }

    let mut declared = Vec::with_capacity(m.targets.len());
    for d in &m.targets {
        let key = Prerequisite::parse(&ctx.types, &ctx.exts, &d.name)
            .with_context(|| format!("{}: target `{}`", mpath.display(), d.name))?;
        // Declared targets live in the out tree.
        let dir = path::absolute(&key.dir, &ctx.out_root);
        let (t, inserted) = ctx
            .targets
            .insert(key.ty, dir, key.out.clone(), key.name.clone(), key.ext)?;
        if !inserted {
            bail!("{}: duplicate target `{}`", mpath.display(), d.name);
        }

        for (k, v) in &d.vars {
            let v = Value::from_json(v).with_context(|| {
                format!("{}: target `{}`: variable `{}`", mpath.display(), d.name, k)
            })?;
            t.vars.write().assign(k, v);
        }
        if let Some(r) = &d.recipe {
            t.vars.write().assign("recipe", Value::Strings(r.clone()));
        }
        if let Some(test) = d.test {
            t.vars.write().assign("test", Value::Bool(test));
        }

        let mut prereqs = t.prerequisites.write();
        for p in &d.prerequisites {
            prereqs.push(Prerequisite::parse(&ctx.types, &ctx.exts, p).with_context(
                || format!("{}: target `{}`: prerequisite `{}`", mpath.display(), d.name, p),
            )?);
        }
        drop(prereqs);
        declared.push(t);
    }

    check_cycles(&m, &mpath)?;
    load_config(ctx)?;
    Ok(declared)
}

/// Persist the root scope's `cc.*` configuration (including the values
/// derived during matching, like the compiler id and checksum) into the
/// out tree. Returns whether the file actually changed.
pub fn save_config(ctx: &BuildContext) -> anyhow::Result<bool> {
    let mut map = serde_json::Map::new();
    for (k, v) in ctx.scopes.snapshot(ctx.root_scope, "cc.") {
        map.insert(k, v.to_json());
    }
    let text = serde_json::to_string_pretty(&serde_json::Value::Object(map))?;

    let path = ctx.out_root.join(CONFIG_JSON);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        if existing == text {
            return Ok(false);
        }
    }
    std::fs::create_dir_all(&ctx.out_root)
        .with_context(|| format!("unable to create {}", ctx.out_root.display()))?;
    std::fs::write(&path, text)
        .with_context(|| format!("unable to write {}", path.display()))?;
    Ok(true)
}

/// Drop the persisted configuration. Returns whether there was one.
pub fn remove_config(ctx: &BuildContext) -> anyhow::Result<bool> {
    let path = ctx.out_root.join(CONFIG_JSON);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("unable to remove {}", path.display())),
    }
}

/// Apply a persisted configuration, if any. Pinned values fill in only
/// what the manifest left unset: explicit declarations always win, but
/// values derived at configure time stay stable until disfigured.
fn load_config(ctx: &BuildContext) -> anyhow::Result<()> {
    let path = ctx.out_root.join(CONFIG_JSON);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("unable to read {}", path.display()))
        }
    };
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    debug!("loaded configuration from {}", path.display());
    for (k, v) in &map {
        if ctx.scopes.find_original(ctx.root_scope, k).is_none() {
            let v = Value::from_json(v)
                .with_context(|| format!("{}: variable `{}`", path.display(), k))?;
            ctx.scopes.assign(ctx.root_scope, k, v);
        }
    }
    Ok(())
}

/// Reject cyclic declarations up front, with a concrete cycle in the
/// diagnostic. Only edges between declared targets matter; files resolved
/// on disk cannot cycle.
fn check_cycles(m: &Manifest, mpath: &Path) -> anyhow::Result<()> {
    let mut g: DiGraph<String, ()> = DiGraph::new();
    let mut nodes = HashMap::new();
    for d in &m.targets {
        let idx = g.add_node(d.name.clone());
        nodes.insert(d.name.as_str(), idx);
    }
    for d in &m.targets {
        for p in &d.prerequisites {
            if let Some(&pi) = nodes.get(p.as_str()) {
                g.add_edge(nodes[d.name.as_str()], pi, ());
            }
        }
    }
    if let Err(c) = petgraph::algo::toposort(&g, None) {
        let cycle = crate::graph::find_cycle(&g, c.node_id());
        bail!(
            "{}: dependency cycle between targets: {}",
            mpath.display(),
            cycle.join(" -> ")
        );
    }
    Ok(())
}

/// Resolve a command-line target spec against the project.
pub fn resolve_targetspec(ctx: &BuildContext, spec: &str) -> anyhow::Result<Arc<Target>> {
    let p = Prerequisite::parse(&ctx.types, &ctx.exts, spec)
        .with_context(|| format!("invalid target `{}`", spec))?;
    p.search(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, json: &str) {
        std::fs::write(dir.join(FORGE_JSON), json).unwrap();
    }

    fn ctx_for(dir: &Path) -> BuildContext {
        BuildContext::new(dir.to_path_buf(), dir.join("out"))
    }

    #[test]
    fn loads_targets_and_vars() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{
                "name": "hello",
                "vars": { "cc.std": "c++17" },
                "targets": [
                    { "name": "exe{hello}",
                      "prerequisites": ["obj{main}"],
                      "test": true },
                    { "name": "obj{main}",
                      "prerequisites": ["cxx{main}"],
                      "vars": { "cc.poptions": ["-DHELLO"] } }
                ]
            }"#,
        );
        let ctx = ctx_for(dir.path());
        let targets = load_project(&ctx).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "hello");
        assert_eq!(
            ctx.root_var("cc.std"),
            Some(Value::String("c++17".into()))
        );
        assert_eq!(
            ctx.lookup(&targets[1], "cc.poptions"),
            Some(Value::Strings(vec!["-DHELLO".into()]))
        );
        assert_eq!(targets[1].prerequisites.read().len(), 1);
    }

    #[test]
    fn rejects_duplicate_targets() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{ "name": "p", "targets": [
                { "name": "obj{a}" }, { "name": "obj{a}" } ] }"#,
        );
        let ctx = ctx_for(dir.path());
        let err = load_project(&ctx).unwrap_err();
        assert!(err.to_string().contains("duplicate target"));
    }

    #[test]
    fn rejects_cycles_with_path() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{ "name": "p", "targets": [
                { "name": "alias{a}", "prerequisites": ["alias{b}"] },
                { "name": "alias{b}", "prerequisites": ["alias{a}"] } ] }"#,
        );
        let ctx = ctx_for(dir.path());
        let err = load_project(&ctx).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("dependency cycle"), "{}", msg);
        assert!(msg.contains("alias{a}") && msg.contains("alias{b}"), "{}", msg);
        assert!(msg.contains(" -> "), "{}", msg);
    }

    #[test]
    fn unknown_manifest_fields_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), r#"{ "name": "p", "tragets": [] }"#);
        let ctx = ctx_for(dir.path());
        assert!(load_project(&ctx).is_err());
    }

    #[test]
    fn config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), r#"{ "name": "p" }"#);
        let ctx = ctx_for(dir.path());
        load_project(&ctx).unwrap();

        ctx.scopes.assign(
            ctx.root_scope,
            "cc.path",
            Value::String("/usr/bin/cc".into()),
        );
        ctx.scopes.assign(
            ctx.root_scope,
            "cc.checksum",
            Value::String("deadbeef".into()),
        );
        assert!(save_config(&ctx).unwrap());
        // Unchanged content is not rewritten.
        assert!(!save_config(&ctx).unwrap());

        // A fresh context picks the pinned values up.
        let ctx2 = ctx_for(dir.path());
        load_project(&ctx2).unwrap();
        assert_eq!(
            ctx2.root_var("cc.checksum"),
            Some(Value::String("deadbeef".into()))
        );

        assert!(remove_config(&ctx).unwrap());
        assert!(!remove_config(&ctx).unwrap());
    }

    #[test]
    fn manifest_vars_win_over_pinned_config() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{ "name": "p", "vars": { "cc.std": "c++20" } }"#,
        );
        let ctx = ctx_for(dir.path());
        load_project(&ctx).unwrap();
        ctx.scopes
            .assign(ctx.root_scope, "cc.std", Value::String("c++17".into()));
        save_config(&ctx).unwrap();

        let ctx2 = ctx_for(dir.path());
        load_project(&ctx2).unwrap();
        assert_eq!(
            ctx2.root_var("cc.std"),
            Some(Value::String("c++20".into()))
        );
    }

    #[test]
    fn finds_project_root_upward() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), r#"{ "name": "p" }"#);
        let sub = dir.path().join("a/b");
        std::fs::create_dir_all(&sub).unwrap();
        assert_eq!(
            find_project_root(&sub),
            Some(dir.path().to_path_buf())
        );
    }
}
