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

//! The C/C++ compile rule and the header-dependency discovery loop.
//!
//! The goal: given source `S` and object `T`, any future change in `S` or
//! in any header transitively included by `S` (including headers that do
//! not exist yet but will be generated by this very build) causes `T` to be
//! rebuilt, and nothing else does. Discovered headers are cached in the
//! target's depdb behind a self-describing prefix (rule id and version,
//! compiler checksum, options checksum, source path) so that subsequent
//! runs can validate the cache without running the compiler.

pub mod deps;
pub mod link;

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use tracing::{debug, trace};

use forgeutil::hash::{short_hash_str, Digest};
use forgeutil::timestamp::{self, Timestamp};
use forgeutil::{path, process, shell};

use crate::action::{Action, Op, PERFORM_CLEAN, PERFORM_UPDATE};
use crate::context::BuildContext;
use crate::depdb::{DepDb, ReadLine};
use crate::extension::ExtState;
use crate::recipe::Recipe;
use crate::rule::{Match, Rule};
use crate::sched;
use crate::target::{Target, TargetState};
use crate::types::{TargetType, C, CXX, H, LIB, OBJA, OBJS};

use deps::{PrefixMap, ShowInclude};

/// The compiler's configuration, read from the root scope.
pub(crate) struct Compiler {
    pub path: PathBuf,
    pub id: String,
    pub checksum: String,
    pub target_system: String,
    pub target_class: String,
}

impl Compiler {
    pub fn msvc(&self) -> bool {
        self.id == "msvc"
    }
}

fn host_system() -> &'static str {
    if cfg!(windows) {
        "win32-msvc"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux-gnu"
    }
}

fn host_class() -> &'static str {
    if cfg!(windows) {
        "windows"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(target_os = "freebsd") {
        "freebsd"
    } else {
        "linux"
    }
}

/// Read (and lazily complete) the compiler configuration: `cc.path` is
/// required, everything else is derived when not set explicitly.
pub(crate) fn configure(ctx: &BuildContext) -> anyhow::Result<Compiler> {
    let path = ctx
        .root_var("cc.path")
        .and_then(|v| v.as_path())
        .context("cc.path is not configured")?;

    let id = match ctx.root_var("cc.id").and_then(|v| v.as_str().map(str::to_owned)) {
        Some(id) => id,
        None => {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            let id = if stem == "cl" || stem.ends_with("-cl") {
                "msvc".to_string()
            } else {
                "gcc".to_string()
            };
            ctx.scopes.assign(
                ctx.root_scope,
                "cc.id",
                crate::scope::Value::String(id.clone()),
            );
            id
        }
    };

    let checksum = match ctx
        .root_var("cc.checksum")
        .and_then(|v| v.as_str().map(str::to_owned))
    {
        Some(c) => c,
        None => {
            // Identity of the compiler binary: its path plus, when it can
            // be stat'ed, its size and mtime. Good enough to notice an
            // upgraded toolchain.
            let meta = std::fs::metadata(&path).ok();
            let c = short_hash_str((
                path.display().to_string(),
                meta.as_ref().map(|m| m.len()),
                meta.and_then(|m| m.modified().ok()),
            ));
            ctx.scopes.assign(
                ctx.root_scope,
                "cc.checksum",
                crate::scope::Value::String(c.clone()),
            );
            c
        }
    };

    let target_system = ctx
        .root_var("cc.target.system")
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_else(|| host_system().to_string());
    let target_class = ctx
        .root_var("cc.target.class")
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_else(|| host_class().to_string());

    Ok(Compiler {
        path,
        id,
        checksum,
        target_system,
        target_class,
    })
}

/// The object file extension for the given object flavor on the given
/// target system.
fn obj_ext(system: &str, ty: &'static TargetType) -> &'static str {
    let (e, a, s) = if system == "win32-msvc" {
        ("exe.obj", "lib.obj", "dll.obj")
    } else if system.starts_with("mingw32") {
        ("exe.o", "a.o", "dll.o")
    } else if system == "darwin" {
        ("o", "a.o", "dylib.o")
    } else {
        ("o", "a.o", "so.o")
    };
    if ty.is_a(&OBJS) {
        s
    } else if ty.is_a(&OBJA) {
        a
    } else {
        e
    }
}

fn append_options(args: &mut Vec<String>, ctx: &BuildContext, t: &Target, var: &str) {
    if let Some(v) = ctx.lookup(t, var) {
        args.extend(v.to_strings());
    }
}

fn hash_options(cs: &mut Digest, ctx: &BuildContext, t: &Target, var: &str) {
    if let Some(v) = ctx.lookup(t, var) {
        for o in v.to_strings() {
            cs.append(&o);
        }
    }
}

fn append_std(args: &mut Vec<String>, ctx: &BuildContext, cc: &Compiler, t: &Target) {
    if let Some(std) = ctx.lookup(t, "cc.std").and_then(|v| v.as_str().map(str::to_owned)) {
        if cc.msvc() {
            args.push(format!("/std:{}", std));
        } else {
            args.push(format!("-std={}", std));
        }
    }
}

/// The library prerequisites of a target, in declaration (link) order.
/// These are matched but not executed before the dependent: all we want is
/// the meta-information riding on them.
fn lib_prerequisites(ctx: &BuildContext, t: &Target) -> anyhow::Result<Vec<Arc<Target>>> {
    let mut out = Vec::new();
    for p in t.prerequisites.read().iter() {
        if p.ty.is_a(&LIB) {
            out.push(p.search(ctx)?);
        }
    }
    Ok(out)
}

/// Append `cc.export.poptions` of a library and, first, of its own library
/// prerequisites (transitively, prerequisites before dependents).
fn append_lib_options(args: &mut Vec<String>, l: &Target) {
    for pt in l.prerequisite_targets() {
        if pt.is_a(&LIB) {
            append_lib_options(args, &pt);
        }
    }
    if let Some(v) = l.vars.read().get("cc.export.poptions") {
        args.extend(v.to_strings());
    }
}

fn hash_lib_options(cs: &mut Digest, l: &Target) {
    for pt in l.prerequisite_targets() {
        if pt.is_a(&LIB) {
            hash_lib_options(cs, &pt);
        }
    }
    if let Some(v) = l.vars.read().get("cc.export.poptions") {
        for o in v.to_strings() {
            cs.append(&o);
        }
    }
}

/// Library prefixes first (prerequisite libraries before dependents, in
/// link order), then our own `cc.poptions`.
fn build_prefix_map(ctx: &BuildContext, t: &Target) -> anyhow::Result<PrefixMap> {
    let mut m = PrefixMap::new();
    for l in lib_prerequisites(ctx, t)? {
        append_lib_prefixes(&mut m, ctx, &l);
    }
    let own: Vec<String> = ctx
        .lookup(t, "cc.poptions")
        .map(|v| v.to_strings())
        .unwrap_or_default();
    deps::append_prefixes(&mut m, &own, &t.dir, &ctx.out_root);
    Ok(m)
}

fn append_lib_prefixes(m: &mut PrefixMap, ctx: &BuildContext, l: &Target) {
    for pt in l.prerequisite_targets() {
        if pt.is_a(&LIB) {
            append_lib_prefixes(m, ctx, &pt);
        }
    }
    let opts: Vec<String> = l
        .vars
        .read()
        .get("cc.export.poptions")
        .map(|v| v.to_strings())
        .unwrap_or_default();
    deps::append_prefixes(m, &opts, &l.dir, &ctx.out_root);
}

/// The compile rule: obj{} from a c{}/cxx{} source prerequisite.
pub struct CompileRule;

impl Rule for CompileRule {
    fn name(&self) -> &'static str {
        "cc.compile"
    }

    fn matches(
        &self,
        ctx: &BuildContext,
        _a: Action,
        t: &Arc<Target>,
    ) -> anyhow::Result<Option<Match>> {
        if !t.is_a(&crate::types::OBJ) {
            return Ok(None);
        }
        if ctx.lookup(t, "recipe").is_some() {
            return Ok(None); // An ad hoc recipe takes precedence.
        }
        // Iterate in reverse so that a source specified for a member
        // overrides one specified for the group.
        for p in t.prerequisites.read().iter().rev() {
            if p.ty.is_a(&CXX) || p.ty.is_a(&C) {
                return Ok(Some(Match::with_source(p.search(ctx)?)));
            }
        }
        debug!("no c/c++ source file for target {}", t);
        Ok(None)
    }

    fn apply(
        &self,
        ctx: &BuildContext,
        a: Action,
        t: &Arc<Target>,
        m: &Match,
    ) -> anyhow::Result<Recipe> {
        let src = m.source.clone().expect("compile match carries the source");
        let cc = configure(ctx)?;

        t.derive_path(&ctx.exts, Some(obj_ext(&cc.target_system, t.ty)))?;

        // The output directory is needed before header extraction can
        // write the depdb, so it is executed now, during apply.
        sched::inject_fsdir(ctx, a, t)?;

        for p in t.prerequisites.read().iter() {
            // Library prerequisites are match-only: their options are
            // harvested via the meta-information protocol and sequencing
            // them before us would only restrict parallelism.
            if p.ty.is_a(&LIB) {
                if a.op == Op::Update {
                    let pt = p.search(ctx)?;
                    sched::match_and_apply(ctx, a, &pt)?;
                }
                continue;
            }
            let pt = p.search(ctx)?;
            if a.op == Op::Clean && !path::sub(&pt.dir, &ctx.out_root) {
                continue;
            }
            sched::match_and_apply(ctx, a, &pt)?;
            t.push_prerequisite_target(pt);
        }

        // In a dry run nothing may touch the filesystem, including the
        // dependency database and header extraction.
        if a == PERFORM_UPDATE && !ctx.dry_run {
            let tpath = t.path().expect("object path derived above");
            let mut dd = DepDb::open(depdb_path(&tpath))?;

            // First the rule name and version.
            if dd.expect("cc.compile 1").mismatched() {
                debug!("rule mismatch forcing update of {}", t);
            }
            // Then the compiler checksum.
            if dd.expect(&cc.checksum).mismatched() {
                debug!("compiler mismatch forcing update of {}", t);
            }
            // Then the options checksum, exactly as passed to the compiler
            // since order may be significant.
            let mut cs = Digest::new();
            for l in lib_prerequisites(ctx, t)? {
                hash_lib_options(&mut cs, &l);
            }
            hash_options(&mut cs, ctx, t, "cc.poptions");
            hash_options(&mut cs, ctx, t, "cc.coptions");
            if let Some(std) = ctx.lookup(t, "cc.std").and_then(|v| v.as_str().map(str::to_owned)) {
                cs.append(&std);
            }
            if t.is_a(&OBJS) && matches!(cc.target_class.as_str(), "linux" | "freebsd") {
                cs.append("-fPIC");
            }
            if dd.expect(&cs.string()).mismatched() {
                debug!("options mismatch forcing update of {}", t);
            }
            // Finally the source file.
            let spath = src
                .path()
                .with_context(|| format!("no path for source {}", src))?;
            if dd.expect(&spath.display().to_string()).mismatched() {
                debug!("source file mismatch forcing update of {}", t);
            }

            // A mismatch above, or a database newer than the target
            // (interrupted update), forces the rebuild.
            if dd.writing() || dd.mtime() > t.load_mtime()? {
                t.set_mtime(Timestamp::Nonexistent);
            }

            inject_header_prerequisites(ctx, a, t, &cc, &src, &mut dd).with_context(|| {
                format!("while extracting header dependencies from {}", src)
            })?;

            dd.close()?;
        }

        if a == PERFORM_UPDATE {
            let src = Arc::clone(&src);
            Ok(Recipe::exec(move |ctx, a, t| perform_update(ctx, a, t, &src)))
        } else if a == PERFORM_CLEAN {
            Ok(Recipe::exec(perform_clean))
        } else {
            // Configure update: the derivations above were the work.
            Ok(Recipe::Noop)
        }
    }
}

pub(crate) fn depdb_path(target_path: &Path) -> PathBuf {
    let mut s = target_path.as_os_str().to_owned();
    s.push(".d");
    PathBuf::from(s)
}

/// Update a header/source target "smartly": run it (joining if another
/// worker has it), and report whether that actually changed anything or
/// the file is newer than the given reference time. The fallback file rule
/// hands existing up-to-date headers a noop recipe, which keeps this walk
/// cheap for the common case of system headers.
fn update_target(
    ctx: &BuildContext,
    a: Action,
    pt: &Arc<Target>,
    ts: Timestamp,
) -> anyhow::Result<bool> {
    if pt.try_state() != Some(TargetState::Unchanged) {
        let os = pt.try_state();
        let ns = sched::execute_direct(ctx, a, pt)?;
        if ns == TargetState::Failed {
            bail!("unable to update {}", pt);
        }
        // Only restart if our call actually caused an update; the target
        // could have been changed already by a dependency extraction run
        // for some other source file.
        if Some(ns) != os && ns != TargetState::Unchanged {
            debug!("updated {}; old state {:?}; new state {:?}", pt, os, ns);
            return Ok(true);
        }
    }
    if !ts.is_unknown() {
        let mt = pt.load_mtime()?;
        return Ok(mt > ts || (mt == ts && pt.try_state() != Some(TargetState::Changed)));
    }
    Ok(false)
}

struct HeaderLoop<'a> {
    cc: &'a Compiler,
    pm: PrefixMap,
    pm_built: bool,
    skip_count: usize,
    /// Canonical paths committed to `prerequisite_targets` so far. On
    /// restart the compiler must reproduce exactly this prefix: all the
    /// inputs it can depend on are up to date, so divergence means the
    /// dependency output is non-deterministic, which we diagnose rather
    /// than silently skip.
    committed: Vec<PathBuf>,
}

impl<'a> HeaderLoop<'a> {
    /// Resolve an emitted header path to its canonical absolute form. A
    /// relative path denotes a file that does not exist yet and is mapped
    /// through the prefix map; an absolute one is realized (symlinks
    /// resolved) unless it came from the cache, where it already was.
    fn resolve(
        &mut self,
        ctx: &BuildContext,
        t: &Target,
        f: PathBuf,
        cache: bool,
    ) -> anyhow::Result<PathBuf> {
        if f.is_relative() {
            let f = path::normalize(&f);
            // About as often a broken include as an auto-generated header.
            debug!("non-existent header '{}'", f.display());
            if !self.pm_built {
                self.pm = build_prefix_map(ctx, t)?;
                self.pm_built = true;
            }
            let dir = f.parent().unwrap_or_else(|| Path::new(""));
            match deps::find_prefix(&self.pm, dir) {
                Some(base) => Ok(base.join(&f)),
                None => bail!(
                    "unable to map presumably auto-generated header '{}' to a project",
                    f.display()
                ),
            }
        } else if cache {
            Ok(f)
        } else {
            Ok(path::realize(&f)?)
        }
    }

    /// Resolve, match, and update one discovered header; record it in the
    /// depdb (when it came from the compiler) and in the prerequisite
    /// list. Returns whether the extraction must restart.
    fn add(
        &mut self,
        ctx: &BuildContext,
        a: Action,
        t: &Arc<Target>,
        dd: &mut DepDb,
        f: PathBuf,
        cache: bool,
    ) -> anyhow::Result<bool> {
        let f = self.resolve(ctx, t, f, cache)?;
        trace!("injecting {}", f.display());

        let (d, n, e) = path::split_name(&f)?;
        let ext = ctx.exts.intern(&e);

        // Classify by extension within the enclosing project; headers
        // outside any project (or with an unknown extension) are plain old
        // C headers.
        let tt = ctx
            .scopes
            .find(&d)
            .and_then(|sid| ctx.types.map_extension(&ctx.scopes, sid, &e))
            .unwrap_or(&H);

        let (pt, _) = ctx
            .targets
            .insert(tt, d, PathBuf::new(), n, ExtState::Decided(ext))?;
        pt.assign_path(f.clone())?;

        sched::match_and_apply(ctx, a, &pt)?;

        // A cached header must be no older than the database itself: if it
        // changed since the database was written the cached data is stale.
        let restart = update_target(
            ctx,
            a,
            &pt,
            if cache { dd.mtime() } else { Timestamp::Unknown },
        )?;

        // Record after updating so we never record a file that does not
        // exist and has no way of being updated.
        if !cache {
            dd.expect(&f.display().to_string());
        }

        t.push_prerequisite_target(pt);
        self.committed.push(f);
        Ok(restart)
    }

    /// Validate one skipped (already committed) entry against what the
    /// compiler reproduced.
    fn validate_skip(
        &mut self,
        ctx: &BuildContext,
        t: &Target,
        index: usize,
        f: PathBuf,
    ) -> anyhow::Result<()> {
        let f = self.resolve(ctx, t, f, false)?;
        if self.committed[index] != f {
            bail!(
                "non-deterministic header dependency output: expected '{}', got '{}'",
                self.committed[index].display(),
                f.display()
            );
        }
        Ok(())
    }
}

/// The discovery loop proper: try the cached depdb suffix first, fall back
/// to (or restart into) a compiler run that skips the already committed
/// prefix.
fn inject_header_prerequisites(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
    cc: &Compiler,
    src: &Arc<Target>,
    dd: &mut DepDb,
) -> anyhow::Result<()> {
    // Before anything else make sure the source file itself is up to date
    // (it may be auto-generated too).
    let mut cache = dd.reading();
    if update_target(ctx, a, src, dd.mtime())? && cache {
        // The cached data may still be valid; the compiler run will
        // re-validate it. But the database timestamp must move or we will
        // keep re-validating over and over.
        cache = false;
        dd.touch()?;
    }

    let mut hl = HeaderLoop {
        cc,
        pm: PrefixMap::new(),
        pm_built: false,
        skip_count: 0,
        committed: Vec::new(),
    };

    let mut restart = true;
    while restart {
        restart = false;

        if cache {
            // If any, this is always the first pass.
            debug_assert_eq!(hl.skip_count, 0);
            while dd.more() {
                match dd.read() {
                    ReadLine::Line(l) => {
                        restart = hl.add(ctx, a, t, dd, PathBuf::from(l), true)?;
                        hl.skip_count += 1;
                        if restart {
                            debug!("restarting (cached header changed)");
                            dd.touch()?;
                            break;
                        }
                    }
                    // An interrupted tail: run the compiler.
                    ReadLine::Corrupt => {
                        restart = true;
                        break;
                    }
                    ReadLine::Eof => break,
                }
            }
        } else {
            restart = compiler_pass(ctx, a, t, src, dd, &mut hl)?;
        }

        cache = false;
    }
    Ok(())
}

/// One compiler run in preprocess-to-discover mode, skipping (and
/// validating) the committed prefix.
fn compiler_pass(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
    src: &Arc<Target>,
    dd: &mut DepDb,
    hl: &mut HeaderLoop,
) -> anyhow::Result<bool> {
    let cc = hl.cc;
    let spath = src.path().expect("source path assigned");

    let mut args: Vec<String> = Vec::new();
    for l in lib_prerequisites(ctx, t)? {
        append_lib_options(&mut args, &l);
    }
    append_options(&mut args, ctx, t, "cc.poptions");
    // Some compile options (-std, -m) affect the preprocessor.
    append_options(&mut args, ctx, t, "cc.coptions");
    append_std(&mut args, ctx, cc, t);
    if t.is_a(&OBJS) && matches!(cc.target_class.as_str(), "linux" | "freebsd") {
        args.push("-fPIC".to_string());
    }
    if cc.msvc() {
        args.push("/nologo".to_string());
        args.push("/EP".to_string()); // Preprocess to stdout.
        args.push("/TP".to_string()); // As C++.
        args.push("/showIncludes".to_string()); // Goes to stderr because of /EP.
    } else {
        args.push("-M".to_string()); // Note: -MM would skip <>-includes.
        args.push("-MG".to_string()); // Treat missing headers as generated.
        args.push("-MQ".to_string()); // Quoted target name.
        args.push("^".to_string());
    }
    // Absolute source path so existing headers come out absolute; relative
    // ones are then exactly the non-existent, potentially auto-generated
    // set.
    args.push(spath.display().to_string());

    if ctx.verbosity >= 3 {
        println!("{}", shell::render(&cc.path.display().to_string(), &args));
    }

    let mut cmd = Command::new(&cc.path);
    cmd.args(&args).stdin(Stdio::null());
    if cc.msvc() {
        // With /EP the includes go to stderr and the preprocessed output
        // to stdout, which we do not want.
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("unable to execute {}", cc.path.display()))?;

    let stream: Box<dyn Read + Send> = if cc.msvc() {
        Box::new(child.stderr.take().expect("piped stderr"))
    } else {
        Box::new(child.stdout.take().expect("piped stdout"))
    };
    let mut reader = BufReader::new(stream);

    let mut restart = false;
    let mut good_error = false;
    let mut bad_error = false;
    let mut skip = hl.skip_count;
    let mut validated = 0usize;

    let mut first = true;
    let mut second = false;
    let mut line = String::new();

    'lines: loop {
        if restart || bad_error {
            break;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = child.kill();
                return Err(e).context("unable to read compiler header dependency output");
            }
        }
        let l = line.trim_end_matches(['\n', '\r']);
        trace!("header dependency line '{}'", l);

        if cc.msvc() {
            if first {
                // The first line must be the file being compiled;
                // otherwise something went wrong before anything could be
                // compiled and what follows is diagnostics.
                let leaf = spath.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if l != leaf {
                    eprintln!("{}", l);
                    bad_error = true;
                    continue;
                }
                first = false;
                continue;
            }
            match deps::next_show(l)? {
                ShowInclude::Other => {
                    eprintln!("{}", l);
                    bad_error = true;
                }
                ShowInclude::Missing(f) => {
                    good_error = true;
                    if skip != 0 {
                        // The committed prefix cannot contain a file that
                        // does not exist.
                        bail!(
                            "non-deterministic header dependency output: \
                             missing header '{}' inside the processed prefix",
                            f
                        );
                    }
                    restart = hl.add(ctx, a, t, dd, PathBuf::from(f), false)?;
                    hl.skip_count += 1;
                    debug_assert!(restart, "a missing header must trigger a restart");
                }
                ShowInclude::Note(f) => {
                    if skip != 0 {
                        hl.validate_skip(ctx, t, validated, PathBuf::from(f))?;
                        validated += 1;
                        skip -= 1;
                    } else {
                        restart = hl.add(ctx, a, t, dd, PathBuf::from(f), false)?;
                        hl.skip_count += 1;
                        if restart {
                            debug!("restarting");
                        }
                    }
                }
            }
        } else {
            // Make dependency declaration.
            let mut pos = 0usize;
            if first {
                // Empty output should mean the wait() below fails.
                if l.is_empty() {
                    bad_error = true;
                    continue;
                }
                if !l.starts_with("^:") {
                    bail!("invalid make dependency declaration line '{}'", l);
                }
                first = false;
                second = true;
                // With a long source path the first line can be just
                // "^: \" with everything on the next one.
                if l == "^: \\" || l == "^:" {
                    continue;
                }
                pos = 2;
            }
            if second {
                second = false;
                deps::next_make(l, &mut pos); // Skip the source file.
            }
            while pos < l.len() {
                let f = deps::next_make(l, &mut pos);
                if f.is_empty() {
                    continue;
                }
                if skip != 0 {
                    hl.validate_skip(ctx, t, validated, PathBuf::from(f))?;
                    validated += 1;
                    skip -= 1;
                    continue;
                }
                restart = hl.add(ctx, a, t, dd, PathBuf::from(f), false)?;
                hl.skip_count += 1;
                if restart {
                    debug!("restarting");
                    continue 'lines;
                }
            }
        }
    }

    // We may not have read all the output (restart); skip to the end so
    // the compiler does not take a broken pipe personally. For MSVC with a
    // real error, what is left is diagnostics the user needs to see.
    if bad_error && cc.msvc() {
        let mut rest = String::new();
        let _ = reader.read_to_string(&mut rest);
        eprint!("{}", rest);
    } else {
        let mut sink = std::io::sink();
        let _ = std::io::copy(&mut reader, &mut sink);
    }

    let status = child
        .wait()
        .with_context(|| format!("unable to wait for {}", cc.path.display()))?;

    if !status.success() {
        if !good_error {
            // The compiler is assumed to have issued diagnostics.
            process::check_status(&cc.path.display().to_string(), status)?;
        }
    } else if bad_error {
        bail!("expected error exit status from compiler");
    }

    Ok(restart)
}

fn perform_update(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
    src: &Arc<Target>,
) -> anyhow::Result<TargetState> {
    let changed = match sched::execute_prerequisites_newer(ctx, a, t)? {
        None => return Ok(TargetState::Failed),
        Some(c) => c,
    };
    if !changed {
        return Ok(TargetState::Unchanged);
    }

    let cc = configure(ctx)?;
    let tpath = t.path().expect("object path derived during apply");
    let spath = src.path().expect("source path assigned during apply");

    let mut args: Vec<String> = Vec::new();
    for l in lib_prerequisites(ctx, t)? {
        append_lib_options(&mut args, &l);
    }
    append_options(&mut args, ctx, t, "cc.poptions");
    append_options(&mut args, ctx, t, "cc.coptions");
    append_std(&mut args, ctx, &cc, t);
    if t.is_a(&OBJS) && matches!(cc.target_class.as_str(), "linux" | "freebsd") {
        args.push("-fPIC".to_string());
    }
    if cc.msvc() {
        if ctx.verbosity < 3 {
            args.push("/nologo".to_string());
        }
        args.push(format!("/Fo:{}", tpath.display()));
        args.push("/c".to_string());
        args.push("/TP".to_string());
    } else {
        args.push("-o".to_string());
        args.push(tpath.display().to_string());
        args.push("-c".to_string());
    }
    args.push(spath.display().to_string());

    let rendered = shell::render(&cc.path.display().to_string(), &args);
    if ctx.dry_run {
        println!("{}", rendered);
        return Ok(TargetState::Changed);
    }
    if ctx.verbosity >= 2 {
        println!("{}", rendered);
    } else if ctx.verbosity == 1 {
        println!("cc {}", ctx.diag_path(&spath));
    }

    let mut cmd = process::command(&cc.path, &args);
    let status = process::run_stdout_to_stderr(&mut cmd)?;
    process::check_status(&cc.path.display().to_string(), status)
        .with_context(|| format!("unable to compile {}", ctx.diag_path(&spath)))?;

    t.set_mtime(timestamp::mtime(&tpath)?);
    Ok(TargetState::Changed)
}

fn perform_clean(
    ctx: &BuildContext,
    a: Action,
    t: &Arc<Target>,
) -> anyhow::Result<TargetState> {
    let tpath = t.path().expect("object path derived during apply");
    let mut state = clean_files(ctx, t, &[depdb_path(&tpath), tpath])?;
    // Prerequisites (the output directory) are cleaned after the files.
    if sched::execute_prerequisites(ctx, a, t)? == TargetState::Changed
        && state == TargetState::Unchanged
    {
        state = TargetState::Changed;
    }
    Ok(state)
}

/// Remove build products, tolerating ones that are already gone. The
/// target's own file is the one reported to the user.
pub(crate) fn clean_files(
    ctx: &BuildContext,
    t: &Arc<Target>,
    files: &[PathBuf],
) -> anyhow::Result<TargetState> {
    let mut removed_any = false;
    for (i, f) in files.iter().enumerate() {
        let last = i + 1 == files.len();
        if ctx.dry_run {
            if f.exists() {
                removed_any = true;
                if last {
                    println!("rm {}", ctx.diag_path(f));
                }
            }
            continue;
        }
        match std::fs::remove_file(f) {
            Ok(()) => {
                removed_any = true;
                if last && ctx.verbosity >= 1 {
                    println!("rm {}", ctx.diag_path(f));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("unable to remove {}", f.display()))
            }
        }
    }
    if removed_any {
        t.set_mtime(Timestamp::Nonexistent);
        Ok(TargetState::Changed)
    } else {
        Ok(TargetState::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_extension_table() {
        assert_eq!(obj_ext("win32-msvc", &crate::types::OBJE), "exe.obj");
        assert_eq!(obj_ext("win32-msvc", &crate::types::OBJS), "dll.obj");
        assert_eq!(obj_ext("mingw32", &crate::types::OBJA), "a.o");
        assert_eq!(obj_ext("darwin", &crate::types::OBJS), "dylib.o");
        assert_eq!(obj_ext("linux-gnu", &crate::types::OBJE), "o");
        assert_eq!(obj_ext("linux-gnu", &crate::types::OBJS), "so.o");
        // A plain obj{} compiles as if for an executable.
        assert_eq!(obj_ext("linux-gnu", &crate::types::OBJ), "o");
    }

    #[test]
    fn depdb_path_appends() {
        assert_eq!(
            depdb_path(Path::new("/p/out/main.o")),
            PathBuf::from("/p/out/main.o.d")
        );
    }
}
