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

//! The execute pass: replaying recorded lines, evaluating conditionals,
//! and running command expressions.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Child, Command as OsCommand, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Context as _};
use tracing::{debug, trace};

use crate::lexer::Token;
use crate::syntax::{
    Command, CommandExpr, DocBody, FileMode, Line, LineType, LogicOp, Pipe, Redirect, Script,
};
use crate::vars::{self, ScriptVars};
use crate::parser;

/// How a script finished: it either ran to completion or short-circuited
/// through the `exit` builtin. An `exit` with a non-zero status is still a
/// normal outcome, distinguished from a hard failure (`Err`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Exited(i32),
}

/// A test command whose expectations did not hold, with its source
/// location.
#[derive(Debug, thiserror::Error)]
#[error("{script}:{line}: test command failed{detail}")]
pub struct CommandFailed {
    pub script: String,
    pub line: usize,
    pub detail: String,
}

impl Outcome {
    pub fn success(self) -> bool {
        matches!(self, Outcome::Completed | Outcome::Exited(0))
    }
}

/// What the enclosing test rule provides to a script run.
#[derive(Debug, Clone, Default)]
pub struct TestEnv {
    /// Script name for diagnostics.
    pub name: String,
    /// The program under test (`$0`, the `test` variable).
    pub program: Option<PathBuf>,
    pub options: Vec<String>,
    pub arguments: Vec<String>,
    /// The scratch working directory commands run in.
    pub cwd: PathBuf,
    /// Additional pre-set variables.
    pub vars: Vec<(String, Vec<String>)>,
    /// With tracing enabled (the build running at a chatty verbosity),
    /// pass-through output redirects are captured and echoed into the
    /// diagnostics instead of inheriting our streams.
    pub trace: bool,
}

enum Eval {
    Bool(bool),
    Exited(i32),
}

enum Flow {
    Normal,
    Exited(i32),
    /// Hit an `elif`/`else`/`end` token belonging to the enclosing
    /// construct (not consumed).
    Branch,
}

pub struct Runner<'a> {
    env: &'a TestEnv,
    vars: ScriptVars,
    cleanups: Vec<PathBuf>,
    /// Details of the last expectation failure, folded into the test-line
    /// diagnostic.
    last_failure: Option<String>,
}

impl<'a> Runner<'a> {
    pub fn new(env: &'a TestEnv) -> Runner<'a> {
        let mut vars = ScriptVars::new();
        if let Some(p) = &env.program {
            vars.assign("test", vec![p.display().to_string()]);
        }
        vars.assign("test.options", env.options.clone());
        vars.assign("test.arguments", env.arguments.clone());
        for (k, v) in &env.vars {
            vars.assign(k, v.clone());
        }
        Runner {
            env,
            vars,
            cleanups: Vec::new(),
            last_failure: None,
        }
    }

    pub fn run(mut self, script: &Script) -> anyhow::Result<Outcome> {
        let mut i = 0usize;
        let flow = self.run_lines(script, &mut i, false)?;
        let outcome = match flow {
            Flow::Normal => Outcome::Completed,
            Flow::Exited(c) => Outcome::Exited(c),
            Flow::Branch => unreachable!("top level never stops at a branch"),
        };
        self.cleanup();
        Ok(outcome)
    }

    fn run_lines(
        &mut self,
        s: &Script,
        i: &mut usize,
        stop_at_branch: bool,
    ) -> anyhow::Result<Flow> {
        while *i < s.lines.len() {
            let line = &s.lines[*i];
            match line.ty {
                LineType::Var => {
                    *i += 1;
                    self.exec_var(s, line)?;
                }
                LineType::Cmd => {
                    *i += 1;
                    match self.exec_expr(s, line, &line.tokens)? {
                        Eval::Exited(c) => return Ok(Flow::Exited(c)),
                        Eval::Bool(true) => {}
                        Eval::Bool(false) => {
                            let detail = self
                                .last_failure
                                .take()
                                .map(|d| format!(": {}", d))
                                .unwrap_or_default();
                            return Err(CommandFailed {
                                script: s.name.clone(),
                                line: line.li,
                                detail,
                            }
                            .into());
                        }
                    }
                }
                LineType::If { .. } => match self.exec_if(s, i)? {
                    Flow::Exited(c) => return Ok(Flow::Exited(c)),
                    _ => {}
                },
                LineType::Elif { .. } | LineType::Else | LineType::End => {
                    if stop_at_branch {
                        return Ok(Flow::Branch);
                    }
                    bail!("{}:{}: unexpected branch keyword", s.name, line.li)
                }
            }
        }
        Ok(Flow::Normal)
    }

    /// Execute one `if … end` construct. Branch selection happens here, at
    /// execute time; non-selected branches are skipped by line counting so
    /// the recorded `li` of every line stays accurate for diagnostics.
    fn exec_if(&mut self, s: &Script, i: &mut usize) -> anyhow::Result<Flow> {
        let mut taken = false;
        loop {
            if *i >= s.lines.len() {
                bail!("{}: missing 'end'", s.name);
            }
            let line = &s.lines[*i];
            match line.ty {
                LineType::If { neg } | LineType::Elif { neg } => {
                    *i += 1;
                    if taken {
                        self.skip_branch(s, i)?;
                        continue;
                    }
                    let cond = match self.eval_condition(s, line)? {
                        Eval::Exited(c) => return Ok(Flow::Exited(c)),
                        Eval::Bool(b) => b,
                    };
                    if cond != neg {
                        taken = true;
                        match self.run_lines(s, i, true)? {
                            Flow::Exited(c) => return Ok(Flow::Exited(c)),
                            Flow::Branch => {}
                            Flow::Normal => bail!("{}: missing 'end'", s.name),
                        }
                    } else {
                        self.skip_branch(s, i)?;
                    }
                }
                LineType::Else => {
                    *i += 1;
                    if taken {
                        self.skip_branch(s, i)?;
                    } else {
                        taken = true;
                        match self.run_lines(s, i, true)? {
                            Flow::Exited(c) => return Ok(Flow::Exited(c)),
                            Flow::Branch => {}
                            Flow::Normal => bail!("{}: missing 'end'", s.name),
                        }
                    }
                }
                LineType::End => {
                    *i += 1;
                    return Ok(Flow::Normal);
                }
                _ => unreachable!("run_lines and skip_branch stop at branch heads"),
            }
        }
    }

    /// Skip forward to the next branch keyword of the current construct,
    /// counting nested `if`/`end` pairs. The keyword itself stays
    /// unconsumed.
    fn skip_branch(&self, s: &Script, i: &mut usize) -> anyhow::Result<()> {
        let mut depth = 0usize;
        while *i < s.lines.len() {
            match s.lines[*i].ty {
                LineType::If { .. } => depth += 1,
                LineType::End => {
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                }
                LineType::Elif { .. } | LineType::Else => {
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => {}
            }
            *i += 1;
        }
        bail!("{}: missing 'end'", s.name)
    }

    fn exec_var(&mut self, s: &Script, line: &Line) -> anyhow::Result<()> {
        let name = match &line.tokens[0] {
            Token::Word(w) => w.raw(),
            _ => unreachable!("classified as a variable line"),
        };
        let mut words = Vec::new();
        for tok in &line.tokens[2..] {
            match tok {
                Token::Word(w) => words.extend(vars::expand_word(w, &mut self.vars)?),
                _ => bail!(
                    "{}:{}: expected value after variable operator",
                    s.name,
                    line.li
                ),
            }
        }
        match line.tokens[1] {
            Token::Assign => self.vars.assign(&name, words),
            Token::Append => self.vars.append(&name, words),
            Token::Prepend => self.vars.prepend(&name, words),
            _ => unreachable!("classified as a variable line"),
        }
        Ok(())
    }

    /// Evaluate an `if`/`elif` condition: either an evaluation context
    /// (`($x == 1)`) or a command whose exit expectation decides.
    fn eval_condition(&mut self, s: &Script, line: &Line) -> anyhow::Result<Eval> {
        let rest = &line.tokens[1..];
        if matches!(rest.first(), Some(Token::LParen)) {
            return self.eval_paren(s, line, rest);
        }
        self.exec_expr(s, line, rest)
    }

    fn eval_paren(&mut self, s: &Script, line: &Line, tokens: &[Token]) -> anyhow::Result<Eval> {
        let fail = |msg: &str| -> anyhow::Error {
            anyhow::anyhow!("{}:{}: {}", s.name, line.li, msg)
        };
        if !matches!(tokens.last(), Some(Token::RParen)) {
            return Err(fail("expected ')'"));
        }
        let inner = &tokens[1..tokens.len() - 1];
        let mut lhs: Vec<String> = Vec::new();
        let mut rhs: Vec<String> = Vec::new();
        let mut eq: Option<bool> = None;
        for tok in inner {
            match tok {
                Token::ExitEq => {
                    if eq.is_some() {
                        return Err(fail("multiple comparison operators"));
                    }
                    eq = Some(true);
                }
                Token::ExitNe => {
                    if eq.is_some() {
                        return Err(fail("multiple comparison operators"));
                    }
                    eq = Some(false);
                }
                Token::Word(w) => {
                    let words = vars::expand_word(w, &mut self.vars)?;
                    if eq.is_none() {
                        lhs.extend(words);
                    } else {
                        rhs.extend(words);
                    }
                }
                _ => return Err(fail("unexpected token in evaluation context")),
            }
        }
        match eq {
            Some(eq) => {
                let l = lhs.join(" ");
                let r = rhs.join(" ");
                trace!("eval ({} {} {})", l, if eq { "==" } else { "!=" }, r);
                Ok(Eval::Bool((l == r) == eq))
            }
            None => Err(fail("expected '==' or '!=' in evaluation context")),
        }
    }

    fn exec_expr(&mut self, s: &Script, line: &Line, tokens: &[Token]) -> anyhow::Result<Eval> {
        let mut expr = parser::build_command_expr(
            tokens,
            &line.here_docs,
            &mut self.vars,
            &s.name,
            line.li,
        )?;
        if self.env.trace {
            trace_passes(&mut expr);
        }
        self.eval_expr(&expr)
    }

    /// Short-circuit evaluation of `||`/`&&` over pipe results.
    fn eval_expr(&mut self, expr: &CommandExpr) -> anyhow::Result<Eval> {
        let mut result: Option<bool> = None;
        for (op, pipe) in &expr.terms {
            let skip = match (result, op) {
                (Some(true), LogicOp::Or) => true,
                (Some(false), LogicOp::And) => true,
                _ => false,
            };
            if skip {
                continue;
            }
            match self.run_pipe(pipe)? {
                Eval::Exited(c) => return Ok(Eval::Exited(c)),
                Eval::Bool(b) => result = Some(b),
            }
        }
        Ok(Eval::Bool(result.unwrap_or(true)))
    }

    fn run_pipe(&mut self, pipe: &Pipe) -> anyhow::Result<Eval> {
        if pipe.commands.len() == 1 {
            if let Some(r) = self.run_builtin(&pipe.commands[0])? {
                return Ok(r);
            }
        }
        self.run_processes(pipe)
    }

    /// Builtins avoid process round-trips for the trivial commands tests
    /// lean on: `echo`, `true`, `false`, `touch`, and `exit`.
    fn run_builtin(&mut self, c: &Command) -> anyhow::Result<Option<Eval>> {
        let code = match c.program.as_str() {
            "exit" => {
                let code = match c.args.first() {
                    Some(a) => a
                        .parse()
                        .with_context(|| format!("invalid exit status '{}'", a))?,
                    None => 0,
                };
                return Ok(Some(Eval::Exited(code)));
            }
            "true" => 0,
            "false" => 1,
            "touch" => {
                for a in &c.args {
                    let p = self.env.cwd.join(a);
                    let f = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&p)
                        .with_context(|| format!("touch: unable to open {}", p.display()))?;
                    f.set_modified(std::time::SystemTime::now())
                        .with_context(|| format!("touch: unable to touch {}", p.display()))?;
                }
                0
            }
            "echo" => {
                let out = format!("{}\n", c.args.join(" "));
                let ok = self.deliver_output(c, 1, out.as_bytes())?;
                let ok = ok && self.deliver_output(c, 2, b"")?;
                let ok = ok && c.exit.holds(0);
                if !ok && self.last_failure.is_none() {
                    self.last_failure =
                        Some(format!("echo exited with 0, expected {:?}", c.exit));
                }
                self.register_cleanups(c);
                return Ok(Some(Eval::Bool(ok)));
            }
            _ => return Ok(None),
        };

        let ok = c.exit.holds(code);
        if !ok {
            self.last_failure = Some(format!(
                "{} exited with {}, expected {} {}",
                c.program,
                code,
                if c.exit.eq { "==" } else { "!=" },
                c.exit.code
            ));
        }
        self.register_cleanups(c);
        Ok(Some(Eval::Bool(ok)))
    }

    /// Route a builtin's output through the command's redirect for `fd`.
    fn deliver_output(&mut self, c: &Command, fd: usize, bytes: &[u8]) -> anyhow::Result<bool> {
        match &c.redirects[fd] {
            None | Some(Redirect::Null) => Ok(true),
            Some(Redirect::Pass) => {
                if fd == 1 {
                    std::io::stdout().write_all(bytes)?;
                } else {
                    std::io::stderr().write_all(bytes)?;
                }
                Ok(true)
            }
            Some(Redirect::Trace) => {
                std::io::stderr().write_all(bytes)?;
                Ok(true)
            }
            Some(Redirect::File { path, mode }) => match mode {
                FileMode::Overwrite => {
                    std::fs::write(self.env.cwd.join(path), bytes)?;
                    Ok(true)
                }
                FileMode::Append => {
                    let mut f = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(self.env.cwd.join(path))?;
                    f.write_all(bytes)?;
                    Ok(true)
                }
                FileMode::Compare => self.check_stream(fd, bytes, &c.redirects[fd]),
                FileMode::Read => bail!("read redirect on an output stream"),
            },
            Some(Redirect::HereStr { .. }) | Some(Redirect::HereDoc { .. }) => {
                self.check_stream(fd, bytes, &c.redirects[fd])
            }
            Some(Redirect::Merge(_)) => {
                // Builtins produce one stream at a time, so merging just
                // re-routes.
                let target = match &c.redirects[fd] {
                    Some(Redirect::Merge(m)) => *m as usize,
                    _ => unreachable!(),
                };
                self.deliver_output(c, target, bytes)
            }
        }
    }

    /// Compare a captured stream against its expectation.
    fn check_stream(
        &mut self,
        fd: usize,
        actual: &[u8],
        redirect: &Option<Redirect>,
    ) -> anyhow::Result<bool> {
        let what = match fd {
            0 => "stdin",
            1 => "stdout",
            _ => "stderr",
        };
        let ok = match redirect {
            Some(Redirect::HereStr {
                text,
                regex,
                no_newline,
            }) => {
                if *regex {
                    // A regex here-string is introduced like a regex line:
                    // its first character is the introducer.
                    let intro = text
                        .chars()
                        .next()
                        .context("empty regex here-string")?;
                    let actual = String::from_utf8_lossy(actual);
                    let lines: Vec<&str> = trimmed_lines(&actual);
                    lines.len() == 1 && regex_line_matches(text, intro, "", lines[0])?
                } else {
                    let mut expected = text.clone().into_bytes();
                    if !no_newline {
                        expected.push(b'\n');
                    }
                    actual == expected.as_slice()
                }
            }
            Some(Redirect::HereDoc { doc, .. }) => {
                if doc.regex {
                    let actual = String::from_utf8_lossy(actual);
                    regex_doc_matches(doc, &actual)?
                } else {
                    let mut expected = doc.lines.join("\n").into_bytes();
                    if !doc.no_newline && !doc.lines.is_empty() {
                        expected.push(b'\n');
                    }
                    actual == expected.as_slice()
                }
            }
            Some(Redirect::File {
                path,
                mode: FileMode::Compare,
            }) => {
                let p = self.env.cwd.join(path);
                let expected = std::fs::read(&p)
                    .with_context(|| format!("unable to read {}", p.display()))?;
                actual == expected.as_slice()
            }
            _ => true,
        };
        if !ok {
            self.last_failure = Some(format!(
                "{} mismatch: got {:?}",
                what,
                String::from_utf8_lossy(actual)
            ));
        }
        Ok(ok)
    }

    fn register_cleanups(&mut self, c: &Command) {
        for p in &c.cleanups {
            self.cleanups.push(self.env.cwd.join(p));
        }
    }

    /// Spawn a pipeline of real processes with the declared stdio wiring.
    fn run_processes(&mut self, pipe: &Pipe) -> anyhow::Result<Eval> {
        struct Running {
            child: Child,
            /// (fd, collector) for captured streams.
            caps: Vec<(usize, JoinHandle<std::io::Result<Vec<u8>>>)>,
            writer: Option<JoinHandle<std::io::Result<()>>>,
        }

        let n = pipe.commands.len();
        let mut running: Vec<Running> = Vec::with_capacity(n);
        let mut prev_stdout = None;

        for (ci, c) in pipe.commands.iter().enumerate() {
            let piped = ci + 1 < n;
            let mut cmd = OsCommand::new(&c.program);
            cmd.args(&c.args).current_dir(&self.env.cwd);

            // stdin
            let mut here_input: Option<Vec<u8>> = None;
            if ci > 0 {
                let out: std::process::ChildStdout = prev_stdout.take().expect("piped stdout");
                cmd.stdin(Stdio::from(out));
            } else {
                match &c.redirects[0] {
                    None | Some(Redirect::Null) => {
                        cmd.stdin(Stdio::null());
                    }
                    Some(Redirect::Pass) => {
                        cmd.stdin(Stdio::inherit());
                    }
                    Some(Redirect::HereStr {
                        text, no_newline, ..
                    }) => {
                        let mut b = text.clone().into_bytes();
                        if !no_newline {
                            b.push(b'\n');
                        }
                        here_input = Some(b);
                        cmd.stdin(Stdio::piped());
                    }
                    Some(Redirect::HereDoc { doc, .. }) => {
                        let mut b = doc.lines.join("\n").into_bytes();
                        if !doc.no_newline && !doc.lines.is_empty() {
                            b.push(b'\n');
                        }
                        here_input = Some(b);
                        cmd.stdin(Stdio::piped());
                    }
                    Some(Redirect::File { path, mode: FileMode::Read }) => {
                        let p = self.env.cwd.join(path);
                        let f = File::open(&p)
                            .with_context(|| format!("unable to open {}", p.display()))?;
                        cmd.stdin(Stdio::from(f));
                    }
                    Some(r) => bail!("invalid stdin redirect {:?}", r),
                }
            }

            // stdout/stderr, with merge support: the merged stream shares
            // the destination of its target.
            let merge_1_into_2 = matches!(c.redirects[1], Some(Redirect::Merge(2)));
            let merge_2_into_1 = matches!(c.redirects[2], Some(Redirect::Merge(1)));
            let mut merged_pipe: Option<std::io::PipeReader> = None;
            let mut cap_out = false;
            let mut cap_err = false;

            if piped {
                if merge_1_into_2 || merge_2_into_1 {
                    bail!("cannot merge across a pipe");
                }
                cmd.stdout(Stdio::piped());
                cap_err = wire_output(&mut cmd, 2, &c.redirects[2], &self.env.cwd)?;
            } else if merge_2_into_1 || merge_1_into_2 {
                let target: usize = if merge_2_into_1 { 1 } else { 2 };
                if capture_kind(&c.redirects[target]) {
                    // Both streams write into one pipe so the merged
                    // content is compared as a whole.
                    let (r, w) = std::io::pipe()?;
                    let w2 = w.try_clone()?;
                    cmd.stdout(Stdio::from(w));
                    cmd.stderr(Stdio::from(w2));
                    merged_pipe = Some(r);
                    if target == 1 {
                        cap_out = true;
                    } else {
                        cap_err = true;
                    }
                } else {
                    wire_merged_plain(&mut cmd, &c.redirects[target], &self.env.cwd)?;
                }
            } else {
                cap_out = wire_output(&mut cmd, 1, &c.redirects[1], &self.env.cwd)?;
                cap_err = wire_output(&mut cmd, 2, &c.redirects[2], &self.env.cwd)?;
            }

            debug!("running {}", forgeutil::shell::render(&c.program, &c.args));
            let mut child = cmd
                .spawn()
                .with_context(|| format!("unable to execute {}", c.program))?;

            // Feed here-input from a thread so a full pipe cannot deadlock
            // against our reads.
            let writer = if let Some(bytes) = here_input {
                let mut stdin = child.stdin.take().expect("piped stdin");
                Some(std::thread::spawn(move || stdin.write_all(&bytes)))
            } else {
                None
            };

            let mut caps: Vec<(usize, JoinHandle<std::io::Result<Vec<u8>>>)> = Vec::new();
            if let Some(r) = merged_pipe {
                let fd = if cap_out { 1 } else { 2 };
                caps.push((fd, spawn_reader(r)));
            } else {
                if cap_out {
                    let out = child.stdout.take().expect("piped stdout");
                    caps.push((1, spawn_reader(out)));
                }
                if cap_err {
                    let err = child.stderr.take().expect("piped stderr");
                    caps.push((2, spawn_reader(err)));
                }
            }
            if piped {
                prev_stdout = Some(child.stdout.take().expect("piped stdout"));
            }

            running.push(Running {
                child,
                caps,
                writer,
            });
        }

        // Join in order and evaluate every command's expectations.
        let mut all_ok = true;
        for (c, mut r) in pipe.commands.iter().zip(running.into_iter()) {
            let status = r
                .child
                .wait()
                .with_context(|| format!("unable to wait for {}", c.program))?;
            if let Some(w) = r.writer.take() {
                let _ = w.join();
            }

            let code = status.code().unwrap_or(-1);
            if !c.exit.holds(code) {
                self.last_failure = Some(format!(
                    "{} exited with {}, expected {} {}",
                    c.program,
                    code,
                    if c.exit.eq { "==" } else { "!=" },
                    c.exit.code
                ));
                all_ok = false;
            }

            for (fd, h) in r.caps {
                let bytes = h
                    .join()
                    .map_err(|_| anyhow::anyhow!("stream reader thread panicked"))?
                    .with_context(|| format!("unable to read output of {}", c.program))?;
                match &c.redirects[fd] {
                    Some(Redirect::Trace) => {
                        std::io::stderr().write_all(&bytes)?;
                    }
                    r @ Some(_) => {
                        if !self.check_stream(fd, &bytes, r)? {
                            all_ok = false;
                        }
                    }
                    None => {}
                }
            }
            self.register_cleanups(c);
        }

        Ok(Eval::Bool(all_ok))
    }

    /// Remove registered cleanup paths, newest first.
    fn cleanup(&mut self) {
        for p in self.cleanups.drain(..).rev() {
            let r = if p.is_dir() {
                std::fs::remove_dir(&p)
            } else {
                std::fs::remove_file(&p)
            };
            if let Err(e) = r {
                if e.kind() != std::io::ErrorKind::NotFound {
                    trace!("cleanup of {} failed: {}", p.display(), e);
                }
            }
        }
    }
}

/// Convert pass-through output redirects into trace redirects: the stream
/// is captured and echoed into the diagnostics after the command, instead
/// of being interleaved with our own output. Stdin pass stays as-is.
fn trace_passes(expr: &mut CommandExpr) {
    for (_, pipe) in &mut expr.terms {
        for c in &mut pipe.commands {
            for fd in 1..=2 {
                if matches!(c.redirects[fd], Some(Redirect::Pass)) {
                    c.redirects[fd] = Some(Redirect::Trace);
                }
            }
        }
    }
}

fn spawn_reader<R: std::io::Read + Send + 'static>(
    mut r: R,
) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        r.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

/// Whether this redirect needs the stream captured on our side.
fn capture_kind(r: &Option<Redirect>) -> bool {
    matches!(
        r,
        Some(Redirect::HereStr { .. })
            | Some(Redirect::HereDoc { .. })
            | Some(Redirect::Trace)
            | Some(Redirect::File {
                mode: FileMode::Compare,
                ..
            })
    )
}

/// Wire one output stream; returns true when it must be captured.
fn wire_output(
    cmd: &mut OsCommand,
    fd: usize,
    r: &Option<Redirect>,
    cwd: &std::path::Path,
) -> anyhow::Result<bool> {
    let stdio = match r {
        None | Some(Redirect::Null) => Stdio::null(),
        Some(Redirect::Pass) => Stdio::inherit(),
        Some(Redirect::File { path, mode }) => match mode {
            FileMode::Overwrite => Stdio::from(File::create(cwd.join(path))?),
            FileMode::Append => Stdio::from(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(cwd.join(path))?,
            ),
            FileMode::Compare => Stdio::piped(),
            FileMode::Read => bail!("read redirect on an output stream"),
        },
        Some(Redirect::HereStr { .. })
        | Some(Redirect::HereDoc { .. })
        | Some(Redirect::Trace) => Stdio::piped(),
        Some(Redirect::Merge(_)) => unreachable!("merge handled by the caller"),
    };
    let capture = capture_kind(r);
    if fd == 1 {
        cmd.stdout(stdio);
    } else {
        cmd.stderr(stdio);
    }
    Ok(capture)
}

/// Merge where the destination is not captured: null, pass, or a file.
fn wire_merged_plain(
    cmd: &mut OsCommand,
    target: &Option<Redirect>,
    cwd: &std::path::Path,
) -> anyhow::Result<()> {
    match target {
        None | Some(Redirect::Null) => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        Some(Redirect::Pass) => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        Some(Redirect::File { path, mode }) => {
            let f = match mode {
                FileMode::Overwrite => File::create(cwd.join(path))?,
                FileMode::Append => OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(cwd.join(path))?,
                _ => bail!("invalid merge destination"),
            };
            let f2 = f.try_clone()?;
            cmd.stdout(Stdio::from(f)).stderr(Stdio::from(f2));
        }
        other => bail!("invalid merge destination {:?}", other),
    }
    Ok(())
}

/// Split captured output into lines, dropping the final empty slice a
/// trailing newline produces.
fn trimmed_lines(s: &str) -> Vec<&str> {
    let mut v: Vec<&str> = s.split('\n').collect();
    if v.last() == Some(&"") {
        v.pop();
    }
    v
}

/// Match one regex line. A line starting with the introducer is a regex
/// (`/re/flags`); the introducer alone matches any line; anything else is
/// a literal.
fn regex_line_matches(
    pattern: &str,
    intro: char,
    global_flags: &str,
    actual: &str,
) -> anyhow::Result<bool> {
    if intro != '\0' && pattern.starts_with(intro) {
        let rest = &pattern[intro.len_utf8()..];
        if rest.is_empty() {
            return Ok(true); // A pure syntax line matches any single line.
        }
        let (re, line_flags) = match rest.rfind(intro) {
            Some(0) | None => (rest, ""),
            Some(close) => (&rest[..close], &rest[close + intro.len_utf8()..]),
        };
        let mut pat = String::new();
        if global_flags.contains('i') || line_flags.contains('i') {
            pat.push_str("(?i)");
        }
        pat.push_str("^(?:");
        pat.push_str(re);
        pat.push_str(")$");
        let re = regex::Regex::new(&pat)
            .with_context(|| format!("invalid regex '{}'", pattern))?;
        Ok(re.is_match(actual))
    } else {
        Ok(pattern == actual)
    }
}

/// Line-by-line regex matching of a here-document body.
fn regex_doc_matches(doc: &DocBody, actual: &str) -> anyhow::Result<bool> {
    let actual = trimmed_lines(actual);
    if actual.len() != doc.lines.len() {
        return Ok(false);
    }
    for (pat, act) in doc.lines.iter().zip(actual.iter()) {
        if !regex_line_matches(pat, doc.intro, &doc.flags, act)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(dir: &tempfile::TempDir) -> TestEnv {
        TestEnv {
            name: "testscript".to_string(),
            program: None,
            options: vec![],
            arguments: vec![],
            cwd: dir.path().to_path_buf(),
            vars: vec![],
            trace: false,
        }
    }

    fn run(text: &str, env: &TestEnv) -> anyhow::Result<Outcome> {
        crate::run_text("testscript", text, env)
    }

    #[test]
    fn conditional_selects_one_branch() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let script = "\
x = 1
if ($x == 1)
  echo ok >=ok
else
  echo bad >=bad
end
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Completed);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("ok")).unwrap(),
            "ok\n"
        );
        assert!(!dir.path().join("bad").exists());
    }

    #[test]
    fn elif_chain_and_li_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        // The failing command sits on source line 7; the diagnostic must
        // say so even though lines 2-5 were skipped.
        let script = "\
x = 2
if ($x == 1)
  echo one >=out
elif ($x == 3)
  echo three >=out
end
false
";
        let err = run(script, &env).unwrap_err();
        assert!(
            err.to_string().contains("testscript:7"),
            "diagnostic was: {}",
            err
        );
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn negated_if() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let script = "\
if! false
  echo yes >=out
end
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Completed);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out")).unwrap(),
            "yes\n"
        );
    }

    #[test]
    fn exit_builtin_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let script = "\
echo before >=a
exit 3
echo after >=b
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Exited(3));
        assert!(dir.path().join("a").exists());
        assert!(!dir.path().join("b").exists());
    }

    #[test]
    fn here_string_compare() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        assert_eq!(run("echo ok >ok\n", &env).unwrap(), Outcome::Completed);
        let err = run("echo ok >bad\n", &env).unwrap_err();
        assert!(err.to_string().contains("test command failed"));
    }

    #[test]
    fn here_doc_compare() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let script = "\
echo a b >>EOO
a b
EOO
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Completed);
    }

    #[test]
    fn variable_expansion_in_commands() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let script = "\
greeting = hello world
echo $greeting >'hello world'
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Completed);
    }

    #[test]
    fn exit_status_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        assert_eq!(run("false != 0\n", &env).unwrap(), Outcome::Completed);
        assert_eq!(run("false == 1\n", &env).unwrap(), Outcome::Completed);
        assert!(run("false\n", &env).is_err());
    }

    #[test]
    fn logical_operators_short_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        // The second command must not run.
        assert_eq!(
            run("true || echo no >=no\ntrue\n", &env).unwrap(),
            Outcome::Completed
        );
        assert!(!dir.path().join("no").exists());

        let script = "\
if false && true
  echo x >=x
end
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Completed);
        assert!(!dir.path().join("x").exists());
    }

    #[test]
    fn cleanup_registration() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let script = "\
touch data.tmp &data.tmp
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Completed);
        assert!(!dir.path().join("data.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn real_process_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let script = "\
echo one two | tr a-z A-Z >'ONE TWO'
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Completed);
    }

    #[cfg(unix)]
    #[test]
    fn stdin_here_document() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let script = "\
cat <<EOI >>EOO
alpha
beta
EOI
alpha
beta
EOO
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Completed);
    }

    #[cfg(unix)]
    #[test]
    fn regex_here_document() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let script = "\
cat <<EOI >>~/EOO/
value: 42
done
EOI
/value: [0-9]+/
done
EOO
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Completed);
    }

    #[cfg(unix)]
    #[test]
    fn merge_stderr_into_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let script = "\
sh -c 'echo out; echo err >&2' 2>&1 >>EOO
out
err
EOO
";
        assert_eq!(run(script, &env).unwrap(), Outcome::Completed);
    }

    #[test]
    fn trace_rewrites_pass_redirects() {
        let s = crate::parser::pre_parse("t", "cmd <| >| 2>|\n").unwrap();
        let mut vars = crate::vars::ScriptVars::new();
        let line = &s.lines[0];
        let mut expr = crate::parser::build_command_expr(
            &line.tokens,
            &line.here_docs,
            &mut vars,
            "t",
            line.li,
        )
        .unwrap();
        trace_passes(&mut expr);

        let c = &expr.terms[0].1.commands[0];
        // Stdin pass is left alone; both output streams trace.
        assert!(matches!(c.redirects[0], Some(Redirect::Pass)));
        assert!(matches!(c.redirects[1], Some(Redirect::Trace)));
        assert!(matches!(c.redirects[2], Some(Redirect::Trace)));
    }

    #[test]
    fn traced_builtin_output_goes_to_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = env(&dir);
        e.trace = true;
        // The pass redirect becomes a trace: the output is captured and
        // echoed on stderr, and the command still succeeds.
        assert_eq!(run("echo traced >|\n", &e).unwrap(), Outcome::Completed);
    }

    #[cfg(unix)]
    #[test]
    fn traced_process_output_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = env(&dir);
        e.trace = true;
        let script = "\
sh -c 'echo traced; echo err >&2' >| 2>|
";
        assert_eq!(run(script, &e).unwrap(), Outcome::Completed);
    }

    #[test]
    fn test_variable_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = env(&dir);
        e.program = Some(PathBuf::from("/bin/prog"));
        e.options = vec!["-v".to_string()];
        e.arguments = vec!["input".to_string()];
        let script = "\
if ($0 == /bin/prog)
  echo yes >=out
end
test.options = -q
if ($1 == -q)
  echo q >=q
end
";
        assert_eq!(run(script, &e).unwrap(), Outcome::Completed);
        assert!(dir.path().join("out").exists());
        assert!(dir.path().join("q").exists());
    }
}
