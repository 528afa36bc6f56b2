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

//! The two-pass parser.
//!
//! The pre-parse records the token stream and type of every line and
//! collects here-document bodies in input order, before anything executes.
//! The execute pass (in the runner) replays the recorded tokens; the
//! command-expression builder below is its parsing half.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context as _};

use crate::lexer::{self, Quoting, RedirectOp, Token};
use crate::syntax::{
    Command, CommandExpr, DocBody, ExitExpect, FileMode, HereDoc, Line, LineType, LogicOp, Pipe,
    Redirect, Script,
};
use crate::vars::{self, ScriptVars};

/// Tokenize and classify every line and collect here-document bodies.
pub fn pre_parse(name: &str, text: &str) -> anyhow::Result<Script> {
    let src: Vec<&str> = text.lines().collect();
    let mut lines = Vec::new();
    let mut idx = 0usize;

    while idx < src.len() {
        let li = idx + 1;
        let raw = src[idx];
        idx += 1;

        let tokens = lexer::lex_line(raw, li)?;
        if tokens.is_empty() {
            continue;
        }
        let ty = classify(&tokens, name, li)?;

        let mut here_docs = collect_here_docs(&tokens, name, li)?;
        for h in &mut here_docs {
            read_here_doc_body(&src, &mut idx, h, name, li)?;
        }

        lines.push(Line {
            li,
            ty,
            tokens,
            here_docs,
        });
    }

    Ok(Script {
        name: name.to_string(),
        lines,
    })
}

fn classify(tokens: &[Token], name: &str, li: usize) -> anyhow::Result<LineType> {
    if let Token::Word(w) = &tokens[0] {
        if w.quoting() == Quoting::None {
            let ty = match w.raw().as_str() {
                "if" => Some(LineType::If { neg: false }),
                "if!" => Some(LineType::If { neg: true }),
                "elif" => Some(LineType::Elif { neg: false }),
                "elif!" => Some(LineType::Elif { neg: true }),
                "else" => Some(LineType::Else),
                "end" => Some(LineType::End),
                _ => None,
            };
            if let Some(ty) = ty {
                match ty {
                    LineType::Else | LineType::End if tokens.len() > 1 => {
                        bail!("{}:{}: expected newline after '{}'", name, li, w.raw())
                    }
                    LineType::If { .. } | LineType::Elif { .. } if tokens.len() == 1 => {
                        bail!("{}:{}: expected condition after '{}'", name, li, w.raw())
                    }
                    _ => {}
                }
                return Ok(ty);
            }
        }
    }
    if tokens.len() >= 2
        && matches!(tokens[0], Token::Word(_))
        && matches!(tokens[1], Token::Assign | Token::Append | Token::Prepend)
    {
        return Ok(LineType::Var);
    }
    Ok(LineType::Cmd)
}

/// Scan a command line for here-document redirects and record their end
/// markers, in order. Redirects naming the same end marker share one body
/// and must agree on modifiers (and, for regex, introducer and flags).
fn collect_here_docs(tokens: &[Token], name: &str, li: usize) -> anyhow::Result<Vec<HereDoc>> {
    let mut out: Vec<HereDoc> = Vec::new();
    for (k, tok) in tokens.iter().enumerate() {
        let (op, modifiers) = match tok {
            Token::Redirect { op, modifiers, .. }
                if matches!(op, RedirectOp::InDoc | RedirectOp::OutDoc) =>
            {
                (*op, modifiers.clone())
            }
            _ => continue,
        };
        let w = match tokens.get(k + 1) {
            Some(Token::Word(w)) => w,
            _ => bail!("{}:{}: here-document end marker expected", name, li),
        };
        let lit = match w.literal() {
            Some(l) if !l.is_empty() => l,
            _ => bail!(
                "{}:{}: here-document end marker must be a literal (unquoted or \
                 single-quoted) word",
                name,
                li
            ),
        };
        let regex = modifiers.contains('~');
        if regex && op == RedirectOp::InDoc {
            bail!("{}:{}: stdin here-document cannot be a regex", name, li);
        }
        let (end, intro, flags) = if regex {
            parse_regex_marker(&lit, name, li)?
        } else {
            (lit, '\0', String::new())
        };

        if let Some(existing) = out.iter().find(|h| h.end == end) {
            if existing.modifiers != modifiers
                || existing.regex != regex
                || (regex && (existing.intro != intro || existing.flags != flags))
            {
                bail!(
                    "{}:{}: here-document redirects sharing end marker '{}' differ",
                    name,
                    li,
                    end
                );
            }
            continue;
        }
        out.push(HereDoc {
            end,
            regex,
            intro,
            flags,
            modifiers,
            body: Vec::new(),
        });
    }
    Ok(out)
}

/// Parse a regex here-document end marker of the form `/EOO/i`: the first
/// character introduces, the marker sits between introducers, global flags
/// follow.
fn parse_regex_marker(s: &str, name: &str, li: usize) -> anyhow::Result<(String, char, String)> {
    let mut chars = s.chars();
    let intro = chars
        .next()
        .with_context(|| format!("{}:{}: empty regex end marker", name, li))?;
    let rest: String = chars.collect();
    let close = rest
        .find(intro)
        .with_context(|| format!("{}:{}: no closing '{}' in regex end marker", name, li, intro))?;
    let end = rest[..close].to_string();
    if end.is_empty() {
        bail!("{}:{}: empty regex end marker", name, li);
    }
    let flags = rest[close + intro.len_utf8()..].to_string();
    Ok((end, intro, flags))
}

/// Consume body lines up to the end marker. The end-marker line may be
/// indented; its indentation becomes the strip prefix removed from each
/// body line (detected after the fact, when the marker line is seen).
fn read_here_doc_body(
    src: &[&str],
    idx: &mut usize,
    h: &mut HereDoc,
    name: &str,
    li: usize,
) -> anyhow::Result<()> {
    let mut body: Vec<String> = Vec::new();
    while *idx < src.len() {
        let bl = src[*idx];
        *idx += 1;
        if bl.trim() == h.end {
            let prefix = &bl[..bl.len() - bl.trim_start().len()];
            if !prefix.is_empty() {
                for l in &mut body {
                    if let Some(stripped) = l.strip_prefix(prefix) {
                        *l = stripped.to_string();
                    }
                }
            }
            h.body = body;
            return Ok(());
        }
        body.push(bl.to_string());
    }
    bail!(
        "{}:{}: missing here-document end marker '{}'",
        name,
        li,
        h.end
    )
}

enum Pending {
    None,
    CleanupPath,
    MergeFd(u8),
    HereStr { fd: u8, regex: bool, no_newline: bool },
    DocMarker { fd: u8 },
    FilePath { fd: u8, mode: FileMode },
    ExitCode { eq: bool },
}

/// Build an executable command expression from recorded tokens, expanding
/// variables. `here_docs` are the line's collected bodies.
pub fn build_command_expr(
    tokens: &[Token],
    here_docs: &[HereDoc],
    vars: &mut ScriptVars,
    name: &str,
    li: usize,
) -> anyhow::Result<CommandExpr> {
    // Expand literal here-document bodies once per line; regex bodies stay
    // raw for the matcher.
    let mut bodies: HashMap<String, Arc<DocBody>> = HashMap::new();
    for h in here_docs {
        let lines = if h.regex {
            h.body.clone()
        } else {
            let mut v = Vec::with_capacity(h.body.len());
            for l in &h.body {
                v.push(vars::expand_text(l, vars)?);
            }
            v
        };
        bodies.insert(
            h.end.clone(),
            Arc::new(DocBody {
                lines,
                regex: h.regex,
                intro: h.intro,
                flags: h.flags.clone(),
                no_newline: h.modifiers.contains(':'),
            }),
        );
    }
    let mut used_docs: HashSet<String> = HashSet::new();

    let mut expr = CommandExpr::default();
    let mut pipe = Pipe::default();
    let mut cmd = Command::default();
    let mut have_prog = false;
    let mut pending = Pending::None;
    // The operator joining the pipe currently being built to the previous
    // one; the first pipe's operator is never consulted.
    let mut next_op = LogicOp::And;

    let fail = |msg: &str| -> anyhow::Error { anyhow::anyhow!("{}:{}: {}", name, li, msg) };

    let set_redirect = |cmd: &mut Command, fd: u8, r: Redirect| -> anyhow::Result<()> {
        let slot = &mut cmd.redirects[fd as usize];
        if slot.is_some() {
            bail!("{}:{}: duplicate redirect for file descriptor {}", name, li, fd);
        }
        *slot = Some(r);
        Ok(())
    };

    macro_rules! finish_command {
        () => {{
            if !matches!(pending, Pending::None) {
                return Err(fail("missing redirect or cleanup operand"));
            }
            if !have_prog {
                return Err(fail("missing program name"));
            }
            if !pipe.commands.is_empty() && cmd.redirects[0].is_some() {
                return Err(fail("stdin is both piped and redirected"));
            }
            if matches!(cmd.redirects[1], Some(Redirect::Merge(_)))
                && matches!(cmd.redirects[2], Some(Redirect::Merge(_)))
            {
                return Err(fail("stdout and stderr cannot be merged into each other"));
            }
            pipe.commands.push(std::mem::take(&mut cmd));
            have_prog = false;
        }};
    }

    for tok in tokens {
        // Operand-consuming state first.
        if let Token::Word(w) = tok {
            match std::mem::replace(&mut pending, Pending::None) {
                Pending::None => {
                    let words = vars::expand_word(w, vars)?;
                    for word in words {
                        if !have_prog {
                            cmd.program = word;
                            have_prog = true;
                        } else {
                            cmd.args.push(word);
                        }
                    }
                    continue;
                }
                Pending::CleanupPath => {
                    let w = vars::expand_word(w, vars)?.join(" ");
                    cmd.cleanups.push(w);
                    continue;
                }
                Pending::MergeFd(fd) => {
                    let operand = vars::expand_word(w, vars)?.join(" ");
                    let m: u8 = operand
                        .parse()
                        .map_err(|_| fail("expected file descriptor after '>&'"))?;
                    if m != 1 && m != 2 || m == fd {
                        return Err(fail("invalid merge file descriptor"));
                    }
                    set_redirect(&mut cmd, fd, Redirect::Merge(m))?;
                    continue;
                }
                Pending::HereStr {
                    fd,
                    regex,
                    no_newline,
                } => {
                    let text = vars::expand_word(w, vars)?.join(" ");
                    set_redirect(
                        &mut cmd,
                        fd,
                        Redirect::HereStr {
                            text,
                            regex,
                            no_newline,
                        },
                    )?;
                    continue;
                }
                Pending::DocMarker { fd } => {
                    let lit = w.literal().ok_or_else(|| {
                        fail("here-document end marker must be a literal word")
                    })?;
                    // For regex documents the marker word embeds the
                    // introducer; resolve to the recorded document.
                    let end = here_docs
                        .iter()
                        .find(|h| h.end == lit || (h.regex && lit.contains(&h.end)))
                        .map(|h| h.end.clone())
                        .ok_or_else(|| fail("unknown here-document end marker"))?;
                    let doc = Arc::clone(&bodies[&end]);
                    let reference = !used_docs.insert(end);
                    set_redirect(&mut cmd, fd, Redirect::HereDoc { doc, reference })?;
                    continue;
                }
                Pending::FilePath { fd, mode } => {
                    let path = vars::expand_word(w, vars)?.join(" ");
                    set_redirect(&mut cmd, fd, Redirect::File { path, mode })?;
                    continue;
                }
                Pending::ExitCode { eq } => {
                    let operand = vars::expand_word(w, vars)?.join(" ");
                    let code: i32 = operand
                        .parse()
                        .map_err(|_| fail("expected exit status number"))?;
                    cmd.exit = ExitExpect { eq, code };
                    continue;
                }
            }
        } else if !matches!(pending, Pending::None) {
            return Err(fail("missing redirect or cleanup operand"));
        }

        match tok {
            Token::Word(_) => unreachable!("handled above"),
            Token::LParen | Token::RParen => {
                return Err(fail("unexpected parenthesis in command"));
            }
            Token::Assign | Token::Append | Token::Prepend => {
                return Err(fail("unexpected variable assignment operator"));
            }
            Token::ExitEq => pending = Pending::ExitCode { eq: true },
            Token::ExitNe => pending = Pending::ExitCode { eq: false },
            Token::Clean => pending = Pending::CleanupPath,
            Token::Pipe => {
                finish_command!();
                // The command we just finished feeds the pipe.
                let prev = pipe.commands.last().unwrap();
                if prev.redirects[1].is_some() {
                    return Err(fail("stdout is both piped and redirected"));
                }
            }
            Token::LogAnd | Token::LogOr => {
                finish_command!();
                expr.terms.push((next_op, std::mem::take(&mut pipe)));
                next_op = if matches!(tok, Token::LogAnd) {
                    LogicOp::And
                } else {
                    LogicOp::Or
                };
            }
            Token::Redirect { fd, op, modifiers } => {
                let regex = modifiers.contains('~');
                let no_newline = modifiers.contains(':');
                if regex && op.is_input() {
                    return Err(fail("stdin redirect cannot be a regex"));
                }
                let fd = fd.unwrap_or(if op.is_input() { 0 } else { 1 });
                match op {
                    RedirectOp::InNull => set_redirect(&mut cmd, 0, Redirect::Null)?,
                    RedirectOp::InPass => set_redirect(&mut cmd, 0, Redirect::Pass)?,
                    RedirectOp::OutNull => set_redirect(&mut cmd, fd, Redirect::Null)?,
                    RedirectOp::OutPass => set_redirect(&mut cmd, fd, Redirect::Pass)?,
                    RedirectOp::InStr => {
                        pending = Pending::HereStr {
                            fd: 0,
                            regex: false,
                            no_newline,
                        }
                    }
                    RedirectOp::OutStr => {
                        pending = Pending::HereStr {
                            fd,
                            regex,
                            no_newline,
                        }
                    }
                    RedirectOp::InDoc => pending = Pending::DocMarker { fd: 0 },
                    RedirectOp::OutDoc => pending = Pending::DocMarker { fd },
                    RedirectOp::InFile => {
                        pending = Pending::FilePath {
                            fd: 0,
                            mode: FileMode::Read,
                        }
                    }
                    RedirectOp::OutFileCmp => {
                        pending = Pending::FilePath {
                            fd,
                            mode: FileMode::Compare,
                        }
                    }
                    RedirectOp::OutFileOvr => {
                        pending = Pending::FilePath {
                            fd,
                            mode: FileMode::Overwrite,
                        }
                    }
                    RedirectOp::OutFileApp => {
                        pending = Pending::FilePath {
                            fd,
                            mode: FileMode::Append,
                        }
                    }
                    RedirectOp::OutMerge => pending = Pending::MergeFd(fd),
                }
            }
        }
    }

    finish_command!();
    expr.terms.push((next_op, std::mem::take(&mut pipe)));

    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_parse_classifies_lines() {
        let text = "\
x = 1
if ($x == 1)
  echo yes
else
  echo no
end
";
        let s = pre_parse("t", text).unwrap();
        let tys: Vec<LineType> = s.lines.iter().map(|l| l.ty).collect();
        assert_eq!(
            tys,
            vec![
                LineType::Var,
                LineType::If { neg: false },
                LineType::Cmd,
                LineType::Else,
                LineType::Cmd,
                LineType::End
            ]
        );
        // Line indices are the source ones.
        assert_eq!(s.lines.iter().map(|l| l.li).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn here_doc_collection_in_order() {
        let text = "\
cmd <<EOI >>EOO
input line
EOI
output line
EOO
";
        let s = pre_parse("t", text).unwrap();
        assert_eq!(s.lines.len(), 1);
        let hd = &s.lines[0].here_docs;
        assert_eq!(hd.len(), 2);
        assert_eq!(hd[0].end, "EOI");
        assert_eq!(hd[0].body, vec!["input line"]);
        assert_eq!(hd[1].end, "EOO");
        assert_eq!(hd[1].body, vec!["output line"]);
    }

    #[test]
    fn here_doc_sharing_single_body() {
        let text = "\
cmd >>EOO 2>>EOO
both streams
EOO
";
        let s = pre_parse("t", text).unwrap();
        // Two redirects, one recorded body.
        assert_eq!(s.lines[0].here_docs.len(), 1);
        assert_eq!(s.lines[0].here_docs[0].body, vec!["both streams"]);

        let mut vars = ScriptVars::new();
        let line = &s.lines[0];
        let expr =
            build_command_expr(&line.tokens, &line.here_docs, &mut vars, "t", line.li).unwrap();
        let c = &expr.terms[0].1.commands[0];
        match (&c.redirects[1], &c.redirects[2]) {
            (
                Some(Redirect::HereDoc {
                    reference: false, ..
                }),
                Some(Redirect::HereDoc {
                    reference: true,
                    doc,
                }),
            ) => {
                assert_eq!(doc.lines, vec!["both streams"]);
            }
            other => panic!("unexpected redirects: {:?}", other),
        }
    }

    #[test]
    fn here_doc_sharing_requires_same_modifiers() {
        let text = "\
cmd >>:EOO 2>>EOO
x
EOO
";
        let err = pre_parse("t", text).unwrap_err();
        assert!(err.to_string().contains("sharing end marker"));
    }

    #[test]
    fn here_doc_strip_prefix() {
        let text = "\
cmd <<EOI
  indented
    more
  EOI
";
        let s = pre_parse("t", text).unwrap();
        assert_eq!(s.lines[0].here_docs[0].body, vec!["indented", "  more"]);
    }

    #[test]
    fn missing_end_marker() {
        let err = pre_parse("t", "cmd <<EOI\nbody\n").unwrap_err();
        assert!(err.to_string().contains("missing here-document end marker"));
    }

    #[test]
    fn regex_marker() {
        let (end, intro, flags) = parse_regex_marker("/EOO/i", "t", 1).unwrap();
        assert_eq!((end.as_str(), intro, flags.as_str()), ("EOO", '/', "i"));
        assert!(parse_regex_marker("/EOO", "t", 1).is_err());
    }

    #[test]
    fn expr_with_pipes_and_logic() {
        let s = pre_parse("t", "a b | c && d || e != 4\n").unwrap();
        let mut vars = ScriptVars::new();
        let line = &s.lines[0];
        let expr =
            build_command_expr(&line.tokens, &line.here_docs, &mut vars, "t", line.li).unwrap();

        assert_eq!(expr.terms.len(), 3);
        assert_eq!(expr.terms[0].1.commands.len(), 2);
        assert_eq!(expr.terms[0].1.commands[0].program, "a");
        assert_eq!(expr.terms[0].1.commands[0].args, vec!["b"]);
        assert_eq!(expr.terms[1].0, LogicOp::And);
        assert_eq!(expr.terms[2].0, LogicOp::Or);
        assert_eq!(expr.terms[2].1.commands[0].exit, ExitExpect { eq: false, code: 4 });
    }

    #[test]
    fn stdin_pipe_conflict() {
        let s = pre_parse("t", "a | b < x\n").unwrap();
        let mut vars = ScriptVars::new();
        let line = &s.lines[0];
        let err = build_command_expr(&line.tokens, &line.here_docs, &mut vars, "t", line.li)
            .unwrap_err();
        assert!(err.to_string().contains("stdin is both piped and redirected"));
    }

    #[test]
    fn merge_conflict() {
        let s = pre_parse("t", "a >&2 2>&1\n").unwrap();
        let mut vars = ScriptVars::new();
        let line = &s.lines[0];
        let err = build_command_expr(&line.tokens, &line.here_docs, &mut vars, "t", line.li)
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("stdout and stderr cannot be merged into each other"));
    }
}
