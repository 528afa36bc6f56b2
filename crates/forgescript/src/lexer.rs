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

//! The line-oriented lexer.
//!
//! Operators are recognized at token start only, so `a=b` is one word
//! while a lone `=` is an assignment. Redirect operators take an optional
//! leading file descriptor (`2>`) and an optional modifier suffix
//! (`:` suppress trailing newline, `~` regex, `/` portable path).

use anyhow::bail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quote {
    None,
    Single,
    Double,
}

/// One quoting segment of a word. Single-quoted segments are immune to
/// variable expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct Seg {
    pub text: String,
    pub quote: Quote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub segs: Vec<Seg>,
}

/// Overall quoting of a word, for validation of here-document end markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quoting {
    None,
    Single,
    Double,
    Mixed,
}

impl Word {
    pub fn raw(&self) -> String {
        self.segs.iter().map(|s| s.text.as_str()).collect()
    }

    pub fn quoting(&self) -> Quoting {
        let mut q = None;
        for s in &self.segs {
            let sq = match s.quote {
                Quote::None => Quoting::None,
                Quote::Single => Quoting::Single,
                Quote::Double => Quoting::Double,
            };
            q = match q {
                None => Some(sq),
                Some(prev) if prev == sq => Some(prev),
                Some(_) => return Quoting::Mixed,
            };
        }
        q.unwrap_or(Quoting::None)
    }

    /// Whether this word may serve as a here-document end marker: a single
    /// literal segment, unquoted (without expansions) or fully
    /// single-quoted.
    pub fn literal(&self) -> Option<String> {
        if self.segs.len() != 1 {
            return None;
        }
        let s = &self.segs[0];
        match s.quote {
            Quote::Single => Some(s.text.clone()),
            Quote::None if !s.text.contains('$') => Some(s.text.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOp {
    InNull,  // <!
    InPass,  // <|
    InStr,   // <
    InDoc,   // <<
    InFile,  // <=  (also <<<)
    OutNull, // >!
    OutPass, // >|
    OutStr,  // >
    OutDoc,  // >>
    OutFileCmp, // >>>
    OutFileOvr, // >=
    OutFileApp, // >+
    OutMerge,   // >&
}

impl RedirectOp {
    pub fn is_input(self) -> bool {
        matches!(
            self,
            RedirectOp::InNull
                | RedirectOp::InPass
                | RedirectOp::InStr
                | RedirectOp::InDoc
                | RedirectOp::InFile
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Word(Word),
    LParen,
    RParen,
    Pipe,
    LogAnd,
    LogOr,
    Clean,
    Assign,  // =
    Append,  // +=
    Prepend, // =+
    ExitEq,  // ==
    ExitNe,  // !=
    Redirect {
        fd: Option<u8>,
        op: RedirectOp,
        modifiers: String,
    },
}

const MODIFIER_CHARS: &str = ":~/";

/// Tokenize one script line. `li` is the 1-based line number used in
/// diagnostics.
pub fn lex_line(line: &str, li: usize) -> anyhow::Result<Vec<Token>> {
    let chars: Vec<char> = line.chars().collect();
    let n = chars.len();
    let mut i = 0usize;
    let mut tokens = Vec::new();

    while i < n {
        let c = chars[i];
        if c == ' ' || c == '\t' {
            i += 1;
            continue;
        }
        if c == '#' {
            break;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::LogOr);
                    i += 2;
                } else {
                    tokens.push(Token::Pipe);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::LogAnd);
                    i += 2;
                } else {
                    tokens.push(Token::Clean);
                    i += 1;
                }
            }
            '=' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::ExitEq);
                    i += 2;
                }
                Some('+') => {
                    tokens.push(Token::Prepend);
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Assign);
                    i += 1;
                }
            },
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::ExitNe);
                i += 2;
            }
            '+' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Append);
                i += 2;
            }
            '<' | '>' => {
                let tok = lex_redirect(&chars, &mut i, None, li)?;
                tokens.push(tok);
            }
            '0'..='9' => {
                // A possible file descriptor prefix: digits immediately
                // followed by a redirect operator.
                let mut j = i;
                while j < n && chars[j].is_ascii_digit() {
                    j += 1;
                }
                if j < n && (chars[j] == '<' || chars[j] == '>') {
                    let fd_str: String = chars[i..j].iter().collect();
                    let fd: u8 = match fd_str.parse() {
                        Ok(fd @ 0..=2) => fd,
                        _ => bail!("line {}: invalid file descriptor `{}`", li, fd_str),
                    };
                    i = j;
                    let tok = lex_redirect(&chars, &mut i, Some(fd), li)?;
                    tokens.push(tok);
                } else {
                    tokens.push(lex_word(&chars, &mut i, li)?);
                }
            }
            _ => {
                tokens.push(lex_word(&chars, &mut i, li)?);
            }
        }
    }
    Ok(tokens)
}

fn lex_redirect(
    chars: &[char],
    i: &mut usize,
    fd: Option<u8>,
    li: usize,
) -> anyhow::Result<Token> {
    const OPS: &[(&str, RedirectOp)] = &[
        ("<<<", RedirectOp::InFile),
        ("<<", RedirectOp::InDoc),
        ("<=", RedirectOp::InFile),
        ("<!", RedirectOp::InNull),
        ("<|", RedirectOp::InPass),
        ("<", RedirectOp::InStr),
        (">>>", RedirectOp::OutFileCmp),
        (">>", RedirectOp::OutDoc),
        (">=", RedirectOp::OutFileOvr),
        (">+", RedirectOp::OutFileApp),
        (">&", RedirectOp::OutMerge),
        (">!", RedirectOp::OutNull),
        (">|", RedirectOp::OutPass),
        (">", RedirectOp::OutStr),
    ];

    let rest: String = chars[*i..].iter().collect();
    let (pat, op) = OPS
        .iter()
        .find(|(pat, _)| rest.starts_with(pat))
        .expect("called on '<' or '>'");
    *i += pat.chars().count();

    let mut modifiers = String::new();
    while *i < chars.len() && MODIFIER_CHARS.contains(chars[*i]) {
        modifiers.push(chars[*i]);
        *i += 1;
    }

    if let Some(fd) = fd {
        if op.is_input() && fd != 0 {
            bail!("line {}: stdin redirect with file descriptor {}", li, fd);
        }
        if !op.is_input() && fd == 0 {
            bail!("line {}: output redirect with file descriptor 0", li);
        }
    }

    Ok(Token::Redirect {
        fd,
        op: *op,
        modifiers,
    })
}

fn lex_word(chars: &[char], i: &mut usize, li: usize) -> anyhow::Result<Token> {
    let n = chars.len();
    let mut segs: Vec<Seg> = Vec::new();
    let mut cur = String::new();

    let flush = |cur: &mut String, segs: &mut Vec<Seg>| {
        if !cur.is_empty() {
            segs.push(Seg {
                text: std::mem::take(cur),
                quote: Quote::None,
            });
        }
    };

    while *i < n {
        let c = chars[*i];
        match c {
            ' ' | '\t' | '<' | '>' | '|' | '&' | '(' | ')' | '#' => break,
            '\'' => {
                flush(&mut cur, &mut segs);
                *i += 1;
                let start = *i;
                while *i < n && chars[*i] != '\'' {
                    *i += 1;
                }
                if *i >= n {
                    bail!("line {}: unterminated single-quoted string", li);
                }
                segs.push(Seg {
                    text: chars[start..*i].iter().collect(),
                    quote: Quote::Single,
                });
                *i += 1;
            }
            '"' => {
                flush(&mut cur, &mut segs);
                *i += 1;
                let start = *i;
                while *i < n && chars[*i] != '"' {
                    *i += 1;
                }
                if *i >= n {
                    bail!("line {}: unterminated double-quoted string", li);
                }
                segs.push(Seg {
                    text: chars[start..*i].iter().collect(),
                    quote: Quote::Double,
                });
                *i += 1;
            }
            _ => {
                cur.push(c);
                *i += 1;
            }
        }
    }
    flush(&mut cur, &mut segs);

    if segs.is_empty() {
        // An empty quoted word ('' or "") lands here with no segments.
        segs.push(Seg {
            text: String::new(),
            quote: Quote::None,
        });
    }
    Ok(Token::Word(Word { segs }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(tokens: &[Token]) -> Vec<String> {
        tokens
            .iter()
            .filter_map(|t| match t {
                Token::Word(w) => Some(w.raw()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn basic_command() {
        let ts = lex_line("echo hello world", 1).unwrap();
        assert_eq!(ts.len(), 3);
        assert_eq!(words(&ts), vec!["echo", "hello", "world"]);
    }

    #[test]
    fn operators() {
        let ts = lex_line("a | b && c || d", 1).unwrap();
        assert!(matches!(ts[1], Token::Pipe));
        assert!(matches!(ts[3], Token::LogAnd));
        assert!(matches!(ts[5], Token::LogOr));
    }

    #[test]
    fn variable_ops() {
        let ts = lex_line("x = 1", 1).unwrap();
        assert!(matches!(ts[1], Token::Assign));
        let ts = lex_line("x += 2", 1).unwrap();
        assert!(matches!(ts[1], Token::Append));
        let ts = lex_line("x =+ 3", 1).unwrap();
        assert!(matches!(ts[1], Token::Prepend));
        // '=' embedded in a word stays a word.
        let ts = lex_line("run a=b", 1).unwrap();
        assert_eq!(words(&ts), vec!["run", "a=b"]);
    }

    #[test]
    fn redirects_with_fd_and_modifiers() {
        let ts = lex_line("cmd 2>>EOE", 1).unwrap();
        assert_eq!(
            ts[1],
            Token::Redirect {
                fd: Some(2),
                op: RedirectOp::OutDoc,
                modifiers: String::new()
            }
        );

        let ts = lex_line("cmd >>~ x", 1).unwrap();
        assert_eq!(
            ts[1],
            Token::Redirect {
                fd: None,
                op: RedirectOp::OutDoc,
                modifiers: "~".to_string()
            }
        );

        let ts = lex_line("cmd >:'ok'", 1).unwrap();
        match &ts[1] {
            Token::Redirect { op, modifiers, .. } => {
                assert_eq!(*op, RedirectOp::OutStr);
                assert_eq!(modifiers, ":");
            }
            _ => panic!("expected redirect"),
        }
        assert_eq!(words(&ts), vec!["cmd", "ok"]);
    }

    #[test]
    fn merge_redirect() {
        let ts = lex_line("cmd 2>&1", 1).unwrap();
        assert_eq!(
            ts[1],
            Token::Redirect {
                fd: Some(2),
                op: RedirectOp::OutMerge,
                modifiers: String::new()
            }
        );
        assert_eq!(words(&ts), vec!["cmd", "1"]);
    }

    #[test]
    fn invalid_fd() {
        assert!(lex_line("cmd 3> x", 1).is_err());
        assert!(lex_line("cmd 1< x", 1).is_err());
    }

    #[test]
    fn quoting() {
        let ts = lex_line(r#"echo 'a b'"c d"e"#, 1).unwrap();
        let w = match &ts[1] {
            Token::Word(w) => w,
            _ => panic!(),
        };
        assert_eq!(w.raw(), "a bc de");
        assert_eq!(w.quoting(), Quoting::Mixed);
        assert_eq!(w.segs.len(), 3);

        let ts = lex_line("echo '$x'", 1).unwrap();
        let w = match &ts[1] {
            Token::Word(w) => w,
            _ => panic!(),
        };
        assert_eq!(w.quoting(), Quoting::Single);
        assert_eq!(w.literal(), Some("$x".to_string()));

        let ts = lex_line("echo $x", 1).unwrap();
        let w = match &ts[1] {
            Token::Word(w) => w,
            _ => panic!(),
        };
        assert_eq!(w.literal(), None);
    }

    #[test]
    fn file_descriptor_vs_number_word() {
        let ts = lex_line("exit 1", 1).unwrap();
        assert_eq!(words(&ts), vec!["exit", "1"]);
    }

    #[test]
    fn comment() {
        let ts = lex_line("echo hi # trailing", 1).unwrap();
        assert_eq!(words(&ts), vec!["echo", "hi"]);
    }
}
