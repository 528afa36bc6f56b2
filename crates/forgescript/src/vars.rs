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

//! Script variables and expansion.
//!
//! `$*` and `$N` are synthesized from `test`, `test.options`, and
//! `test.arguments`: assigning to any of the three resets the cached `$*`,
//! which is lazily recomputed on the next read; `$N` indexes into the same
//! cache.

use anyhow::bail;
use indexmap::IndexMap;

use crate::lexer::{Quote, Word};

pub struct ScriptVars {
    map: IndexMap<String, Vec<String>>,
    star: Option<Vec<String>>,
}

const STAR_SOURCES: [&str; 3] = ["test", "test.options", "test.arguments"];

impl ScriptVars {
    pub fn new() -> ScriptVars {
        ScriptVars {
            map: IndexMap::new(),
            star: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Vec<String>> {
        self.map.get(name)
    }

    pub fn assign(&mut self, name: &str, words: Vec<String>) {
        if STAR_SOURCES.contains(&name) {
            self.star = None;
        }
        self.map.insert(name.to_string(), words);
    }

    pub fn append(&mut self, name: &str, words: Vec<String>) {
        if STAR_SOURCES.contains(&name) {
            self.star = None;
        }
        self.map.entry(name.to_string()).or_default().extend(words);
    }

    pub fn prepend(&mut self, name: &str, mut words: Vec<String>) {
        if STAR_SOURCES.contains(&name) {
            self.star = None;
        }
        let entry = self.map.entry(name.to_string()).or_default();
        words.extend(entry.drain(..));
        *entry = words;
    }

    /// The synthesized `$*`: the test program followed by its options and
    /// arguments, recomputed lazily after any of the sources changed.
    pub fn star(&mut self) -> &[String] {
        if self.star.is_none() {
            let mut v = Vec::new();
            for src in STAR_SOURCES {
                if let Some(words) = self.map.get(src) {
                    v.extend(words.iter().cloned());
                }
            }
            self.star = Some(v);
        }
        self.star.as_deref().unwrap()
    }

    fn lookup(&mut self, name: &str) -> anyhow::Result<Vec<String>> {
        if name == "*" {
            return Ok(self.star().to_vec());
        }
        if name.chars().all(|c| c.is_ascii_digit()) {
            let n: usize = name.parse().unwrap();
            let star = self.star();
            return Ok(star.get(n).map(|s| vec![s.clone()]).unwrap_or_default());
        }
        match self.map.get(name) {
            Some(v) => Ok(v.clone()),
            None => bail!("undefined variable '{}'", name),
        }
    }
}

impl Default for ScriptVars {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand `$name`, `$N`, and `$*` references in a text fragment. List
/// values are joined with single spaces.
pub fn expand_text(s: &str, vars: &mut ScriptVars) -> anyhow::Result<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::new();
    let mut i = 0usize;
    while i < chars.len() {
        if chars[i] != '$' || i + 1 >= chars.len() {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let start = i + 1;
        let name: String = if chars[start] == '*' {
            i = start + 1;
            "*".to_string()
        } else {
            let mut j = start;
            while j < chars.len()
                && (chars[j].is_ascii_alphanumeric() || chars[j] == '_' || chars[j] == '.')
            {
                j += 1;
            }
            if j == start {
                out.push('$');
                i += 1;
                continue;
            }
            // A trailing dot belongs to the surrounding text, not the name.
            let mut j2 = j;
            while j2 > start && chars[j2 - 1] == '.' {
                j2 -= 1;
            }
            if j2 == start {
                out.push('$');
                i = start;
                continue;
            }
            i = j2;
            chars[start..j2].iter().collect()
        };
        let words = vars.lookup(&name)?;
        out.push_str(&words.join(" "));
    }
    Ok(out)
}

/// Expand a word into command-line words. A bare unquoted `$*` expands
/// into multiple words; anything else stays a single word with list
/// values joined.
pub fn expand_word(w: &Word, vars: &mut ScriptVars) -> anyhow::Result<Vec<String>> {
    if w.segs.len() == 1 && w.segs[0].quote == Quote::None && w.segs[0].text == "$*" {
        return Ok(vars.star().to_vec());
    }
    let mut out = String::new();
    for seg in &w.segs {
        match seg.quote {
            Quote::Single => out.push_str(&seg.text),
            Quote::None | Quote::Double => out.push_str(&expand_text(&seg.text, vars)?),
        }
    }
    Ok(vec![out])
}
