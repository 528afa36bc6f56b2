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

//! Parsing of compiler dependency output and the include prefix map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::bail;
use tracing::{debug, trace};

/// Return the next prerequisite from a make dependency declaration line,
/// advancing `pos` past it (and past trailing spaces and a final line
/// continuation). Escape processing: `$$` is `$`, `\\` is `\`, `\ ` is a
/// space; a lone backslash stands for itself. Returns an empty string when
/// the line is exhausted.
pub fn next_make(l: &str, pos: &mut usize) -> String {
    let b = l.as_bytes();
    let n = b.len();
    let mut p = *pos;

    while p < n && b[p] == b' ' {
        p += 1;
    }

    let mut r: Vec<u8> = Vec::new();
    while p < n && b[p] != b' ' {
        let mut c = b[p];
        if p + 1 < n {
            if c == b'$' {
                // Got to be another (escaped) '$'.
                if b[p + 1] == b'$' {
                    p += 1;
                }
            } else if c == b'\\' {
                // May or may not be an escape sequence depending on whether
                // what follows is escapable.
                p += 1;
                c = b[p];
                match c {
                    b'\\' | b' ' => {}
                    _ => {
                        c = b'\\';
                        p -= 1;
                    }
                }
            }
        }
        r.push(c);
        p += 1;
    }

    while p < n && b[p] == b' ' {
        p += 1;
    }

    // Skip the final line continuation.
    if p + 1 == n && b[p] == b'\\' {
        p += 1;
    }

    *pos = p;
    String::from_utf8_lossy(&r).into_owned()
}

/// One parsed line of MSVC `/showIncludes` output.
#[derive(Debug, PartialEq, Eq)]
pub enum ShowInclude {
    /// `Note: including file: <path>` (the note text can be translated; the
    /// path is taken from the end of the line).
    Note(String),
    /// A C1083 missing-include error naming the header that does not exist
    /// yet. The compiler will exit non-zero and that status is expected.
    Missing(String),
    /// Some other diagnostic: the caller reports it and fails.
    Other,
}

/// Parse a `/showIncludes` line. An error line is recognized by the
/// ` CNNNN:` pattern (a space, `C`, four digits, a colon), which holds up
/// against translated note text.
pub fn next_show(l: &str) -> anyhow::Result<ShowInclude> {
    let b = l.as_bytes();
    let n = b.len();

    let mut err_pos = None;
    let mut p = 0usize;
    while let Some(i) = l[p..].find(':').map(|i| i + p) {
        if i > 5
            && b[i - 6] == b' '
            && b[i - 5] == b'C'
            && b[i - 4].is_ascii_digit()
            && b[i - 3].is_ascii_digit()
            && b[i - 2].is_ascii_digit()
            && b[i - 1].is_ascii_digit()
        {
            err_pos = Some(i - 4);
            break;
        }
        p = i + 1;
        if p >= n {
            break;
        }
    }

    match err_pos {
        None => {
            // An include note. The path is at the end; watch out for the
            // colon of a Windows drive letter.
            let mut p = l.rfind(':');
            if let Some(i) = p {
                let is_drive = i > 1
                    && i + 1 < n
                    && b[i - 2] == b' '
                    && b[i - 1].is_ascii_alphabetic()
                    && (b[i + 1] == b'/' || b[i + 1] == b'\\');
                if is_drive {
                    p = l[..i - 2].rfind(':');
                }
            }
            // The nesting depth shows up as indentation after the colon.
            let start = p.and_then(|i| {
                l[i + 1..]
                    .find(|c| c != ' ')
                    .map(|off| i + 1 + off)
            });
            match start {
                Some(s) => Ok(ShowInclude::Note(l[s..].to_string())),
                None => bail!("unable to parse /showIncludes include note line"),
            }
        }
        Some(i) if l[i..].starts_with("1083") => {
            // The missing path is conveniently quoted with ''.
            let p2 = l.rfind('\'');
            if let Some(p2) = p2 {
                if p2 != 0 {
                    if let Some(p1) = l[..p2].rfind('\'') {
                        return Ok(ShowInclude::Missing(l[p1 + 1..p2].to_string()));
                    }
                }
            }
            bail!("unable to parse /showIncludes include error line")
        }
        Some(_) => Ok(ShowInclude::Other),
    }
}

/// Mapping of include prefixes (`foo` in `<foo/bar>`) for auto-generated
/// headers to the directories their `-I` options point at: the entry for
/// prefix `P` gives a base `D` such that `P/<rest>` resolves to
/// `D/P/<rest>`.
pub type PrefixMap = BTreeMap<PathBuf, PathBuf>;

/// Harvest `-I` (or `/I`) entries from an option list into the prefix map.
/// Only absolute directories inside the project out-tree can hold
/// generated headers; everything else is ignored. A later option overrides
/// an earlier mapping for the same prefix, matching option order.
pub fn append_prefixes(
    m: &mut PrefixMap,
    options: &[String],
    out_base: &Path,
    out_root: &Path,
) {
    let mut it = options.iter();
    while let Some(o) = it.next() {
        let bytes = o.as_bytes();
        if bytes.len() < 2 || (bytes[0] != b'-' && bytes[0] != b'/') || bytes[1] != b'I' {
            continue;
        }
        let d = if o.len() == 2 {
            match it.next() {
                Some(next) => PathBuf::from(next),
                None => break, // Let the compiler complain.
            }
        } else {
            PathBuf::from(&o[2..])
        };
        trace!("-I '{}'", d.display());

        // If we are relative or not inside the project out-tree, ignore.
        if d.is_relative() || !d.starts_with(out_root) {
            continue;
        }

        // If the target directory is under the include directory, the
        // prefix is the difference between the two; otherwise it is empty.
        // This makes the canonical setup work: includes written with a
        // prefix (<foo/bar>), the target living in the foo/ subdirectory,
        // and -I pointing at its parent.
        let p = out_base
            .strip_prefix(&d)
            .map(Path::to_path_buf)
            .unwrap_or_default();

        match m.get_mut(&p) {
            Some(existing) if *existing != d => {
                debug!(
                    "overriding dependency prefix '{}': '{}' -> '{}'",
                    p.display(),
                    existing.display(),
                    d.display()
                );
                *existing = d;
            }
            Some(_) => {}
            None => {
                trace!("prefix '{}' = '{}'", p.display(), d.display());
                m.insert(p, d);
            }
        }
    }
}

/// Find the base directory for the most qualified prefix that is an
/// ancestor of `dir` (the empty prefix matching everything).
pub fn find_prefix<'a>(m: &'a PrefixMap, dir: &Path) -> Option<&'a PathBuf> {
    let mut cur = Some(dir);
    while let Some(d) = cur {
        if let Some(v) = m.get(d) {
            return Some(v);
        }
        cur = d.parent();
    }
    None
}
