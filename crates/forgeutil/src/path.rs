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

//! Lexical path manipulation on top of `std::path`.
//!
//! Target identity is path-based, so every directory stored in a target key
//! must be in normalized form: no `.` components and no internal `..`.

use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::bail;

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component where one exists.
pub fn normalize(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                // Only fold into a real component; keep a leading `..`.
                let fold = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if fold {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            c => out.push(c.as_os_str()),
        }
    }
    out
}

/// True if `p` equals `dir` or lies inside it. Both sides are compared
/// lexically and are expected to be normalized.
pub fn sub(p: &Path, dir: &Path) -> bool {
    p.starts_with(dir)
}

/// Make `p` absolute against `base` (which must be absolute), normalizing
/// the result.
pub fn absolute(p: &Path, base: &Path) -> PathBuf {
    debug_assert!(base.is_absolute());
    if p.is_absolute() {
        normalize(p)
    } else {
        normalize(&base.join(p))
    }
}

/// Resolve symlinks in an existing path (realpath semantics). For a path
/// that does not exist yet, fall back to making it absolute lexically: the
/// callers that hit this case are naming files about to be created.
pub fn realize(p: &Path) -> io::Result<PathBuf> {
    match dunce::canonicalize(p) {
        Ok(r) => Ok(r),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Ok(absolute(p, &std::env::current_dir()?))
        }
        Err(e) => Err(e),
    }
}

/// Split a file path into its directory part, the name without extension,
/// and the extension. A name like `lib.hxx` splits into (`lib`, `hxx`);
/// a name with no dot yields an empty extension.
pub fn split_name(p: &Path) -> anyhow::Result<(PathBuf, String, String)> {
    let dir = p.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
    let leaf = match p.file_name().and_then(|n| n.to_str()) {
        Some(l) => l,
        None => bail!("invalid file path `{}`", p.display()),
    };
    match leaf.rsplit_once('.') {
        // A leading dot is part of the name, not an extension separator.
        Some((base, ext)) if !base.is_empty() => Ok((dir, base.to_string(), ext.to_string())),
        _ => Ok((dir, leaf.to_string(), String::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_dots() {
        assert_eq!(normalize(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize(Path::new("./x")), PathBuf::from("x"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(normalize(Path::new("/a/b/../../c")), PathBuf::from("/c"));
    }

    #[test]
    fn sub_is_lexical() {
        assert!(sub(Path::new("/a/b/c"), Path::new("/a/b")));
        assert!(sub(Path::new("/a/b"), Path::new("/a/b")));
        assert!(!sub(Path::new("/a/bc"), Path::new("/a/b")));
    }

    #[test]
    fn split_name_cases() {
        let (d, n, e) = split_name(Path::new("src/lib.hxx")).unwrap();
        assert_eq!((d, n, e), (PathBuf::from("src"), "lib".into(), "hxx".into()));

        let (_, n, e) = split_name(Path::new("Makefile")).unwrap();
        assert_eq!((n.as_str(), e.as_str()), ("Makefile", ""));

        let (_, n, e) = split_name(Path::new(".gitignore")).unwrap();
        assert_eq!((n.as_str(), e.as_str()), (".gitignore", ""));
    }
}
