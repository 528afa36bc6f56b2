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

//! Shared helpers for the end-to-end tests: a scratch project directory
//! and a minimal stand-in compiler (a shell script) so the tests do not
//! depend on a real toolchain.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use forgebuild::{manifest, BuildContext, Summary, Target};

/// The stand-in compiler. It understands three invocation shapes:
/// `-M -MG -MQ ^ ... src` emits make-style dependency output (scanning
/// `#include` lines transitively, emitting unresolvable includes as
/// relative paths the way `-MG` does), `-c -o out src` "compiles" by
/// copying, and anything else "links" by concatenation.
const FAKE_CC: &str = r#"#!/bin/sh
M=0; out=""; src=""; incs=""; compile=0; inputs=""
while [ $# -gt 0 ]; do
  case "$1" in
    -M|-MG) M=1 ;;
    -MQ) shift ;;
    -I) shift; incs="$incs $1" ;;
    -I*) incs="$incs ${1#-I}" ;;
    -o) shift; out="$1" ;;
    -c) compile=1 ;;
    -*) ;;
    *) src="$1"; inputs="$inputs $1" ;;
  esac
  shift
done

resolve() {
  d=$(dirname "$2")
  if [ -f "$d/$1" ]; then echo "$d/$1"; return 0; fi
  for i in $incs; do
    if [ -f "$i/$1" ]; then echo "$i/$1"; return 0; fi
  done
  return 1
}

abs() { echo "$(cd "$(dirname "$1")" && pwd)/$(basename "$1")"; }

if [ "$M" = 1 ]; then
  queue=$(mktemp); seen=$(mktemp)
  echo "$src" > "$queue"
  printf '^: %s' "$src"
  while [ -s "$queue" ]; do
    f=$(head -n 1 "$queue")
    tail -n +2 "$queue" > "$queue.n" && mv "$queue.n" "$queue"
    [ -f "$f" ] || continue
    for inc in $(sed -n 's/^#include [<"]\([^">]*\)[">].*$/\1/p' "$f"); do
      if r=$(resolve "$inc" "$f"); then
        r=$(abs "$r")
        if ! grep -qx "$r" "$seen"; then
          echo "$r" >> "$seen"
          printf ' %s' "$r"
          echo "$r" >> "$queue"
        fi
      else
        if ! grep -qx "$inc" "$seen"; then
          echo "$inc" >> "$seen"
          printf ' %s' "$inc"
        fi
      fi
    done
  done
  printf '\n'
  rm -f "$queue" "$seen"
  exit 0
fi

if [ "$compile" = 1 ]; then
  cat "$src" > "$out"
  exit 0
fi

: > "$out"
for i in $inputs; do cat "$i" >> "$out"; done
chmod +x "$out"
exit 0
"#;

pub struct TestProject {
    // Held for its Drop.
    _dir: tempfile::TempDir,
    pub root: PathBuf,
}

impl TestProject {
    pub fn new() -> TestProject {
        let dir = tempfile::tempdir().unwrap();
        // Canonicalize so depdb paths and realized header paths agree even
        // when the temp directory sits behind a symlink.
        let root = std::fs::canonicalize(dir.path()).unwrap();
        TestProject { _dir: dir, root }
    }

    pub fn file(&self, rel: &str, content: &str) -> PathBuf {
        let p = self.root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, content).unwrap();
        p
    }

    /// Install the stand-in compiler and return its path.
    #[cfg(unix)]
    pub fn fake_cc(&self) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let p = self.file("fakecc", FAKE_CC);
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        p
    }

    pub fn out(&self) -> PathBuf {
        self.root.join("out")
    }

    pub fn ctx(&self) -> BuildContext {
        let mut ctx = BuildContext::new(self.root.clone(), self.out());
        ctx.verbosity = 0;
        ctx
    }

    pub fn load(&self, ctx: &BuildContext) -> Vec<Arc<Target>> {
        manifest::load_project(ctx).unwrap()
    }
}

pub fn update(ctx: &BuildContext, roots: &[Arc<Target>]) -> Summary {
    forgebuild::perform(ctx, forgebuild::PERFORM_UPDATE, roots).unwrap()
}

pub fn clean(ctx: &BuildContext, roots: &[Arc<Target>]) -> Summary {
    forgebuild::perform(ctx, forgebuild::PERFORM_CLEAN, roots).unwrap()
}

/// Give the filesystem a moment so mtime comparisons see a difference.
pub fn tick() {
    std::thread::sleep(std::time::Duration::from_millis(30));
}

/// Read a depdb file as lines.
pub fn depdb_lines(p: &Path) -> Vec<String> {
    std::fs::read_to_string(p)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}
