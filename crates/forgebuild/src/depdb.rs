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

//! The per-target dependency database.
//!
//! A `.d` file next to the target records, one `\n`-terminated UTF-8 line
//! at a time, the inputs of the last successful build: first the rule's
//! self-describing lines (rule id and version, tool checksum, options
//! checksum, source path), then the dynamic suffix (discovered headers).
//! Position is significant; there is no header and no trailing sentinel.
//!
//! A rule re-validates by calling `expect` on each line it would write. The
//! first mismatch truncates the tail and switches the database to write
//! mode; from then on `expect` appends.

use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::Context as _;
use tracing::debug;

use forgeutil::timestamp::{self, Timestamp};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Read,
    Write,
    Closed,
}

/// Result of `expect`: on mismatch the previously stored line, if any, is
/// handed back so the rule can log what changed.
#[derive(Debug, PartialEq, Eq)]
pub enum Expect {
    Match,
    Mismatch(Option<String>),
}

impl Expect {
    pub fn mismatched(&self) -> bool {
        matches!(self, Expect::Mismatch(_))
    }
}

/// Result of `read`: a stored line, a corrupt (interrupted) tail, or the
/// end of the stored lines.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadLine {
    Line(String),
    Corrupt,
    Eof,
}

pub struct DepDb {
    path: PathBuf,
    lines: Vec<String>,
    /// Trailing bytes without a final `\n` or with invalid UTF-8: the tell
    /// of an interrupted write.
    corrupt_tail: bool,
    pos: usize,
    state: State,
    mtime: Timestamp,
}

impl DepDb {
    /// Open the database, reading its current content. A missing file
    /// starts out in write mode with nothing stored.
    pub fn open(path: PathBuf) -> anyhow::Result<DepDb> {
        match fs::read(&path) {
            Ok(bytes) => {
                let mut lines = Vec::new();
                let mut corrupt_tail = false;
                let mut rest: &[u8] = &bytes;
                while let Some(nl) = rest.iter().position(|&b| b == b'\n') {
                    match std::str::from_utf8(&rest[..nl]) {
                        Ok(s) => lines.push(s.to_string()),
                        Err(_) => {
                            corrupt_tail = true;
                            break;
                        }
                    }
                    rest = &rest[nl + 1..];
                }
                if !corrupt_tail && !rest.is_empty() {
                    corrupt_tail = true;
                }
                let mtime = timestamp::mtime(&path)
                    .with_context(|| format!("unable to stat {}", path.display()))?;
                Ok(DepDb {
                    path,
                    lines,
                    corrupt_tail,
                    pos: 0,
                    state: State::Read,
                    mtime,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DepDb {
                path,
                lines: Vec::new(),
                corrupt_tail: false,
                pos: 0,
                state: State::Write,
                mtime: Timestamp::Nonexistent,
            }),
            Err(e) => {
                Err(e).with_context(|| format!("unable to read {}", path.display()))
            }
        }
    }

    pub fn reading(&self) -> bool {
        self.state == State::Read
    }

    pub fn writing(&self) -> bool {
        self.state == State::Write
    }

    /// Whether there are stored lines (or a corrupt tail) still to read.
    pub fn more(&self) -> bool {
        self.state == State::Read && (self.pos < self.lines.len() || self.corrupt_tail)
    }

    pub fn mtime(&self) -> Timestamp {
        self.mtime
    }

    /// Compare `line` to the next stored line. On a match the position
    /// advances; on a mismatch (or end of stored content) the tail is
    /// discarded, `line` is recorded, and the database switches to write.
    pub fn expect(&mut self, line: &str) -> Expect {
        match self.state {
            State::Read => {
                if !self.corrupt_or_past() && self.lines[self.pos] == line {
                    self.pos += 1;
                    return Expect::Match;
                }
                let prev = if self.corrupt_or_past() {
                    None
                } else {
                    Some(self.lines[self.pos].clone())
                };
                debug!(
                    "depdb {}: mismatch at line {} (stored {:?})",
                    self.path.display(),
                    self.pos + 1,
                    prev
                );
                self.lines.truncate(self.pos);
                self.corrupt_tail = false;
                self.lines.push(line.to_string());
                self.pos += 1;
                self.state = State::Write;
                Expect::Mismatch(prev)
            }
            State::Write => {
                self.write(line);
                Expect::Mismatch(None)
            }
            State::Closed => unreachable!("expect on a closed depdb"),
        }
    }

    fn corrupt_or_past(&self) -> bool {
        self.pos >= self.lines.len()
    }

    /// Read the next dynamic line.
    pub fn read(&mut self) -> ReadLine {
        debug_assert_eq!(self.state, State::Read);
        if self.pos < self.lines.len() {
            let l = self.lines[self.pos].clone();
            self.pos += 1;
            ReadLine::Line(l)
        } else if self.corrupt_tail {
            ReadLine::Corrupt
        } else {
            ReadLine::Eof
        }
    }

    /// Append a line; only meaningful in write mode.
    pub fn write(&mut self, line: &str) {
        debug_assert_eq!(self.state, State::Write);
        self.lines.push(line.to_string());
        self.pos = self.lines.len();
    }

    /// Bump the file's modification time without changing its logical
    /// content. Keeps re-validated-but-unchanged cached data from being
    /// treated as stale over and over.
    pub fn touch(&mut self) -> anyhow::Result<()> {
        self.flush(self.lines.len())?;
        self.mtime = timestamp::now();
        Ok(())
    }

    /// Flush and close. In write mode the file is truncated to the last
    /// written line.
    pub fn close(&mut self) -> anyhow::Result<()> {
        if self.state == State::Write {
            self.flush(self.pos)?;
            self.mtime = timestamp::now();
        }
        self.state = State::Closed;
        Ok(())
    }

    fn flush(&self, upto: usize) -> anyhow::Result<()> {
        let mut content = String::new();
        for l in &self.lines[..upto] {
            content.push_str(l);
            content.push('\n');
        }
        fs::write(&self.path, content)
            .with_context(|| format!("unable to write {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("t.d")
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = db(&dir);

        let mut dd = DepDb::open(path.clone()).unwrap();
        assert!(dd.writing());
        dd.write("cc.compile 1");
        dd.write("deadbeefdeadbeef");
        dd.write("/src/main.cxx");
        dd.close().unwrap();

        let mut dd = DepDb::open(path).unwrap();
        assert!(dd.reading());
        assert_eq!(dd.expect("cc.compile 1"), Expect::Match);
        assert_eq!(dd.expect("deadbeefdeadbeef"), Expect::Match);
        assert_eq!(dd.expect("/src/main.cxx"), Expect::Match);
        assert!(!dd.more());
        assert_eq!(dd.read(), ReadLine::Eof);
        assert!(dd.reading());
    }

    #[test]
    fn mismatch_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = db(&dir);
        std::fs::write(&path, "L1\nL2\nL3\n").unwrap();

        let mut dd = DepDb::open(path.clone()).unwrap();
        assert_eq!(dd.expect("L1"), Expect::Match);
        assert_eq!(dd.expect("L2'"), Expect::Mismatch(Some("L2".to_string())));
        assert!(dd.writing());
        dd.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "L1\nL2'\n");
    }

    #[test]
    fn mismatch_past_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = db(&dir);
        std::fs::write(&path, "L1\n").unwrap();

        let mut dd = DepDb::open(path).unwrap();
        assert_eq!(dd.expect("L1"), Expect::Match);
        assert_eq!(dd.expect("L2"), Expect::Mismatch(None));
        assert!(dd.writing());
    }

    #[test]
    fn interrupted_write_leaves_corrupt_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = db(&dir);
        std::fs::write(&path, "L1\npartial-without-newline").unwrap();

        let mut dd = DepDb::open(path).unwrap();
        assert_eq!(dd.read(), ReadLine::Line("L1".to_string()));
        assert!(dd.more());
        assert_eq!(dd.read(), ReadLine::Corrupt);
    }

    #[test]
    fn touch_bumps_mtime_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = db(&dir);
        std::fs::write(&path, "L1\n").unwrap();

        let mut dd = DepDb::open(path.clone()).unwrap();
        let before = dd.mtime();
        dd.touch().unwrap();
        assert!(dd.mtime() >= before);
        dd.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "L1\n");
    }
}
