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

use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// A modification time as tracked by the build state machinery.
///
/// `Unknown` means "not loaded yet" and never takes part in comparisons.
/// `Nonexistent` orders before every real time so that a missing output is
/// always older than any of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    Unknown,
    Nonexistent,
    Real(SystemTime),
}

impl Timestamp {
    pub fn is_unknown(self) -> bool {
        matches!(self, Timestamp::Unknown)
    }

    pub fn exists(self) -> bool {
        matches!(self, Timestamp::Real(_))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Timestamp) -> Option<Ordering> {
        use Timestamp::*;
        match (self, other) {
            (Unknown, _) | (_, Unknown) => None,
            (Nonexistent, Nonexistent) => Some(Ordering::Equal),
            (Nonexistent, Real(_)) => Some(Ordering::Less),
            (Real(_), Nonexistent) => Some(Ordering::Greater),
            (Real(a), Real(b)) => a.partial_cmp(b),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Unknown => write!(f, "<unknown>"),
            Timestamp::Nonexistent => write!(f, "<nonexistent>"),
            Timestamp::Real(t) => match t.duration_since(SystemTime::UNIX_EPOCH) {
                Ok(d) => write!(f, "{}.{:09}", d.as_secs(), d.subsec_nanos()),
                Err(_) => write!(f, "<pre-epoch>"),
            },
        }
    }
}

/// Read the modification time of a filesystem entry, mapping the expected
/// "no such file" error classes to `Nonexistent`.
pub fn mtime(path: &Path) -> io::Result<Timestamp> {
    match std::fs::symlink_metadata(path) {
        Ok(md) => Ok(Timestamp::Real(md.modified()?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Timestamp::Nonexistent),
        // A file component used as a directory (ENOTDIR).
        Err(e) if e.raw_os_error() == Some(20) && cfg!(unix) => Ok(Timestamp::Nonexistent),
        Err(e) => Err(e),
    }
}

/// The current time as a `Timestamp`.
pub fn now() -> Timestamp {
    Timestamp::Real(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ordering() {
        let early = Timestamp::Real(SystemTime::UNIX_EPOCH);
        let late = Timestamp::Real(SystemTime::UNIX_EPOCH + Duration::from_secs(1));

        assert!(Timestamp::Nonexistent < early);
        assert!(early < late);
        assert!(!(Timestamp::Nonexistent < Timestamp::Nonexistent));
        assert_eq!(
            Timestamp::Unknown.partial_cmp(&early),
            None,
            "unknown must not compare"
        );
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let t = mtime(&dir.path().join("no-such-file")).unwrap();
        assert_eq!(t, Timestamp::Nonexistent);

        let file = dir.path().join("present");
        std::fs::write(&file, "x").unwrap();
        assert!(mtime(&file).unwrap().exists());
    }
}
