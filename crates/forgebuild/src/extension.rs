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

//! Interned filename extensions.
//!
//! Extensions take part in target identity and get compared a lot, so the
//! pool guarantees that equal strings intern to the same allocation and
//! comparison is a pointer check.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;

/// An interned extension. Two `Ext` values from the same pool are equal
/// exactly when they point at the same allocation.
#[derive(Clone, Copy)]
pub struct Ext(&'static str);

impl Ext {
    pub fn as_str(self) -> &'static str {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Ext {
    fn eq(&self, other: &Ext) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for Ext {}

impl std::hash::Hash for Ext {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.0.as_ptr() as usize).hash(state);
    }
}

impl fmt::Debug for Ext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ext({:?})", self.0)
    }
}

impl fmt::Display for Ext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// The extension slot of a target key. The empty extension (`Decided("")`)
/// is distinct from "not decided yet": `file{foo.}` names a file with no
/// extension, `file{foo}` names one whose extension is still to be derived.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExtState {
    Unknown,
    Decided(Ext),
}

impl ExtState {
    pub fn decided(self) -> Option<Ext> {
        match self {
            ExtState::Unknown => None,
            ExtState::Decided(e) => Some(e),
        }
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, ExtState::Unknown)
    }
}

/// The interning pool. One per build context.
pub struct ExtensionPool {
    interned: Mutex<HashSet<&'static str>>,
}

impl ExtensionPool {
    pub fn new() -> ExtensionPool {
        ExtensionPool {
            interned: Mutex::new(HashSet::new()),
        }
    }

    pub fn intern(&self, s: &str) -> Ext {
        let mut pool = self.interned.lock();
        if let Some(existing) = pool.get(s) {
            return Ext(existing);
        }
        // Interned strings live for the rest of the process; the pool is
        // expected to be process-lifetime even though it is not a global.
        let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
        pool.insert(leaked);
        Ext(leaked)
    }
}

impl Default for ExtensionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_intern_to_same_pointer() {
        let pool = ExtensionPool::new();
        let a = pool.intern("hxx");
        let b = pool.intern("hxx");
        assert_eq!(a, b);
        assert!(std::ptr::eq(a.as_str(), b.as_str()));
    }

    #[test]
    fn distinct_strings_differ() {
        let pool = ExtensionPool::new();
        let a = pool.intern("h");
        let b = pool.intern("hxx");
        assert_ne!(a, b);
    }

    #[test]
    fn empty_is_a_real_extension() {
        let pool = ExtensionPool::new();
        let e = pool.intern("");
        assert!(e.is_empty());
        assert_eq!(ExtState::Decided(e).decided(), Some(e));
        assert!(ExtState::Unknown.decided().is_none());
    }
}
