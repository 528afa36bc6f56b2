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

//! Target-type descriptors.
//!
//! The type hierarchy is a chain of static descriptors rather than a class
//! tower: behavior lives in the descriptor fields (factory, default
//! extension, printing flags) and `is_a` walks the base chain.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::extension::ExtState;
use crate::scope::{ScopeId, ScopeTree};
use crate::target::Target;

pub type Factory = fn(&'static TargetType, PathBuf, PathBuf, String, ExtState) -> Target;

pub struct TargetType {
    pub name: &'static str,
    pub base: Option<&'static TargetType>,
    pub factory: Factory,
    /// The extension used when deriving a file name and none was decided.
    /// `None` means the type has no default and the name is used as-is.
    pub default_ext: Option<&'static str>,
    /// A see-through target exposes its members to a caller asking for
    /// prerequisites instead of owning them opaquely.
    pub see_through: bool,
    /// The target names a directory; its "path" is the directory itself.
    pub dir_based: bool,
}

impl TargetType {
    /// Walk the base chain testing for identity.
    pub fn is_a(&'static self, tt: &'static TargetType) -> bool {
        let mut cur = self;
        loop {
            if std::ptr::eq(cur, tt) {
                return true;
            }
            match cur.base {
                Some(b) => cur = b,
                None => return false,
            }
        }
    }
}

impl std::fmt::Debug for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TargetType({})", self.name)
    }
}

/// Identity wrapper for descriptor pointers so they can key maps.
#[derive(Clone, Copy)]
pub struct TypePtr(pub &'static TargetType);

impl PartialEq for TypePtr {
    fn eq(&self, other: &TypePtr) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for TypePtr {}

impl std::hash::Hash for TypePtr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.0 as *const TargetType as usize).hash(state);
    }
}

fn default_factory(
    ty: &'static TargetType,
    dir: PathBuf,
    out: PathBuf,
    name: String,
    ext: ExtState,
) -> Target {
    Target::new(ty, dir, out, name, ext)
}

macro_rules! target_type {
    ($id:ident, $name:literal, $base:expr, $ext:expr, $see:literal, $dir:literal) => {
        pub static $id: TargetType = TargetType {
            name: $name,
            base: $base,
            factory: default_factory,
            default_ext: $ext,
            see_through: $see,
            dir_based: $dir,
        };
    };
}

target_type!(TARGET, "target", None, None, false, false);
target_type!(MTIME_TARGET, "mtime_target", Some(&TARGET), None, false, false);
target_type!(PATH_TARGET, "path_target", Some(&MTIME_TARGET), None, false, false);
target_type!(FILE, "file", Some(&PATH_TARGET), Some(""), false, false);

// Compilation artifacts. The objX types distinguish what the object will be
// linked into: an executable, a static library, or a shared library (which
// is what decides -fPIC and the MSVC/mingw extension).
target_type!(OBJ, "obj", Some(&FILE), None, false, false);
target_type!(OBJE, "obje", Some(&OBJ), None, false, false);
target_type!(OBJA, "obja", Some(&OBJ), None, false, false);
target_type!(OBJS, "objs", Some(&OBJ), None, false, false);

target_type!(EXE, "exe", Some(&FILE), Some(""), false, false);
target_type!(LIB, "lib", Some(&FILE), None, true, false);
target_type!(LIBA, "liba", Some(&LIB), Some("a"), false, false);
target_type!(LIBS, "libs", Some(&LIB), Some("so"), false, false);

// Translation units and headers.
target_type!(C, "c", Some(&FILE), Some("c"), false, false);
target_type!(CXX, "cxx", Some(&FILE), Some("cxx"), false, false);
target_type!(H, "h", Some(&FILE), Some("h"), false, false);
target_type!(HXX, "hxx", Some(&FILE), Some("hxx"), false, false);
target_type!(IXX, "ixx", Some(&FILE), Some("ixx"), false, false);
target_type!(TXX, "txx", Some(&FILE), Some("txx"), false, false);

target_type!(DIR, "dir", Some(&ALIAS), None, true, true);
target_type!(FSDIR, "fsdir", Some(&MTIME_TARGET), None, false, true);
target_type!(ALIAS, "alias", Some(&TARGET), None, true, false);
target_type!(TESTSCRIPT, "testscript", Some(&FILE), Some("testscript"), false, false);

/// Per-context view of the known target types: name lookup plus the
/// extension reverse map used to classify discovered headers.
pub struct TypeRegistry {
    by_name: HashMap<&'static str, &'static TargetType>,
}

impl TypeRegistry {
    pub fn builtin() -> TypeRegistry {
        let mut by_name = HashMap::new();
        for tt in [
            &TARGET,
            &MTIME_TARGET,
            &PATH_TARGET,
            &FILE,
            &OBJ,
            &OBJE,
            &OBJA,
            &OBJS,
            &EXE,
            &LIB,
            &LIBA,
            &LIBS,
            &C,
            &CXX,
            &H,
            &HXX,
            &IXX,
            &TXX,
            &DIR,
            &FSDIR,
            &ALIAS,
            &TESTSCRIPT,
        ] {
            by_name.insert(tt.name, tt);
        }
        TypeRegistry { by_name }
    }

    pub fn find(&self, name: &str) -> Option<&'static TargetType> {
        self.by_name.get(name).copied()
    }

    /// Reverse-lookup a target type from a file extension, trying the header
    /// types first (they are the likely match for discovered dependencies).
    /// A scope can override a type's extension with an `extension.<type>`
    /// variable; otherwise the type's default applies.
    pub fn map_extension(
        &self,
        scopes: &ScopeTree,
        scope: ScopeId,
        ext: &str,
    ) -> Option<&'static TargetType> {
        let candidates: [&'static TargetType; 6] = [&HXX, &H, &IXX, &TXX, &CXX, &C];
        for tt in candidates {
            let var = format!("extension.{}", tt.name);
            let effective = scopes
                .find_original(scope, &var)
                .and_then(|v| v.as_str().map(str::to_owned))
                .or_else(|| tt.default_ext.map(str::to_owned));
            if effective.as_deref() == Some(ext) {
                return Some(tt);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_chain() {
        assert!(CXX.is_a(&FILE));
        assert!(CXX.is_a(&PATH_TARGET));
        assert!(CXX.is_a(&TARGET));
        assert!(!CXX.is_a(&OBJ));
        assert!(OBJS.is_a(&OBJ));
        assert!(LIBA.is_a(&LIB));
    }

    #[test]
    fn registry_finds_builtin_types() {
        let reg = TypeRegistry::builtin();
        assert!(std::ptr::eq(reg.find("obj").unwrap(), &OBJ));
        assert!(reg.find("nonesuch").is_none());
    }

    #[test]
    fn extension_reverse_lookup() {
        let reg = TypeRegistry::builtin();
        let mut scopes = ScopeTree::new();
        let root = scopes.create(None, "/p/out".into(), "/p".into(), true);

        assert!(std::ptr::eq(
            reg.map_extension(&scopes, root, "hxx").unwrap(),
            &HXX
        ));
        assert!(std::ptr::eq(reg.map_extension(&scopes, root, "h").unwrap(), &H));
        assert!(reg.map_extension(&scopes, root, "zzz").is_none());

        // A scope override takes precedence over the builtin default.
        scopes.assign(
            root,
            "extension.hxx",
            crate::scope::Value::String("hpp".into()),
        );
        assert!(std::ptr::eq(
            reg.map_extension(&scopes, root, "hpp").unwrap(),
            &HXX
        ));
    }
}
