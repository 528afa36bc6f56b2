use std::hash::{Hash, Hasher};

use twox_hash::xxh3;

/// A 64-bit stable hash of the given data.
pub fn short_hash(data: impl Hash) -> u64 {
    let mut hasher = xxh3::Hash64::with_seed(0);
    data.hash(&mut hasher);
    hasher.finish()
}

/// A 16-character hexadecimal representation of the hash of the given data.
pub fn short_hash_str(data: impl Hash) -> String {
    format!("{:016x}", short_hash(data))
}

/// An order-preserving digest of a sequence of strings.
///
/// Used for option checksums: the same options in a different order must
/// produce a different digest since option order can be significant.
pub struct Digest {
    hasher: xxh3::Hash64,
}

impl Digest {
    pub fn new() -> Digest {
        Digest {
            hasher: xxh3::Hash64::with_seed(0),
        }
    }

    pub fn append(&mut self, s: &str) {
        self.hasher.write(s.as_bytes());
        // Separator so that ["ab", "c"] and ["a", "bc"] differ.
        self.hasher.write_u8(0);
    }

    pub fn string(&self) -> String {
        format!("{:016x}", self.hasher.finish())
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_order_sensitive() {
        let mut a = Digest::new();
        a.append("-DX");
        a.append("-DY");
        let mut b = Digest::new();
        b.append("-DY");
        b.append("-DX");
        assert_ne!(a.string(), b.string());
    }

    #[test]
    fn digest_separates_boundaries() {
        let mut a = Digest::new();
        a.append("ab");
        a.append("c");
        let mut b = Digest::new();
        b.append("a");
        b.append("bc");
        assert_ne!(a.string(), b.string());
    }

    #[test]
    fn short_hash_is_stable() {
        assert_eq!(short_hash_str("x"), short_hash_str("x"));
        assert_eq!(short_hash_str("x").len(), 16);
    }
}
