//! String interning for identifiers and string constants.
//!
//! Names in bytecode (globals, attributes, locals, code object names) and string
//! constants are stored once in [`Interns`] and referenced by [`StringId`]. The table
//! is populated while code objects are built, then shared read-only by every run of
//! a [`crate::Program`]. During execution lookups are needed only for error messages,
//! keyword matching and `repr()` output.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Index into the string interner's storage.
///
/// Uses `u32` to save space (4 bytes vs 8 bytes for `usize`). This limits us to
/// ~4 billion unique interns, which is more than sufficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct StringId(u32);

impl StringId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Interned strings.
///
/// Interning the same string twice returns the same id, so id equality implies
/// string equality. The reverse lookup map is not serialized and is rebuilt by
/// [`Interns::rebuild_index`] after loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interns {
    strings: Vec<String>,
    #[serde(skip)]
    index: AHashMap<String, StringId>,
}

impl Interns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `s`, returning the existing id if it was interned before.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("too many interned strings"));
        self.strings.push(s.to_owned());
        self.index.insert(s.to_owned(), id);
        id
    }

    /// Gets the string for a `StringId`.
    ///
    /// # Panics
    /// Panics if the id was not produced by this table.
    #[must_use]
    pub fn get_str(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    /// Looks up the id of an already interned string.
    #[must_use]
    pub fn try_get_str_id(&self, s: &str) -> Option<StringId> {
        self.index.get(s).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Rebuilds the reverse lookup map, needed after deserializing.
    pub(crate) fn rebuild_index(&mut self) {
        self.index = self
            .strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), StringId(u32::try_from(i).expect("too many interned strings"))))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut interns = Interns::new();
        let a = interns.intern("alpha");
        let b = interns.intern("beta");
        assert_ne!(a, b);
        assert_eq!(interns.intern("alpha"), a);
        assert_eq!(interns.get_str(b), "beta");
        assert_eq!(interns.len(), 2);
    }

    #[test]
    fn index_survives_round_trip() {
        let mut interns = Interns::new();
        let id = interns.intern("name");
        let bytes = postcard::to_allocvec(&interns).unwrap();
        let mut loaded: Interns = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.try_get_str_id("name"), None);
        loaded.rebuild_index();
        assert_eq!(loaded.try_get_str_id("name"), Some(id));
        assert_eq!(loaded.intern("name"), id);
    }
}
