//! Hash-to-text lookup for string literals.
//!
//! Literals longer than the inline width are logged as their FNV-1 hash.
//! Feeding the same literals into a [`SymbolTable`] (from the program's
//! sources, a strings dump of the binary, or anywhere else) lets a reader
//! print them again.

use std::collections::HashMap;

use crate::arg::fnv1_64;

/// Literal strings keyed by [`fnv1_64`] of their bytes.
///
/// ```
/// use pagelog::{fnv1_64, SymbolTable};
///
/// let table: SymbolTable = ["connection accepted", "connection closed"].into_iter().collect();
/// assert_eq!(table.resolve(fnv1_64(b"connection closed")), Some("connection closed"));
/// assert_eq!(table.resolve(42), None);
/// ```
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: HashMap<u64, String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `text` and returns its hash. Registering the same text twice is
    /// a no-op.
    pub fn register(&mut self, text: &str) -> u64 {
        let hash = fnv1_64(text.as_bytes());
        self.symbols.entry(hash).or_insert_with(|| text.to_owned());
        hash
    }

    pub fn resolve(&self, hash: u64) -> Option<&str> {
        self.symbols.get(&hash).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl<S: AsRef<str>> Extend<S> for SymbolTable {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        for text in iter {
            self.register(text.as_ref());
        }
    }
}

impl<S: AsRef<str>> FromIterator<S> for SymbolTable {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut table = SymbolTable::new();
        table.extend(iter);
        table
    }
}
