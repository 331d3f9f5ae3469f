use pagelog::{fnv1_64, Arg, SymbolTable};
use proptest::prelude::*;

/// Straightforward FNV-1 over a byte slice.
fn reference_fnv1(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0xcbf29ce484222325u64, |hash, &b| hash.wrapping_mul(0x100000001b3) ^ u64::from(b))
}

#[test]
fn test_register_returns_literal_hash() {
    let mut table = SymbolTable::new();
    let hash = table.register("request served in");
    assert_eq!(hash, fnv1_64(b"request served in"));
    assert_eq!(Arg::from_literal("request served in"), Arg::Hash(hash));
    assert_eq!(table.resolve(hash), Some("request served in"));
}

#[test]
fn test_register_twice_keeps_one_entry() {
    let mut table = SymbolTable::new();
    assert!(table.is_empty());
    let first = table.register("duplicate literal");
    let second = table.register("duplicate literal");
    assert_eq!(first, second);
    assert_eq!(table.len(), 1);
}

#[test]
fn test_collect_from_owned_strings() {
    let lines = vec![String::from("first long literal"), String::from("second long literal")];
    let table: SymbolTable = lines.iter().collect();
    assert_eq!(table.len(), 2);
    assert_eq!(table.resolve(fnv1_64(b"second long literal")), Some("second long literal"));
    assert_eq!(table.resolve(fnv1_64(b"unknown")), None);
}

proptest! {
    #[test]
    fn fnv1_matches_reference(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        prop_assert_eq!(fnv1_64(&bytes), reference_fnv1(&bytes));
    }

    #[test]
    fn long_literals_hash_and_short_ones_inline(text in "[ -~]{0,24}") {
        match Arg::from_literal(&text) {
            Arg::Inline { .. } => prop_assert!(text.len() <= 8),
            Arg::Hash(hash) => {
                prop_assert!(text.len() > 8);
                prop_assert_eq!(hash, reference_fnv1(text.as_bytes()));
            }
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }
}
