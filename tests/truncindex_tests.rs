//! Tests for prefix lookup of ids.

use magiksnap::{Error, TruncIndex};

const IDS: [&str; 3] = [
    "sha256:3f2a9c",
    "sha256:3f2b11",
    "sha256:a01234",
];

// =============================================================================
// Lookup Tests
// =============================================================================

#[test]
fn test_get_unique_prefix() {
    let index = TruncIndex::new(IDS);

    assert_eq!(index.get("sha256:a").unwrap(), "sha256:a01234");
    assert_eq!(index.get("sha256:3f2b").unwrap(), "sha256:3f2b11");
    assert_eq!(index.get("sha256:3f2a9c").unwrap(), "sha256:3f2a9c", "full id resolves");
}

#[test]
fn test_get_ambiguous_prefix() {
    let index = TruncIndex::new(IDS);

    let err = index.get("sha256:3f2").unwrap_err();

    assert!(matches!(err, Error::AmbiguousPrefix(ref p) if p == "sha256:3f2"));
}

#[test]
fn test_get_unknown_prefix() {
    let index = TruncIndex::new(IDS);

    let err = index.get("sha256:ff").unwrap_err();

    assert!(matches!(err, Error::IdNotFound(_)));
    assert!(err.is_not_found());
}

#[test]
fn test_get_empty_prefix() {
    let index = TruncIndex::new(IDS);

    assert!(matches!(index.get(""), Err(Error::EmptyPrefix)));
}

// =============================================================================
// Mutation Tests
// =============================================================================

#[test]
fn test_add_validates_ids() {
    let index = TruncIndex::default();

    assert!(matches!(index.add(""), Err(Error::EmptyPrefix)));
    assert!(matches!(index.add("has space"), Err(Error::IllegalIdChar(' '))));
    index.add("one").unwrap();
    assert!(matches!(index.add("one"), Err(Error::IdAlreadyExists(_))));
    assert_eq!(index.len(), 1);
}

#[test]
fn test_add_makes_prefix_ambiguous() {
    let index = TruncIndex::new(["abc123"]);
    assert_eq!(index.get("abc").unwrap(), "abc123");

    index.add("abc456").unwrap();

    assert!(matches!(index.get("abc"), Err(Error::AmbiguousPrefix(_))));
}

#[test]
fn test_delete_requires_full_id() {
    let index = TruncIndex::new(IDS);

    assert!(matches!(index.delete("sha256:a0"), Err(Error::IdNotFound(_))));
    index.delete("sha256:a01234").unwrap();

    assert!(index.get("sha256:a").is_err());
    assert_eq!(index.len(), 2);
    assert!(matches!(index.delete(""), Err(Error::EmptyPrefix)));
}

#[test]
fn test_iterate_in_sorted_order() {
    let index = TruncIndex::new(["c", "a", "b"]);
    let mut seen = Vec::new();

    index.iterate(|id| seen.push(id.to_string()));

    assert_eq!(seen, vec!["a", "b", "c"]);
    assert!(!index.is_empty());
    assert!(TruncIndex::default().is_empty());
}
