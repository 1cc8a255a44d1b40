use hashbrown::HashSet;

use super::merge::canonical_key;
use crate::Filter;

/// Every filter of `next` that has no value-equal counterpart in `prev`.
///
/// Set fields compare unordered, so rebuilding the same request in a
/// different order yields an empty diff. Duplicates inside `next` are only
/// reported once.
#[profiling::function]
pub fn get_diff(prev: &[Filter], next: &[Filter]) -> Vec<Filter> {
    let mut seen: HashSet<String> = prev.iter().map(|f| canonical_key(f, None)).collect();

    next.iter()
        .filter(|f| seen.insert(canonical_key(f, None)))
        .cloned()
        .collect()
}
