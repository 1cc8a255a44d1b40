use hashbrown::{HashMap, HashSet};
use indexmap::IndexSet;
use std::fmt::{Debug, Write};
use std::hash::Hash;

use crate::Filter;

/// A set valued field of a filter. Merging is only sound along one of these
/// at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Dimension {
    Ids,
    Authors,
    Kinds,
    Tag(String),
}

impl Dimension {
    fn is_set_on(&self, filter: &Filter) -> bool {
        match self {
            Dimension::Ids => filter.ids.is_some(),
            Dimension::Authors => filter.authors.is_some(),
            Dimension::Kinds => filter.kinds.is_some(),
            Dimension::Tag(name) => filter.tags.contains_key(name),
        }
    }

    /// Union `from`'s values for this dimension into `into`
    fn union(&self, into: &mut Filter, from: &Filter) {
        match self {
            Dimension::Ids => union_opt(&mut into.ids, from.ids.as_ref()),
            Dimension::Authors => union_opt(&mut into.authors, from.authors.as_ref()),
            Dimension::Kinds => union_opt(&mut into.kinds, from.kinds.as_ref()),
            Dimension::Tag(name) => {
                if let (Some(into), Some(from)) = (into.tags.get_mut(name), from.tags.get(name)) {
                    into.extend(from.iter().cloned());
                }
            }
        }
    }
}

fn union_opt<T: Hash + Eq + Clone>(into: &mut Option<IndexSet<T>>, from: Option<&IndexSet<T>>) {
    if let (Some(into), Some(from)) = (into.as_mut(), from) {
        into.extend(from.iter().cloned());
    }
}

fn push_set<T: Ord + Debug>(key: &mut String, label: &str, set: Option<&IndexSet<T>>, skip: bool) {
    let Some(set) = set else {
        return;
    };
    if skip {
        let _ = write!(key, "{label}=*;");
        return;
    }
    let mut values: Vec<&T> = set.iter().collect();
    values.sort();
    let _ = write!(key, "{label}={values:?};");
}

/// Order independent textual identity of a filter. With `skip`, the values
/// of that dimension are left out so filters differing only there collide.
pub(super) fn canonical_key(filter: &Filter, skip: Option<&Dimension>) -> String {
    let mut key = String::new();

    push_set(&mut key, "ids", filter.ids.as_ref(), skip == Some(&Dimension::Ids));
    push_set(
        &mut key,
        "authors",
        filter.authors.as_ref(),
        skip == Some(&Dimension::Authors),
    );
    push_set(&mut key, "kinds", filter.kinds.as_ref(), skip == Some(&Dimension::Kinds));

    let mut tags: Vec<_> = filter.tags.iter().collect();
    tags.sort_by(|a, b| a.0.cmp(b.0));
    for (name, values) in tags {
        let skip_tag = matches!(skip, Some(Dimension::Tag(skipped)) if skipped == name);
        push_set(&mut key, &format!("#{name:?}"), Some(values), skip_tag);
    }

    let _ = write!(
        key,
        "since={:?};until={:?};limit={:?};search={:?}",
        filter.since, filter.until, filter.limit, filter.search
    );
    key
}

fn dedupe(filters: Vec<Filter>) -> Vec<Filter> {
    let mut seen: HashSet<String> = HashSet::with_capacity(filters.len());
    filters
        .into_iter()
        .filter(|f| seen.insert(canonical_key(f, None)))
        .collect()
}

/// Every dimension used by at least one filter, in a stable order
fn dimensions(filters: &[Filter]) -> Vec<Dimension> {
    let mut dims = vec![Dimension::Ids, Dimension::Authors, Dimension::Kinds];
    let mut tag_names: IndexSet<&str> = IndexSet::new();
    for filter in filters {
        tag_names.extend(filter.tags.keys().map(String::as_str));
    }
    dims.extend(tag_names.into_iter().map(|n| Dimension::Tag(n.to_owned())));
    dims
}

/// One merge sweep over every dimension. Filters are bucketed by their key
/// with that dimension blanked out; everything landing in an occupied bucket
/// is folded into the first filter of the bucket.
fn merge_pass(filters: Vec<Filter>) -> Vec<Filter> {
    let dims = dimensions(&filters);
    let mut slots: Vec<Option<Filter>> = filters.into_iter().map(Some).collect();

    for dim in &dims {
        let mut buckets: HashMap<String, usize> = HashMap::new();

        for i in 0..slots.len() {
            let key = match &slots[i] {
                Some(filter) if dim.is_set_on(filter) => canonical_key(filter, Some(dim)),
                _ => continue,
            };

            match buckets.get(&key) {
                Some(&target) => {
                    if let Some(from) = slots[i].take() {
                        if let Some(into) = slots[target].as_mut() {
                            dim.union(into, &from);
                        }
                    }
                }
                None => {
                    buckets.insert(key, i);
                }
            }
        }
    }

    slots.into_iter().flatten().collect()
}

/// Merge filters that are equal in everything but one of ids, authors,
/// kinds or a single tag, repeating until nothing changes. Scalars
/// (`since`, `until`, `limit`, `search`) must match exactly.
#[profiling::function]
pub fn flat_merge(filters: Vec<Filter>) -> Vec<Filter> {
    let mut filters = dedupe(filters);

    loop {
        let before = filters.len();
        filters = merge_pass(filters);
        if filters.len() == before {
            return filters;
        }
    }
}

fn set_within<T: Hash + Eq>(narrow: Option<&IndexSet<T>>, broad: Option<&IndexSet<T>>) -> bool {
    match (narrow, broad) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(narrow), Some(broad)) => narrow.is_subset(broad),
    }
}

/// Does every note matching `narrow` also match `broad`?
///
/// Only answered for filters without a `limit`, since a limit makes the
/// result set depend on what the relay has stored.
pub fn subsumes(broad: &Filter, narrow: &Filter) -> bool {
    if broad.limit.is_some() || narrow.limit.is_some() || broad.search != narrow.search {
        return false;
    }

    if !set_within(narrow.ids.as_ref(), broad.ids.as_ref())
        || !set_within(narrow.authors.as_ref(), broad.authors.as_ref())
        || !set_within(narrow.kinds.as_ref(), broad.kinds.as_ref())
    {
        return false;
    }

    for (name, values) in &broad.tags {
        if !set_within(narrow.tags.get(name), Some(values)) {
            return false;
        }
    }

    let since_ok = match (broad.since, narrow.since) {
        (None, _) => true,
        (Some(b), Some(n)) => n >= b,
        (Some(_), None) => false,
    };
    let until_ok = match (broad.until, narrow.until) {
        (None, _) => true,
        (Some(b), Some(n)) => n <= b,
        (Some(_), None) => false,
    };

    since_ok && until_ok
}

/// Dedupe, merge to a fixpoint, then drop filters that another filter in
/// the list already covers. The universal filter always survives.
#[profiling::function]
pub fn compress(filters: Vec<Filter>) -> Vec<Filter> {
    let merged = flat_merge(filters);
    if merged.len() < 2 {
        return merged;
    }

    let keep: Vec<bool> = merged
        .iter()
        .enumerate()
        .map(|(i, narrow)| {
            narrow.is_universal()
                || !merged
                    .iter()
                    .enumerate()
                    .any(|(j, broad)| i != j && subsumes(broad, narrow))
        })
        .collect();

    merged
        .into_iter()
        .zip(keep)
        .filter_map(|(filter, keep)| keep.then_some(filter))
        .collect()
}
