use crate::Filter;

mod diff;
mod merge;

pub use diff::get_diff;
pub use merge::{compress, flat_merge, subsumes};

/// Filter set arithmetic used to keep the number of wire requests down.
///
/// None of these operations fail: an empty result is a valid answer.
pub trait QueryOptimizer: Send + Sync {
    /// Filters in `next` that are not value-equal to any filter in `prev`
    fn get_diff(&self, prev: &[Filter], next: &[Filter]) -> Vec<Filter>;

    /// Merge filters that only differ in a single set dimension
    fn flat_merge(&self, filters: Vec<Filter>) -> Vec<Filter>;

    /// Smallest equivalent filter list we know how to produce
    fn compress(&self, filters: Vec<Filter>) -> Vec<Filter>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultQueryOptimizer;

impl QueryOptimizer for DefaultQueryOptimizer {
    fn get_diff(&self, prev: &[Filter], next: &[Filter]) -> Vec<Filter> {
        get_diff(prev, next)
    }

    fn flat_merge(&self, filters: Vec<Filter>) -> Vec<Filter> {
        flat_merge(filters)
    }

    fn compress(&self, filters: Vec<Filter>) -> Vec<Filter> {
        compress(filters)
    }
}
