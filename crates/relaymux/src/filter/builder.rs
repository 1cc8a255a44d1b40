use indexmap::IndexSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::directory::RelayDirectory;
use crate::relay::NormRelayUrl;
use crate::selector::{BuiltReqFilter, EndpointSelector};
use crate::Filter;

/// Builder for a single filter clause, plus the relays it is pinned to.
///
/// Every method is additive: repeated calls accumulate into deduplicated
/// sets, and `None` arguments leave the clause untouched.
#[derive(Debug, Clone, Default)]
pub struct FilterBuilder {
    filter: Filter,
    relays: IndexSet<String>,
}

fn append_dedupe<T, I>(set: &mut Option<IndexSet<T>>, values: I)
where
    T: std::hash::Hash + Eq,
    I: IntoIterator<Item = T>,
{
    let mut values = values.into_iter().peekable();
    if values.peek().is_none() {
        return;
    }
    set.get_or_insert_with(IndexSet::new).extend(values);
}

impl FilterBuilder {
    /// Pin this clause to a specific relay. Urls that do not parse are
    /// ignored.
    pub fn relay(&mut self, url: &str) -> &mut Self {
        match NormRelayUrl::new(url) {
            Ok(url) => {
                self.relays.insert(url.to_string());
            }
            Err(_) => debug!("ignoring unparseable relay url '{url}'"),
        }
        self
    }

    pub fn ids<S: Into<String>>(&mut self, ids: impl IntoIterator<Item = S>) -> &mut Self {
        append_dedupe(&mut self.filter.ids, ids.into_iter().map(Into::into));
        self
    }

    pub fn authors<S: Into<String>>(&mut self, authors: impl IntoIterator<Item = S>) -> &mut Self {
        append_dedupe(&mut self.filter.authors, authors.into_iter().map(Into::into));
        self
    }

    pub fn kinds(&mut self, kinds: impl IntoIterator<Item = u64>) -> &mut Self {
        append_dedupe(&mut self.filter.kinds, kinds);
        self
    }

    pub fn since(&mut self, since: impl Into<Option<u64>>) -> &mut Self {
        if let Some(since) = since.into() {
            self.filter.since = Some(since);
        }
        self
    }

    pub fn until(&mut self, until: impl Into<Option<u64>>) -> &mut Self {
        if let Some(until) = until.into() {
            self.filter.until = Some(until);
        }
        self
    }

    pub fn limit(&mut self, limit: impl Into<Option<u64>>) -> &mut Self {
        if let Some(limit) = limit.into() {
            self.filter.limit = Some(limit);
        }
        self
    }

    /// Add accepted values for a tag, eg. `tag("e", [root_id])`
    pub fn tag<S: Into<String>>(
        &mut self,
        name: &str,
        values: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        let mut values = values.into_iter().map(Into::into).peekable();
        if values.peek().is_none() {
            return self;
        }
        self.filter
            .tags
            .entry(name.to_owned())
            .or_default()
            .extend(values);
        self
    }

    pub fn search<'a>(&mut self, keyword: impl Into<Option<&'a str>>) -> &mut Self {
        if let Some(keyword) = keyword.into() {
            if !keyword.is_empty() {
                self.filter.search = Some(keyword.to_owned());
            }
        }
        self
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn relays(&self) -> &IndexSet<String> {
        &self.relays
    }

    pub fn build(&self) -> Filter {
        self.filter.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestBuilderOptions {
    /// Keep the query open after every relay sent EOSE
    pub leave_open: bool,
    /// Always send the full filter set instead of the diff against a
    /// running query with the same id
    pub skip_diff: bool,
    /// Override the default per-trace timeout
    pub timeout: Option<Duration>,
}

/// Builds one logical request out of any number of filter clauses. Clauses
/// are OR'd together, the constraints inside a clause are AND'd.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    id: String,
    instance: String,
    builders: Vec<FilterBuilder>,
    options: RequestBuilderOptions,
}

impl RequestBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance: Uuid::new_v4().to_string(),
            builders: Vec::new(),
            options: RequestBuilderOptions::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unique per builder, so two builders sharing a logical id can be told
    /// apart
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn num_filters(&self) -> usize {
        self.builders.len()
    }

    pub fn options(&self) -> &RequestBuilderOptions {
        &self.options
    }

    pub fn with_options(&mut self, options: RequestBuilderOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Start a new filter clause
    pub fn with_filter(&mut self) -> &mut FilterBuilder {
        self.builders.push(FilterBuilder::default());
        // just pushed
        let last = self.builders.len() - 1;
        &mut self.builders[last]
    }

    /// Append the clauses of another request to this one
    pub fn merge(&mut self, other: &RequestBuilder) -> &mut Self {
        self.builders.extend(other.builders.iter().cloned());
        self
    }

    pub fn clauses(&self) -> &[FilterBuilder] {
        &self.builders
    }

    /// The plain filters without any relay resolution
    pub fn build_raw(&self) -> Vec<Filter> {
        self.builders.iter().map(FilterBuilder::build).collect()
    }

    /// Resolve the request against the relay directory with the default
    /// optimizer
    pub fn build(&self, directory: &dyn RelayDirectory) -> Vec<BuiltReqFilter> {
        self.build_with(&EndpointSelector::new(directory))
    }

    pub fn build_with(&self, selector: &EndpointSelector<'_>) -> Vec<BuiltReqFilter> {
        let expanded = self
            .builders
            .iter()
            .flat_map(|b| selector.expand(b))
            .collect();
        selector.group_by_relay(expanded)
    }

    /// Only build what changed compared to `prev`. Relay resolution is
    /// skipped entirely when nothing changed.
    pub fn build_diff(&self, selector: &EndpointSelector<'_>, prev: &[Filter]) -> Vec<BuiltReqFilter> {
        let start = Instant::now();
        let diff = selector.optimizer().get_diff(prev, &self.build_raw());
        let elapsed = start.elapsed();
        trace!("build_diff {} {:?}", self.id, elapsed);

        if diff.is_empty() {
            debug!("wasted {:?} detecting no changes in '{}'", elapsed, self.id);
            return Vec::new();
        }

        let expanded = self
            .builders
            .iter()
            .filter(|b| diff.contains(b.filter()))
            .flat_map(|b| selector.expand(b))
            .collect();
        selector.group_by_relay(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{RelayListCache, RelaySpec};
    use crate::selector::RequestStrategy;

    /// Repeated calls accumulate into a deduplicated set in insertion order.
    #[test]
    fn builder_calls_accumulate_and_dedupe() {
        let f = Filter::new()
            .kinds([1, 2])
            .kinds([2, 3])
            .authors(["a"])
            .authors(["a", "b"])
            .build();

        let kinds: Vec<u64> = f.kinds().unwrap().iter().copied().collect();
        assert_eq!(kinds, vec![1, 2, 3]);
        assert_eq!(f.authors().unwrap().len(), 2);
    }

    #[test]
    fn none_and_empty_arguments_are_noops() {
        let f = Filter::new()
            .since(None)
            .limit(None)
            .search(None)
            .search("")
            .kinds(Vec::new())
            .tag("e", Vec::<String>::new())
            .build();
        assert!(f.is_universal());
    }

    #[test]
    fn relay_pins_are_normalized_and_bad_urls_dropped() {
        let mut b = FilterBuilder::default();
        b.relay("wss://relay.example.com")
            .relay("wss://relay.example.com/")
            .relay("not a url");
        assert_eq!(b.relays().len(), 1);
        assert_eq!(b.relays()[0], "wss://relay.example.com/");
    }

    /// Different builders get different instance ids even with the same id.
    #[test]
    fn request_builder_instances_are_unique() {
        let a = RequestBuilder::new("timeline");
        let b = RequestBuilder::new("timeline");
        assert_eq!(a.id(), b.id());
        assert_ne!(a.instance(), b.instance());
    }

    #[test]
    fn merge_appends_clauses() {
        let mut a = RequestBuilder::new("a");
        a.with_filter().kinds([1]);
        let mut b = RequestBuilder::new("b");
        b.with_filter().kinds([7]);
        b.with_filter().ids(["x"]);

        a.merge(&b);
        assert_eq!(a.num_filters(), 3);
        assert_eq!(a.build_raw()[1], Filter::new().kinds([7]).build());
    }

    /// Unchanged requests produce no dispatches at all.
    #[test]
    fn build_diff_empty_when_unchanged() {
        let dir = RelayListCache::default();
        let selector = EndpointSelector::new(&dir);

        let mut rb = RequestBuilder::new("feed");
        rb.with_filter().kinds([1]).authors(["alice"]);
        let prev = rb.build_raw();

        assert!(rb.build_diff(&selector, &prev).is_empty());
    }

    /// Only the new clause is resolved, and its relay pin survives.
    #[test]
    fn build_diff_only_sends_new_clause() {
        let mut dir = RelayListCache::default();
        dir.insert("alice", vec![RelaySpec::new("wss://alice.example.com", false, false)]);
        let selector = EndpointSelector::new(&dir);

        let mut rb = RequestBuilder::new("feed");
        rb.with_filter().kinds([1]).authors(["alice"]);
        let prev = rb.build_raw();
        rb.with_filter().ids(["note1"]).relay("wss://pinned.example.com");

        let built = rb.build_diff(&selector, &prev);
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].relay, "wss://pinned.example.com/");
        assert_eq!(built[0].strategy, RequestStrategy::ExplicitRelays);
        assert_eq!(built[0].filters, vec![Filter::new().ids(["note1"]).build()]);
    }
}
