use hashbrown::HashMap;
use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace};

use crate::directory::RelayDirectory;
use crate::filter::FilterBuilder;
use crate::optimizer::{DefaultQueryOptimizer, QueryOptimizer};
use crate::relay::NormRelayUrl;
use crate::Filter;

/// How the relay of a dispatch was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStrategy {
    /// Whatever relays the connection pool uses by default
    DefaultRelays,
    /// The write relays of the requested authors
    AuthorsRelays,
    /// The clause was pinned to specific relays
    ExplicitRelays,
}

/// A filter set bound to one relay. An empty `relay` means "any of the
/// default relays".
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltReqFilter {
    pub filters: Vec<Filter>,
    pub relay: String,
    pub strategy: RequestStrategy,
}

impl BuiltReqFilter {
    pub fn is_default_relay(&self) -> bool {
        self.relay.is_empty()
    }

    /// Needs a relay with full-text search support
    pub fn has_search(&self) -> bool {
        self.filters.iter().any(|f| f.search().is_some())
    }
}

#[derive(Default)]
struct RelayAggregate {
    authors: usize,
}

/// Resolves filter clauses to the relays that should receive them
pub struct EndpointSelector<'a> {
    directory: &'a dyn RelayDirectory,
    optimizer: &'a dyn QueryOptimizer,
    max_relays_per_author: usize,
}

impl<'a> EndpointSelector<'a> {
    pub fn new(directory: &'a dyn RelayDirectory) -> Self {
        Self {
            directory,
            optimizer: &DefaultQueryOptimizer,
            max_relays_per_author: 2,
        }
    }

    pub fn with_optimizer(mut self, optimizer: &'a dyn QueryOptimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn max_relays_per_author(mut self, max: usize) -> Self {
        self.max_relays_per_author = max.max(1);
        self
    }

    pub fn optimizer(&self) -> &dyn QueryOptimizer {
        self.optimizer
    }

    /// Resolve one clause. Explicit relay pins win, then the authors' write
    /// relays, then the default relay set.
    pub fn expand(&self, builder: &FilterBuilder) -> Vec<BuiltReqFilter> {
        let filter = builder.filter();

        if !builder.relays().is_empty() {
            return builder
                .relays()
                .iter()
                .map(|relay| BuiltReqFilter {
                    filters: vec![filter.clone()],
                    relay: relay.clone(),
                    strategy: RequestStrategy::ExplicitRelays,
                })
                .collect();
        }

        if filter.authors().is_some_and(|a| !a.is_empty()) {
            return self.split_by_write_relays(filter);
        }

        vec![BuiltReqFilter {
            filters: vec![filter.clone()],
            relay: String::new(),
            strategy: RequestStrategy::DefaultRelays,
        }]
    }

    /// Normalized, deduplicated write relays of an author
    fn author_relays(&self, author: &str) -> Vec<String> {
        let mut relays: IndexSet<String> = IndexSet::new();
        for relay in self.directory.write_relays(author).unwrap_or_default() {
            match NormRelayUrl::new(&relay) {
                Ok(url) => {
                    relays.insert(url.to_string());
                }
                Err(_) => debug!("ignoring bad write relay '{relay}' for {author}"),
            }
        }
        relays.into_iter().collect()
    }

    /// Split an author filter into one copy per write relay, each copy only
    /// asking for the authors that publish there. Every author is sent to at
    /// most `max_relays_per_author` relays, preferring relays many of the
    /// requested authors share. Authors we know nothing about are asked for
    /// on the default relays.
    pub fn split_by_write_relays(&self, filter: &Filter) -> Vec<BuiltReqFilter> {
        let Some(authors) = filter.authors() else {
            return vec![BuiltReqFilter {
                filters: vec![filter.clone()],
                relay: String::new(),
                strategy: RequestStrategy::DefaultRelays,
            }];
        };

        let mut per_author: IndexMap<&str, Vec<String>> = IndexMap::new();
        let mut aggregates: HashMap<String, RelayAggregate> = HashMap::new();
        let mut missing: IndexSet<String> = IndexSet::new();

        for author in authors {
            let relays = self.author_relays(author);
            if relays.is_empty() {
                missing.insert(author.clone());
                continue;
            }
            for relay in &relays {
                aggregates.entry(relay.clone()).or_default().authors += 1;
            }
            per_author.insert(author.as_str(), relays);
        }

        let mut by_relay: IndexMap<String, IndexSet<String>> = IndexMap::new();
        for (author, mut relays) in per_author {
            relays.sort_by(|a, b| {
                let shared = |r: &String| aggregates.get(r).map_or(0, |agg| agg.authors);
                shared(b).cmp(&shared(a)).then_with(|| a.cmp(b))
            });
            relays.truncate(self.max_relays_per_author);

            for relay in relays {
                by_relay
                    .entry(relay)
                    .or_default()
                    .insert(author.to_owned());
            }
        }

        let mut built: Vec<BuiltReqFilter> = by_relay
            .into_iter()
            .map(|(relay, authors)| BuiltReqFilter {
                filters: vec![with_authors(filter, authors)],
                relay,
                strategy: RequestStrategy::AuthorsRelays,
            })
            .collect();

        if !missing.is_empty() {
            trace!("{} authors without write relays", missing.len());
            built.push(BuiltReqFilter {
                filters: vec![with_authors(filter, missing)],
                relay: String::new(),
                strategy: RequestStrategy::DefaultRelays,
            });
        }

        built
    }

    /// Group dispatches sharing a relay into one, compressing their filters.
    /// The first dispatch of a relay decides the strategy.
    pub fn group_by_relay(&self, expanded: Vec<BuiltReqFilter>) -> Vec<BuiltReqFilter> {
        let mut grouped: IndexMap<String, BuiltReqFilter> = IndexMap::new();

        for dispatch in expanded {
            match grouped.get_mut(&dispatch.relay) {
                Some(existing) => existing.filters.extend(dispatch.filters),
                None => {
                    grouped.insert(dispatch.relay.clone(), dispatch);
                }
            }
        }

        grouped
            .into_values()
            .map(|mut dispatch| {
                dispatch.filters = self.optimizer.compress(dispatch.filters);
                dispatch
            })
            .collect()
    }
}

fn with_authors(filter: &Filter, authors: IndexSet<String>) -> Filter {
    let mut filter = filter.clone();
    filter.authors = Some(authors);
    filter
}
