use indexmap::{IndexMap, IndexSet};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::{Note, Result};

pub mod builder;

pub use builder::{FilterBuilder, RequestBuilder, RequestBuilderOptions};

/// A single REQ filter. Sets keep their insertion order for stable wire
/// output, but two filters with the same members compare equal no matter how
/// they were built.
///
/// A filter with no constraints at all is the universal filter and matches
/// every note.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub(crate) ids: Option<IndexSet<String>>,
    pub(crate) authors: Option<IndexSet<String>>,
    pub(crate) kinds: Option<IndexSet<u64>>,
    /// tag name (without the `#`) -> accepted values
    pub(crate) tags: IndexMap<String, IndexSet<String>>,
    /// inclusive, unix seconds
    pub(crate) since: Option<u64>,
    /// exclusive, unix seconds
    pub(crate) until: Option<u64>,
    pub(crate) limit: Option<u64>,
    pub(crate) search: Option<String>,
}

impl Filter {
    /// Start building a filter clause
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> FilterBuilder {
        FilterBuilder::default()
    }

    pub fn universal() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Option<&IndexSet<String>> {
        self.ids.as_ref()
    }

    pub fn authors(&self) -> Option<&IndexSet<String>> {
        self.authors.as_ref()
    }

    pub fn kinds(&self) -> Option<&IndexSet<u64>> {
        self.kinds.as_ref()
    }

    pub fn tag(&self, name: &str) -> Option<&IndexSet<String>> {
        self.tags.get(name)
    }

    pub fn tags(&self) -> &IndexMap<String, IndexSet<String>> {
        &self.tags
    }

    pub fn since(&self) -> Option<u64> {
        self.since
    }

    pub fn until(&self) -> Option<u64> {
        self.until
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn search(&self) -> Option<&str> {
        self.search.as_deref()
    }

    /// Number of constraining fields that are set
    pub fn num_elements(&self) -> usize {
        self.ids.is_some() as usize
            + self.authors.is_some() as usize
            + self.kinds.is_some() as usize
            + self.tags.len()
            + self.since.is_some() as usize
            + self.until.is_some() as usize
            + self.limit.is_some() as usize
            + self.search.is_some() as usize
    }

    pub fn is_universal(&self) -> bool {
        self.num_elements() == 0
    }

    /// Check a note against every constraint of this filter.
    ///
    /// `search` is a relay side full-text query we cannot evaluate locally,
    /// so it never rejects a note.
    pub fn matches(&self, note: &Note) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(note.id.as_str()) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !authors.contains(note.pubkey.as_str()) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&note.kind) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if note.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if note.created_at >= until {
                return false;
            }
        }

        for (name, values) in &self.tags {
            if !note.tag_values(name).any(|v| values.contains(v)) {
                return false;
            }
        }

        true
    }

    pub fn json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Serialize for Filter {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.num_elements()))?;

        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        for (name, values) in &self.tags {
            map.serialize_entry(&format!("#{name}"), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        if let Some(search) = &self.search {
            map.serialize_entry("search", search)?;
        }

        map.end()
    }
}

struct FilterVisitor;

impl<'de> Visitor<'de> for FilterVisitor {
    type Value = Filter;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a nostr REQ filter object")
    }

    fn visit_map<A>(self, mut access: A) -> std::result::Result<Filter, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut filter = Filter::default();

        while let Some(key) = access.next_key::<String>()? {
            match key.as_str() {
                "ids" => filter.ids = Some(access.next_value()?),
                "authors" => filter.authors = Some(access.next_value()?),
                "kinds" => filter.kinds = Some(access.next_value()?),
                "since" => filter.since = Some(access.next_value()?),
                "until" => filter.until = Some(access.next_value()?),
                "limit" => filter.limit = Some(access.next_value()?),
                "search" => filter.search = Some(access.next_value()?),
                tag if tag.len() > 1 && tag.starts_with('#') => {
                    filter
                        .tags
                        .insert(tag[1..].to_owned(), access.next_value()?);
                }
                other => {
                    return Err(de::Error::unknown_field(
                        other,
                        &[
                            "ids", "authors", "kinds", "#<tag>", "since", "until", "limit",
                            "search",
                        ],
                    ))
                }
            }
        }

        Ok(filter)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(FilterVisitor)
    }
}
