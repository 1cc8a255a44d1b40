use hashbrown::HashMap;
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

use crate::relay::NormRelayUrl;

/// Where authors publish their notes (the "gossip" model).
///
/// Returning `None` or an empty list means the author is unknown; callers
/// fall back to the default relay set.
pub trait RelayDirectory: Send + Sync {
    fn write_relays(&self, author: &str) -> Option<Vec<String>>;
}

// A Relay specification includes NIP-65 defined "markers" which
// indicate if the relay should be used for reading or writing (or
// both).

#[derive(Clone)]
pub struct RelaySpec {
    pub url: String,
    pub has_read_marker: bool,
    pub has_write_marker: bool,
}

impl RelaySpec {
    pub fn new(
        url: impl Into<String>,
        mut has_read_marker: bool,
        mut has_write_marker: bool,
    ) -> Self {
        // if both markers are set turn both off ...
        if has_read_marker && has_write_marker {
            has_read_marker = false;
            has_write_marker = false;
        }
        RelaySpec {
            url: url.into(),
            has_read_marker,
            has_write_marker,
        }
    }

    // From NIP-65: "If the marker is omitted, the relay is used for both
    // purposes."
    pub fn is_readable(&self) -> bool {
        !self.has_write_marker // only "write" relays are not readable
    }

    pub fn is_writable(&self) -> bool {
        !self.has_read_marker // only "read" relays are not writable
    }
}

impl fmt::Display for RelaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl fmt::Debug for RelaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self)?;
        if self.has_read_marker {
            write!(f, " [r]")?;
        }
        if self.has_write_marker {
            write!(f, " [w]")?;
        }
        Ok(())
    }
}

// For purposes of set arithmetic only the url is considered

impl PartialEq for RelaySpec {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for RelaySpec {}

impl PartialOrd for RelaySpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RelaySpec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.url.cmp(&other.url)
    }
}

/// In-memory relay list cache keyed by author pubkey
#[derive(Default)]
pub struct RelayListCache {
    lists: HashMap<String, Vec<RelaySpec>>,
}

impl RelayListCache {
    /// Replace the relay list of an author. Relay urls are normalized and
    /// unparseable ones are dropped.
    pub fn insert(&mut self, author: impl Into<String>, relays: Vec<RelaySpec>) {
        let mut normalized: Vec<RelaySpec> = Vec::with_capacity(relays.len());
        for spec in relays {
            let Ok(url) = NormRelayUrl::new(&spec.url) else {
                debug!("dropping unparseable relay '{}' from relay list", spec.url);
                continue;
            };
            let spec = RelaySpec {
                url: url.to_string(),
                ..spec
            };
            if !normalized.contains(&spec) {
                normalized.push(spec);
            }
        }
        self.lists.insert(author.into(), normalized);
    }

    pub fn remove(&mut self, author: &str) {
        self.lists.remove(author);
    }

    pub fn get(&self, author: &str) -> Option<&[RelaySpec]> {
        self.lists.get(author).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

impl RelayDirectory for RelayListCache {
    fn write_relays(&self, author: &str) -> Option<Vec<String>> {
        let relays: Vec<String> = self
            .lists
            .get(author)?
            .iter()
            .filter(|spec| spec.is_writable())
            .map(|spec| spec.url.clone())
            .collect();

        if relays.is_empty() {
            None
        } else {
            Some(relays)
        }
    }
}
