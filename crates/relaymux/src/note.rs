use crate::Result;
use serde_derive::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A nostr event as streamed back from a relay
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Note {
    /// 32-bytes sha256 of the the serialized event data, hex encoded
    pub id: String,
    /// 32-bytes hex-encoded public key of the event creator
    pub pubkey: String,
    /// unix timestamp in seconds
    pub created_at: u64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// 64-bytes signature of the sha256 hash of the serialized event data.
    /// Signatures are not verified here.
    #[serde(default)]
    pub sig: String,
}

impl Hash for Note {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialEq for Note {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Note {}

impl Note {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(Into::into)
    }

    /// The first value of every tag named `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags.iter().filter_map(move |tag| {
            if tag.len() < 2 || tag[0] != name {
                return None;
            }
            Some(tag[1].as_str())
        })
    }
}

impl std::str::FromStr for Note {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        Note::from_json(s)
    }
}
