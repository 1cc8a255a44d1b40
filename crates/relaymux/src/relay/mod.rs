use std::borrow::Borrow;
use std::fmt::{self, Display};
use std::sync::Arc;

use url::Url;
use uuid::Uuid;

use crate::{Error, Filter, Note};

pub mod message;
pub mod pool;
pub mod websocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// Subscription id of a single REQ sent to a single relay
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayReqId(pub String);

impl RelayReqId {
    pub fn byte_len() -> usize {
        uuid::fmt::Hyphenated::LENGTH
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RelayReqId {
    fn default() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<String> for RelayReqId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RelayReqId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<RelayReqId> for String {
    fn from(value: RelayReqId) -> Self {
        value.0
    }
}

impl Display for RelayReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Borrow<str> for RelayReqId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A relay url in canonical form (lowercase host, trailing slash), so the
/// same relay always compares equal no matter how it was written.
#[derive(Eq, PartialEq, Hash, Clone, Debug, PartialOrd, Ord)]
pub struct NormRelayUrl {
    url: Url,
}

impl NormRelayUrl {
    pub fn new(url: &str) -> Result<Self, Error> {
        let url = Url::parse(url.trim()).map_err(|_| Error::InvalidRelayUrl)?;
        if !matches!(url.scheme(), "ws" | "wss") || url.host_str().is_none() {
            return Err(Error::InvalidRelayUrl);
        }
        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl Display for NormRelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl From<NormRelayUrl> for String {
    fn from(value: NormRelayUrl) -> Self {
        value.url.into()
    }
}

/// Invoked by a connection once a queued REQ actually went out
pub type SentCallback = Box<dyn FnOnce() + Send>;

/// What the query engine needs from a relay connection. Transports (websocket,
/// in-process, test mocks) implement this; the engine never looks further.
pub trait Connection: Send + Sync {
    /// Unique id of this connection instance
    fn id(&self) -> &str;

    /// Normalized relay url
    fn address(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Ephemeral connections were opened for one specific request and must
    /// not receive requests meant for the default relay set
    fn is_ephemeral(&self) -> bool;

    /// NIP-50 full-text search capability
    fn supports_search(&self) -> bool;

    /// Queue a REQ. `on_sent` is called once it was actually transmitted.
    fn queue_req(&self, sub_id: &RelayReqId, filters: &[Filter], on_sent: SentCallback);

    /// Best effort CLOSE; closing an unknown or closed sub is a no-op
    fn close_req(&self, sub_id: &RelayReqId);
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("address", &self.address())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Inbound events from the transport layer
#[derive(Clone)]
pub enum TransportEvent {
    Event {
        conn_id: String,
        sub_id: String,
        note: Note,
    },
    Eose {
        conn_id: String,
        sub_id: String,
    },
    ConnectionLost {
        conn_id: String,
    },
    ConnectionRestored(Arc<dyn Connection>),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event { conn_id, sub_id, note } => f
                .debug_struct("Event")
                .field("conn_id", conn_id)
                .field("sub_id", sub_id)
                .field("note", &note.id)
                .finish(),
            Self::Eose { conn_id, sub_id } => f
                .debug_struct("Eose")
                .field("conn_id", conn_id)
                .field("sub_id", sub_id)
                .finish(),
            Self::ConnectionLost { conn_id } => f
                .debug_struct("ConnectionLost")
                .field("conn_id", conn_id)
                .finish(),
            Self::ConnectionRestored(conn) => {
                f.debug_tuple("ConnectionRestored").field(conn).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_relay_url_canonicalizes() {
        let a = NormRelayUrl::new("wss://Relay.Example.com").unwrap();
        let b = NormRelayUrl::new("wss://relay.example.com/").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "wss://relay.example.com/");
    }

    #[test]
    fn norm_relay_url_rejects_non_websockets() {
        assert!(NormRelayUrl::new("https://relay.example.com").is_err());
        assert!(NormRelayUrl::new("relay.example.com").is_err());
        assert!(NormRelayUrl::new("").is_err());
    }

    #[test]
    fn relay_req_ids_are_uuids() {
        let a = RelayReqId::default();
        let b = RelayReqId::default();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), RelayReqId::byte_len());
    }
}
