use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::relay::message::RelayMessage;
use crate::relay::websocket::{WebsocketEvent, WebsocketRelay};
use crate::relay::{Connection, NormRelayUrl, TransportEvent};
use crate::Result;

/// The set of websocket relays we keep connections to
pub struct RelayPool {
    relays: Vec<PoolRelay>,
    ping_rate: Duration,
}

struct PoolRelay {
    relay: Arc<WebsocketRelay>,
    /// only reconnects are reported as restored connections
    was_connected: bool,
}

impl Default for RelayPool {
    fn default() -> Self {
        RelayPool::new()
    }
}

impl RelayPool {
    // Constructs a new, empty RelayPool.
    pub fn new() -> RelayPool {
        RelayPool {
            relays: vec![],
            ping_rate: Duration::from_secs(25),
        }
    }

    pub fn ping_rate(&mut self, duration: Duration) -> &mut Self {
        self.ping_rate = duration;
        self
    }

    pub fn has(&self, url: &str) -> bool {
        self.get(url).is_some()
    }

    pub fn get(&self, url: &str) -> Option<&Arc<WebsocketRelay>> {
        self.relays
            .iter()
            .map(|r| &r.relay)
            .find(|relay| relay.address() == url)
    }

    pub fn urls(&self) -> BTreeSet<String> {
        self.relays
            .iter()
            .map(|r| r.relay.address().to_owned())
            .collect()
    }

    /// Every relay as a query engine connection
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.relays
            .iter()
            .map(|r| r.relay.clone() as Arc<dyn Connection>)
            .collect()
    }

    /// Adds a websocket url to the pool, returning the existing relay if we
    /// already have it.
    pub fn add_url(
        &mut self,
        url: &str,
        wakeup: impl Fn() + Send + Sync + 'static,
    ) -> Result<Arc<WebsocketRelay>> {
        let url = NormRelayUrl::new(url)?;
        if let Some(existing) = self.get(url.as_str()) {
            return Ok(existing.clone());
        }
        self.add_relay(WebsocketRelay::new(url, wakeup)?)
    }

    /// Add an already configured relay (eg. ephemeral or search capable)
    pub fn add_relay(&mut self, relay: WebsocketRelay) -> Result<Arc<WebsocketRelay>> {
        if let Some(existing) = self.get(relay.address()) {
            return Ok(existing.clone());
        }
        let relay = Arc::new(relay);
        self.relays.push(PoolRelay {
            relay: relay.clone(),
            was_connected: false,
        });
        Ok(relay)
    }

    pub fn remove_urls(&mut self, urls: &BTreeSet<String>) {
        self.relays
            .retain(|r| !urls.contains(r.relay.address()));
    }

    /// Keep relay connections alive by pinging relays that haven't been
    /// pinged in a while, and reconnect dropped ones.
    pub fn keepalive_ping(&mut self, wakeup: impl Fn() + Send + Sync + Clone + 'static) {
        for r in &self.relays {
            r.relay.keepalive(self.ping_rate, wakeup.clone());
        }
    }

    /// Receive the next transport event from any relay, in pool order.
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        for r in &mut self.relays {
            let conn: Arc<dyn Connection> = r.relay.clone();
            while let Some(event) = r.relay.try_recv() {
                if let Some(event) = transport_event(&conn, &mut r.was_connected, event) {
                    return Some(event);
                }
            }
        }

        None
    }
}

/// Translate a socket event of `conn` into what the query engine cares
/// about. Only reconnects count as restored connections, and a relay ending
/// a subscription with CLOSED is as good as EOSE.
fn transport_event(
    conn: &Arc<dyn Connection>,
    was_connected: &mut bool,
    event: WebsocketEvent,
) -> Option<TransportEvent> {
    let conn_id = conn.id().to_owned();
    match event {
        WebsocketEvent::Opened => {
            let reconnect = std::mem::replace(was_connected, true);
            if !reconnect {
                return None;
            }
            debug!("relay {} reconnected", conn.address());
            Some(TransportEvent::ConnectionRestored(conn.clone()))
        }
        WebsocketEvent::Closed => Some(TransportEvent::ConnectionLost { conn_id }),
        WebsocketEvent::Message(RelayMessage::Event(sub_id, note)) => Some(TransportEvent::Event {
            conn_id,
            sub_id,
            note,
        }),
        WebsocketEvent::Message(RelayMessage::Eose(sub_id)) => {
            Some(TransportEvent::Eose { conn_id, sub_id })
        }
        WebsocketEvent::Message(RelayMessage::Closed(sub_id, reason)) => {
            debug!("relay {} closed {}: {}", conn.address(), sub_id, reason);
            Some(TransportEvent::Eose { conn_id, sub_id })
        }
        WebsocketEvent::Message(msg) => {
            debug!("relay {}: {:?}", conn.address(), msg);
            None
        }
    }
}
