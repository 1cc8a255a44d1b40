use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ewebsock::{Options, WsEvent, WsMessage, WsReceiver, WsSender};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::relay::message::{ClientMessage, RelayMessage};
use crate::relay::{Connection, NormRelayUrl, RelayReqId, RelayStatus, SentCallback};
use crate::{Filter, Result};

/// Things that happened on a websocket, already decoded
#[derive(Debug)]
pub enum WebsocketEvent {
    Opened,
    Closed,
    Message(RelayMessage),
}

struct PendingReq {
    sub_id: RelayReqId,
    json: String,
    on_sent: SentCallback,
}

struct WebsocketConn {
    status: RelayStatus,
    sender: WsSender,
    receiver: WsReceiver,
    /// REQs queued while the socket was not open yet
    pending: Vec<PendingReq>,
    last_ping: Instant,
    last_connect_attempt: Instant,
    retry_connect_after: Duration,
}

/// A websocket relay connection
pub struct WebsocketRelay {
    id: String,
    url: NormRelayUrl,
    ephemeral: bool,
    supports_search: bool,
    conn: Mutex<WebsocketConn>,
}

impl fmt::Debug for WebsocketRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebsocketRelay")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("status", &self.status())
            .finish()
    }
}

impl WebsocketRelay {
    pub fn new(url: NormRelayUrl, wakeup: impl Fn() + Send + Sync + 'static) -> Result<Self> {
        let (sender, receiver) =
            ewebsock::connect_with_wakeup(url.as_str(), Options::default(), wakeup)?;

        let now = Instant::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            url,
            ephemeral: false,
            supports_search: false,
            conn: Mutex::new(WebsocketConn {
                status: RelayStatus::Connecting,
                sender,
                receiver,
                pending: Vec::new(),
                last_ping: now,
                last_connect_attempt: now,
                retry_connect_after: Self::initial_reconnect_duration(),
            }),
        })
    }

    /// Only used for a single request, never for the default relay set
    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    /// Set from the relay's NIP-11 document (supported_nips contains 50)
    pub fn with_search(mut self, supports_search: bool) -> Self {
        self.supports_search = supports_search;
        self
    }

    pub fn initial_reconnect_duration() -> Duration {
        Duration::from_secs(5)
    }

    pub fn url(&self) -> &NormRelayUrl {
        &self.url
    }

    pub fn status(&self) -> RelayStatus {
        self.lock().status
    }

    fn lock(&self) -> MutexGuard<'_, WebsocketConn> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_text(&self, conn: &mut WebsocketConn, json: String) {
        trace!("sending {} to {}", json, self.url);
        conn.sender.send(WsMessage::Text(json));
    }

    /// Reconnect with backoff when disconnected, ping when connected
    pub fn keepalive(&self, ping_rate: Duration, wakeup: impl Fn() + Send + Sync + 'static) {
        let now = Instant::now();
        let mut conn = self.lock();

        match conn.status {
            RelayStatus::Disconnected => {
                let reconnect_at = conn.last_connect_attempt + conn.retry_connect_after;
                if now <= reconnect_at {
                    return;
                }

                conn.last_connect_attempt = now;
                let next_duration = Duration::from_millis(
                    ((conn.retry_connect_after.as_millis() as f64) * 1.5) as u64,
                );
                debug!(
                    "bumping reconnect duration from {:?} to {:?} and retrying connect",
                    conn.retry_connect_after, next_duration
                );
                conn.retry_connect_after = next_duration;

                match ewebsock::connect_with_wakeup(self.url.as_str(), Options::default(), wakeup) {
                    Ok((sender, receiver)) => {
                        conn.sender = sender;
                        conn.receiver = receiver;
                        conn.status = RelayStatus::Connecting;
                    }
                    Err(err) => error!("error connecting to relay {}: {}", self.url, err),
                }
            }

            RelayStatus::Connected => {
                conn.retry_connect_after = Self::initial_reconnect_duration();

                if now - conn.last_ping > ping_rate {
                    trace!("pinging {}", self.url);
                    conn.sender.send(WsMessage::Ping(vec![]));
                    conn.last_ping = now;
                }
            }

            RelayStatus::Connecting => {}
        }
    }

    /// Receive and decode one websocket event, if any is waiting
    pub fn try_recv(&self) -> Option<WebsocketEvent> {
        let mut conn = self.lock();
        let event = conn.receiver.try_recv()?;

        match event {
            WsEvent::Opened => {
                conn.status = RelayStatus::Connected;
                conn.retry_connect_after = Self::initial_reconnect_duration();

                let pending = std::mem::take(&mut conn.pending);
                for req in pending {
                    debug!("flushing queued REQ {} to {}", req.sub_id, self.url);
                    self.send_text(&mut conn, req.json);
                    (req.on_sent)();
                }
                Some(WebsocketEvent::Opened)
            }
            WsEvent::Closed => {
                conn.status = RelayStatus::Disconnected;
                // the query engine resends what it still needs on reconnect
                conn.pending.clear();
                Some(WebsocketEvent::Closed)
            }
            WsEvent::Error(err) => {
                error!("relay {} error: {:?}", self.url, err);
                conn.status = RelayStatus::Disconnected;
                conn.pending.clear();
                Some(WebsocketEvent::Closed)
            }
            WsEvent::Message(WsMessage::Text(text)) => match RelayMessage::from_json(&text) {
                Ok(RelayMessage::Notice(msg)) => {
                    warn!("Notice from {}: {}", self.url, msg);
                    None
                }
                Ok(msg) => Some(WebsocketEvent::Message(msg)),
                Err(err) => {
                    error!("relay {} message decode error: {:?}", self.url, err);
                    None
                }
            },
            #[cfg(not(target_arch = "wasm32"))]
            WsEvent::Message(WsMessage::Ping(bs)) => {
                conn.sender.send(WsMessage::Pong(bs));
                None
            }
            WsEvent::Message(_) => None,
        }
    }
}

impl Connection for WebsocketRelay {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> &str {
        self.url.as_str()
    }

    fn is_connected(&self) -> bool {
        self.status() == RelayStatus::Connected
    }

    fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    fn supports_search(&self) -> bool {
        self.supports_search
    }

    fn queue_req(&self, sub_id: &RelayReqId, filters: &[Filter], on_sent: SentCallback) {
        let json = match ClientMessage::req(sub_id.as_str(), filters).to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("error serializing json for filter: {e}");
                return;
            }
        };

        let mut conn = self.lock();
        if conn.status != RelayStatus::Connected {
            debug!("queueing REQ {} until {} is connected", sub_id, self.url);
            conn.pending.push(PendingReq {
                sub_id: sub_id.clone(),
                json,
                on_sent,
            });
            return;
        }

        self.send_text(&mut conn, json);
        drop(conn);
        on_sent();
    }

    fn close_req(&self, sub_id: &RelayReqId) {
        let mut conn = self.lock();

        // never sent, nothing to close on the relay
        let before = conn.pending.len();
        conn.pending.retain(|req| &req.sub_id != sub_id);
        if conn.pending.len() != before {
            return;
        }

        if conn.status != RelayStatus::Connected {
            return;
        }

        match ClientMessage::close(sub_id.as_str()).to_json() {
            Ok(json) => self.send_text(&mut conn, json),
            Err(e) => error!("error serializing CLOSE: {e}"),
        }
    }
}
