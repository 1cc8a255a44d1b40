use std::time::Duration;
use tokio::time::Instant;

use crate::relay::RelayReqId;
use crate::Filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Queued,
    Sent,
    Completed,
    Closed,
}

/// Emitted once per trace when it completes, forced or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceReport {
    pub id: RelayReqId,
    pub relay: String,
    pub conn_id: String,
    pub was_forced: bool,
    pub queued: Duration,
    pub response_time: Duration,
}

/// Lifecycle of one REQ on one relay connection.
///
/// Each transition method returns `true` only the first time it takes
/// effect, so callers can attach side effects (CLOSE, reports) to exactly
/// one transition.
#[derive(Debug, Clone)]
pub struct QueryTrace {
    id: RelayReqId,
    relay: String,
    filters: Vec<Filter>,
    conn_id: String,
    start: Instant,
    sent: Option<Instant>,
    eose: Option<Instant>,
    close: Option<Instant>,
    was_forced: bool,
}

impl QueryTrace {
    pub fn new(relay: impl Into<String>, filters: Vec<Filter>, conn_id: impl Into<String>) -> Self {
        Self {
            id: RelayReqId::default(),
            relay: relay.into(),
            filters,
            conn_id: conn_id.into(),
            start: Instant::now(),
            sent: None,
            eose: None,
            close: None,
            was_forced: false,
        }
    }

    pub fn id(&self) -> &RelayReqId {
        &self.id
    }

    pub fn relay(&self) -> &str {
        &self.relay
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn sent(&self) -> Option<Instant> {
        self.sent
    }

    pub fn eose(&self) -> Option<Instant> {
        self.eose
    }

    pub fn close(&self) -> Option<Instant> {
        self.close
    }

    pub fn was_forced(&self) -> bool {
        self.was_forced
    }

    pub fn sent_to_relay(&mut self) -> bool {
        self.sent_at(Instant::now())
    }

    /// Record the moment the connection actually wrote the REQ
    pub fn sent_at(&mut self, at: Instant) -> bool {
        if self.sent.is_some() {
            return false;
        }
        self.sent = Some(at);
        true
    }

    /// The relay told us it has no more stored notes
    pub fn got_eose(&mut self) -> bool {
        if self.finished() {
            return false;
        }
        let now = Instant::now();
        // the sent notification can trail the EOSE it caused
        self.sent.get_or_insert(now);
        self.eose = Some(now);
        true
    }

    /// Complete without waiting for the relay (timeout, disconnect). Also
    /// closes the trace.
    pub fn force_eose(&mut self) -> bool {
        if self.finished() {
            return false;
        }
        let now = Instant::now();
        self.sent.get_or_insert(now);
        self.eose = Some(now);
        self.was_forced = true;
        self.send_close();
        true
    }

    pub fn send_close(&mut self) -> bool {
        if self.close.is_some() {
            return false;
        }
        self.close = Some(Instant::now());
        true
    }

    /// Time spent before the relay got the REQ. Forced traces count up to
    /// the forced completion, unsent ones up to now.
    pub fn queued(&self) -> Duration {
        let end = match (self.sent, self.eose) {
            (Some(_), Some(eose)) if self.was_forced => eose,
            (Some(sent), _) => sent,
            (None, _) => Instant::now(),
        };
        end.saturating_duration_since(self.start)
    }

    pub fn runtime(&self) -> Duration {
        self.eose
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.start)
    }

    /// Time between sending the REQ and EOSE, zero until both happened
    pub fn response_time(&self) -> Duration {
        match (self.sent, self.eose) {
            (Some(sent), Some(eose)) => eose.saturating_duration_since(sent),
            _ => Duration::ZERO,
        }
    }

    /// We got EOSE or gave up waiting for it
    pub fn finished(&self) -> bool {
        self.eose.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_some()
    }

    pub fn state(&self) -> TraceState {
        if self.is_closed() {
            TraceState::Closed
        } else if self.finished() {
            TraceState::Completed
        } else if self.sent.is_some() {
            TraceState::Sent
        } else {
            TraceState::Queued
        }
    }

    pub fn report(&self) -> TraceReport {
        TraceReport {
            id: self.id.clone(),
            relay: self.relay.clone(),
            conn_id: self.conn_id.clone(),
            was_forced: self.was_forced,
            queued: self.queued(),
            response_time: self.response_time(),
        }
    }
}
