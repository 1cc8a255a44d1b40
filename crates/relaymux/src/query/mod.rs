use hashbrown::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::relay::{Connection, RelayReqId};
use crate::selector::BuiltReqFilter;
use crate::{Filter, Note};

pub mod store;
pub mod task;
pub mod trace;

pub use store::{NoteCollection, NoteStore};
pub use task::{spawn_query, QueryCommand, QueryHandle, QueryStatus};
pub use trace::{QueryTrace, TraceReport, TraceState};

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Keep the subscription open after every relay sent EOSE
    pub leave_open: bool,
    /// Traces still waiting after this long are force completed
    pub timeout: Duration,
    /// Delay between `cancel` and the query becoming removable
    pub grace: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            leave_open: false,
            timeout: Duration::from_millis(5_000),
            grace: Duration::from_millis(5_000),
        }
    }
}

/// Why a dispatch was not sent over a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    /// The dispatch is pinned to a different relay
    RelayMismatch,
    /// Default relay dispatches never go to single purpose connections
    EphemeralConnection,
    /// Search filters need a NIP-50 relay
    SearchUnsupported,
}

pub type RejectionHook = Box<dyn Fn(&dyn Connection, &BuiltReqFilter, GateRejection) + Send + Sync>;

/// One logical subscription spread over any number of relay traces.
///
/// The query is a plain state machine; time only moves through
/// `check_traces` and the timestamps recorded by the transitions. Its
/// visible filters are always derived from the traces.
pub struct Query {
    id: String,
    instance: String,
    traces: Vec<QueryTrace>,
    connections: HashMap<String, Arc<dyn Connection>>,
    leave_open: bool,
    cancel_at: Option<Instant>,
    timeout: Duration,
    grace: Duration,
    feed: Arc<dyn NoteStore>,
    sent_tx: mpsc::UnboundedSender<(RelayReqId, Instant)>,
    sent_rx: mpsc::UnboundedReceiver<(RelayReqId, Instant)>,
    reports: Vec<TraceReport>,
    on_rejected: Option<RejectionHook>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("traces", &self.traces)
            .field("leave_open", &self.leave_open)
            .field("cancel_at", &self.cancel_at)
            .finish()
    }
}

/// Send a CLOSE for a trace if we still know its connection
fn close_on(connections: &HashMap<String, Arc<dyn Connection>>, trace: &QueryTrace) {
    if let Some(conn) = connections.get(trace.conn_id()) {
        conn.close_req(trace.id());
    }
}

impl Query {
    pub fn new(
        id: impl Into<String>,
        instance: impl Into<String>,
        feed: Arc<dyn NoteStore>,
        options: QueryOptions,
    ) -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            id: id.into(),
            instance: instance.into(),
            traces: Vec::new(),
            connections: HashMap::new(),
            leave_open: options.leave_open,
            cancel_at: None,
            timeout: options.timeout,
            grace: options.grace,
            feed,
            sent_tx,
            sent_rx,
            reports: Vec::new(),
            on_rejected: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the request builder this query was created from
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn feed(&self) -> &Arc<dyn NoteStore> {
        &self.feed
    }

    pub fn traces(&self) -> &[QueryTrace] {
        &self.traces
    }

    pub fn leave_open(&self) -> bool {
        self.leave_open
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancel_at(&self) -> Option<Instant> {
        self.cancel_at
    }

    /// Called with every dispatch a connection refused. Rejections are
    /// otherwise only visible as a debug log.
    pub fn set_rejection_hook(&mut self, hook: RejectionHook) {
        self.on_rejected = Some(hook);
    }

    /// A leave-open query that nobody cancelled
    pub fn is_open(&self) -> bool {
        self.cancel_at.is_none() && self.leave_open
    }

    /// The cancel grace period is over
    pub fn can_remove(&self) -> bool {
        self.cancel_at.is_some_and(|at| at <= Instant::now())
    }

    /// Every trace is closed. Vacuously true without traces.
    pub fn is_closed(&self) -> bool {
        self.traces.iter().all(QueryTrace::is_closed)
    }

    /// The filters of every trace, in trace order
    pub fn filters(&self) -> Vec<Filter> {
        self.traces
            .iter()
            .flat_map(|t| t.filters().iter().cloned())
            .collect()
    }

    /// Route a note from a relay subscription into the feed. Notes that do
    /// not match the filters of the trace they arrived on are dropped.
    pub fn handle_event(&mut self, sub_id: &str, note: &Note) -> bool {
        let Some(trace) = self.traces.iter().find(|t| t.id().as_str() == sub_id) else {
            return false;
        };

        if !trace.filters().iter().any(|f| f.matches(note)) {
            debug!(
                "{}: note {} from {} does not match its filters, dropping",
                self.id,
                note.id,
                trace.relay()
            );
            return false;
        }

        self.feed.add(std::slice::from_ref(note));
        true
    }

    /// Schedule removal after the grace period
    pub fn cancel(&mut self) {
        self.cancel_at = Some(Instant::now() + self.grace);
    }

    pub fn uncancel(&mut self) {
        self.cancel_at = None;
    }

    /// Forget connections and pending sent notifications. Call after
    /// `send_close` when the query is torn down.
    pub fn cleanup(&mut self) {
        // nothing will finish the remaining traces anymore
        if self.feed.loading() {
            self.feed.set_loading(false);
        }
        self.connections.clear();
        self.sent_rx.close();
        while self.sent_rx.try_recv().is_ok() {}
    }

    /// Record a request that was answered without going to the network,
    /// eg. from a cache.
    pub fn insert_completed_trace(&mut self, dispatch: &BuiltReqFilter, notes: &[Note]) -> RelayReqId {
        let mut trace = QueryTrace::new(dispatch.relay.clone(), dispatch.filters.clone(), "");
        trace.sent_to_relay();
        trace.got_eose();
        let id = trace.id().clone();
        self.traces.push(trace);

        self.feed.add(notes);
        self.on_progress();
        id
    }

    fn gate(&self, conn: &dyn Connection, dispatch: &BuiltReqFilter) -> Result<(), GateRejection> {
        if !dispatch.relay.is_empty() && dispatch.relay != conn.address() {
            return Err(GateRejection::RelayMismatch);
        }
        if dispatch.relay.is_empty() && conn.is_ephemeral() {
            return Err(GateRejection::EphemeralConnection);
        }
        if dispatch.has_search() && !conn.supports_search() {
            return Err(GateRejection::SearchUnsupported);
        }
        Ok(())
    }

    /// Send a dispatch over a connection if the connection may carry it.
    /// Refused dispatches create no trace.
    pub fn send_to_relay(
        &mut self,
        conn: &Arc<dyn Connection>,
        dispatch: &BuiltReqFilter,
    ) -> Option<RelayReqId> {
        if let Err(reason) = self.gate(conn.as_ref(), dispatch) {
            debug!(
                "{}: not sending '{}' dispatch to {}: {:?}",
                self.id,
                dispatch.relay,
                conn.address(),
                reason
            );
            if let Some(hook) = &self.on_rejected {
                hook(conn.as_ref(), dispatch, reason);
            }
            return None;
        }

        Some(self.send_internal(conn, dispatch.filters.clone()))
    }

    fn send_internal(&mut self, conn: &Arc<dyn Connection>, filters: Vec<Filter>) -> RelayReqId {
        let trace = QueryTrace::new(conn.address(), filters, conn.id());
        let id = trace.id().clone();

        self.connections
            .insert(conn.id().to_owned(), conn.clone());

        let sent_tx = self.sent_tx.clone();
        let sent_id = id.clone();
        tracing::trace!("{}: queueing {} on {}", self.id, id, conn.address());
        conn.queue_req(
            &id,
            trace.filters(),
            Box::new(move || {
                // the query may already be gone
                let _ = sent_tx.send((sent_id, Instant::now()));
            }),
        );

        self.traces.push(trace);
        self.on_progress();
        id
    }

    /// Apply the sent notifications connections reported since last time
    pub fn poll_sent(&mut self) -> usize {
        let mut applied = 0;
        while let Ok((id, at)) = self.sent_rx.try_recv() {
            if let Some(trace) = self.traces.iter_mut().find(|t| t.id() == &id) {
                if trace.sent_at(at) {
                    applied += 1;
                }
            }
        }
        applied
    }

    /// Force complete everything that was running on a lost connection
    pub fn connection_lost(&mut self, conn_id: &str) {
        let mut changed = false;
        for trace in self.traces.iter_mut().filter(|t| t.conn_id() == conn_id) {
            if trace.force_eose() {
                close_on(&self.connections, trace);
                self.reports.push(trace.report());
                changed = true;
            }
        }

        if changed {
            debug!("{}: connection {} lost, forced traces", self.id, conn_id);
            self.on_progress();
        }
    }

    /// Resend an open query's requests for the relay that came back, as
    /// fresh traces. Older traces on that relay that are still running are
    /// superseded and force completed.
    pub fn connection_restored(&mut self, conn: &Arc<dyn Connection>) -> Vec<RelayReqId> {
        if !self.is_open() {
            return Vec::new();
        }

        let mut resend: Vec<Vec<Filter>> = Vec::new();
        for trace in self.traces.iter_mut().filter(|t| t.relay() == conn.address()) {
            if !resend.iter().any(|f| f.as_slice() == trace.filters()) {
                resend.push(trace.filters().to_vec());
            }
            if trace.force_eose() {
                close_on(&self.connections, trace);
                self.reports.push(trace.report());
            }
        }

        if !resend.is_empty() {
            debug!(
                "{}: resending {} requests to {}",
                self.id,
                resend.len(),
                conn.address()
            );
        }

        resend
            .into_iter()
            .map(|filters| self.send_internal(conn, filters))
            .collect()
    }

    /// Close every trace
    pub fn send_close(&mut self) {
        for trace in &mut self.traces {
            if trace.send_close() {
                close_on(&self.connections, trace);
            }
        }
    }

    /// EOSE from `conn_id` for one of our traces. Queries that are not left
    /// open close the trace right away.
    pub fn eose(&mut self, sub_id: &str, conn_id: &str) {
        let Some(trace) = self
            .traces
            .iter_mut()
            .find(|t| t.id().as_str() == sub_id && t.conn_id() == conn_id)
        else {
            return;
        };

        if trace.got_eose() {
            self.reports.push(trace.report());
        }
        if !self.leave_open && trace.send_close() {
            close_on(&self.connections, trace);
        }

        self.on_progress();
    }

    /// Fraction of finished traces, 0 without traces
    pub fn progress(&self) -> f32 {
        if self.traces.is_empty() {
            return 0.0;
        }
        let finished = self.traces.iter().filter(|t| t.finished()).count();
        finished as f32 / self.traces.len() as f32
    }

    fn all_finished(&self) -> bool {
        !self.traces.is_empty() && self.traces.iter().all(QueryTrace::finished)
    }

    /// Force complete traces that ran past the timeout
    pub fn check_traces(&mut self) {
        let timeout = self.timeout;
        let mut changed = false;
        for trace in &mut self.traces {
            if trace.finished() || trace.runtime() <= timeout {
                continue;
            }
            if trace.force_eose() {
                debug!("{}: {} on {} timed out", self.id, trace.id(), trace.relay());
                close_on(&self.connections, trace);
                self.reports.push(trace.report());
                changed = true;
            }
        }

        if changed {
            self.on_progress();
        }
    }

    /// Reports of traces completed since the last call
    pub fn drain_reports(&mut self) -> Vec<TraceReport> {
        std::mem::take(&mut self.reports)
    }

    fn on_progress(&mut self) {
        if self.traces.is_empty() {
            return;
        }
        let loading = !self.all_finished();
        if self.feed.loading() != loading {
            debug!(
                "{} loading={} progress={} traces={}",
                self.id,
                loading,
                self.progress(),
                self.traces.len()
            );
            self.feed.set_loading(loading);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::RequestStrategy;
    use crate::test_utils::{note, MockConnection};
    use std::sync::Mutex;
    use tokio::time::advance;

    fn dispatch(relay: &str, filters: Vec<Filter>) -> BuiltReqFilter {
        BuiltReqFilter {
            filters,
            relay: relay.to_owned(),
            strategy: if relay.is_empty() {
                RequestStrategy::DefaultRelays
            } else {
                RequestStrategy::ExplicitRelays
            },
        }
    }

    fn query(leave_open: bool) -> (Query, Arc<NoteCollection>) {
        let feed = Arc::new(NoteCollection::new());
        let q = Query::new(
            "test",
            "instance",
            feed.clone(),
            QueryOptions {
                leave_open,
                ..Default::default()
            },
        );
        (q, feed)
    }

    fn conn(address: &str) -> (Arc<MockConnection>, Arc<dyn Connection>) {
        let mock = Arc::new(MockConnection::new(address));
        let dyn_conn: Arc<dyn Connection> = mock.clone();
        (mock, dyn_conn)
    }

    /// A note whose kind is not in the trace's filter never reaches the feed.
    #[tokio::test(start_paused = true)]
    async fn handle_event_drops_non_matching_notes() {
        let (mut q, feed) = query(false);
        let (_mock, c) = conn("wss://a.com/");

        let sub = q
            .send_to_relay(&c, &dispatch("", vec![Filter::new().kinds([1]).build()]))
            .unwrap();

        assert!(!q.handle_event(sub.as_str(), &note("n2", "p", 2, 10)));
        assert!(feed.is_empty());

        assert!(q.handle_event(sub.as_str(), &note("n1", "p", 1, 10)));
        assert_eq!(feed.len(), 1);

        // unknown subscriptions are ignored
        assert!(!q.handle_event("other", &note("n3", "p", 1, 10)));
    }

    /// Losing the only connection completes every trace on it at once.
    #[tokio::test(start_paused = true)]
    async fn connection_lost_completes_all_traces() {
        let (mut q, feed) = query(false);
        let (_mock, c) = conn("wss://a.com/");

        for kind in [1, 6, 7] {
            q.send_to_relay(&c, &dispatch("", vec![Filter::new().kinds([kind]).build()]));
        }
        assert_eq!(q.progress(), 0.0);
        assert!(feed.loading());

        q.connection_lost(c.id());
        assert_eq!(q.progress(), 1.0);
        assert!(!feed.loading());
        assert!(q.is_closed());

        let reports = q.drain_reports();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.was_forced));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_zero_without_traces() {
        let (q, feed) = query(false);
        assert_eq!(q.progress(), 0.0);
        assert!(!feed.loading());
        assert!(q.filters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gate_rejects_silently_and_calls_hook() {
        let (mut q, _feed) = query(false);
        let rejections = Arc::new(Mutex::new(Vec::new()));
        let seen = rejections.clone();
        q.set_rejection_hook(Box::new(
            move |_conn: &dyn Connection, _dispatch: &BuiltReqFilter, reason: GateRejection| {
                seen.lock().unwrap().push(reason);
            },
        ));

        let plain = Arc::new(MockConnection::new("wss://plain.com/")) as Arc<dyn Connection>;
        let ephemeral =
            Arc::new(MockConnection::new("wss://eph.com/").ephemeral(true)) as Arc<dyn Connection>;

        let search = dispatch("", vec![Filter::new().search("nostr").build()]);
        assert!(q.send_to_relay(&plain, &search).is_none());
        assert!(q
            .send_to_relay(&ephemeral, &dispatch("", vec![Filter::universal()]))
            .is_none());
        assert!(q
            .send_to_relay(&plain, &dispatch("wss://other.com/", vec![Filter::universal()]))
            .is_none());

        // relay specific dispatches are fine on ephemeral connections
        assert!(q
            .send_to_relay(&ephemeral, &dispatch("wss://eph.com/", vec![Filter::universal()]))
            .is_some());

        assert_eq!(q.traces().len(), 1);
        assert_eq!(
            *rejections.lock().unwrap(),
            vec![
                GateRejection::SearchUnsupported,
                GateRejection::EphemeralConnection,
                GateRejection::RelayMismatch
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn search_goes_to_search_relays() {
        let (mut q, _feed) = query(false);
        let c = Arc::new(MockConnection::new("wss://search.com/").with_search(true))
            as Arc<dyn Connection>;
        let search = dispatch("", vec![Filter::new().search("nostr").build()]);
        assert!(q.send_to_relay(&c, &search).is_some());
    }

    /// EOSE closes the trace unless the query stays open.
    #[tokio::test(start_paused = true)]
    async fn eose_closes_unless_left_open() {
        let (mut q, _feed) = query(false);
        let (mock, c) = conn("wss://a.com/");
        let sub = q.send_to_relay(&c, &dispatch("", vec![Filter::universal()])).unwrap();
        q.poll_sent();

        // wrong connection id is ignored
        q.eose(sub.as_str(), "someone-else");
        assert_eq!(q.progress(), 0.0);

        q.eose(sub.as_str(), c.id());
        assert_eq!(q.progress(), 1.0);
        assert_eq!(q.traces()[0].state(), TraceState::Closed);
        assert_eq!(mock.closes(), vec![sub.clone()]);

        let (mut open, _feed) = query(true);
        let sub = open.send_to_relay(&c, &dispatch("", vec![Filter::universal()])).unwrap();
        open.eose(sub.as_str(), c.id());
        assert_eq!(open.traces()[0].state(), TraceState::Completed);
    }

    /// The on_sent callback of the connection lands on the trace.
    #[tokio::test(start_paused = true)]
    async fn sent_notifications_are_applied() {
        let (mut q, _feed) = query(false);
        let (mock, c) = conn("wss://a.com/");
        mock.hold_sent(true);

        q.send_to_relay(&c, &dispatch("", vec![Filter::universal()]));
        assert_eq!(q.traces()[0].state(), TraceState::Queued);

        advance(Duration::from_millis(120)).await;
        mock.flush_sent();
        assert_eq!(q.poll_sent(), 1);
        assert_eq!(q.traces()[0].state(), TraceState::Sent);
        assert_eq!(q.traces()[0].queued(), Duration::from_millis(120));
    }

    #[tokio::test(start_paused = true)]
    async fn check_traces_forces_after_timeout() {
        let (mut q, _feed) = query(false);
        let (_mock, c) = conn("wss://a.com/");
        q.send_to_relay(&c, &dispatch("", vec![Filter::universal()]));

        advance(Duration::from_millis(5_000)).await;
        q.check_traces();
        assert_eq!(q.progress(), 0.0);

        advance(Duration::from_millis(1)).await;
        q.check_traces();
        assert_eq!(q.progress(), 1.0);
        assert!(q.drain_reports()[0].was_forced);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_waits_for_grace_period() {
        let (mut q, _feed) = query(true);
        assert!(q.is_open());

        q.cancel();
        assert!(!q.is_open());
        assert!(!q.can_remove());

        advance(Duration::from_millis(4_999)).await;
        assert!(!q.can_remove());
        q.uncancel();
        assert!(q.is_open());

        q.cancel();
        advance(Duration::from_millis(5_000)).await;
        assert!(q.can_remove());
    }

    /// Open queries come back on reconnect with fresh subscriptions.
    #[tokio::test(start_paused = true)]
    async fn restored_connection_resends_open_queries() {
        let (mut q, _feed) = query(true);
        let (mock, c) = conn("wss://a.com/");
        let kinds = vec![Filter::new().kinds([1]).build()];
        let first = q.send_to_relay(&c, &dispatch("", kinds.clone())).unwrap();

        q.connection_lost(c.id());
        let resent = q.connection_restored(&c);

        assert_eq!(resent.len(), 1);
        assert_ne!(resent[0], first);
        assert_eq!(mock.reqs().len(), 2);
        assert_eq!(mock.reqs()[1].1, kinds);
        assert_eq!(q.traces().len(), 2);
        assert_eq!(q.progress(), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn restored_connection_ignores_closing_queries() {
        let (mut q, _feed) = query(false);
        let (mock, c) = conn("wss://a.com/");
        q.send_to_relay(&c, &dispatch("", vec![Filter::universal()]));

        assert!(q.connection_restored(&c).is_empty());
        assert_eq!(mock.reqs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_traces_feed_notes_without_network() {
        let (mut q, feed) = query(false);
        q.insert_completed_trace(
            &dispatch("wss://cache/", vec![Filter::new().kinds([1]).build()]),
            &[note("a", "p", 1, 1), note("b", "p", 1, 2)],
        );

        assert_eq!(feed.len(), 2);
        assert_eq!(q.progress(), 1.0);
        assert_eq!(q.filters(), vec![Filter::new().kinds([1]).build()]);
        assert_eq!(q.traces()[0].state(), TraceState::Completed);
    }

    /// Filters are derived from the traces, never stored separately.
    #[tokio::test(start_paused = true)]
    async fn filters_follow_traces() {
        let (mut q, _feed) = query(false);
        let (_mock, c) = conn("wss://a.com/");
        let a = Filter::new().kinds([1]).build();
        let b = Filter::new().kinds([7]).build();
        q.send_to_relay(&c, &dispatch("", vec![a.clone()]));
        q.send_to_relay(&c, &dispatch("wss://a.com/", vec![b.clone()]));
        assert_eq!(q.filters(), vec![a, b]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_close_closes_every_trace_once() {
        let (mut q, _feed) = query(true);
        let (mock, c) = conn("wss://a.com/");
        q.send_to_relay(&c, &dispatch("", vec![Filter::universal()]));
        q.send_to_relay(&c, &dispatch("", vec![Filter::new().kinds([1]).build()]));

        q.send_close();
        q.send_close();
        assert!(q.is_closed());
        assert_eq!(mock.closes().len(), 2);
    }

    /// A query that is not left open closes every trace through the timeout
    /// alone, without ever being cancelled.
    #[tokio::test(start_paused = true)]
    async fn timeout_alone_closes_every_trace() {
        let (mut q, feed) = query(false);
        let (a, ca) = conn("wss://a.com/");
        let (b, cb) = conn("wss://b.com/");
        q.send_to_relay(&ca, &dispatch("", vec![Filter::new().kinds([1]).build()]));
        q.send_to_relay(&cb, &dispatch("", vec![Filter::new().kinds([1]).build()]));
        q.poll_sent();
        assert!(feed.loading());

        advance(Duration::from_millis(5_001)).await;
        q.check_traces();

        assert!(q.is_closed());
        assert_eq!(q.progress(), 1.0);
        assert!(!feed.loading());
        assert_eq!(a.closes().len(), 1);
        assert_eq!(b.closes().len(), 1);
        assert_eq!(q.drain_reports().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_clears_loading_of_unfinished_traces() {
        let (mut q, feed) = query(true);
        let (_mock, c) = conn("wss://a.com/");
        q.send_to_relay(&c, &dispatch("", vec![Filter::universal()]));
        assert!(feed.loading());

        q.send_close();
        q.cleanup();
        assert!(!feed.loading());
        assert_eq!(q.progress(), 0.0);
    }
}
