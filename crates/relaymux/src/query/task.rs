use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::{NoteStore, Query, TraceReport};
use crate::config::QueryConfig;
use crate::relay::{Connection, TransportEvent};
use crate::selector::BuiltReqFilter;
use crate::{Filter, Note};

/// Everything that can happen to a running query
pub enum QueryCommand {
    Transport(TransportEvent),
    Send {
        conn: Arc<dyn Connection>,
        dispatch: BuiltReqFilter,
    },
    InsertCompleted {
        dispatch: BuiltReqFilter,
        notes: Vec<Note>,
    },
    Cancel,
    /// Revive a cancelled query. The sender, if any, is answered once the
    /// query is running again and dropped if it was torn down first.
    Uncancel(Option<oneshot::Sender<()>>),
    /// Tear down right away, skipping the grace period
    Close,
}

impl std::fmt::Debug for QueryCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(ev) => f.debug_tuple("Transport").field(ev).finish(),
            Self::Send { conn, dispatch } => f
                .debug_struct("Send")
                .field("conn", &conn.address())
                .field("dispatch", dispatch)
                .finish(),
            Self::InsertCompleted { dispatch, notes } => f
                .debug_struct("InsertCompleted")
                .field("dispatch", dispatch)
                .field("notes", &notes.len())
                .finish(),
            Self::Cancel => f.write_str("Cancel"),
            Self::Uncancel(_) => f.write_str("Uncancel"),
            Self::Close => f.write_str("Close"),
        }
    }
}

/// Snapshot of a running query, published after every change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStatus {
    pub progress: f32,
    pub loading: bool,
    pub filters: Vec<Filter>,
    pub traces: usize,
    /// every trace has been closed
    pub traces_closed: bool,
    pub open: bool,
    pub cancel_pending: bool,
    /// the query was torn down, nothing will change anymore
    pub closed: bool,
}

impl QueryStatus {
    fn of(query: &Query) -> Self {
        Self {
            filters: query.filters(),
            ..Self::summary(query)
        }
    }

    /// Everything but the filters
    fn summary(query: &Query) -> Self {
        Self {
            progress: query.progress(),
            loading: query.feed().loading(),
            filters: Vec::new(),
            traces: query.traces().len(),
            traces_closed: query.is_closed(),
            open: query.is_open(),
            cancel_pending: query.cancel_at().is_some(),
            closed: false,
        }
    }

    /// Bring the status up to date with `query`, returning whether anything
    /// changed. Traces are only ever added, so the filters are rebuilt only
    /// when the trace count moved.
    fn refresh(&mut self, query: &Query) -> bool {
        let mut next = Self::summary(query);
        if next.traces != self.traces {
            next.filters = query.filters();
            *self = next;
            return true;
        }

        let filters = std::mem::take(&mut self.filters);
        let changed = *self != next;
        *self = next;
        self.filters = filters;
        changed
    }
}

/// Owner side of a query running on its own task. Dropping the handle
/// tears the query down.
pub struct QueryHandle {
    id: String,
    instance: String,
    /// raw filters requested so far, what the next request is diffed against
    requested: Vec<Filter>,
    commands: mpsc::Sender<QueryCommand>,
    status: watch::Receiver<QueryStatus>,
    reports: Option<mpsc::UnboundedReceiver<TraceReport>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl QueryHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub(crate) fn set_instance(&mut self, instance: &str) {
        self.instance = instance.to_owned();
    }

    pub fn requested(&self) -> &[Filter] {
        &self.requested
    }

    pub(crate) fn add_requested(&mut self, filters: impl IntoIterator<Item = Filter>) {
        self.requested.extend(filters);
    }

    /// Queue a command. Waits while the query's command queue is full;
    /// returns false when the query is already gone.
    pub async fn send(&self, command: QueryCommand) -> bool {
        match self.commands.send(command).await {
            Ok(()) => true,
            Err(err) => {
                debug!("query {} is gone, dropping {:?}", self.id, err.0);
                false
            }
        }
    }

    pub async fn cancel(&self) -> bool {
        self.send(QueryCommand::Cancel).await
    }

    /// Revive a cancelled query. Returns false when the query was torn down
    /// before it could be revived.
    pub async fn uncancel(&self) -> bool {
        let (ack, revived) = oneshot::channel();
        if !self.send(QueryCommand::Uncancel(Some(ack))).await {
            return false;
        }
        revived.await.is_ok()
    }

    pub async fn close(&self) -> bool {
        self.send(QueryCommand::Close).await
    }

    pub fn status(&self) -> QueryStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes instead of polling `status`
    pub fn subscribe(&self) -> watch::Receiver<QueryStatus> {
        self.status.clone()
    }

    /// Trace completion reports. Can only be taken once.
    pub fn take_reports(&mut self) -> Option<mpsc::UnboundedReceiver<TraceReport>> {
        self.reports.take()
    }

    pub fn is_closed(&self) -> bool {
        self.status.borrow().closed || self.task.is_finished()
    }
}

/// Run `query` on its own tokio task. The task is the only thing that ever
/// touches the query.
pub fn spawn_query(query: Query, config: &QueryConfig) -> QueryHandle {
    let (commands, command_rx) = mpsc::channel(config.command_capacity.max(1));
    let (status_tx, status) = watch::channel(QueryStatus::of(&query));
    let (report_tx, reports) = mpsc::unbounded_channel();

    let id = query.id().to_owned();
    let instance = query.instance().to_owned();
    let task = tokio::spawn(run(
        query,
        command_rx,
        status_tx,
        report_tx,
        config.check_interval(),
    ));

    QueryHandle {
        id,
        instance,
        requested: Vec::new(),
        commands,
        status,
        reports: Some(reports),
        task,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn apply(query: &mut Query, command: QueryCommand) {
    // sent timestamps have to land before the EOSE they caused
    query.poll_sent();

    match command {
        QueryCommand::Transport(TransportEvent::Event {
            sub_id, note, ..
        }) => {
            query.handle_event(&sub_id, &note);
        }
        QueryCommand::Transport(TransportEvent::Eose { conn_id, sub_id }) => {
            query.eose(&sub_id, &conn_id);
        }
        QueryCommand::Transport(TransportEvent::ConnectionLost { conn_id }) => {
            query.connection_lost(&conn_id);
        }
        QueryCommand::Transport(TransportEvent::ConnectionRestored(conn)) => {
            query.connection_restored(&conn);
        }
        QueryCommand::Send { conn, dispatch } => {
            query.send_to_relay(&conn, &dispatch);
        }
        QueryCommand::InsertCompleted { dispatch, notes } => {
            query.insert_completed_trace(&dispatch, &notes);
        }
        QueryCommand::Cancel => query.cancel(),
        QueryCommand::Uncancel(ack) => {
            query.uncancel();
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        // handled by the loop
        QueryCommand::Close => {}
    }
}

fn publish(
    query: &mut Query,
    status_tx: &watch::Sender<QueryStatus>,
    report_tx: &mpsc::UnboundedSender<TraceReport>,
) {
    for report in query.drain_reports() {
        // nobody listening is fine
        let _ = report_tx.send(report);
    }

    status_tx.send_if_modified(|current| current.refresh(query));
}

async fn run(
    mut query: Query,
    mut commands: mpsc::Receiver<QueryCommand>,
    status_tx: watch::Sender<QueryStatus>,
    report_tx: mpsc::UnboundedSender<TraceReport>,
    check_interval: Duration,
) {
    let mut interval = time::interval(check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(QueryCommand::Close) => break,
                Some(command) => {
                    trace!("{}: {:?}", query.id(), command);
                    apply(&mut query, command);
                }
            },

            _ = interval.tick() => {
                query.poll_sent();
                query.check_traces();
            }

            _ = sleep_until_deadline(query.cancel_at()) => {
                if query.can_remove() {
                    debug!("{}: cancel grace period over", query.id());
                    break;
                }
            }
        }

        publish(&mut query, &status_tx, &report_tx);
    }

    query.send_close();
    query.cleanup();
    publish(&mut query, &status_tx, &report_tx);
    status_tx.send_modify(|status| status.closed = true);
    debug!("{}: query closed", query.id());
}
