use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::QueryConfig;
use crate::directory::RelayDirectory;
use crate::filter::RequestBuilder;
use crate::optimizer::{DefaultQueryOptimizer, QueryOptimizer};
use crate::query::{spawn_query, NoteStore, Query, QueryCommand, QueryHandle, QueryOptions};
use crate::relay::{Connection, TransportEvent};
use crate::selector::{BuiltReqFilter, EndpointSelector};

/// Owns the live queries and the connections they are sent over.
///
/// Queries are keyed by their logical id: asking again for a running id
/// only sends what changed, and a cancelled query asked for again within its
/// grace period is revived instead of re-sent.
pub struct QueryManager {
    config: QueryConfig,
    directory: Arc<dyn RelayDirectory>,
    optimizer: Arc<dyn QueryOptimizer>,
    connections: IndexMap<String, Arc<dyn Connection>>,
    queries: HashMap<String, QueryHandle>,
}

fn selector<'a>(
    directory: &'a dyn RelayDirectory,
    optimizer: &'a dyn QueryOptimizer,
    config: &QueryConfig,
) -> EndpointSelector<'a> {
    EndpointSelector::new(directory)
        .with_optimizer(optimizer)
        .max_relays_per_author(config.max_relays_per_author)
}

/// What asking again for a query id found
enum Existing {
    /// the very same request is already running
    Same,
    /// a running query that will take the new dispatches
    Revived,
    /// nothing usable, start over
    Gone,
}

/// Hand dispatches to the connections that should carry them. Default relay
/// dispatches go to every non-ephemeral connection. Returns false if the
/// query went away before taking all of them.
async fn dispatch(
    connections: &IndexMap<String, Arc<dyn Connection>>,
    handle: &QueryHandle,
    dispatches: Vec<BuiltReqFilter>,
) -> bool {
    for dispatch in dispatches {
        let targets: Vec<Arc<dyn Connection>> = connections
            .values()
            .filter(|c| {
                if dispatch.is_default_relay() {
                    !c.is_ephemeral()
                } else {
                    c.address() == dispatch.relay
                }
            })
            .cloned()
            .collect();

        if targets.is_empty() {
            debug!(
                "{}: no connection for relay '{}', skipping dispatch",
                handle.id(),
                dispatch.relay
            );
            continue;
        }

        for conn in targets {
            let sent = handle
                .send(QueryCommand::Send {
                    conn,
                    dispatch: dispatch.clone(),
                })
                .await;
            if !sent {
                return false;
            }
        }
    }

    true
}

/// Spawn a fresh query for `req` and send all of it
async fn start(
    req: &RequestBuilder,
    feed: Arc<dyn NoteStore>,
    config: &QueryConfig,
    selector: &EndpointSelector<'_>,
    connections: &IndexMap<String, Arc<dyn Connection>>,
) -> QueryHandle {
    let query = Query::new(
        req.id(),
        req.instance(),
        feed,
        QueryOptions {
            leave_open: req.options().leave_open,
            timeout: req
                .options()
                .timeout
                .unwrap_or_else(|| config.default_timeout()),
            grace: config.cancel_grace(),
        },
    );

    let dispatches = req.build_with(selector);
    debug!("{}: new query with {} dispatches", req.id(), dispatches.len());

    let mut handle = spawn_query(query, config);
    handle.add_requested(req.build_raw());
    if !dispatch(connections, &handle, dispatches).await {
        debug!("{}: new query went away while sending", req.id());
    }
    handle
}

impl QueryManager {
    pub fn new(directory: Arc<dyn RelayDirectory>, config: QueryConfig) -> Self {
        Self {
            config,
            directory,
            optimizer: Arc::new(DefaultQueryOptimizer),
            connections: IndexMap::new(),
            queries: HashMap::new(),
        }
    }

    pub fn with_optimizer(mut self, optimizer: Arc<dyn QueryOptimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn add_connection(&mut self, conn: Arc<dyn Connection>) {
        debug!("adding connection {} ({})", conn.id(), conn.address());
        self.connections.insert(conn.id().to_owned(), conn);
    }

    pub fn remove_connection(&mut self, conn_id: &str) -> Option<Arc<dyn Connection>> {
        self.connections.shift_remove(conn_id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<dyn Connection>> {
        self.connections.values()
    }

    pub fn get(&self, id: &str) -> Option<&QueryHandle> {
        self.queries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut QueryHandle> {
        self.queries.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Start a query for `req`, or bring a running one with the same id up
    /// to date. A query that is torn down while being revived is replaced by
    /// a fresh one.
    pub async fn query(&mut self, req: &RequestBuilder, feed: Arc<dyn NoteStore>) -> &QueryHandle {
        let existing = match self.queries.get(req.id()) {
            Some(handle) if !handle.is_closed() => {
                if handle.instance() == req.instance() {
                    Existing::Same
                } else if handle.uncancel().await {
                    Existing::Revived
                } else {
                    debug!("{}: query was torn down before it could be revived", req.id());
                    Existing::Gone
                }
            }
            _ => Existing::Gone,
        };

        let selector = selector(self.directory.as_ref(), self.optimizer.as_ref(), &self.config);

        match (existing, self.queries.entry(req.id().to_owned())) {
            (Existing::Same, Entry::Occupied(entry)) => {
                trace!("{}: same request instance, nothing to do", req.id());
                entry.into_mut()
            }
            (Existing::Revived, Entry::Occupied(entry)) => {
                let handle = entry.into_mut();
                let raw = req.build_raw();
                let (dispatches, added) = if req.options().skip_diff {
                    (req.build_with(&selector), raw)
                } else {
                    let added = selector.optimizer().get_diff(handle.requested(), &raw);
                    (req.build_diff(&selector, handle.requested()), added)
                };
                debug!(
                    "{}: updating running query with {} dispatches",
                    req.id(),
                    dispatches.len()
                );

                if dispatch(&self.connections, handle, dispatches).await {
                    handle.set_instance(req.instance());
                    handle.add_requested(added);
                } else {
                    debug!("{}: query went away while updating, starting over", req.id());
                    *handle = start(req, feed, &self.config, &selector, &self.connections).await;
                }
                handle
            }
            (_, entry) => {
                let handle = start(req, feed, &self.config, &selector, &self.connections).await;
                entry.insert(handle).into_mut()
            }
        }
    }

    /// Fan a transport event out to every live query. Each query only
    /// reacts to its own subscription ids.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match &event {
            TransportEvent::ConnectionRestored(conn) => {
                self.connections
                    .insert(conn.id().to_owned(), conn.clone());
            }
            TransportEvent::ConnectionLost { conn_id } => {
                debug!("connection {conn_id} lost");
            }
            _ => {}
        }

        for handle in self.queries.values() {
            handle.send(QueryCommand::Transport(event.clone())).await;
        }
    }

    /// Start the grace period of a query
    pub async fn cancel(&mut self, id: &str) -> bool {
        match self.queries.get(id) {
            Some(handle) => handle.cancel().await,
            None => false,
        }
    }

    /// Drop the handles of queries that were torn down, returning how many
    pub fn cleanup(&mut self) -> usize {
        let before = self.queries.len();
        self.queries.retain(|id, handle| {
            let closed = handle.is_closed();
            if closed {
                trace!("removing closed query {id}");
            }
            !closed
        });
        before - self.queries.len()
    }
}
