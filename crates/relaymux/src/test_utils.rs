#![cfg(test)]
//! Test helpers shared by the unit tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::relay::{Connection, RelayReqId, SentCallback};
use crate::{Filter, Note};

/// A note with no tags and no content
pub fn note(id: &str, pubkey: &str, kind: u64, created_at: u64) -> Note {
    Note {
        id: id.to_owned(),
        pubkey: pubkey.to_owned(),
        created_at,
        kind,
        tags: vec![],
        content: String::new(),
        sig: String::new(),
    }
}

/// A connection that records every REQ and CLOSE instead of sending them.
///
/// `on_sent` callbacks run right away unless `hold_sent` is set, in which
/// case they wait for `flush_sent`.
pub struct MockConnection {
    id: String,
    address: String,
    ephemeral: bool,
    search: bool,
    connected: AtomicBool,
    hold_sent: AtomicBool,
    held: Mutex<Vec<SentCallback>>,
    reqs: Mutex<Vec<(RelayReqId, Vec<Filter>)>>,
    closes: Mutex<Vec<RelayReqId>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().expect("mock mutex poisoned")
}

impl MockConnection {
    pub fn new(address: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            address: address.to_owned(),
            ephemeral: false,
            search: false,
            connected: AtomicBool::new(true),
            hold_sent: AtomicBool::new(false),
            held: Mutex::new(vec![]),
            reqs: Mutex::new(vec![]),
            closes: Mutex::new(vec![]),
        }
    }

    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    pub fn with_search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }

    pub fn hold_sent(&self, hold: bool) {
        self.hold_sent.store(hold, Ordering::SeqCst);
    }

    /// Run every held `on_sent` callback
    pub fn flush_sent(&self) {
        let held = std::mem::take(&mut *lock(&self.held));
        for on_sent in held {
            on_sent();
        }
    }

    pub fn reqs(&self) -> Vec<(RelayReqId, Vec<Filter>)> {
        lock(&self.reqs).clone()
    }

    pub fn closes(&self) -> Vec<RelayReqId> {
        lock(&self.closes).clone()
    }
}

impl Connection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    fn supports_search(&self) -> bool {
        self.search
    }

    fn queue_req(&self, sub_id: &RelayReqId, filters: &[Filter], on_sent: SentCallback) {
        lock(&self.reqs).push((sub_id.clone(), filters.to_vec()));
        if self.hold_sent.load(Ordering::SeqCst) {
            lock(&self.held).push(on_sent);
        } else {
            on_sent();
        }
    }

    fn close_req(&self, sub_id: &RelayReqId) {
        lock(&self.closes).push(sub_id.clone());
    }
}
