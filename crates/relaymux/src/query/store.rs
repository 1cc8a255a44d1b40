use hashbrown::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::Note;

/// Where a query puts the notes it receives
pub trait NoteStore: Send + Sync {
    /// Add notes, returning how many were new
    fn add(&self, notes: &[Note]) -> usize;

    fn loading(&self) -> bool;

    fn set_loading(&self, loading: bool);
}

#[derive(Default)]
struct CollectionState {
    notes: Vec<Note>,
    seen: HashSet<String>,
    loading: bool,
}

/// Insertion ordered note collection, deduplicated by note id.
///
/// Every change bumps a counter on a watch channel, so observers can
/// `changed().await` instead of polling.
pub struct NoteCollection {
    state: Mutex<CollectionState>,
    changes: watch::Sender<u64>,
}

impl Default for NoteCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl NoteCollection {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(CollectionState::default()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Change counter, bumped on every added batch and loading flip
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn snapshot(&self) -> Vec<Note> {
        self.lock().notes.clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().notes.is_empty()
    }
}

impl NoteStore for NoteCollection {
    fn add(&self, notes: &[Note]) -> usize {
        let added = {
            let mut state = self.lock();
            let mut added = 0;
            for note in notes {
                if state.seen.insert(note.id.clone()) {
                    state.notes.push(note.clone());
                    added += 1;
                }
            }
            added
        };

        if added > 0 {
            self.bump();
        }
        added
    }

    fn loading(&self) -> bool {
        self.lock().loading
    }

    fn set_loading(&self, loading: bool) {
        let changed = {
            let mut state = self.lock();
            std::mem::replace(&mut state.loading, loading) != loading
        };
        if changed {
            self.bump();
        }
    }
}
