//! Suppression of self-originated change notifications.
//!
//! The reconciler and the live tracker write to the same persisted store that
//! external-change notifications watch. Before such a write a writer engages
//! the guard for its document; while any token is held, and for a quiet window
//! after the last one is released, [`SelfSaveGuard::is_suppressed`] reports
//! `true` and external-change handling for that document is skipped.
//!
//! Tokens are counted, so overlapping writers extend each other's window
//! instead of clearing it early.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
struct GuardState {
    active: usize,
    quiet_until: Option<Instant>,
}

impl GuardState {
    fn is_active(&self, now: Instant) -> bool {
        self.active > 0 || self.quiet_until.is_some_and(|until| now < until)
    }
}

/// Shared, cloneable guard keyed by document path.
#[derive(Debug, Clone)]
pub struct SelfSaveGuard {
    documents: Arc<Mutex<HashMap<String, GuardState>>>,
    window: Duration,
}

impl SelfSaveGuard {
    /// Creates a guard that keeps suppressing for `window` after release.
    pub fn new(window: Duration) -> Self {
        Self {
            documents: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    /// Engages the guard for `document_path` until the token is dropped.
    pub fn engage(&self, document_path: &str) -> SelfSaveToken {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        documents
            .entry(document_path.to_owned())
            .or_default()
            .active += 1;
        SelfSaveToken {
            guard: self.clone(),
            document_path: document_path.to_owned(),
        }
    }

    /// Whether change notifications for `document_path` should be ignored now.
    pub fn is_suppressed(&self, document_path: &str) -> bool {
        let now = Instant::now();
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = documents.get(document_path) else {
            return false;
        };
        let suppressed = state.is_active(now);
        if !suppressed {
            documents.remove(document_path);
        }
        suppressed
    }

    /// Ends one writer's hold and drops entries whose window has passed.
    fn release(&self, document_path: &str) {
        let now = Instant::now();
        let until = now + self.window;
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = documents.get_mut(document_path) {
            state.active = state.active.saturating_sub(1);
            state.quiet_until = Some(state.quiet_until.map_or(until, |prev| prev.max(until)));
        }
        documents.retain(|_, state| state.is_active(now));
    }
}

/// Held by a writer for the duration of a self-originated save.
#[derive(Debug)]
pub struct SelfSaveToken {
    guard: SelfSaveGuard,
    document_path: String,
}

impl Drop for SelfSaveToken {
    fn drop(&mut self) {
        self.guard.release(&self.document_path);
    }
}
