use std::time::Duration;

use crate::aggregate::FilterPolicy;
use crate::snippet::DEFAULT_SEARCH_RADIUS;

/// Quiet period after the last edit before tracked lines are written back.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Tunables for an [`crate::engine::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Debounce window of live tracking sessions.
    pub debounce: Duration,
    /// Lines searched on each side of a drifted anchor.
    pub search_radius: usize,
    /// How long self-originated writes keep suppressing change notifications.
    /// Must be at least `debounce`.
    pub self_save_window: Duration,
    pub filter: FilterPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            search_radius: DEFAULT_SEARCH_RADIUS,
            self_save_window: DEFAULT_DEBOUNCE,
            filter: FilterPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Sets the debounce and stretches the self-save window to cover it.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self.self_save_window = self.self_save_window.max(debounce);
        self
    }
}
