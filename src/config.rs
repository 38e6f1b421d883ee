use crate::{
    DEFAULT_ACTION_CAPACITY, DEFAULT_BUFFER_SIZE, DEFAULT_EVENT_CAPACITY,
    DEFAULT_JOURNAL_ALLOCATION_DELTA, DEFAULT_JOURNAL_MAX_SIZE, reason::DEFAULT_REASON_MASK,
};

#[derive(Debug, Clone)]
/// Options for a journal watcher.
///
/// The reason mask is shared by every watch of the engine.
pub struct WatcherConfig {
    pub reason_mask: u32,
    pub only_on_close: bool,
    pub buffer_size: usize,
    /// Create the change journal on volumes where it is not active.
    pub create_journal: bool,
    pub journal_max_size: u64,
    pub journal_allocation_delta: u64,
    pub event_capacity: usize,
    pub action_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            reason_mask: DEFAULT_REASON_MASK,
            only_on_close: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            create_journal: true,
            journal_max_size: DEFAULT_JOURNAL_MAX_SIZE,
            journal_allocation_delta: DEFAULT_JOURNAL_ALLOCATION_DELTA,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            action_capacity: DEFAULT_ACTION_CAPACITY,
        }
    }
}
