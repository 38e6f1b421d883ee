//! # usn-journal-watcher
//!
//! A file system change watcher for NTFS volumes fed by the USN change journal.
//!
//! Instead of one directory-change subscription per watched path, the watcher keeps one
//! asynchronous journal read per volume and matches every journal record against the
//! watched paths by file reference number. A single background thread owns all volume
//! state and is driven by an I/O completion port.
//!
//! ## Example: Watch a directory
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> usn_journal_watcher::UsnResult<()> {
//! use usn_journal_watcher::JournalWatcher;
//!
//! let mut watcher = JournalWatcher::new()?;
//! watcher.add(r"C:\data")?;
//! for event in watcher.events().iter().take(10) {
//!     println!("{}", event);
//! }
//! watcher.close()
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
//!
//! Watching a directory reports changes to the directory itself and to its direct
//! children. Only changes recorded after [`Engine::add`] returns are reported.
//!
//! ## Platform
//! - Windows NTFS volumes
//! - Requires an elevated process to read the change journal
//!
//! The engine itself is written against the [`Platform`] trait, so it can be driven by
//! any completion source.

pub mod config;
pub mod engine;
pub mod errors;
pub mod event;
pub mod platform;
pub mod reason;
pub mod record;
mod time;
pub mod watch;

#[cfg(windows)]
pub mod journal;
#[cfg(windows)]
pub mod path;
#[cfg(windows)]
pub mod port;
#[cfg(windows)]
mod privilege;
#[cfg(windows)]
pub mod volume;

// Re-export commonly used types
pub use config::WatcherConfig;
pub use engine::{Engine, Watch};
pub use errors::UsnError;
pub use event::{Event, Op};
pub use platform::{Completion, JournalPosition, JournalVolume, Platform, ReadRequest, Signal};
pub use watch::WatchEntry;

#[cfg(windows)]
pub use port::{CompletionPort, JournalWatcher};

/// A convenient type alias for Results with UsnError.
pub type UsnResult<T> = std::result::Result<T, UsnError>;

pub type Usn = i64;

pub(crate) const DEFAULT_BUFFER_SIZE: usize = 64 * 1024; // 64KB

pub const DEFAULT_JOURNAL_MAX_SIZE: u64 = 32 * 1024 * 1024; // 32MB
pub const DEFAULT_JOURNAL_ALLOCATION_DELTA: u64 = 8 * 1024 * 1024; // 8MB

pub(crate) const DEFAULT_EVENT_CAPACITY: usize = 50;
pub(crate) const DEFAULT_ACTION_CAPACITY: usize = 16;
