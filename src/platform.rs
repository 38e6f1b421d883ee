//! The operating-system seam of the watcher.
//!
//! The completion loop only talks to a [`Platform`]: it waits on it, posts wake-ups to
//! it, and asks it to open volumes whose journal reads complete back through the same
//! wait. On Windows this is an I/O completion port.

use std::path::Path;

use crate::{Usn, UsnResult, config::WatcherConfig, errors::UsnError, watch::WatchEntry};

/// Identifies one issued journal read across its completion.
pub type ReadToken = usize;

/// Synthetic completions posted by caller threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// One or more watch actions are queued.
    Change,
    /// Shut the loop down.
    Quit,
}

/// A completion dequeued by [`Platform::wait`].
#[derive(Debug)]
pub enum Completion {
    Signal(Signal),
    /// A journal read finished and filled `bytes` bytes of its buffer.
    Read { token: ReadToken, bytes: u32 },
    /// A journal read was cancelled.
    Aborted { token: ReadToken },
    /// A journal read finished with an error.
    Failed { token: ReadToken, error: UsnError },
}

/// Where a volume's change journal stands when a session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalPosition {
    pub journal_id: u64,
    pub next_usn: Usn,
}

/// Parameters of one `FSCTL_READ_USN_JOURNAL` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub start_usn: Usn,
    pub reason_mask: u32,
    pub only_on_close: bool,
    pub journal_id: u64,
}

/// An open volume able to run one asynchronous journal read at a time.
///
/// Buffers of reads that were cancelled stay owned by the volume until their
/// completion is handed back through [`JournalVolume::complete`] or
/// [`JournalVolume::release`].
pub trait JournalVolume {
    /// Issues a read. The completion arrives later through the platform's wait.
    fn read(&mut self, request: &ReadRequest) -> UsnResult<ReadToken>;

    /// Requests cancellation of the read in flight, if any.
    fn cancel(&mut self) -> UsnResult<()>;

    /// Returns true if `token` is a read issued by this volume that has not settled.
    fn owns(&self, token: ReadToken) -> bool;

    /// Settles a successful completion. Returns the filled bytes if `token` is the
    /// current read, `None` if it had been cancelled in the meantime.
    fn complete(&mut self, token: ReadToken, bytes: u32) -> Option<&[u8]>;

    /// Settles an aborted or failed completion.
    fn release(&mut self, token: ReadToken);

    /// Returns true when no read of this volume is outstanding.
    fn is_idle(&self) -> bool;

    /// Closes the volume handle. Closing twice is a no-op.
    fn close(&mut self) -> UsnResult<()>;
}

/// Completion queue, path resolution and volume access for the completion loop.
pub trait Platform: Send + Sync + 'static {
    type Volume: JournalVolume;

    /// Resolves a path to its file reference number and volume serial number.
    fn resolve(&self, path: &Path) -> UsnResult<WatchEntry>;

    /// Opens the volume holding `entry` for journal reads completing on this platform.
    fn open_volume(
        &self,
        entry: &WatchEntry,
        config: &WatcherConfig,
    ) -> UsnResult<(Self::Volume, JournalPosition)>;

    /// Wakes the waiting loop with a synthetic completion.
    fn post(&self, signal: Signal) -> UsnResult<()>;

    /// Blocks until the next completion. An error means the queue itself failed.
    fn wait(&self) -> UsnResult<Completion>;

    /// Releases the completion queue.
    fn close(self) -> UsnResult<()>;
}
