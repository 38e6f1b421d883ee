//! The journal watcher engine.
//!
//! One background thread runs the completion loop and is the only owner of the watch
//! table and the volume sessions. Callers hand it work through a bounded action queue
//! followed by a [`Signal::Change`] wake-up on the platform's completion queue; journal
//! reads complete on the same queue, so a single wait drives everything.

use std::{
    collections::HashSet,
    mem,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, SendError, Sender, bounded, select, unbounded};
use log::{debug, trace, warn};

use crate::{
    UsnResult,
    config::WatcherConfig,
    errors::UsnError,
    event::Event,
    platform::{Completion, JournalVolume, Platform, ReadToken, Signal},
    record,
    watch::{Attach, VolumeSession, WatchAction, WatchEntry, WatchTable},
};

const LOOP_THREAD_NAME: &str = "usn-journal-watcher";

/// The capability every watcher backend offers to the dispatcher in front of it.
pub trait Watch {
    fn add(&self, path: &Path) -> UsnResult<()>;
    fn remove(&self, path: &Path) -> UsnResult<()>;
    fn close(&mut self) -> UsnResult<()>;
}

/// A volume-wide change watcher fed by the USN change journal.
///
/// Events and errors are delivered through [`Engine::events`] and [`Engine::errors`].
/// The event channel is bounded: a consumer that stops reading eventually stalls
/// journal decoding.
pub struct Engine<P: Platform> {
    platform: Option<Arc<P>>,
    actions: Sender<WatchAction>,
    // Paths handed to the loop, so removing an unknown path fails without a round trip.
    watched: Mutex<HashSet<PathBuf>>,
    events: Receiver<Event>,
    errors: Receiver<UsnError>,
    // Dropped on close, which unblocks a loop stuck on a full event queue.
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<UsnResult<()>>>,
}

impl<P: Platform> Engine<P> {
    /// Starts a watcher on `platform`.
    pub fn with_platform(platform: P, config: WatcherConfig) -> UsnResult<Self> {
        let platform = Arc::new(platform);
        let (action_tx, action_rx) = bounded(config.action_capacity);
        let (event_tx, event_rx) = bounded(config.event_capacity);
        let (error_tx, error_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded(0);

        let loop_platform = Arc::clone(&platform);
        let worker = thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || {
                let channels = LoopChannels {
                    actions: action_rx,
                    events: event_tx,
                    errors: error_tx,
                    shutdown: shutdown_rx,
                };
                CompletionLoop::new(loop_platform, config, channels).run()
            })?;

        Ok(Engine {
            platform: Some(platform),
            actions: action_tx,
            watched: Mutex::new(HashSet::new()),
            events: event_rx,
            errors: error_rx,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    /// Starts watching `path` and, if it is a directory, its direct children.
    ///
    /// Only changes recorded after this call are reported.
    pub fn add(&self, path: impl AsRef<Path>) -> UsnResult<()> {
        let entry = self.platform()?.resolve(path.as_ref())?;

        let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
        let path = entry.path.clone();
        self.submit(WatchAction::Add(entry))?;
        watched.insert(path);
        Ok(())
    }

    /// Stops watching `path`.
    pub fn remove(&self, path: impl AsRef<Path>) -> UsnResult<()> {
        let path = path.as_ref();

        let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
        if !watched.contains(path) {
            return Err(UsnError::NotWatchedError(path.to_path_buf()));
        }
        self.submit(WatchAction::Remove(path.to_path_buf()))?;
        watched.remove(path);
        Ok(())
    }

    /// Stops the completion loop, cancelling outstanding reads and closing every
    /// volume handle. Failures of individual handles are folded into one error.
    pub fn close(&mut self) -> UsnResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let mut failures = Vec::new();

        drop(self.shutdown.take());
        if let Err(err) = self.platform()?.post(Signal::Quit) {
            warn!("Failed to post quit to the completion loop: {}", err);
            failures.push(err);
        }
        // Without a quit signal only a loop that already stopped can be joined.
        if failures.is_empty() || worker.is_finished() {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(err),
                Err(_) => failures.push(UsnError::OtherError(
                    "Completion loop panicked".to_string(),
                )),
            }
        }

        if let Some(platform) = self.platform.take() {
            match Arc::try_unwrap(platform) {
                Ok(platform) => {
                    if let Err(err) = platform.close() {
                        failures.push(err);
                    }
                }
                Err(_) => warn!("Completion loop still holds the platform, not closing it"),
            }
        }

        UsnError::collect(failures)
    }

    /// Changes on watched paths, in journal order per volume.
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Errors raised inside the completion loop.
    pub fn errors(&self) -> &Receiver<UsnError> {
        &self.errors
    }

    fn platform(&self) -> UsnResult<&Arc<P>> {
        self.platform.as_ref().ok_or(UsnError::DisconnectedError)
    }

    fn submit(&self, action: WatchAction) -> UsnResult<()> {
        trace!("Queueing {:?}", action);
        self.actions
            .send(action)
            .map_err(|_| UsnError::DisconnectedError)?;
        self.platform()?.post(Signal::Change)
    }
}

impl<P: Platform> Watch for Engine<P> {
    fn add(&self, path: &Path) -> UsnResult<()> {
        Engine::add(self, path)
    }

    fn remove(&self, path: &Path) -> UsnResult<()> {
        Engine::remove(self, path)
    }

    fn close(&mut self) -> UsnResult<()> {
        Engine::close(self)
    }
}

impl<P: Platform> Drop for Engine<P> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.close() {
                warn!("Error closing journal watcher: {}", err);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Running,
    Draining,
    Closed,
}

struct CompletionLoop<P: Platform> {
    state: LoopState,
    platform: Arc<P>,
    config: WatcherConfig,
    table: WatchTable<P::Volume>,
    // Detached sessions whose cancelled reads have not completed yet.
    retiring: Vec<VolumeSession<P::Volume>>,
    actions: Receiver<WatchAction>,
    events: Sender<Event>,
    errors: Sender<UsnError>,
    shutdown: Receiver<()>,
}

/// The loop's ends of the engine's channels.
struct LoopChannels {
    actions: Receiver<WatchAction>,
    events: Sender<Event>,
    errors: Sender<UsnError>,
    shutdown: Receiver<()>,
}

impl<P: Platform> CompletionLoop<P> {
    fn new(platform: Arc<P>, config: WatcherConfig, channels: LoopChannels) -> Self {
        CompletionLoop {
            state: LoopState::Running,
            platform,
            config,
            table: WatchTable::default(),
            retiring: Vec::new(),
            actions: channels.actions,
            events: channels.events,
            errors: channels.errors,
            shutdown: channels.shutdown,
        }
    }

    fn run(mut self) -> UsnResult<()> {
        debug!("Completion loop started");

        while self.state == LoopState::Running {
            match self.platform.wait() {
                Ok(Completion::Signal(Signal::Quit)) => self.state = LoopState::Draining,
                Ok(Completion::Signal(Signal::Change)) => self.apply_actions(),
                Ok(Completion::Read { token, bytes }) => self.on_read(token, bytes),
                Ok(Completion::Aborted { token }) => self.settle(token),
                Ok(Completion::Failed { token, error }) => self.on_failed(token, error),
                Err(err) => {
                    warn!("Completion queue failed, stopping: {}", err);
                    self.abandon();
                    return Err(err);
                }
            }
        }

        self.drain()
    }

    fn apply_actions(&mut self) {
        while let Ok(action) = self.actions.try_recv() {
            let result = match action {
                WatchAction::Add(entry) => self.add_watch(entry),
                WatchAction::Remove(path) => self.remove_watch(&path),
            };
            if let Err(err) = result {
                report(&self.errors, err);
            }
        }
    }

    fn add_watch(&mut self, entry: WatchEntry) -> UsnResult<()> {
        debug!(
            "Adding watch {:?} (fid={:#x}, volume={:#010x})",
            entry.path, entry.file_id, entry.volume_id
        );
        let platform = &self.platform;
        let config = &self.config;

        let (session, attach) = self.table.add(entry, |entry| {
            let (volume, position) = platform.open_volume(entry, config)?;
            Ok(VolumeSession::new(entry.volume_id, volume, position, config))
        })?;

        let volume_id = session.volume_id;
        let started = match attach {
            Attach::AlreadyWatched => Ok(()),
            Attach::NewSession | Attach::NewWatch => session.start_read(),
        };
        debug!(
            "{} watch(es) on volume {:#010x}, {} volume(s) open",
            self.table.watch_count(volume_id),
            volume_id,
            self.table.len()
        );
        started
    }

    fn remove_watch(&mut self, path: &Path) -> UsnResult<()> {
        debug!("Removing watch {:?}", path);
        let volume_id = self
            .table
            .volume_of(path)
            .ok_or_else(|| UsnError::NotWatchedError(path.to_path_buf()))?;

        let Some(mut session) = self.table.remove(volume_id, path)? else {
            return Ok(());
        };

        debug!("Last watch removed, releasing volume {:#010x}", volume_id);
        let cancelled = session.volume.cancel();
        self.retiring.push(session);
        self.sweep_retiring();
        cancelled
    }

    fn on_read(&mut self, token: ReadToken, bytes: u32) {
        let Some(session) = self.table.session_for(token) else {
            self.settle(token);
            return;
        };

        let VolumeSession {
            volume_id,
            volume,
            cursor,
            watches,
            recovering,
            ..
        } = &mut *session;
        let Some(buffer) = volume.complete(token, bytes) else {
            trace!("Ignoring completion of cancelled read {:#x}", token);
            return;
        };
        *recovering = false;

        let (events, shutdown) = (&self.events, &self.shutdown);
        let decoded = record::decode(buffer, cursor, watches, |event| {
            trace!("Emitting {}", event);
            select! {
                send(events, event) -> sent => {
                    if sent.is_err() {
                        trace!("Event receiver is gone, dropping event");
                    }
                }
                recv(shutdown) -> _ => trace!("Watcher is closing, dropping event"),
            }
        });
        match decoded {
            Ok(count) => trace!(
                "Decoded {} records on volume {:#010x}, next usn {}",
                count, volume_id, cursor
            ),
            Err(err) => report(&self.errors, err),
        }

        if let Err(err) = session.start_read() {
            report(&self.errors, err);
        }
    }

    /// Reports a failed read and reopens the volume at the journal's current position.
    ///
    /// A session that fails again before any read succeeds is left idle until the next
    /// watch is added on its volume.
    fn on_failed(&mut self, token: ReadToken, error: UsnError) {
        warn!("Journal read {:#x} failed: {}", token, error);
        report(&self.errors, error);

        let Some(session) = self.table.session_for(token) else {
            self.settle(token);
            return;
        };
        session.volume.release(token);
        if session.recovering {
            warn!(
                "Volume {:#010x} failed again after reopening, leaving it idle",
                session.volume_id
            );
            return;
        }

        let Some(entry) = session.watches.iter().next().cloned() else {
            return;
        };
        let reopened = self
            .platform
            .open_volume(&entry, &self.config)
            .and_then(|(volume, position)| {
                let mut failed = mem::replace(&mut session.volume, volume);
                session.journal_id = position.journal_id;
                session.cursor = position.next_usn;
                session.recovering = true;
                debug!(
                    "Reopened volume {:#010x} at usn {}",
                    session.volume_id, position.next_usn
                );
                if let Err(err) = failed.close() {
                    report(&self.errors, err);
                }
                session.start_read()
            });
        if let Err(err) = reopened {
            report(&self.errors, err);
        }
    }

    /// Hands an aborted or failed read back to whichever session issued it.
    fn settle(&mut self, token: ReadToken) {
        let owner = self
            .table
            .session_for(token)
            .or_else(|| {
                self.retiring
                    .iter_mut()
                    .find(|session| session.volume.owns(token))
            });

        match owner {
            Some(session) => session.volume.release(token),
            None => warn!("Completion for unknown read {:#x}", token),
        }
        self.sweep_retiring();
    }

    /// Closes detached sessions that have no reads left in flight.
    fn sweep_retiring(&mut self) {
        let (idle, busy): (Vec<_>, Vec<_>) = mem::take(&mut self.retiring)
            .into_iter()
            .partition(|session| session.volume.is_idle());
        self.retiring = busy;

        for mut session in idle {
            debug!("Closing volume {:#010x}", session.volume_id);
            if let Err(err) = session.volume.close() {
                report(&self.errors, err);
            }
        }
    }

    /// Cancels every read, waits for the cancellations to settle and closes the volumes.
    fn drain(mut self) -> UsnResult<()> {
        debug!("Completion loop draining");
        let mut failures = Vec::new();

        let mut sessions: Vec<_> = self.table.drain().collect();
        sessions.append(&mut self.retiring);

        let mut waiting = Vec::with_capacity(sessions.len());
        for mut session in sessions {
            if let Err(err) = session.volume.cancel() {
                failures.push(err);
                // Closing the handle also aborts its I/O.
                if let Err(err) = session.volume.close() {
                    warn!(
                        "Abandoning volume {:#010x} with reads in flight",
                        session.volume_id
                    );
                    failures.push(err);
                    continue;
                }
            }
            waiting.push(session);
        }

        while waiting.iter().any(|session| !session.volume.is_idle()) {
            match self.platform.wait() {
                Ok(
                    Completion::Read { token, .. }
                    | Completion::Aborted { token }
                    | Completion::Failed { token, .. },
                ) => {
                    if let Some(session) = waiting
                        .iter_mut()
                        .find(|session| session.volume.owns(token))
                    {
                        session.volume.release(token);
                    }
                }
                Ok(Completion::Signal(signal)) => {
                    trace!("Ignoring {:?} while draining", signal);
                }
                Err(err) => {
                    failures.push(err);
                    break;
                }
            }
        }

        for mut session in waiting {
            if let Err(err) = session.volume.close() {
                failures.push(err);
            }
        }

        self.state = LoopState::Closed;
        debug!("Completion loop closed");
        UsnError::collect(failures)
    }

    /// Closes what can be closed after the completion queue itself failed.
    fn abandon(&mut self) {
        let mut sessions: Vec<_> = self.table.drain().collect();
        sessions.append(&mut self.retiring);
        for mut session in sessions {
            if let Err(err) = session.volume.close() {
                report(&self.errors, err);
            }
        }
        self.state = LoopState::Closed;
    }
}

fn report(errors: &Sender<UsnError>, err: UsnError) {
    if let Err(SendError(err)) = errors.send(err) {
        warn!("Error receiver is gone, dropping error: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::{
        event::Op,
        reason::{
            USN_REASON_CLOSE, USN_REASON_DATA_EXTEND, USN_REASON_FILE_CREATE,
            USN_REASON_RENAME_OLD_NAME,
        },
        tests::{FakePlatform, RecordBuilder, usn_buffer},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);
    const VOLUME: u32 = 0x00C0_FFEE;
    const DATA_FID: u64 = 0x0001_0000_0000_0100;

    fn watcher() -> (FakePlatform, Engine<FakePlatform>) {
        watcher_with(WatcherConfig::default())
    }

    fn watcher_with(config: WatcherConfig) -> (FakePlatform, Engine<FakePlatform>) {
        let platform = FakePlatform::new();
        platform.add_file(r"C:\data", VOLUME, DATA_FID);
        platform.set_next_usn(VOLUME, 1_000);
        let engine = Engine::with_platform(platform.clone(), config).expect("engine starts");
        (platform, engine)
    }

    /// An engine whose single-slot event queue is full, with the loop stuck sending
    /// the second event of a buffer.
    fn stalled_watcher() -> (FakePlatform, Engine<FakePlatform>) {
        let config = WatcherConfig {
            event_capacity: 1,
            ..WatcherConfig::default()
        };
        let (platform, engine) = watcher_with(config);
        engine.add(r"C:\data").expect("add");
        platform.wait_for_read(VOLUME, 1, TIMEOUT);

        let create =
            |fid, name| RecordBuilder::new(fid, DATA_FID, name).reason(USN_REASON_FILE_CREATE);
        platform.complete_read(
            VOLUME,
            usn_buffer(1_500, &[create(0x41, "a.txt"), create(0x42, "b.txt")]),
        );

        let deadline = Instant::now() + TIMEOUT;
        while !engine.events().is_full() {
            assert!(Instant::now() < deadline, "event queue never filled");
            thread::sleep(Duration::from_millis(2));
        }
        (platform, engine)
    }

    #[test]
    fn create_in_watched_directory_emits_one_event() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        engine.add(r"C:\data")?;

        let first = platform.wait_for_read(VOLUME, 1, TIMEOUT);
        assert_eq!(first.start_usn, 1_000);

        platform.complete_read(
            VOLUME,
            usn_buffer(
                1_200,
                &[RecordBuilder::new(0x0002_0000_0000_0200, DATA_FID, "a.txt")
                    .reason(USN_REASON_FILE_CREATE)],
            ),
        );

        let event = engine.events().recv_timeout(TIMEOUT).expect("create event");
        assert_eq!(event, Event::new(Path::new(r"C:\data").join("a.txt"), Op::Create));

        // The read is re-armed from the buffer's next USN.
        let second = platform.wait_for_read(VOLUME, 2, TIMEOUT);
        assert_eq!(second.start_usn, 1_200);
        assert!(engine.events().try_recv().is_err());

        engine.close()?;
        assert!(engine.errors().try_recv().is_err());
        Ok(())
    }

    #[test]
    fn records_within_a_buffer_keep_journal_order() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        engine.add(r"C:\data")?;
        platform.wait_for_read(VOLUME, 1, TIMEOUT);

        platform.complete_read(
            VOLUME,
            usn_buffer(
                2_000,
                &[
                    RecordBuilder::new(0x21, DATA_FID, "old.txt")
                        .reason(USN_REASON_RENAME_OLD_NAME),
                    RecordBuilder::new(0x22, DATA_FID, "new.txt")
                        .reason(USN_REASON_FILE_CREATE | USN_REASON_DATA_EXTEND | USN_REASON_CLOSE),
                ],
            ),
        );

        let received: Vec<Event> = (0..3)
            .map(|_| engine.events().recv_timeout(TIMEOUT).expect("event"))
            .collect();
        let data = Path::new(r"C:\data");
        assert_eq!(
            received,
            vec![
                Event::new(data.join("old.txt"), Op::RenamedFrom),
                Event::new(data.join("new.txt"), Op::Create),
                Event::new(data.join("new.txt"), Op::Modify),
            ]
        );

        engine.close()
    }

    #[test]
    fn add_then_remove_emits_nothing_and_releases_volume() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        engine.add(r"C:\data")?;
        platform.wait_for_read(VOLUME, 1, TIMEOUT);

        engine.remove(r"C:\data")?;
        platform.wait_for_close(VOLUME, TIMEOUT);

        engine.close()?;
        assert!(engine.events().try_recv().is_err());
        assert!(engine.errors().try_recv().is_err());
        Ok(())
    }

    #[test]
    fn fresh_session_starts_at_current_journal_position() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        platform.add_file(r"C:\other", VOLUME, 0x0003_0000_0000_0300);

        engine.add(r"C:\data")?;
        platform.wait_for_read(VOLUME, 1, TIMEOUT);
        engine.remove(r"C:\data")?;
        platform.wait_for_close(VOLUME, TIMEOUT);

        platform.set_next_usn(VOLUME, 50_000);
        engine.add(r"C:\other")?;
        let read = platform.wait_for_read(VOLUME, 2, TIMEOUT);
        assert_eq!(read.start_usn, 50_000);
        assert_eq!(platform.opened_count(VOLUME), 2);

        engine.close()
    }

    #[test]
    fn add_to_existing_session_rearms_without_reopening() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        platform.add_file(r"C:\data\report.txt", VOLUME, 0x0004_0000_0000_0400);

        engine.add(r"C:\data")?;
        platform.wait_for_read(VOLUME, 1, TIMEOUT);
        engine.add(r"C:\data\report.txt")?;
        let read = platform.wait_for_read(VOLUME, 2, TIMEOUT);

        assert_eq!(read.start_usn, 1_000);
        assert_eq!(platform.opened_count(VOLUME), 1);
        assert_eq!(platform.cancelled_count(VOLUME), 1);

        engine.close()
    }

    #[test]
    fn unknown_paths_fail_synchronously() -> UsnResult<()> {
        let (_platform, mut engine) = watcher();

        let added = engine.add(r"C:\missing");
        assert!(matches!(added, Err(UsnError::PathUnavailableError { .. })));

        let removed = engine.remove(r"C:\data");
        assert!(matches!(removed, Err(UsnError::NotWatchedError(_))));

        engine.close()
    }

    #[test]
    fn decode_errors_are_reported_and_watching_continues() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        engine.add(r"C:\data")?;
        platform.wait_for_read(VOLUME, 1, TIMEOUT);

        // Header equal to the cursor the read started from.
        platform.complete_read(VOLUME, usn_buffer(1_000, &[]));
        let err = engine.errors().recv_timeout(TIMEOUT).expect("stall error");
        assert!(matches!(err, UsnError::StalledJournalError(1_000)));

        let read = platform.wait_for_read(VOLUME, 2, TIMEOUT);
        assert_eq!(read.start_usn, 1_000);

        platform.complete_read(
            VOLUME,
            usn_buffer(
                1_100,
                &[RecordBuilder::new(0x31, DATA_FID, "b.txt").reason(USN_REASON_FILE_CREATE)],
            ),
        );
        let event = engine.events().recv_timeout(TIMEOUT).expect("event after error");
        assert_eq!(event.op, Op::Create);

        engine.close()
    }

    #[test]
    fn failed_read_is_reported() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        engine.add(r"C:\data")?;
        platform.wait_for_read(VOLUME, 1, TIMEOUT);

        platform.fail_read(VOLUME, UsnError::OtherError("journal entry deleted".to_string()));
        let err = engine.errors().recv_timeout(TIMEOUT).expect("read error");
        assert!(matches!(
            err,
            UsnError::OtherError(ref message) if message == "journal entry deleted"
        ));

        engine.close()
    }

    #[test]
    fn volume_open_failure_is_reported() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        platform.deny_volume(VOLUME);

        engine.add(r"C:\data")?;
        let err = engine.errors().recv_timeout(TIMEOUT).expect("open error");
        assert!(matches!(err, UsnError::PermissionError));

        engine.close()
    }

    #[test]
    fn close_with_outstanding_read_returns() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        engine.add(r"C:\data")?;
        platform.wait_for_read(VOLUME, 1, TIMEOUT);

        engine.close()?;

        assert!(platform.is_closed(VOLUME));
        assert!(engine.events().try_recv().is_err());
        assert!(engine.add(r"C:\data").is_err());
        Ok(())
    }

    #[test]
    fn close_returns_with_full_event_queue() -> UsnResult<()> {
        let (platform, mut engine) = stalled_watcher();

        let (done_tx, done_rx) = bounded(1);
        let closer = thread::spawn(move || {
            let result = engine.close();
            let _ = done_tx.send(());
            result
        });

        done_rx
            .recv_timeout(TIMEOUT)
            .expect("close returns while the event queue is full");
        closer.join().expect("close thread")?;
        assert!(platform.is_closed(VOLUME));
        Ok(())
    }

    #[test]
    fn drop_returns_with_full_event_queue() {
        let (platform, engine) = stalled_watcher();

        let (done_tx, done_rx) = bounded(1);
        thread::spawn(move || {
            drop(engine);
            let _ = done_tx.send(());
        });

        done_rx
            .recv_timeout(TIMEOUT)
            .expect("drop returns while the event queue is full");
        assert!(platform.is_closed(VOLUME));
    }

    #[test]
    fn read_completing_while_draining_emits_nothing() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        let events = engine.events().clone();
        engine.add(r"C:\data")?;
        platform.wait_for_read(VOLUME, 1, TIMEOUT);

        platform.complete_read_after(
            VOLUME,
            Signal::Quit,
            usn_buffer(
                1_300,
                &[RecordBuilder::new(0x51, DATA_FID, "late.txt").reason(USN_REASON_FILE_CREATE)],
            ),
        );
        platform.wait_for_close(VOLUME, TIMEOUT);

        engine.close()?;
        assert!(events.try_recv().is_err());
        assert!(engine.errors().try_recv().is_err());
        Ok(())
    }

    #[test]
    fn failed_read_reopens_volume_once() -> UsnResult<()> {
        let (platform, mut engine) = watcher();
        engine.add(r"C:\data")?;
        platform.wait_for_read(VOLUME, 1, TIMEOUT);

        platform.set_next_usn(VOLUME, 7_000);
        platform.fail_read(VOLUME, UsnError::OtherError("journal entry deleted".to_string()));
        let read = platform.wait_for_read(VOLUME, 2, TIMEOUT);
        assert_eq!(read.start_usn, 7_000);
        assert_eq!(platform.opened_count(VOLUME), 2);

        // Failing again before any read succeeded leaves the volume idle.
        platform.fail_read(VOLUME, UsnError::OtherError("still deleted".to_string()));
        for _ in 0..2 {
            engine.errors().recv_timeout(TIMEOUT).expect("read error");
        }

        engine.close()?;
        assert_eq!(platform.reads(VOLUME).len(), 2);
        assert_eq!(platform.opened_count(VOLUME), 2);
        assert!(platform.is_closed(VOLUME));
        Ok(())
    }

    #[test]
    fn close_aggregates_handle_failures() {
        let (platform, mut engine) = watcher();
        platform.add_file(r"D:\other", VOLUME + 1, 0x55);
        platform.fail_close(VOLUME);
        platform.fail_close(VOLUME + 1);

        engine.add(r"C:\data").expect("add C");
        engine.add(r"D:\other").expect("add D");
        platform.wait_for_read(VOLUME, 1, TIMEOUT);
        platform.wait_for_read(VOLUME + 1, 1, TIMEOUT);

        let result = engine.close();
        assert!(matches!(result, Err(UsnError::MultipleErrors(ref errors)) if errors.len() == 2));
    }

    #[test]
    fn engine_is_usable_through_the_watch_trait() -> UsnResult<()> {
        let (platform, engine) = watcher();
        let mut backend: Box<dyn Watch> = Box::new(engine);

        backend.add(Path::new(r"C:\data"))?;
        platform.wait_for_read(VOLUME, 1, TIMEOUT);
        backend.remove(Path::new(r"C:\data"))?;
        backend.close()
    }
}
