//! Watch bookkeeping owned by the completion loop.
//!
//! The journal only reports file reference numbers, so every watched path is stored
//! with the reference number it resolved to when it was added. Sessions are keyed by
//! volume serial number and live exactly as long as they hold at least one watch.

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    ffi::OsStr,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    Usn, UsnResult,
    config::WatcherConfig,
    errors::UsnError,
    platform::{JournalPosition, JournalVolume, ReadRequest, ReadToken},
};

/// A watched path and the identity it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub file_id: u64,
    pub volume_id: u32,
    pub path: PathBuf,
}

impl WatchEntry {
    pub fn new(file_id: u64, volume_id: u32, path: impl Into<PathBuf>) -> Self {
        WatchEntry {
            file_id,
            volume_id,
            path: path.into(),
        }
    }
}

/// A change to the watch set, queued by a caller for the completion loop.
#[derive(Debug)]
pub(crate) enum WatchAction {
    Add(WatchEntry),
    Remove(PathBuf),
}

/// The watches of one volume, keyed by path.
#[derive(Debug, Default)]
pub struct WatchSet {
    entries: BTreeMap<PathBuf, WatchEntry>,
}

impl WatchSet {
    /// Inserts `entry` unless its path is already watched. Returns true if inserted.
    pub fn insert(&mut self, entry: WatchEntry) -> bool {
        match self.entries.contains_key(&entry.path) {
            true => false,
            false => {
                self.entries.insert(entry.path.clone(), entry);
                true
            }
        }
    }

    pub fn remove(&mut self, path: &Path) -> Option<WatchEntry> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchEntry> {
        self.entries.values()
    }

    /// Maps a journal record onto a watched path.
    ///
    /// A watch on the record's own file wins over a watch on its parent directory,
    /// whose path is joined with the record's file name.
    pub fn resolve(&self, file_id: u64, parent_file_id: u64, file_name: &OsStr) -> Option<PathBuf> {
        if let Some(entry) = self.iter().find(|entry| entry.file_id == file_id) {
            return Some(entry.path.clone());
        }

        self.iter()
            .find(|entry| entry.file_id == parent_file_id)
            .map(|entry| entry.path.join(file_name))
    }
}

/// Journal reading state for one volume with at least one watch.
#[derive(Debug)]
pub struct VolumeSession<V> {
    pub(crate) volume_id: u32,
    pub(crate) volume: V,
    pub(crate) journal_id: u64,
    pub(crate) cursor: Usn,
    pub(crate) reason_mask: u32,
    pub(crate) only_on_close: bool,
    pub(crate) watches: WatchSet,
    // Set when the volume was reopened after a failed read, until a read succeeds.
    pub(crate) recovering: bool,
}

impl<V: JournalVolume> VolumeSession<V> {
    pub(crate) fn new(
        volume_id: u32,
        volume: V,
        position: JournalPosition,
        config: &WatcherConfig,
    ) -> Self {
        debug!(
            "Opened session for volume {:#010x}, journal_id={:#x}, next_usn={}",
            volume_id, position.journal_id, position.next_usn
        );
        VolumeSession {
            volume_id,
            volume,
            journal_id: position.journal_id,
            cursor: position.next_usn,
            reason_mask: config.reason_mask,
            only_on_close: config.only_on_close,
            watches: WatchSet::default(),
            recovering: false,
        }
    }

    /// Cancels the outstanding read, if any, and reads again from the cursor.
    pub(crate) fn start_read(&mut self) -> UsnResult<()> {
        self.volume.cancel()?;

        let request = ReadRequest {
            start_usn: self.cursor,
            reason_mask: self.reason_mask,
            only_on_close: self.only_on_close,
            journal_id: self.journal_id,
        };
        let token = self.volume.read(&request)?;
        debug!(
            "Issued journal read on volume {:#010x} from usn {} (token {:#x})",
            self.volume_id, self.cursor, token
        );
        Ok(())
    }
}

/// How [`WatchTable::add`] attached a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attach {
    NewSession,
    NewWatch,
    AlreadyWatched,
}

/// All volume sessions, keyed by volume serial number.
#[derive(Debug)]
pub(crate) struct WatchTable<V> {
    volumes: HashMap<u32, VolumeSession<V>>,
}

impl<V> Default for WatchTable<V> {
    fn default() -> Self {
        WatchTable {
            volumes: HashMap::new(),
        }
    }
}

impl<V: JournalVolume> WatchTable<V> {
    /// Attaches `entry` to its volume's session, opening the session with `open` if the
    /// volume has none yet.
    pub(crate) fn add(
        &mut self,
        entry: WatchEntry,
        open: impl FnOnce(&WatchEntry) -> UsnResult<VolumeSession<V>>,
    ) -> UsnResult<(&mut VolumeSession<V>, Attach)> {
        let (session, created) = match self.volumes.entry(entry.volume_id) {
            Entry::Occupied(occupied) => (occupied.into_mut(), false),
            Entry::Vacant(vacant) => (vacant.insert(open(&entry)?), true),
        };

        let attach = match (session.watches.insert(entry), created) {
            (_, true) => Attach::NewSession,
            (true, false) => Attach::NewWatch,
            (false, false) => Attach::AlreadyWatched,
        };
        Ok((session, attach))
    }

    /// Removes the watch on `path`. If it was the volume's last watch, the session is
    /// detached from the table and returned so its read can be cancelled.
    pub(crate) fn remove(
        &mut self,
        volume_id: u32,
        path: &Path,
    ) -> UsnResult<Option<VolumeSession<V>>> {
        let not_watched = || UsnError::NotWatchedError(path.to_path_buf());

        let session = self.volumes.get_mut(&volume_id).ok_or_else(not_watched)?;
        session.watches.remove(path).ok_or_else(not_watched)?;

        if session.watches.is_empty() {
            return Ok(self.volumes.remove(&volume_id));
        }
        Ok(None)
    }

    /// Finds the volume a path is watched on.
    pub(crate) fn volume_of(&self, path: &Path) -> Option<u32> {
        self.volumes
            .values()
            .find(|session| session.watches.contains(path))
            .map(|session| session.volume_id)
    }

    /// Finds the session that issued the read identified by `token`.
    pub(crate) fn session_for(&mut self, token: ReadToken) -> Option<&mut VolumeSession<V>> {
        self.volumes
            .values_mut()
            .find(|session| session.volume.owns(token))
    }

    pub(crate) fn watch_count(&self, volume_id: u32) -> usize {
        self.volumes
            .get(&volume_id)
            .map_or(0, |session| session.watches.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Detaches every session, for shutdown.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = VolumeSession<V>> + '_ {
        self.volumes.drain().map(|(_, session)| session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::FakePlatform;

    const VOLUME: u32 = 0x1234_5678;

    fn open_with(
        platform: &FakePlatform,
    ) -> impl FnOnce(&WatchEntry) -> UsnResult<VolumeSession<crate::tests::FakeVolume>> + '_ {
        move |entry| {
            let (volume, position) = platform.open_fake_volume(entry.volume_id)?;
            Ok(VolumeSession::new(
                entry.volume_id,
                volume,
                position,
                &WatcherConfig::default(),
            ))
        }
    }

    #[test]
    fn add_is_idempotent_per_path() -> UsnResult<()> {
        let platform = FakePlatform::new();
        let mut table = WatchTable::default();

        let (_, attach) = table.add(WatchEntry::new(1, VOLUME, r"C:\a"), open_with(&platform))?;
        assert_eq!(attach, Attach::NewSession);
        for _ in 0..3 {
            let (_, attach) =
                table.add(WatchEntry::new(1, VOLUME, r"C:\a"), open_with(&platform))?;
            assert_eq!(attach, Attach::AlreadyWatched);
        }
        assert_eq!(table.watch_count(VOLUME), 1);

        let (_, attach) = table.add(WatchEntry::new(2, VOLUME, r"C:\b"), open_with(&platform))?;
        assert_eq!(attach, Attach::NewWatch);
        assert_eq!(table.watch_count(VOLUME), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(platform.opened_count(VOLUME), 1);
        Ok(())
    }

    #[test]
    fn same_file_id_under_two_paths_is_kept_twice() -> UsnResult<()> {
        let platform = FakePlatform::new();
        let mut table = WatchTable::default();

        table.add(WatchEntry::new(9, VOLUME, r"C:\old"), open_with(&platform))?;
        table.add(WatchEntry::new(9, VOLUME, r"C:\alias"), open_with(&platform))?;
        assert_eq!(table.watch_count(VOLUME), 2);
        Ok(())
    }

    #[test]
    fn failed_open_leaves_no_session() {
        let platform = FakePlatform::new();
        let mut table: WatchTable<crate::tests::FakeVolume> = WatchTable::default();

        let result = table.add(WatchEntry::new(1, VOLUME, r"C:\a"), |_| {
            Err(UsnError::PermissionError)
        });
        assert!(matches!(result, Err(UsnError::PermissionError)));
        assert_eq!(table.len(), 0);
        assert_eq!(platform.opened_count(VOLUME), 0);
    }

    #[test]
    fn removing_last_watch_detaches_session() -> UsnResult<()> {
        let platform = FakePlatform::new();
        let mut table = WatchTable::default();
        table.add(WatchEntry::new(1, VOLUME, r"C:\a"), open_with(&platform))?;
        table.add(WatchEntry::new(2, VOLUME, r"C:\b"), open_with(&platform))?;

        assert!(table.remove(VOLUME, Path::new(r"C:\a"))?.is_none());
        assert_eq!(table.volume_of(Path::new(r"C:\b")), Some(VOLUME));

        let detached = table.remove(VOLUME, Path::new(r"C:\b"))?;
        let detached = detached.expect("last watch detaches the session");
        assert_eq!(detached.volume_id, VOLUME);
        assert!(detached.watches.is_empty());
        assert_eq!(table.len(), 0);
        assert_eq!(table.volume_of(Path::new(r"C:\b")), None);
        Ok(())
    }

    #[test]
    fn remove_unknown_is_not_watched() -> UsnResult<()> {
        let platform = FakePlatform::new();
        let mut table = WatchTable::default();

        let result = table.remove(VOLUME, Path::new(r"C:\a"));
        assert!(matches!(result, Err(UsnError::NotWatchedError(_))));

        table.add(WatchEntry::new(1, VOLUME, r"C:\a"), open_with(&platform))?;
        let result = table.remove(VOLUME, Path::new(r"C:\other"));
        assert!(matches!(
            result,
            Err(UsnError::NotWatchedError(path)) if path == Path::new(r"C:\other")
        ));
        assert_eq!(table.watch_count(VOLUME), 1);
        Ok(())
    }

    #[test]
    fn start_read_uses_cursor_and_mask() -> UsnResult<()> {
        let platform = FakePlatform::new();
        platform.set_next_usn(VOLUME, 8_192);
        let mut table = WatchTable::default();

        let (session, _) = table.add(WatchEntry::new(1, VOLUME, r"C:\a"), open_with(&platform))?;
        session.start_read()?;
        session.cursor = 9_000;
        session.start_read()?;

        let reads = platform.reads(VOLUME);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].start_usn, 8_192);
        assert_eq!(reads[1].start_usn, 9_000);
        assert_eq!(reads[1].reason_mask, WatcherConfig::default().reason_mask);
        // The first read was cancelled before the second was issued.
        assert_eq!(platform.cancelled_count(VOLUME), 1);
        Ok(())
    }

    #[test]
    fn resolve_prefers_direct_hit() {
        let mut watches = WatchSet::default();
        watches.insert(WatchEntry::new(10, VOLUME, r"C:\dir"));
        watches.insert(WatchEntry::new(11, VOLUME, r"C:\dir\file"));

        assert_eq!(
            watches.resolve(11, 10, OsStr::new("file")),
            Some(PathBuf::from(r"C:\dir\file"))
        );
        assert_eq!(
            watches.resolve(12, 10, OsStr::new("other")),
            Some(Path::new(r"C:\dir").join("other"))
        );
        assert_eq!(watches.resolve(13, 14, OsStr::new("x")), None);
    }
}
