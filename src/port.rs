//! The Windows platform: an I/O completion port driving overlapped journal reads.

use std::{mem, path::Path, ptr};

use log::{debug, warn};
use windows::Win32::{
    Foundation::{CloseHandle, ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE},
    System::{
        IO::{
            CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
            PostQueuedCompletionStatus,
        },
        Threading::INFINITE,
    },
};

use crate::{
    UsnResult,
    config::WatcherConfig,
    engine::Engine,
    errors::UsnError,
    journal::{self, JournalDevice},
    path,
    platform::{Completion, JournalPosition, Platform, ReadToken, Signal},
    volume::Volume,
    watch::WatchEntry,
};

// Completion keys. Volume handles are associated with KEY_SYSTEM and are told apart
// by their OVERLAPPED address instead.
const KEY_SYSTEM: usize = 0;
const KEY_QUIT: usize = 1;
const KEY_CHANGE: usize = 2;

/// A journal watcher backed by an I/O completion port.
pub type JournalWatcher = Engine<CompletionPort>;

impl Engine<CompletionPort> {
    /// Starts a watcher with the default configuration.
    pub fn new() -> UsnResult<Self> {
        Self::with_config(WatcherConfig::default())
    }

    pub fn with_config(config: WatcherConfig) -> UsnResult<Self> {
        Engine::with_platform(CompletionPort::new()?, config)
    }
}

#[derive(Debug)]
pub struct CompletionPort {
    port: HANDLE,
}

// The port handle is only used through thread-safe completion port calls.
unsafe impl Send for CompletionPort {}
unsafe impl Sync for CompletionPort {}

impl CompletionPort {
    pub fn new() -> UsnResult<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, None, KEY_SYSTEM, 0)? };
        debug!("Created completion port {:?}", port);
        Ok(CompletionPort { port })
    }
}

impl Platform for CompletionPort {
    type Volume = JournalDevice;

    fn resolve(&self, path: &Path) -> UsnResult<WatchEntry> {
        path::resolve(path)
    }

    fn open_volume(
        &self,
        entry: &WatchEntry,
        config: &WatcherConfig,
    ) -> UsnResult<(JournalDevice, JournalPosition)> {
        let name = Volume::name_for_path(&entry.path)?;

        let position = {
            let mut volume = Volume::open(&name, false)?;
            let position = journal::query(&volume, config)?;
            volume.close()?;
            position
        };

        let volume = Volume::open(&name, true)?;
        unsafe { CreateIoCompletionPort(volume.handle()?, Some(self.port), KEY_SYSTEM, 0)? };
        debug!(
            "Associated {} (volume {:#010x}) with the completion port",
            name, entry.volume_id
        );

        Ok((JournalDevice::new(volume, config.buffer_size), position))
    }

    fn post(&self, signal: Signal) -> UsnResult<()> {
        let key = match signal {
            Signal::Change => KEY_CHANGE,
            Signal::Quit => KEY_QUIT,
        };
        unsafe { PostQueuedCompletionStatus(self.port, 0, key, None)? };
        Ok(())
    }

    fn wait(&self) -> UsnResult<Completion> {
        loop {
            let mut bytes = 0u32;
            let mut key = 0usize;
            let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
            let result = unsafe {
                GetQueuedCompletionStatus(
                    self.port,
                    &mut bytes,
                    &mut key,
                    &mut overlapped,
                    INFINITE,
                )
            };

            // No packet was dequeued: the port itself failed.
            if overlapped.is_null() {
                if let Err(err) = result {
                    return Err(UsnError::CompletionPortError(err.message()));
                }
                match key {
                    KEY_QUIT => return Ok(Completion::Signal(Signal::Quit)),
                    KEY_CHANGE => return Ok(Completion::Signal(Signal::Change)),
                    other => {
                        warn!("Ignoring completion with unknown key {}", other);
                        continue;
                    }
                }
            }

            let token = overlapped as ReadToken;
            return Ok(match result {
                Ok(()) => Completion::Read { token, bytes },
                Err(err) if err.code() == ERROR_OPERATION_ABORTED.into() => {
                    Completion::Aborted { token }
                }
                Err(err) => Completion::Failed {
                    token,
                    error: err.into(),
                },
            });
        }
    }

    fn close(self) -> UsnResult<()> {
        let port = self.port;
        mem::forget(self);
        unsafe { CloseHandle(port)? };
        debug!("Closed completion port");
        Ok(())
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        if let Err(err) = unsafe { CloseHandle(self.port) } {
            warn!("Failed to close completion port: {}", err);
        }
    }
}
