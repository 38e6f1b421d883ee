//! Change journal access on an NTFS volume.
//!
//! Querying and creating the journal run synchronously on a plain volume handle.
//! Reads run asynchronously on an overlapped handle associated with the completion
//! port, each into a heap block that stays put until the kernel is done with it.

use std::{ffi::c_void, mem, mem::size_of};

use log::{debug, warn};
use windows::Win32::{
    Foundation::{ERROR_IO_PENDING, ERROR_JOURNAL_NOT_ACTIVE, ERROR_NOT_FOUND},
    System::{
        IO::{CancelIoEx, DeviceIoControl, OVERLAPPED},
        Ioctl::{
            CREATE_USN_JOURNAL_DATA, FSCTL_CREATE_USN_JOURNAL, FSCTL_QUERY_USN_JOURNAL,
            FSCTL_READ_USN_JOURNAL, READ_USN_JOURNAL_DATA_V0, USN_JOURNAL_DATA_V0,
        },
    },
};

use crate::{
    UsnResult,
    config::WatcherConfig,
    errors::UsnError,
    platform::{JournalPosition, JournalVolume, ReadRequest, ReadToken},
    volume::Volume,
};

/// Queries the journal of `volume`, creating it first if it is not active and
/// `config.create_journal` is set.
pub fn query(volume: &Volume, config: &WatcherConfig) -> UsnResult<JournalPosition> {
    let journal_data = match query_core(volume) {
        Err(UsnError::WinApiError(err))
            if err.code() == ERROR_JOURNAL_NOT_ACTIVE.into() && config.create_journal =>
        {
            create_or_update(
                volume,
                config.journal_max_size,
                config.journal_allocation_delta,
            )?;
            query_core(volume)?
        }
        Err(err) => {
            warn!("Error querying USN journal on {}: {}", volume.name, err);
            return Err(err);
        }
        Ok(journal_data) => journal_data,
    };

    debug!("USN journal data: {:#?}", journal_data);
    Ok(JournalPosition {
        journal_id: journal_data.UsnJournalID,
        next_usn: journal_data.NextUsn,
    })
}

fn query_core(volume: &Volume) -> UsnResult<USN_JOURNAL_DATA_V0> {
    let mut journal_data = USN_JOURNAL_DATA_V0::default();
    let mut bytes_returned = 0u32;
    unsafe {
        // https://learn.microsoft.com/en-us/windows/win32/fileio/using-the-change-journal-identifier
        DeviceIoControl(
            volume.handle()?,
            FSCTL_QUERY_USN_JOURNAL,
            None,
            0,
            Some(&mut journal_data as *mut _ as *mut c_void),
            size_of::<USN_JOURNAL_DATA_V0>() as u32,
            Some(&mut bytes_returned),
            None,
        )?
    };
    Ok(journal_data)
}

/// Creates the journal on `volume`, or resizes an existing one.
pub fn create_or_update(volume: &Volume, max_size: u64, allocation_delta: u64) -> UsnResult<()> {
    let create_data = CREATE_USN_JOURNAL_DATA {
        MaximumSize: max_size,
        AllocationDelta: allocation_delta,
    };
    unsafe {
        DeviceIoControl(
            volume.handle()?,
            FSCTL_CREATE_USN_JOURNAL,
            Some(&create_data as *const _ as *const c_void),
            size_of::<CREATE_USN_JOURNAL_DATA>() as u32,
            None,
            0,
            None,
            None,
        )?
    };
    debug!(
        "Created USN journal on {}, max_size={}, allocation_delta={}",
        volume.name, max_size, allocation_delta
    );
    Ok(())
}

/// Everything one overlapped read hands to the kernel.
///
/// `overlapped` comes first, so its address is also the block's address and serves as
/// the read token.
#[repr(C)]
struct PendingRead {
    overlapped: OVERLAPPED,
    request: READ_USN_JOURNAL_DATA_V0,
    buffer: Vec<u8>,
}

impl PendingRead {
    fn new(buffer_size: usize) -> Box<Self> {
        Box::new(PendingRead {
            overlapped: OVERLAPPED::default(),
            request: READ_USN_JOURNAL_DATA_V0::default(),
            buffer: vec![0u8; buffer_size],
        })
    }

    fn token(&self) -> ReadToken {
        &self.overlapped as *const OVERLAPPED as ReadToken
    }
}

/// An overlapped volume handle reading the change journal one request at a time.
pub struct JournalDevice {
    volume: Volume,
    buffer_size: usize,
    current: Option<Box<PendingRead>>,
    // Reads whose cancellation was requested but not yet reported.
    cancelled: Vec<Box<PendingRead>>,
    // The last settled read, reused by the next one.
    filled: Option<Box<PendingRead>>,
}

impl JournalDevice {
    pub(crate) fn new(volume: Volume, buffer_size: usize) -> Self {
        JournalDevice {
            volume,
            buffer_size,
            current: None,
            cancelled: Vec::new(),
            filled: None,
        }
    }

    fn settle(&mut self, token: ReadToken) -> bool {
        if self.current.as_ref().is_some_and(|read| read.token() == token) {
            self.filled = self.current.take();
            return true;
        }
        if let Some(index) = self.cancelled.iter().position(|read| read.token() == token) {
            let read = self.cancelled.swap_remove(index);
            self.filled.get_or_insert(read);
        }
        false
    }
}

impl JournalVolume for JournalDevice {
    fn read(&mut self, request: &ReadRequest) -> UsnResult<ReadToken> {
        let handle = self.volume.handle()?;
        let mut pending = self
            .filled
            .take()
            .unwrap_or_else(|| PendingRead::new(self.buffer_size));

        pending.overlapped = OVERLAPPED::default();
        pending.request = READ_USN_JOURNAL_DATA_V0 {
            StartUsn: request.start_usn,
            ReasonMask: request.reason_mask,
            ReturnOnlyOnClose: request.only_on_close as u32,
            Timeout: 0,
            BytesToWaitFor: 1,
            UsnJournalID: request.journal_id,
        };

        let input = &pending.request as *const READ_USN_JOURNAL_DATA_V0 as *const c_void;
        let output = pending.buffer.as_mut_ptr() as *mut c_void;
        let output_len = pending.buffer.len() as u32;
        let overlapped = &mut pending.overlapped as *mut OVERLAPPED;

        // Synchronous success still queues a completion packet on the port.
        let issued = unsafe {
            DeviceIoControl(
                handle,
                FSCTL_READ_USN_JOURNAL,
                Some(input),
                size_of::<READ_USN_JOURNAL_DATA_V0>() as u32,
                Some(output),
                output_len,
                None,
                Some(overlapped),
            )
        };
        match issued {
            Ok(()) => {}
            Err(err) if err.code() == ERROR_IO_PENDING.into() => {}
            Err(err) => {
                warn!("Error issuing USN journal read on {}: {}", self.volume.name, err);
                self.filled = Some(pending);
                return Err(err.into());
            }
        }

        let token = pending.token();
        self.current = Some(pending);
        Ok(token)
    }

    fn cancel(&mut self) -> UsnResult<()> {
        let Some(read) = self.current.take() else {
            return Ok(());
        };
        let overlapped = &read.overlapped as *const OVERLAPPED;
        let cancelled = unsafe { CancelIoEx(self.volume.handle()?, Some(overlapped)) };
        self.cancelled.push(read);

        match cancelled {
            Ok(()) => Ok(()),
            // Already completed, the completion is on its way.
            Err(err) if err.code() == ERROR_NOT_FOUND.into() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn owns(&self, token: ReadToken) -> bool {
        self.current.iter().chain(&self.cancelled).any(|read| read.token() == token)
    }

    fn complete(&mut self, token: ReadToken, bytes: u32) -> Option<&[u8]> {
        if !self.settle(token) {
            return None;
        }
        self.filled.as_ref().map(|read| {
            let len = (bytes as usize).min(read.buffer.len());
            &read.buffer[..len]
        })
    }

    fn release(&mut self, token: ReadToken) {
        self.settle(token);
    }

    fn is_idle(&self) -> bool {
        self.current.is_none() && self.cancelled.is_empty()
    }

    fn close(&mut self) -> UsnResult<()> {
        self.volume.close()
    }
}

impl Drop for JournalDevice {
    fn drop(&mut self) {
        if let Err(err) = self.volume.close() {
            warn!("Failed to close volume {}: {}", self.volume.name, err);
        }
        if !self.is_idle() {
            // The kernel may still write into these blocks.
            warn!(
                "Leaking {} unsettled journal read(s) on {}",
                self.cancelled.len() + self.current.is_some() as usize,
                self.volume.name
            );
            mem::forget(self.current.take());
            mem::forget(mem::take(&mut self.cancelled));
        }
    }
}
