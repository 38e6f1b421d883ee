//! Path identity resolution.
//!
//! The journal names files by file reference number only, so a watched path is pinned
//! to its reference number and volume serial number when it is added.

use std::path::Path;

use log::{debug, warn};
use windows::{
    Win32::{
        Foundation::{CloseHandle, HANDLE},
        Storage::FileSystem::{
            BY_HANDLE_FILE_INFORMATION, CreateFileW, FILE_FLAG_BACKUP_SEMANTICS,
            FILE_READ_ATTRIBUTES, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE,
            GetFileInformationByHandle, GetVolumeInformationByHandleW, OPEN_EXISTING,
        },
    },
    core::HSTRING,
};

use crate::{UsnResult, errors::UsnError, watch::WatchEntry};

const NTFS: &str = "NTFS";

/// Resolves `path` to the file reference number and volume serial number it names.
///
/// Directories resolve as well as files. Fails with
/// [`UsnError::PathUnavailableError`] if the path cannot be opened or does not live
/// on an NTFS volume.
pub fn resolve(path: &Path) -> UsnResult<WatchEntry> {
    let unavailable = |reason: String| UsnError::PathUnavailableError {
        path: path.to_path_buf(),
        reason,
    };

    // Metadata-only access with backup semantics, so directories open too.
    let handle = unsafe {
        CreateFileW(
            &HSTRING::from(path),
            FILE_READ_ATTRIBUTES.0,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            None,
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS,
            None,
        )
    }
    .map_err(|err| unavailable(err.message()))?;

    let identity = identify(handle);
    if let Err(err) = unsafe { CloseHandle(handle) } {
        warn!("Failed to close handle of {:?}: {}", path, err);
    }
    let (file_id, volume_id, file_system) = identity.map_err(|err| unavailable(err.message()))?;

    if file_system != NTFS {
        return Err(unavailable(format!(
            "{} volume has no change journal",
            file_system
        )));
    }

    debug!(
        "Resolved {:?} to fid={:#x} on volume {:#010x}",
        path, file_id, volume_id
    );
    Ok(WatchEntry::new(file_id, volume_id, path))
}

fn identify(handle: HANDLE) -> windows::core::Result<(u64, u32, String)> {
    let mut info = BY_HANDLE_FILE_INFORMATION::default();
    unsafe { GetFileInformationByHandle(handle, &mut info)? };

    let mut file_system = [0u16; 32];
    unsafe {
        GetVolumeInformationByHandleW(handle, None, None, None, None, Some(&mut file_system))?
    };
    let end = file_system
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(file_system.len());

    let file_id = ((info.nFileIndexHigh as u64) << 32) | info.nFileIndexLow as u64;
    Ok((
        file_id,
        info.dwVolumeSerialNumber,
        String::from_utf16_lossy(&file_system[..end]),
    ))
}
