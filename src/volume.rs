//! Volume handles for change journal access.

use std::path::Path;

use log::{debug, warn};
use windows::{
    Win32::{
        Foundation::{CloseHandle, ERROR_ACCESS_DENIED, HANDLE},
        Storage::FileSystem::{
            CreateFileW, FILE_FLAG_OVERLAPPED, FILE_FLAGS_AND_ATTRIBUTES, FILE_GENERIC_READ,
            FILE_SHARE_READ, FILE_SHARE_WRITE, GetVolumeNameForVolumeMountPointW,
            GetVolumePathNameW, OPEN_EXISTING,
        },
    },
    core::HSTRING,
};

use crate::{UsnResult, errors::UsnError, privilege};

const MAX_PATH: usize = 260;

/// An open handle to an NTFS volume.
#[derive(Debug)]
pub struct Volume {
    handle: Option<HANDLE>,
    pub name: String,
}

impl Volume {
    /// Returns the `\\?\Volume{GUID}` name of the volume holding `path`, without the
    /// trailing backslash.
    pub fn name_for_path(path: &Path) -> UsnResult<String> {
        let mut mount_point = [0u16; MAX_PATH];
        unsafe { GetVolumePathNameW(&HSTRING::from(path), &mut mount_point)? };
        let mount_point = from_wide_null(&mount_point);

        // GetVolumeNameForVolumeMountPointW requires the trailing backslash, which
        // GetVolumePathNameW always returns.
        let mut volume_name = [0u16; 64];
        if let Err(err) = unsafe {
            GetVolumeNameForVolumeMountPointW(&HSTRING::from(&mount_point), &mut volume_name)
        } {
            warn!(
                "GetVolumeNameForVolumeMountPointW failed, mount_point={}, error={:?}",
                mount_point, err
            );
            return Err(err.into());
        }

        // CreateFileW opens the volume itself only without the trailing backslash.
        let name = from_wide_null(&volume_name)
            .trim_end_matches('\\')
            .to_string();
        debug!("Volume of {:?} is {}", path, name);
        Ok(name)
    }

    /// Opens the named volume for reading. Requires an elevated process.
    pub fn open(name: &str, overlapped: bool) -> UsnResult<Self> {
        if !privilege::is_elevated()? {
            return Err(UsnError::PermissionError);
        }

        let flags = match overlapped {
            true => FILE_FLAG_OVERLAPPED,
            false => FILE_FLAGS_AND_ATTRIBUTES::default(),
        };

        // https://learn.microsoft.com/en-us/windows/win32/fileio/obtaining-a-volume-handle-for-change-journal-operations
        let handle = match unsafe {
            CreateFileW(
                &HSTRING::from(name),
                FILE_GENERIC_READ.0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                flags,
                None,
            )
        } {
            Ok(handle) => handle,
            Err(err) if err.code() == ERROR_ACCESS_DENIED.into() => {
                return Err(UsnError::PermissionError);
            }
            Err(err) => return Err(UsnError::WinApiError(err)),
        };

        debug!("Opened volume {} (overlapped={})", name, overlapped);
        Ok(Volume {
            handle: Some(handle),
            name: name.to_string(),
        })
    }

    pub(crate) fn handle(&self) -> UsnResult<HANDLE> {
        self.handle
            .ok_or_else(|| UsnError::OtherError(format!("Volume {} is closed", self.name)))
    }

    /// Closes the handle. Closing twice is a no-op.
    pub fn close(&mut self) -> UsnResult<()> {
        if let Some(handle) = self.handle.take() {
            unsafe { CloseHandle(handle)? };
            debug!("Closed volume {}", self.name);
        }
        Ok(())
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Failed to close volume {}: {}", self.name, err);
        }
    }
}

fn from_wide_null(buffer: &[u16]) -> String {
    let end = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..end])
}
