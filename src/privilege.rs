use std::mem::size_of;

use log::warn;
use windows::Win32::{
    Foundation::{CloseHandle, HANDLE},
    Security::{GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation},
    System::Threading::{GetCurrentProcess, OpenProcessToken},
};

use crate::UsnResult;

/// Returns true if the current process token is elevated.
///
/// Opening a volume for change journal reads requires an elevated process.
pub(crate) fn is_elevated() -> UsnResult<bool> {
    let mut token = HANDLE::default();
    unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token)? };

    let mut elevation = TOKEN_ELEVATION::default();
    let mut returned_length = 0;
    let queried = unsafe {
        GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut _),
            size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned_length,
        )
    };

    if let Err(err) = unsafe { CloseHandle(token) } {
        warn!("Failed to close process token: {}", err);
    }
    queried?;

    Ok(elevation.TokenIsElevated != 0)
}
