use std::path::PathBuf;

use thiserror::Error;

use crate::Usn;

#[derive(Debug, Error)]
pub enum UsnError {
    #[error("Access denied: Administrator privileges required. Please run the application as Administrator to access the USN journal.")]
    PermissionError,

    #[error("Path unavailable: {path:?}: {reason}")]
    PathUnavailableError { path: PathBuf, reason: String },

    #[error("Path is not watched: {0:?}")]
    NotWatchedError(PathBuf),

    #[error("USN journal made no progress, next USN is still {0}")]
    StalledJournalError(Usn),

    #[error(
        "Truncated USN record at offset {offset}: record length {record_length}, {available} bytes available"
    )]
    TruncatedRecordError {
        offset: usize,
        record_length: u32,
        available: usize,
    },

    #[error("Completion port failed: {0}")]
    CompletionPortError(String),

    #[error("Watcher loop is no longer running")]
    DisconnectedError,

    #[error("Multiple errors: {}", join_errors(.0))]
    MultipleErrors(Vec<UsnError>),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(windows)]
    #[error("Windows error: {0}")]
    WinApiError(#[from] windows::core::Error),

    #[error("Other error: {0}")]
    OtherError(String),
}

impl UsnError {
    /// Folds a list of failures into a single result.
    pub(crate) fn collect(mut errors: Vec<UsnError>) -> Result<(), UsnError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(UsnError::MultipleErrors(errors)),
        }
    }
}

fn join_errors(errors: &[UsnError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
