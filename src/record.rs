//! Decoding of `FSCTL_READ_USN_JOURNAL` output buffers.
//!
//! A filled buffer starts with the USN of the next unread record, followed by
//! back-to-back `USN_RECORD_V2` records. Every field is read through bounds-checked
//! slices; a record that claims more bytes than the buffer holds ends the pass.

use std::{ffi::OsString, mem::size_of, time::SystemTime};

use log::{trace, warn};

use crate::{
    Usn, UsnResult,
    errors::UsnError,
    event::{Event, Op},
    reason, time,
    watch::WatchSet,
};

/// Size of the next-USN header at the start of every read buffer.
pub const USN_HEADER_SIZE: usize = size_of::<Usn>();

/// Size of the fixed part of a `USN_RECORD_V2`, up to the file name.
pub const RECORD_V2_HEADER_SIZE: usize = 60;

const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;

/// A decoded `USN_RECORD_V2`.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub record_length: u32,
    pub usn: Usn,
    pub time: SystemTime,
    pub file_id: u64,
    pub parent_file_id: u64,
    pub reason: u32,
    pub source_info: u32,
    pub file_attributes: u32,
    pub file_name: OsString,
}

impl ChangeRecord {
    /// Parses the record starting at `offset`.
    ///
    /// Returns `Ok(None)` for a well-formed record of a major version other than 2.
    pub fn parse(buffer: &[u8], offset: usize) -> UsnResult<Option<ChangeRecord>> {
        let available = buffer.len().saturating_sub(offset);
        let truncated = |record_length| UsnError::TruncatedRecordError {
            offset,
            record_length,
            available,
        };

        let record_length = read_u32(buffer, offset).ok_or_else(|| truncated(0))?;
        if (record_length as usize) < RECORD_V2_HEADER_SIZE || record_length as usize > available
        {
            return Err(truncated(record_length));
        }
        let record = buffer
            .get(offset..offset + record_length as usize)
            .ok_or_else(|| truncated(record_length))?;

        let major_version = read_u16(record, 4).ok_or_else(|| truncated(record_length))?;
        if major_version != 2 {
            warn!(
                "Skipping USN record with unsupported major version {} at offset {}",
                major_version, offset
            );
            return Ok(None);
        }

        let field_u64 = |at| read_u64(record, at).ok_or_else(|| truncated(record_length));
        let field_u32 = |at| read_u32(record, at).ok_or_else(|| truncated(record_length));
        let field_u16 = |at| read_u16(record, at).ok_or_else(|| truncated(record_length));

        // https://learn.microsoft.com/en-us/windows/win32/api/winioctl/ns-winioctl-usn_record_v2
        // The name is located by FileNameOffset and sized by FileNameLength, it is not
        // null terminated.
        let name_length = field_u16(56)? as usize;
        let name_offset = field_u16(58)? as usize;
        let name_bytes = record
            .get(name_offset..name_offset + name_length)
            .ok_or_else(|| truncated(record_length))?;
        let name_units: Vec<u16> = name_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(Some(ChangeRecord {
            record_length,
            file_id: field_u64(8)?,
            parent_file_id: field_u64(16)?,
            usn: field_u64(24)? as Usn,
            time: time::filetime_to_systemtime(field_u64(32)? as i64),
            reason: field_u32(40)?,
            source_info: field_u32(44)?,
            file_attributes: field_u32(52)?,
            file_name: wide_to_os_string(&name_units),
        }))
    }

    /// Returns true if this record describes a directory.
    pub fn is_dir(&self) -> bool {
        self.file_attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }
}

/// Decodes one filled read buffer, emitting events for watched paths in journal order.
///
/// `cursor` is the USN the read started from; it is moved to the buffer's next-USN
/// header unless the journal made no progress. Returns the number of records walked.
pub fn decode(
    buffer: &[u8],
    cursor: &mut Usn,
    watches: &WatchSet,
    mut emit: impl FnMut(Event),
) -> UsnResult<usize> {
    let Some(next_usn) = read_u64(buffer, 0).map(|usn| usn as Usn) else {
        // Nothing but a partial header, treat it as no new data.
        return Ok(0);
    };

    if next_usn == *cursor {
        return Err(UsnError::StalledJournalError(next_usn));
    }
    // Move past this buffer even if a record below turns out to be corrupt,
    // otherwise the same bytes would be read again.
    *cursor = next_usn;

    let mut offset = USN_HEADER_SIZE;
    let mut count = 0;
    while offset < buffer.len() {
        let record = ChangeRecord::parse(buffer, offset)?;
        let record_length = match &record {
            Some(record) => record.record_length,
            None => read_u32(buffer, offset).unwrap_or_default(),
        };
        offset += record_length as usize;
        count += 1;

        let Some(record) = record else {
            continue;
        };

        trace!(
            "usn={}, time={:?}, fid={:#x}, parent_fid={:#x}, reason={}, source_info={:#x}, dir={}, name={:?}",
            record.usn,
            record.time,
            record.file_id,
            record.parent_file_id,
            reason::reason_to_string(record.reason),
            record.source_info,
            record.is_dir(),
            record.file_name
        );

        let Some(path) = watches.resolve(record.file_id, record.parent_file_id, &record.file_name)
        else {
            continue;
        };

        for op in Op::from_reason(record.reason) {
            emit(Event::new(path.clone(), op));
        }
    }

    Ok(count)
}

fn read_u16(buffer: &[u8], at: usize) -> Option<u16> {
    let bytes = buffer.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u32(buffer: &[u8], at: usize) -> Option<u32> {
    let bytes = buffer.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(buffer: &[u8], at: usize) -> Option<u64> {
    let bytes = buffer.get(at..at.checked_add(8)?)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

#[cfg(windows)]
fn wide_to_os_string(units: &[u16]) -> OsString {
    use std::os::windows::ffi::OsStringExt;

    OsString::from_wide(units)
}

#[cfg(not(windows))]
fn wide_to_os_string(units: &[u16]) -> OsString {
    OsString::from(String::from_utf16_lossy(units))
}
