//! Change events delivered to watcher consumers.

use std::{fmt, path::PathBuf};

use crate::reason::{
    USN_REASON_DATA_EXTEND, USN_REASON_DATA_OVERWRITE, USN_REASON_DATA_TRUNCATION,
    USN_REASON_FILE_CREATE, USN_REASON_FILE_DELETE, USN_REASON_RENAME_NEW_NAME,
    USN_REASON_RENAME_OLD_NAME,
};

/// The kind of change an [`Event`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Modify,
    RenamedFrom,
    RenamedTo,
    Delete,
}

impl Op {
    const ALL: [Op; 5] = [
        Op::Create,
        Op::Modify,
        Op::RenamedFrom,
        Op::RenamedTo,
        Op::Delete,
    ];

    /// Journal reason bits that map onto this operation.
    pub const fn reason_bits(self) -> u32 {
        match self {
            Op::Create => USN_REASON_FILE_CREATE,
            Op::Modify => {
                USN_REASON_DATA_OVERWRITE | USN_REASON_DATA_EXTEND | USN_REASON_DATA_TRUNCATION
            }
            Op::RenamedFrom => USN_REASON_RENAME_OLD_NAME,
            Op::RenamedTo => USN_REASON_RENAME_NEW_NAME,
            Op::Delete => USN_REASON_FILE_DELETE,
        }
    }

    /// Operations reported by a record with the given reason flags, in emission order.
    ///
    /// Each operation appears at most once, however many of its reason bits are set.
    pub fn from_reason(reason: u32) -> impl Iterator<Item = Op> {
        Op::ALL
            .into_iter()
            .filter(move |op| reason & op.reason_bits() != 0)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Create => "CREATE",
            Op::Modify => "MODIFY",
            Op::RenamedFrom => "RENAMED_FROM",
            Op::RenamedTo => "RENAMED_TO",
            Op::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A change to a watched path, or to a direct child of a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub path: PathBuf,
    pub op: Op,
}

impl Event {
    pub fn new(path: impl Into<PathBuf>, op: Op) -> Self {
        Event {
            path: path.into(),
            op,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.path, self.op)
    }
}
