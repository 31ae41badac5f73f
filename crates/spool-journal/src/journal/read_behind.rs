//! The trailing cursor used while the queue is in read-behind mode.

use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::Path;

use crate::clock::Clock;
use crate::record::{self, Record, RecordError};

/// A second, read-only position on the live journal file.
///
/// The cursor tracks its own byte offset instead of asking the OS, so every
/// advance is exactly the decoded record's length and comparison against
/// the writer offset needs no syscall.
#[derive(Debug)]
pub(crate) struct ReadBehind {
    reader: BufReader<File>,
    pos: u64,
}

impl ReadBehind {
    /// Open a cursor on `path` positioned at byte offset `pos`.
    pub(crate) fn open(path: &Path, pos: u64) -> io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(Self {
            reader: BufReader::new(file),
            pos,
        })
    }

    /// Current byte offset of the cursor.
    pub(crate) fn pos(&self) -> u64 {
        self.pos
    }

    /// Decode the record at the cursor and advance past it.
    ///
    /// `Ok(None)` means the file ended at the cursor; the caller decides
    /// whether that is consistent with the writer offset.
    pub(crate) fn next_record<C: Clock>(
        &mut self,
        max_block_size: u32,
        clock: &C,
    ) -> Result<Option<Record>, RecordError> {
        match record::read_record(&mut self.reader, max_block_size, clock)? {
            Some((record, len)) => {
                self.pos += len;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}
