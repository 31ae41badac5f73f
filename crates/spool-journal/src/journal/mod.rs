//! The write-ahead journal: writer, replayer, read-behind, rotation.
//!
//! A [`Journal`] is the durable half of one spool queue. The owning queue
//! logs every state change through the record emitters, replays the file on
//! startup to rebuild its in-memory state, and, when it has shed part of
//! its tail from memory, streams items back in with the read-behind
//! cursor.
//!
//! # Features
//!
//! - **Append-only writes**: each operation appends exactly one record and
//!   advances `size` by the record's byte length; records are never edited
//!   in place
//! - **Replay with truncation tolerance**: a crash mid-write leaves a
//!   partial tail; replay keeps every fully written record and drops the
//!   rest
//! - **Read-behind**: a second cursor trails the writer through the same
//!   file and yields only enqueued items
//! - **Rotation**: `roll` retires the file and starts over empty once the
//!   queue has checkpointed
//!
//! # Durability
//!
//! No per-record fsync is issued. Each write loops until the OS has
//! accepted the full record, and the record framing makes a torn tail
//! detectable on replay, so a crash costs at most the records after the
//! last complete one.
//!
//! # Concurrency
//!
//! The journal performs no locking; exactly one caller drives all methods
//! serially. The read-behind cursor is the only concurrent reader and it is
//! stepped by that same caller.
//!
//! # Example
//!
//! ```rust,no_run
//! use spool_journal::{Journal, QueueItem};
//!
//! # fn example() -> Result<(), spool_journal::JournalError> {
//! let mut journal = Journal::new("/var/spool/queues/work");
//! journal.replay("work", |_journal, _record| Ok(()))?;
//! journal.open()?;
//!
//! // A reliable-delivery cycle: reserve the head item under a
//! // transaction id, then confirm it once the consumer acks.
//! journal.add(&QueueItem::new(0, 0, &b"job"[..]))?;
//! journal.remove_tentative()?;
//! journal.save_xid(17)?;
//! journal.confirm_remove(17)?;
//! # Ok(())
//! # }
//! ```

mod read_behind;


use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::item::QueueItem;
use crate::record::{self, Record, RecordError};
use read_behind::ReadBehind;

/// Errors from journal operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// A write or rotation was attempted before `open` (or after `close`).
    #[error("journal is not open")]
    NotOpen,

    /// I/O error against the journal file or its directory.
    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be encoded.
    #[error("record codec error: {0}")]
    Record(#[from] RecordError),

    /// An item's block would exceed the configured block limit.
    #[error("item block of {size} bytes exceeds the {max}-byte limit")]
    ItemTooLarge {
        /// Size of the rejected item's block (header + payload).
        size: usize,
        /// The configured block limit.
        max: u32,
    },

    /// The read-behind cursor hit end of file while still behind the
    /// writer offset. The file is shorter than the writer believes, which
    /// only happens if something else mutated it; the cursor is closed.
    #[error("read-behind cursor hit end of file at offset {offset}, behind writer offset {writer}")]
    ReadBehindEof {
        /// Byte offset of the cursor when the file ended.
        offset: u64,
        /// The writer offset the cursor was trailing.
        writer: u64,
    },

    /// The read-behind cursor could not decode the record at its offset.
    /// The cursor is closed; the caller decides how to proceed.
    #[error("read-behind record at offset {offset} could not be decoded: {source}")]
    ReadBehindRecord {
        /// Byte offset of the undecodable record.
        offset: u64,
        /// The decode failure.
        #[source]
        source: RecordError,
    },
}

/// Journal configuration.
///
/// Embedders typically keep one of these inside each queue's configuration
/// stanza.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Path of the live journal file. Rotation backups appear momentarily
    /// as `<path>.<millisecond-timestamp>` siblings.
    pub path: PathBuf,

    /// Upper bound on an item block (metadata header + payload), enforced
    /// on both encode and decode. A decoded length prefix above this cap is
    /// treated as corruption before any allocation happens.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u32,
}

fn default_max_block_size() -> u32 {
    record::DEFAULT_MAX_BLOCK_SIZE
}

impl JournalConfig {
    /// Configuration with defaults for everything but the path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_block_size: default_max_block_size(),
        }
    }
}

/// Append-only operation log for one queue.
///
/// `size` equals the file's byte length at every quiescent point; during
/// replay it equals the bytes consumed so far. The read-behind cursor
/// compares its own offset against `size` in both modes, which is what lets
/// the queue activate read-behind from inside the replay callback.
pub struct Journal<C: Clock = SystemClock> {
    config: JournalConfig,
    clock: C,
    writer: Option<File>,
    reader: Option<ReadBehind>,
    scratch: BytesMut,
    size: u64,
    replayed: bool,
}

impl Journal<SystemClock> {
    /// Create a journal handle for `path` with default configuration.
    ///
    /// No file is touched until [`Journal::replay`] or [`Journal::open`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(JournalConfig::new(path))
    }

    /// Create a journal handle from explicit configuration.
    #[must_use]
    pub fn with_config(config: JournalConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> Journal<C> {
    /// Create a journal handle with a caller-supplied clock.
    ///
    /// The clock is consulted for rotation backup suffixes and for the
    /// `add_time` synthesized when legacy records are decoded.
    #[must_use]
    pub fn with_clock(config: JournalConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            writer: None,
            reader: None,
            scratch: BytesMut::new(),
            size: 0,
            replayed: false,
        }
    }

    /// Path of the live journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Byte length of the live journal.
    ///
    /// During replay this is the number of bytes consumed so far.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether a read-behind cursor is active.
    #[must_use]
    pub fn in_read_behind(&self) -> bool {
        self.reader.is_some()
    }

    /// Open the writer in append mode, creating the file if needed.
    ///
    /// When called after [`Journal::replay`], any bytes past the replayed
    /// prefix are the unparseable remains of a torn write; they are trimmed
    /// so that `size` matches the file length and new records are never
    /// stranded behind garbage.
    ///
    /// # Errors
    ///
    /// Any failure to open, inspect, or trim the file.
    pub fn open(&mut self) -> Result<(), JournalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)?;
        let on_disk = file.metadata()?.len();
        if self.replayed {
            if on_disk > self.size {
                warn!(
                    path = %self.config.path.display(),
                    kept = self.size,
                    dropped = on_disk - self.size,
                    "trimming unparseable bytes from the journal tail"
                );
                file.set_len(self.size)?;
            }
        } else {
            self.size = on_disk;
        }
        self.writer = Some(file);
        Ok(())
    }

    /// Release the writer and any active read-behind cursor.
    pub fn close(&mut self) {
        self.writer = None;
        self.reader = None;
    }

    /// Delete the journal file, used when the owning queue is deleted.
    /// Best-effort: absence and deletion failures are logged, not
    /// surfaced.
    pub fn erase(&mut self) {
        self.close();
        if let Err(err) = fs::remove_file(&self.config.path) {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(
                    path = %self.config.path.display(),
                    error = %err,
                    "could not delete journal file"
                );
            }
        }
        self.size = 0;
    }

    /// Retire the current file and start a fresh, empty one.
    ///
    /// In order: close the writer, rename the file to
    /// `<path>.<millisecond-timestamp>`, open a new empty writer at the
    /// original path, reset `size` to zero, delete the renamed backup. A
    /// crash between the rename and the reopen leaves no primary file; the
    /// next startup replays from empty. Rotation must only be requested
    /// once the queue has fully checkpointed.
    ///
    /// # Errors
    ///
    /// [`JournalError::NotOpen`] if the writer is not open; otherwise any
    /// rename, open, or delete failure, surfaced to the caller.
    pub fn roll(&mut self) -> Result<(), JournalError> {
        if self.writer.is_none() {
            return Err(JournalError::NotOpen);
        }
        self.writer = None;
        // A cursor on the retired file has nothing left to deliver.
        self.reader = None;

        let backup = self.backup_path(self.clock.now_ms());
        fs::rename(&self.config.path, &backup)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)?;
        self.writer = Some(file);
        self.size = 0;
        fs::remove_file(&backup)?;
        debug!(path = %self.config.path.display(), "journal rotated");
        Ok(())
    }

    /// Delete leftover rotation backups (`<name>.<digits>` siblings).
    ///
    /// A surviving backup means a crash landed between the rename and the
    /// delete of a previous rotation; its contents were already
    /// checkpointed. Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// Any failure to scan the directory or delete a matched file.
    pub fn clean_stale_backups(&self) -> Result<usize, JournalError> {
        let Some(name) = self.config.path.file_name().and_then(|n| n.to_str()) else {
            return Ok(0);
        };
        let parent = match self.config.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut removed = 0;
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(suffix) = file_name
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('.'))
            else {
                continue;
            };
            if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            warn!(
                file = file_name,
                "removing leftover journal backup from an interrupted rotation"
            );
            fs::remove_file(entry.path())?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Log an enqueued item.
    ///
    /// # Errors
    ///
    /// [`JournalError::ItemTooLarge`] if the item's block would exceed the
    /// configured limit, [`JournalError::NotOpen`] before `open`, or any
    /// write failure.
    pub fn add(&mut self, item: &QueueItem) -> Result<(), JournalError> {
        let block_len = record::ITEM_HEADER_LEN + item.data.len();
        if block_len > self.config.max_block_size as usize {
            return Err(JournalError::ItemTooLarge {
                size: block_len,
                max: self.config.max_block_size,
            });
        }
        self.append_record(&Record::Add(item.clone()))
    }

    /// Log that the head item was consumed.
    ///
    /// # Errors
    ///
    /// [`JournalError::NotOpen`] before `open`, or any write failure.
    pub fn remove(&mut self) -> Result<(), JournalError> {
        self.append_record(&Record::Remove)
    }

    /// Log that the head item was reserved by a transaction.
    ///
    /// # Errors
    ///
    /// [`JournalError::NotOpen`] before `open`, or any write failure.
    pub fn remove_tentative(&mut self) -> Result<(), JournalError> {
        self.append_record(&Record::RemoveTentative)
    }

    /// Checkpoint the queue's next transaction-id counter.
    ///
    /// # Errors
    ///
    /// [`JournalError::NotOpen`] before `open`, or any write failure.
    pub fn save_xid(&mut self, xid: u32) -> Result<(), JournalError> {
        self.append_record(&Record::SaveXid(xid))
    }

    /// Log that tentative remove `xid` was rolled back.
    ///
    /// # Errors
    ///
    /// [`JournalError::NotOpen`] before `open`, or any write failure.
    pub fn unremove(&mut self, xid: u32) -> Result<(), JournalError> {
        self.append_record(&Record::Unremove(xid))
    }

    /// Log that tentative remove `xid` was confirmed.
    ///
    /// # Errors
    ///
    /// [`JournalError::NotOpen`] before `open`, or any write failure.
    pub fn confirm_remove(&mut self, xid: u32) -> Result<(), JournalError> {
        self.append_record(&Record::ConfirmRemove(xid))
    }

    /// Replay the journal from the start, delivering each decoded record
    /// to `f`, then a terminal [`Record::EndOfFile`].
    ///
    /// `name` is the owning queue's name, used in log messages. The
    /// callback receives the journal itself so the queue can activate
    /// read-behind while replay is still in progress; the cursor then
    /// starts at the replay offset.
    ///
    /// A missing file replays as empty. Input ending inside a record, or
    /// an undecodable record, ends the replay with the cleanly decoded
    /// prefix accepted: the queue's recovered state is exactly that
    /// prefix. Neither case is an error to the caller.
    ///
    /// # Errors
    ///
    /// Failures opening an existing file (anything but absence), and
    /// errors returned by the callback.
    pub fn replay<F>(&mut self, name: &str, mut f: F) -> Result<(), JournalError>
    where
        F: FnMut(&mut Self, Record) -> Result<(), JournalError>,
    {
        self.size = 0;
        self.replayed = true;

        let file = match File::open(&self.config.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(
                    queue = name,
                    path = %self.config.path.display(),
                    "no journal on disk; starting empty"
                );
                f(self, Record::EndOfFile)?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut reader = BufReader::new(file);
        loop {
            match record::read_record(&mut reader, self.config.max_block_size, &self.clock) {
                Ok(Some((record, len))) => {
                    self.size += len;
                    f(self, record)?;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        queue = name,
                        offset = self.size,
                        error = %err,
                        "journal replay stopped mid-record"
                    );
                    warn!(
                        queue = name,
                        "DATA MAY HAVE BEEN LOST; keeping the records that replayed cleanly"
                    );
                    break;
                }
            }
        }
        f(self, Record::EndOfFile)?;
        Ok(())
    }

    /// Activate read-behind: open a cursor at the current writer offset
    /// (or the replay offset, if replay is in progress).
    ///
    /// # Errors
    ///
    /// Any failure opening or positioning the read handle.
    pub fn start_read_behind(&mut self) -> Result<(), JournalError> {
        let cursor = ReadBehind::open(&self.config.path, self.size)?;
        self.reader = Some(cursor);
        Ok(())
    }

    /// Advance the read-behind cursor by one record.
    ///
    /// If the cursor has caught up to the writer offset it is closed and
    /// the journal returns to the inactive state. Otherwise exactly one
    /// record is decoded; an `Add` is delivered to `f` and every other
    /// record is skipped. With no active cursor this is a no-op.
    ///
    /// # Errors
    ///
    /// [`JournalError::ReadBehindEof`] if the file ends before the writer
    /// offset, and [`JournalError::ReadBehindRecord`] if the record cannot
    /// be decoded. Both close the cursor.
    pub fn fill_read_behind<F>(&mut self, mut f: F) -> Result<(), JournalError>
    where
        F: FnMut(QueueItem),
    {
        let writer_pos = self.size;
        let Some(cursor) = self.reader.as_mut() else {
            return Ok(());
        };
        if cursor.pos() == writer_pos {
            self.reader = None;
            return Ok(());
        }

        let offset = cursor.pos();
        match cursor.next_record(self.config.max_block_size, &self.clock) {
            Ok(Some(Record::Add(item))) => {
                f(item);
                Ok(())
            }
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                self.reader = None;
                Err(JournalError::ReadBehindEof {
                    offset,
                    writer: writer_pos,
                })
            }
            Err(source) => {
                self.reader = None;
                Err(JournalError::ReadBehindRecord { offset, source })
            }
        }
    }

    /// Encode `record` into the scratch buffer and append it, retrying
    /// short writes until the OS has the whole record.
    fn append_record(&mut self, record: &Record) -> Result<(), JournalError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(JournalError::NotOpen);
        };
        self.scratch.clear();
        let len = record.encode(&mut self.scratch)?;
        writer.write_all(&self.scratch)?;
        self.size += len;
        Ok(())
    }

    fn backup_path(&self, timestamp_ms: u64) -> PathBuf {
        let mut name = self.config.path.clone().into_os_string();
        name.push(format!(".{timestamp_ms}"));
        PathBuf::from(name)
    }
}
