//! # spool-journal
//!
//! Write-ahead journal for the spool durable FIFO message queue.
//!
//! The journal is the only part of a spool queue that touches durable
//! storage. It records every state change of the in-memory queue as an
//! append-only stream of binary operation records, replays that stream on
//! startup to rebuild queue state, and can stream the tail of the file back
//! to the queue ("read-behind") when the queue has shed part of its
//! contents from memory.
//!
//! ## Features
//!
//! - **Append-only operation log**: every enqueue, dequeue, and
//!   transactional remove is one record; records are never rewritten
//! - **Crash recovery by replay**: a truncated tail (the expected result of
//!   a crash mid-write) is detected and dropped; everything before it is
//!   recovered
//! - **Reliable delivery**: tentative removes carry transaction ids and are
//!   later confirmed or rolled back, so a crash never silently drops a
//!   reserved item
//! - **Read-behind**: a second cursor trails the writer through the same
//!   file, re-materializing items in order
//! - **Rotation**: the live file can be retired and restarted empty once
//!   the owning queue has checkpointed
//!
//! ## Example
//!
//! ```rust,no_run
//! use spool_journal::{Journal, QueueItem, Record};
//!
//! # fn example() -> Result<(), spool_journal::JournalError> {
//! let mut journal = Journal::new("/var/spool/queues/work");
//!
//! // Rebuild in-memory state from whatever survived the last shutdown.
//! journal.replay("work", |_journal, record| {
//!     if let Record::Add(item) = record {
//!         let _ = item; // hand the item to the in-memory queue
//!     }
//!     Ok(())
//! })?;
//!
//! // Start logging new operations.
//! journal.open()?;
//! journal.add(&QueueItem::new(0, 0, &b"payload"[..]))?;
//! journal.remove()?;
//! # Ok(())
//! # }
//! ```
//!
//! The in-memory queue, the client protocol, and process configuration are
//! external collaborators; this crate only defines the on-disk format and
//! the file lifecycle.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod item;
pub mod journal;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use item::QueueItem;
pub use journal::{Journal, JournalConfig, JournalError};
pub use record::{Record, RecordError};
