#![no_main]
//! Fuzz target for journal record decoding.
//!
//! Streams arbitrary bytes through `read_record` until the first decode
//! error or end of input. The decoder sits on the crash-recovery path, so
//! no byte sequence may cause a panic, and the block-length cap must be
//! enforced before any payload allocation: a hostile length prefix must
//! not allocate.

use std::io::Cursor;

use libfuzzer_sys::fuzz_target;
use spool_journal::record::read_record;
use spool_journal::ManualClock;

fuzz_target!(|data: &[u8]| {
    let clock = ManualClock::new(0);
    let mut cursor = Cursor::new(data);
    // A tight cap keeps the harness honest about bounded allocation.
    while let Ok(Some(_)) = read_record(&mut cursor, 1 << 20, &clock) {}
});
