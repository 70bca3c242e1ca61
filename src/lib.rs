//! # Strata: an embedded, append-only, memory-mapped versioned store.
//!
//! A single writer process produces new *revisions* of the store; any number
//! of readers — in the same process or in cooperating processes — observe
//! consistent past revisions through memory-mapped views of one append-only
//! file.  There is no write-ahead log and no recovery phase: the format
//! itself is the log.
//!
//! ## Design constraints
//!
//! These invariants are the groundwork that keeps the design simple:
//! - the file only ever grows while revisions are being produced; committed
//!   bytes are immutable
//! - every revision ends in a fixed-size, checksummed trailer, and the
//!   trailers form a singly-linked list from newest back to generation zero
//! - exactly one word of the file is ever rewritten: the header's
//!   `footer_pos` slot, updated with a release-ordered atomic store at
//!   commit and read with an acquire-ordered load everywhere else
//! - a crashed writer needs no cleanup: the header still names the previous
//!   revision and the torn bytes past it are simply ignored
//! - all multi-byte integers on disk are little-endian
//!
//! ## On-disk layout
//!
//! ```text
//! [0, 64)            header: magic, version, flags, store UUID,
//!                    footer_pos (the atomic commit slot)
//! [64, 80)           lock block: never interpreted, target of the OS
//!                    byte-range locks coordinating processes
//! [80, footer_pos)   revision payload, including the trailers of all
//!                    earlier revisions embedded as list nodes
//! [footer_pos, footer_pos + 64)   the head trailer
//! ```
//!
//! ## Addressing
//!
//! Data is addressed by [`Address`], a stable 64-bit logical address equal
//! to the absolute byte offset.  The file is mapped as a chain of regions
//! that grow with the store; a request that crosses a region boundary is
//! served by a copy-on-read handle over a scatter-gathered buffer, while
//! anything else is a zero-cost view into mapped memory.  Consumers get a
//! contiguous byte slice either way.
//!
//! ## Reading and writing
//!
//! A reader opens the store, [`sync`](Database::sync)s to the head or to a
//! named historical revision, and reads through [`get`](Database::get) /
//! [`getu`](Database::getu).  The single writer opens the store writable,
//! accumulates writes in a [`Transaction`], and commits: the transaction
//! appends a trailer, flushes it, verifies what landed, and only then
//! publishes the new revision through the header slot under an exclusive
//! byte-range lock.  Readers that observe the new slot value are guaranteed
//! to see a fully-written, checksum-valid trailer behind it.

#[macro_use]
extern crate tracing;

mod address;
mod common;
mod database;
mod error;
mod handle;
mod io;
mod layout;
mod message;
mod os;
mod region;
mod storage;
mod transaction;

#[cfg(test)]
mod tests;

pub use self::{
    address::{Address, TypedAddress},
    common::{AccessMode, StoreConfig, StoreConfigBuilder, VacuumSpawner},
    database::{Database, Revision},
    error::{Result, StoreError},
    handle::{ReadHandle, UniqueReadHandle, WriteHandle},
    layout::{
        Header, LockBlock, Trailer, FORMAT_VERSION, HEADER_SIZE, INDEX_SLOT_COUNT, LEADER_SIZE,
        LOCK_BLOCK_SIZE, SYNC_NAME_LENGTH, TRAILER_SIZE,
    },
    message::{MessageFrame, MESSAGE_SIZE, PAYLOAD_SIZE},
};
