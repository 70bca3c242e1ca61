use std::{io, path::PathBuf};

use snafu::Snafu;

/// Error raised by the store core.
///
/// Corruption errors (`HeaderCorrupt`, `FooterCorrupt`) are never recovered
/// internally: the database is left synced to whatever revision it was on
/// before the failing call, and the caller decides what to do.  Address and
/// lifecycle errors (`BadAddress`, `ReadOnlyAddress`, `StoreClosed`) indicate
/// misuse of the API and are likewise surfaced rather than caught.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// A general I/O error occurred.
    ///
    /// Every failing OS call is wrapped with the operation that was being
    /// attempted and the path it was attempted on.  The core never retries a
    /// transient OS error.
    #[snafu(display("I/O error during {} of {}: {}", operation, path.display(), source))]
    Io {
        operation: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    /// The file header did not look like a store header.
    ///
    /// Raised when the magic bytes or format version do not match.  A file
    /// that fails this check was either never a store or was produced by an
    /// incompatible version; it is not touched further.
    #[snafu(display("{} does not contain a valid store header", path.display()))]
    HeaderCorrupt { path: PathBuf },

    /// The trailer of a revision failed validation.
    ///
    /// This covers a checksum mismatch, a trailer that lies beyond the end of
    /// the file, and a broken revision chain (generation numbers or
    /// timestamps out of order, a previous-trailer link pointing forward).
    #[snafu(display("store trailer corrupt in {}", path.display()))]
    FooterCorrupt { path: PathBuf },

    /// `sync` was asked for a revision that is not on the chain.
    ///
    /// Either the generation number is newer than the head revision, or the
    /// chain was walked to a smaller generation without passing through it.
    #[snafu(display("unknown revision {}", revision))]
    UnknownRevision { revision: u32 },

    /// A writable handle was requested for an address inside a committed
    /// revision.  Committed bytes are immutable; only addresses past the
    /// current head trailer may be written.
    #[snafu(display(
        "address {:#x} lies inside a committed revision and cannot be written",
        address
    ))]
    ReadOnlyAddress { address: u64 },

    /// The requested byte range is not contained in the current revision.
    #[snafu(display(
        "address range [{:#x}, {:#x}) exceeds the logical store size {:#x}",
        address,
        address + *size as u64,
        logical_size
    ))]
    BadAddress {
        address: u64,
        size: usize,
        logical_size: u64,
    },

    /// An operation was attempted after `close`.
    #[snafu(display("the store has been closed"))]
    StoreClosed,

    /// A control-message frame was constructed with a part number that is not
    /// less than the total number of parts.
    #[snafu(display(
        "message part number {} out of range (message has {} parts)",
        part_no,
        num_parts
    ))]
    BadMessagePartNumber { part_no: u16, num_parts: u16 },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
