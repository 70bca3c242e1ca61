//! Copy-on-read handles over store bytes.
//!
//! A handle is either a zero-cost view straight into mapped memory (when the
//! requested range lies inside one region) or an owning heap buffer filled by
//! a scatter-gather copy (when the range spans regions).  Consumers see a
//! plain byte slice either way and must not care which case they got.
//!
//! Write handles additionally carry the write-back contract: a spanning write
//! handle copies its buffer back into the mapped regions when dropped.  Read
//! handles never write back.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use crate::{address::Address, storage::Storage};

enum ReadInner<'a> {
    Mapped(&'a [u8]),
    Spanning(Arc<[u8]>),
}

/// Shared read handle returned by [`Database::get`](crate::Database::get).
///
/// Cheap to clone: the mapped case copies a reference, the spanning case
/// bumps the reference count on the one heap buffer.
pub struct ReadHandle<'a> {
    inner: ReadInner<'a>,
}

impl<'a> ReadHandle<'a> {
    pub(crate) fn mapped(bytes: &'a [u8]) -> Self {
        ReadHandle {
            inner: ReadInner::Mapped(bytes),
        }
    }

    pub(crate) fn spanning(bytes: Arc<[u8]>) -> Self {
        ReadHandle {
            inner: ReadInner::Spanning(bytes),
        }
    }

    /// True when this handle is a direct view into mapped memory rather
    /// than an owned copy.
    pub fn is_mapped(&self) -> bool {
        matches!(self.inner, ReadInner::Mapped(_))
    }
}

impl Deref for ReadHandle<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.inner {
            ReadInner::Mapped(bytes) => bytes,
            ReadInner::Spanning(bytes) => bytes,
        }
    }
}

impl Clone for ReadHandle<'_> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            ReadInner::Mapped(bytes) => ReadInner::Mapped(*bytes),
            ReadInner::Spanning(bytes) => ReadInner::Spanning(Arc::clone(bytes)),
        };
        ReadHandle { inner }
    }
}

impl fmt::Debug for ReadHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHandle")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

enum UniqueReadInner<'a> {
    Mapped(&'a [u8]),
    Spanning(Box<[u8]>),
}

/// Uniquely-owned read handle returned by
/// [`Database::getu`](crate::Database::getu).  Identical access semantics to
/// [`ReadHandle`] without the shared ownership.
pub struct UniqueReadHandle<'a> {
    inner: UniqueReadInner<'a>,
}

impl<'a> UniqueReadHandle<'a> {
    pub(crate) fn mapped(bytes: &'a [u8]) -> Self {
        UniqueReadHandle {
            inner: UniqueReadInner::Mapped(bytes),
        }
    }

    pub(crate) fn spanning(bytes: Box<[u8]>) -> Self {
        UniqueReadHandle {
            inner: UniqueReadInner::Spanning(bytes),
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.inner, UniqueReadInner::Mapped(_))
    }
}

impl Deref for UniqueReadHandle<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.inner {
            UniqueReadInner::Mapped(bytes) => bytes,
            UniqueReadInner::Spanning(bytes) => bytes,
        }
    }
}

impl fmt::Debug for UniqueReadHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueReadHandle")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// A spanning write buffer that copies itself back into the store when
/// dropped.
pub(crate) struct SpanningWrite<'a> {
    storage: &'a Storage,
    addr: Address,
    buf: Box<[u8]>,
}

impl Drop for SpanningWrite<'_> {
    fn drop(&mut self) {
        self.storage.copy_to_store(self.addr, &self.buf);
    }
}

enum WriteInner<'a> {
    Mapped(&'a mut [u8]),
    Spanning(SpanningWrite<'a>),
}

/// Writable handle returned by
/// [`Database::get_mut`](crate::Database::get_mut).
///
/// The mapped case writes straight into the store; the spanning case
/// accumulates writes in a heap buffer and scatter-copies it back into the
/// mapped regions on drop.
pub struct WriteHandle<'a> {
    inner: WriteInner<'a>,
}

impl<'a> WriteHandle<'a> {
    pub(crate) fn mapped(bytes: &'a mut [u8]) -> Self {
        WriteHandle {
            inner: WriteInner::Mapped(bytes),
        }
    }

    pub(crate) fn spanning(storage: &'a Storage, addr: Address, buf: Box<[u8]>) -> Self {
        WriteHandle {
            inner: WriteInner::Spanning(SpanningWrite { storage, addr, buf }),
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.inner, WriteInner::Mapped(_))
    }
}

impl Deref for WriteHandle<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.inner {
            WriteInner::Mapped(bytes) => bytes,
            WriteInner::Spanning(write) => &write.buf,
        }
    }
}

impl DerefMut for WriteHandle<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.inner {
            WriteInner::Mapped(bytes) => bytes,
            WriteInner::Spanning(write) => &mut write.buf,
        }
    }
}

impl fmt::Debug for WriteHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHandle")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
