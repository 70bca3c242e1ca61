//! The top-level store handle.
//!
//! A [`Database`] owns the store file, the mapped regions over it, and the
//! OS range lock that announces this instance's presence to other processes.
//! Opening walks the header to the most recent revision; [`Database::sync`]
//! moves the view to the head or to any named historical revision;
//! [`Database::get`]/[`Database::getu`]/[`Database::get_mut`] hand out
//! handles over store bytes; [`Transaction`](crate::Transaction) drives the
//! commit protocol on top of [`Database::allocate`] and the lock-upgrade
//! path.

use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use uuid::Uuid;

use crate::{
    address::{Address, TypedAddress},
    common::{alignment_padding, AccessMode, StoreConfig},
    error::{
        BadAddressSnafu, FooterCorruptSnafu, HeaderCorruptSnafu, ReadOnlyAddressSnafu, Result,
        StoreClosedSnafu, UnknownRevisionSnafu,
    },
    handle::{ReadHandle, UniqueReadHandle, WriteHandle},
    io::{FileHandle, LockKind, PresentMode, RangeLock},
    layout::{
        sync_name, Header, LockBlock, Trailer, FOOTER_POS_OFFSET, HEADER_SIZE, INDEX_SLOT_COUNT,
        LEADER_SIZE, TRAILER_SIZE, VACUUM_LOCK_LEN, VACUUM_LOCK_OFFSET,
    },
    os::now_millis,
    storage::Storage,
    transaction::Transaction,
};

/// Which revision [`Database::sync`] should move the view to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Revision {
    /// The most recent committed revision.
    Head,
    /// A specific generation number.
    Generation(u32),
}

#[derive(Debug)]
pub struct Database {
    storage: Storage,
    config: StoreConfig,
    mode: AccessMode,
    header: Header,
    sync_name: String,
    footer_pos: TypedAddress<Trailer>,
    logical_size: u64,
    current_generation: u32,
    index_roots_cache: Option<[Address; INDEX_SLOT_COUNT]>,
    lock: RangeLock,
    modified: bool,
    closed: bool,
}

impl Database {
    /// Opens the store at `path` with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`open_with_config`](Database::open_with_config).
    pub fn open(path: &Path, mode: AccessMode) -> Result<Database> {
        Database::open_with_config(path, mode, StoreConfig::default())
    }

    /// Opens the store at `path`.
    ///
    /// A missing file is created atomically when `mode` is
    /// [`AccessMode::Writable`]: the initial header, lock block, and
    /// generation-0 trailer are written to a uniquely-named temporary file in
    /// the same directory, which is then renamed onto `path`.  Other modes
    /// report a missing file as an error.
    ///
    /// On success the database is synced to the head revision, holds a
    /// shared-read range lock over the store's lock block, and has validated
    /// the head trailer.
    ///
    /// # Errors
    ///
    /// Any OS failure is surfaced with the operation and path attached.  A
    /// file that is not a store, or whose format version is unknown, fails
    /// with `HeaderCorrupt`; a head trailer that does not validate fails
    /// with `FooterCorrupt`.
    pub fn open_with_config(
        path: &Path,
        mode: AccessMode,
        config: StoreConfig,
    ) -> Result<Database> {
        let writable = mode.is_writable();

        let mut file = FileHandle::open(path, writable, PresentMode::AllowNotFound)?;
        if !file.is_open() {
            if mode != AccessMode::Writable {
                return Err(crate::StoreError::Io {
                    operation: "open",
                    path: path.to_path_buf(),
                    source: std::io::ErrorKind::NotFound.into(),
                });
            }
            Database::create_new_store(path, &config)?;
            file = FileHandle::open(path, writable, PresentMode::MustExist)?;
        }

        let mut header_bytes = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(0, &mut header_bytes)?;
        let header = Header::decode(&header_bytes).ok_or_else(|| {
            HeaderCorruptSnafu {
                path: path.to_path_buf(),
            }
            .build()
        })?;

        let footer_pos = header.footer_pos;
        let file_size = file.size()?;
        if footer_pos.absolute() < LEADER_SIZE
            || footer_pos.absolute() + TRAILER_SIZE > file_size
        {
            return FooterCorruptSnafu {
                path: path.to_path_buf(),
            }
            .fail();
        }

        // Build the initial region set covering header through the current
        // trailer, and freshen the pointer table used for translation.
        let mut storage = Storage::new(file, writable, config.small_files, config.min_region_size);
        storage.map_bytes(0, footer_pos.absolute() + TRAILER_SIZE)?;
        storage.update_master_pointers();

        // Announce our presence: every open database keeps a shared-read
        // lock over the vacuum-lock bytes.  The collector takes this range
        // exclusively, so it can never run while anyone has the store open.
        let mut lock = storage.file().range_lock(VACUUM_LOCK_OFFSET, VACUUM_LOCK_LEN);
        lock.lock(LockKind::SharedRead)?;

        let mut database = Database {
            sync_name: sync_name(&header.uuid),
            storage,
            config,
            mode,
            header,
            footer_pos,
            logical_size: footer_pos.absolute() + TRAILER_SIZE,
            current_generation: 0,
            index_roots_cache: None,
            lock,
            modified: false,
            closed: false,
        };

        let trailer = database.validate_trailer(footer_pos, database.logical_size)?;
        database.current_generation = trailer.generation;

        debug!(
            path = %path.display(),
            generation = trailer.generation,
            sync_name = %database.sync_name,
            "Opened store."
        );
        Ok(database)
    }

    /// Writes a brand-new store into a unique temporary file and renames it
    /// onto `path`.  The rename is the commit point of creation: a crash
    /// beforehand leaves at most a stray temporary, never a half-built store
    /// under the final name.
    fn create_new_store(path: &Path, config: &StoreConfig) -> Result<()> {
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut temporary = FileHandle::create_unique(directory)?;
        let built = Database::build_new_store(&temporary, config).and_then(|()| {
            temporary.close();
            temporary.rename(path)
        });
        if let Err(error) = built {
            // Creation failed; the temporary is useless, so drop it from the
            // filesystem before surfacing the original error.
            if let Err(cleanup) = temporary.remove() {
                debug!(error = %cleanup, "Failed to remove temporary store file.");
            }
            return Err(error);
        }

        debug!(path = %path.display(), "Created new store.");
        Ok(())
    }

    fn build_new_store(file: &FileHandle, config: &StoreConfig) -> Result<()> {
        let header = Header::new(TypedAddress::make(LEADER_SIZE));
        file.write_all_at(0, &header.encode())?;
        file.write_all_at(HEADER_SIZE, &LockBlock.encode())?;

        let trailer = Trailer::initial(now_millis());
        file.write_all_at(LEADER_SIZE, &trailer.encode())?;

        // Make sure the file is at least as large as the minimum region, so
        // the first mapping after reopen is fully backed.
        if !config.small_files {
            let written = LEADER_SIZE + TRAILER_SIZE;
            if written < config.min_region_size {
                file.truncate(config.min_region_size)?;
            }
        }
        file.sync_all()
    }

    /// The short textual name derived from the store UUID, used by external
    /// coordination to identify this database.
    pub fn sync_name(&self) -> &str {
        &self.sync_name
    }

    pub fn uuid(&self) -> Uuid {
        self.header.uuid
    }

    pub fn path(&self) -> &Path {
        self.storage.file().path()
    }

    /// Generation number of the revision the view is synced to.
    pub fn current_revision(&self) -> u32 {
        self.current_generation
    }

    /// Bytes belonging to the current revision (plus any uncommitted tail
    /// owned by an open transaction).
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    pub fn footer_pos(&self) -> TypedAddress<Trailer> {
        self.footer_pos
    }

    /// First address a transaction may write to: the byte just past the
    /// current head trailer.  Everything below it is committed and
    /// immutable.
    pub fn first_writable_address(&self) -> Address {
        Address::new(self.footer_pos.absolute() + TRAILER_SIZE)
    }

    pub fn is_writable(&self) -> bool {
        self.mode.is_writable()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True when no revision has been committed past the one the view is
    /// synced to.  This consults the shared header slot, so it reflects
    /// commits made by other processes.
    pub fn is_synced_to_head(&self) -> bool {
        self.load_footer_pos() == self.footer_pos
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Moves the view to the given revision.
    ///
    /// Syncing to [`Revision::Head`] performs one atomic load of the shared
    /// header slot; transactions committed after that load are simply not
    /// visible.  Syncing to an older generation walks the trailer chain
    /// backwards from the current position, validating every hop.  On any
    /// failure the view is left exactly where it was.
    ///
    /// # Errors
    ///
    /// `UnknownRevision` when the generation is newer than head or absent
    /// from the chain; `FooterCorrupt` when a trailer fails validation along
    /// the way; `StoreClosed` after `close`.
    #[cfg_attr(test, instrument(skip(self), level = "trace"))]
    pub fn sync(&mut self, revision: Revision) -> Result<()> {
        if self.closed {
            return StoreClosedSnafu.fail();
        }

        let mut candidate = self.footer_pos;
        let mut candidate_generation = self.current_generation;
        let mut limit = self.logical_size;

        // A request for a revision at or before the current one can be
        // served by walking backwards from where we are; only the head (or a
        // generation newer than ours) requires consulting the shared header
        // slot.
        let is_newer = match revision {
            Revision::Head => true,
            Revision::Generation(generation) => {
                if generation == self.current_generation {
                    return Ok(());
                }
                generation > self.current_generation
            }
        };

        if is_newer {
            // This atomic load fixes our view of the head revision; anything
            // committed afterwards is not visible to this sync.
            let new_footer = self.load_footer_pos();
            if revision == Revision::Head && new_footer == self.footer_pos {
                // The head has not moved since we last synced.
                return Ok(());
            }

            let file_size = self.storage.file().size()?;
            if new_footer.absolute() < LEADER_SIZE
                || new_footer.absolute() + TRAILER_SIZE > file_size
            {
                return FooterCorruptSnafu {
                    path: self.path().to_path_buf(),
                }
                .fail();
            }

            // Another process may have grown the store since we mapped it.
            let new_limit = new_footer.absolute() + TRAILER_SIZE;
            self.storage.map_bytes(self.logical_size, new_limit)?;

            let trailer = self.validate_trailer(new_footer, new_limit)?;
            candidate = new_footer;
            candidate_generation = trailer.generation;
            limit = new_limit;
        }

        if let Revision::Generation(generation) = revision {
            let (pos, gen) = self.older_revision_footer_pos(generation, candidate, limit)?;
            candidate = pos;
            candidate_generation = gen;
        }

        self.footer_pos = candidate;
        self.logical_size = candidate.absolute() + TRAILER_SIZE;
        self.current_generation = candidate_generation;
        // The revision changed, so cached index roots no longer apply.
        self.index_roots_cache = None;

        trace!(
            generation = candidate_generation,
            footer_pos = candidate.absolute(),
            "Synced store view."
        );
        Ok(())
    }

    /// Walks backwards down the revision chain from `start` until the
    /// requested generation is found.
    fn older_revision_footer_pos(
        &self,
        revision: u32,
        start: TypedAddress<Trailer>,
        limit: u64,
    ) -> Result<(TypedAddress<Trailer>, u32)> {
        debug_assert!(start.absolute() + TRAILER_SIZE <= limit);
        let mut pos = start;
        loop {
            let tail = self.read_trailer(pos);
            if revision > tail.generation {
                return UnknownRevisionSnafu { revision }.fail();
            }
            if tail.generation == revision {
                return Ok((pos, tail.generation));
            }
            // Each hop is fully validated before we trust its back link;
            // strictly-decreasing positions guarantee the walk terminates.
            let prev = tail.prev_generation;
            self.validate_trailer(prev, pos.absolute())?;
            pos = prev;
        }
    }

    /// Reads the trailer bytes at `pos`.
    ///
    /// **Precondition**: `[pos, pos + TRAILER_SIZE)` is mapped.
    pub(crate) fn read_trailer(&self, pos: TypedAddress<Trailer>) -> Trailer {
        let mut bytes = [0u8; TRAILER_SIZE as usize];
        self.storage.copy_from_store(pos.to_address(), &mut bytes);
        Trailer::decode(&bytes)
    }

    /// Fully validates the trailer at `pos`: it must lie within `limit`,
    /// its checksum must match (unless checksum checks are configured off),
    /// and its backwards link must obey the chain invariants.
    ///
    /// # Errors
    ///
    /// `FooterCorrupt` on any violation.
    pub(crate) fn validate_trailer(
        &self,
        pos: TypedAddress<Trailer>,
        limit: u64,
    ) -> Result<Trailer> {
        let corrupt = || FooterCorruptSnafu {
            path: self.path().to_path_buf(),
        };

        if pos.absolute() < LEADER_SIZE || pos.absolute() + TRAILER_SIZE > limit {
            return corrupt().fail();
        }

        let trailer = self.read_trailer(pos);
        if self.config.crc_checks && !trailer.crc_matches() {
            return corrupt().fail();
        }

        let prev = trailer.prev_generation;
        if prev.is_null() {
            if trailer.generation != 0 {
                return corrupt().fail();
            }
        } else {
            if trailer.generation == 0 {
                return corrupt().fail();
            }
            // The previous trailer must end at or before this one starts.
            if prev.absolute() < LEADER_SIZE
                || prev.absolute() + TRAILER_SIZE > pos.absolute()
            {
                return corrupt().fail();
            }
            let previous = self.read_trailer(prev);
            if previous.generation >= trailer.generation || previous.time > trailer.time {
                return corrupt().fail();
            }
        }

        Ok(trailer)
    }

    /// Reserves `bytes` bytes of uncommitted storage aligned to `align` (a
    /// power of two) and returns the address of the reservation.  Alignment
    /// padding is accounted for in the logical size, so `allocate(0, a)`
    /// still rounds the cursor up to a multiple of `a`.
    ///
    /// # Errors
    ///
    /// `StoreClosed` after `close`; OS errors from growing the mapping.
    pub fn allocate(&mut self, bytes: u64, align: u64) -> Result<Address> {
        debug_assert!(align.is_power_of_two());
        if self.closed {
            return StoreClosedSnafu.fail();
        }
        self.modified = true;

        let old_logical = self.logical_size;
        debug_assert!(old_logical >= self.footer_pos.absolute() + TRAILER_SIZE);
        let padding = alignment_padding(old_logical, align);
        let result = old_logical + padding;
        let new_logical = result + bytes;

        self.storage.map_bytes(old_logical, new_logical)?;
        self.logical_size = new_logical;
        if self.config.small_files {
            self.storage.file().truncate(new_logical)?;
        }

        Ok(Address::new(result))
    }

    /// Shrinks (or grows) the logical size.  Shrinking may only discard
    /// uncommitted bytes: the logical size can never drop below the end of
    /// the current head trailer, so no reader, in this process or another,
    /// can be observing the discarded range.
    ///
    /// # Errors
    ///
    /// `StoreClosed` after `close`; `BadAddress` when the target size would
    /// cut into the current revision; OS errors from resizing the file.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        if self.closed {
            return StoreClosedSnafu.fail();
        }
        let floor = self.footer_pos.absolute() + TRAILER_SIZE;
        if size < floor {
            return BadAddressSnafu {
                address: size,
                size: 0usize,
                logical_size: floor,
            }
            .fail();
        }
        self.modified = true;

        if size > self.logical_size {
            self.storage.map_bytes(self.logical_size, size)?;
        }
        self.logical_size = size;

        if self.config.small_files {
            self.storage.file().truncate(size)?;
        } else {
            self.storage.truncate_to_physical_size(size)?;
        }
        Ok(())
    }

    /// Validates a `get`-family request.
    fn check_get_params(&self, addr: Address, size: usize, writable: bool) -> Result<()> {
        if self.closed {
            return StoreClosedSnafu.fail();
        }
        if writable
            && (!self.mode.is_writable() || addr < self.first_writable_address())
        {
            return ReadOnlyAddressSnafu {
                address: addr.absolute(),
            }
            .fail();
        }
        let start = addr.absolute();
        if start > self.logical_size || size as u64 > self.logical_size - start {
            return BadAddressSnafu {
                address: start,
                size,
                logical_size: self.logical_size,
            }
            .fail();
        }
        Ok(())
    }

    /// Shared read handle over `[addr, addr + size)`.
    ///
    /// When the range lies inside one region this is a free view into mapped
    /// memory; when it spans regions the bytes are scatter-copied into an
    /// owned buffer.  `initialized == false` skips the copy-in for callers
    /// that will ignore the contents.
    ///
    /// # Errors
    ///
    /// `BadAddress` when the range exceeds the current revision;
    /// `StoreClosed` after `close`.
    pub fn get(&self, addr: Address, size: usize, initialized: bool) -> Result<ReadHandle<'_>> {
        self.check_get_params(addr, size, false)?;
        if self.storage.request_spans_regions(addr, size) {
            Ok(ReadHandle::spanning(self.get_spanning(addr, size, initialized)))
        } else {
            Ok(ReadHandle::mapped(self.storage.mapped_slice(addr, size)))
        }
    }

    /// Uniquely-owned read handle over `[addr, addr + size)`; same
    /// semantics as [`get`](Database::get) without shared ownership.
    ///
    /// # Errors
    ///
    /// As [`get`](Database::get).
    pub fn getu(
        &self,
        addr: Address,
        size: usize,
        initialized: bool,
    ) -> Result<UniqueReadHandle<'_>> {
        self.check_get_params(addr, size, false)?;
        if self.storage.request_spans_regions(addr, size) {
            Ok(UniqueReadHandle::spanning(
                self.get_spanning_unique(addr, size, initialized),
            ))
        } else {
            Ok(UniqueReadHandle::mapped(self.storage.mapped_slice(addr, size)))
        }
    }

    /// Writable handle over `[addr, addr + size)`.
    ///
    /// Only addresses past the current head trailer can be written.  A
    /// non-spanning handle writes straight into mapped memory; a spanning
    /// handle buffers writes and scatter-copies them back when dropped.
    ///
    /// # Errors
    ///
    /// `ReadOnlyAddress` when the store is read-only or `addr` precedes the
    /// first writable address; otherwise as [`get`](Database::get).
    pub fn get_mut(
        &mut self,
        addr: Address,
        size: usize,
        initialized: bool,
    ) -> Result<WriteHandle<'_>> {
        self.check_get_params(addr, size, true)?;
        if self.storage.request_spans_regions(addr, size) {
            let mut buf = vec![0u8; size].into_boxed_slice();
            if initialized {
                self.storage.copy_from_store(addr, &mut buf);
            }
            Ok(WriteHandle::spanning(&self.storage, addr, buf))
        } else {
            Ok(WriteHandle::mapped(self.storage.mapped_slice_mut(addr, size)))
        }
    }

    fn get_spanning(&self, addr: Address, size: usize, initialized: bool) -> Arc<[u8]> {
        let mut buf = vec![0u8; size];
        if initialized {
            self.storage.copy_from_store(addr, &mut buf);
        }
        buf.into()
    }

    fn get_spanning_unique(&self, addr: Address, size: usize, initialized: bool) -> Box<[u8]> {
        let mut buf = vec![0u8; size].into_boxed_slice();
        if initialized {
            self.storage.copy_from_store(addr, &mut buf);
        }
        buf
    }

    /// The root address recorded for an index slot in the trailer of the
    /// currently synced revision.
    ///
    /// # Errors
    ///
    /// `StoreClosed` after `close`.
    pub fn index_root(&mut self, slot: usize) -> Result<Address> {
        assert!(slot < INDEX_SLOT_COUNT, "index slot out of range");
        Ok(self.index_roots()?[slot])
    }

    /// All index roots of the currently synced revision.  Cached until the
    /// next `sync` or commit.
    ///
    /// # Errors
    ///
    /// `StoreClosed` after `close`.
    pub fn index_roots(&mut self) -> Result<[Address; INDEX_SLOT_COUNT]> {
        if self.closed {
            return StoreClosedSnafu.fail();
        }
        if let Some(roots) = self.index_roots_cache {
            return Ok(roots);
        }
        let trailer = self.read_trailer(self.footer_pos);
        self.index_roots_cache = Some(trailer.index_roots);
        Ok(trailer.index_roots)
    }

    /// One acquire-ordered load of the shared header slot.
    fn load_footer_pos(&self) -> TypedAddress<Trailer> {
        let ptr = self.storage.address_to_pointer(Address::new(FOOTER_POS_OFFSET));
        // SAFETY: the header region is mapped for the life of the instance;
        // the slot sits at an 8-byte-aligned offset of a page-aligned
        // mapping; concurrent mutation only ever happens through the
        // release-ordered store in `set_new_footer`.
        let atomic = unsafe { &*ptr.cast::<AtomicU64>() };
        TypedAddress::make(atomic.load(Ordering::Acquire))
    }

    /// Publishes a freshly committed trailer.  The release-ordered store
    /// into the header slot is the atomic commit point: a reader that
    /// observes the new value is guaranteed to see the fully-written,
    /// checksummed trailer bytes it names.
    pub(crate) fn set_new_footer(
        &mut self,
        pos: TypedAddress<Trailer>,
        trailer: &Trailer,
    ) -> Result<()> {
        self.footer_pos = pos;
        self.logical_size = pos.absolute() + TRAILER_SIZE;
        self.current_generation = trailer.generation;
        self.index_roots_cache = Some(trailer.index_roots);

        let ptr = self
            .storage
            .address_to_mut_pointer(Address::new(FOOTER_POS_OFFSET));
        // SAFETY: as in `load_footer_pos`; this instance is the single
        // writer, serialized against the collector by the exclusive range
        // lock held across the commit.
        let atomic = unsafe { &*ptr.cast::<AtomicU64>() };
        atomic.store(pos.absolute(), Ordering::Release);

        if self.config.sync_on_commit {
            self.storage
                .flush_range(Address::NULL, HEADER_SIZE as usize)?;
        }
        Ok(())
    }

    /// Swaps the instance's shared-read presence lock for the exclusive
    /// lock that serializes commits and the collector.  Blocks until every
    /// other holder has released its shared lock.
    ///
    /// # Errors
    ///
    /// Surfaces the OS error if either lock transition fails.
    pub fn upgrade_to_write_lock(&mut self) -> Result<()> {
        self.lock.unlock()?;
        self.lock.lock(LockKind::ExclusiveWrite)
    }

    /// Returns to the shared-read presence lock after a commit or abort.
    ///
    /// # Errors
    ///
    /// Surfaces the OS error if either lock transition fails.
    pub(crate) fn restore_shared_lock(&mut self) -> Result<()> {
        self.lock.unlock()?;
        self.lock.lock(LockKind::SharedRead)
    }

    /// Starts a transaction against the currently synced revision.
    ///
    /// # Errors
    ///
    /// `StoreClosed` after `close`; `ReadOnlyAddress` when the store was
    /// opened read-only.
    pub fn begin_transaction(&mut self) -> Result<Transaction<'_>> {
        Transaction::begin(self)
    }

    /// Closes the store.  When the store was modified and no other process
    /// still has it open, the configured vacuum hook is invoked so an
    /// external collector can compact the file.  Every subsequent operation
    /// fails with `StoreClosed`.
    ///
    /// # Errors
    ///
    /// Surfaces the OS error if releasing the presence lock, or probing it
    /// for other holders, fails.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let handoff = self.modified && self.mode.is_writable();
        self.lock.unlock()?;

        if handoff {
            // Hand the store to the collector only when we were the last
            // one out: every open database holds a shared lock over this
            // range, so a non-blocking exclusive probe succeeds exactly
            // when no other process still has the store open.
            if self.lock.try_lock(LockKind::ExclusiveWrite)? {
                self.lock.unlock()?;
                self.config.vacuum.start(self.storage.file().path());
            } else {
                debug!(
                    path = %self.storage.file().path().display(),
                    "Store still open elsewhere; skipping collection handoff."
                );
            }
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            debug!(%error, "Failed to close store cleanly on drop.");
        }
    }
}
