//! Transactions.
//!
//! A [`Transaction`] scopes everything written since the revision it was
//! begun against.  Writes land in uncommitted space past the head trailer
//! and stay invisible to every reader until [`Transaction::commit`] appends
//! a new trailer and publishes it through the header slot — the single
//! atomic commit point.  Dropping (or explicitly rolling back) an
//! uncommitted transaction truncates the uncommitted tail away, leaving the
//! store at the revision it started from; a writer that crashes mid-commit
//! leaves the previous revision intact for the same reason.

use crate::{
    address::{Address, TypedAddress},
    database::Database,
    error::{FooterCorruptSnafu, ReadOnlyAddressSnafu, Result, StoreClosedSnafu},
    handle::{ReadHandle, UniqueReadHandle, WriteHandle},
    layout::{Trailer, INDEX_SLOT_COUNT, TRAILER_SIZE},
    os::now_millis,
};

#[derive(Debug)]
pub struct Transaction<'db> {
    db: &'db mut Database,
    base_footer: TypedAddress<Trailer>,
    base_logical: u64,
    base_generation: u32,
    base_time: u64,
    index_roots: [Address; INDEX_SLOT_COUNT],
    finished: bool,
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin(db: &'db mut Database) -> Result<Transaction<'db>> {
        if db.is_closed() {
            return StoreClosedSnafu.fail();
        }
        if !db.is_writable() {
            return ReadOnlyAddressSnafu {
                address: db.first_writable_address().absolute(),
            }
            .fail();
        }

        let base_footer = db.footer_pos();
        let base = db.read_trailer(base_footer);
        Ok(Transaction {
            base_footer,
            base_logical: db.logical_size(),
            base_generation: base.generation,
            base_time: base.time,
            index_roots: base.index_roots,
            finished: false,
            db,
        })
    }

    /// The generation this transaction will commit as.
    pub fn generation(&self) -> u32 {
        self.base_generation + 1
    }

    /// Reserves `bytes` bytes aligned to `align`; see
    /// [`Database::allocate`].
    ///
    /// # Errors
    ///
    /// As [`Database::allocate`].
    pub fn allocate(&mut self, bytes: u64, align: u64) -> Result<Address> {
        self.db.allocate(bytes, align)
    }

    /// Writable handle over a range allocated by this transaction; see
    /// [`Database::get_mut`].
    ///
    /// # Errors
    ///
    /// As [`Database::get_mut`].
    pub fn get_mut(
        &mut self,
        addr: Address,
        size: usize,
        initialized: bool,
    ) -> Result<WriteHandle<'_>> {
        self.db.get_mut(addr, size, initialized)
    }

    /// Copies `bytes` into storage at `addr`.
    ///
    /// # Errors
    ///
    /// As [`Database::get_mut`].
    pub fn write(&mut self, addr: Address, bytes: &[u8]) -> Result<()> {
        let mut handle = self.db.get_mut(addr, bytes.len(), false)?;
        handle.copy_from_slice(bytes);
        Ok(())
    }

    /// Allocates space for `bytes` and writes them, returning the address.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Transaction::allocate) and
    /// [`write`](Transaction::write).
    pub fn append(&mut self, bytes: &[u8], align: u64) -> Result<Address> {
        let addr = self.allocate(bytes.len() as u64, align)?;
        self.write(addr, bytes)?;
        Ok(addr)
    }

    /// Read handle over anything visible to this transaction, including its
    /// own uncommitted writes; see [`Database::get`].
    ///
    /// # Errors
    ///
    /// As [`Database::get`].
    pub fn get(&self, addr: Address, size: usize, initialized: bool) -> Result<ReadHandle<'_>> {
        self.db.get(addr, size, initialized)
    }

    /// Unique read handle; see [`Database::getu`].
    ///
    /// # Errors
    ///
    /// As [`Database::getu`].
    pub fn getu(
        &self,
        addr: Address,
        size: usize,
        initialized: bool,
    ) -> Result<UniqueReadHandle<'_>> {
        self.db.getu(addr, size, initialized)
    }

    /// Stages a new root address for an index slot.  Slots not staged carry
    /// the base revision's roots forward into the new trailer.
    pub fn set_index_root(&mut self, slot: usize, root: Address) {
        assert!(slot < INDEX_SLOT_COUNT, "index slot out of range");
        self.index_roots[slot] = root;
    }

    /// Commits the transaction, returning the new generation number.
    ///
    /// A new trailer is appended past everything this transaction wrote,
    /// flushed (under the default durability configuration), re-read and
    /// re-checksummed, and only then published with a release-ordered store
    /// into the header slot.  The exclusive range lock is held from just
    /// before the trailer is appended until just after publication.
    ///
    /// # Errors
    ///
    /// `FooterCorrupt` when the re-read of the just-written trailer does not
    /// checksum — the store is rolled back to the base revision and the
    /// header is left untouched.  OS errors from writing, flushing, or the
    /// lock transitions are surfaced as `Io`.
    #[cfg_attr(test, instrument(skip(self), level = "trace"))]
    pub fn commit(mut self) -> Result<u32> {
        if self.db.is_closed() {
            return StoreClosedSnafu.fail();
        }

        let generation = self.base_generation + 1;
        // Trailer times are monotonically non-decreasing along the chain,
        // even when the wall clock steps backwards between commits.
        let time = now_millis().max(self.base_time);
        let mut trailer = Trailer {
            generation,
            time,
            prev_generation: self.base_footer,
            index_roots: self.index_roots,
            crc: 0,
        };
        trailer.crc = trailer.calculate_crc();

        self.db.upgrade_to_write_lock()?;
        let committed = self.append_and_publish(&trailer);
        let restored = self.db.restore_shared_lock();
        self.finished = true;

        match committed {
            Ok(()) => {
                restored?;
                debug!(generation, "Committed transaction.");
                Ok(generation)
            }
            Err(error) => {
                // Roll the uncommitted tail back; the header was never
                // updated, so every reader still sees the base revision.
                if let Err(truncate_error) = self.db.truncate(self.base_logical) {
                    debug!(error = %truncate_error, "Failed to roll back after commit error.");
                }
                Err(error)
            }
        }
    }

    fn append_and_publish(&mut self, trailer: &Trailer) -> Result<()> {
        let addr = self.db.allocate(TRAILER_SIZE, 8)?;
        {
            let mut handle = self.db.get_mut(addr, TRAILER_SIZE as usize, false)?;
            handle.copy_from_slice(&trailer.encode());
        }

        if self.db.config().sync_on_commit {
            // The trailer must be durable before the header points at it;
            // otherwise a crash between the two could publish a revision
            // whose trailer never reached the disk.
            self.db.storage().flush_range(addr, TRAILER_SIZE as usize)?;
            self.db.storage().file().sync_all()?;
        }

        let pos = TypedAddress::make(addr.absolute());
        let written = self.db.read_trailer(pos);
        if self.db.config().crc_checks && !written.crc_matches() {
            return FooterCorruptSnafu {
                path: self.db.path().to_path_buf(),
            }
            .fail();
        }

        self.db.set_new_footer(pos, trailer)
    }

    /// Abandons the transaction, truncating its writes away.
    ///
    /// # Errors
    ///
    /// Surfaces the OS error if the truncate fails.  Dropping the
    /// transaction performs the same rollback with the error logged instead.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.db.truncate(self.base_logical)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(error) = self.db.truncate(self.base_logical) {
                debug!(%error, "Failed to roll back abandoned transaction.");
            }
        }
    }
}
