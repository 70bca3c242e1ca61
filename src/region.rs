//! Mapped regions.
//!
//! A [`Region`] is one contiguous memory mapping of a sub-range of the store
//! file.  The [`RegionSet`] keeps regions ordered by base offset with no
//! gaps, starting at offset zero, and grows by appending: the first region is
//! `min_region_size` bytes, and each subsequent region doubles in size up to
//! [`MAX_REGION_SIZE`](crate::common::MAX_REGION_SIZE).  Doubling keeps the
//! set small enough that the address-to-region search stays cheap for any
//! realistic store size.
//!
//! Regions are only ever appended while the database instance is open;
//! existing regions never move, so pointers into them stay valid for the life
//! of the instance.  The one exception is `truncate_to_physical_size`, which
//! discards wholly-unused tail regions under `&mut` access — the borrow
//! checker guarantees no outstanding handle can be observing them.

use memmap2::{Mmap, MmapMut, MmapOptions};
use snafu::ResultExt;

use crate::{
    common::MAX_REGION_SIZE,
    error::{IoSnafu, Result},
    io::FileHandle,
};

#[derive(Debug)]
enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// One contiguous mapping of `[base, base + len)` of the store file.
#[derive(Debug)]
pub struct Region {
    base: u64,
    len: u64,
    mapping: Mapping,
    // Cached base pointer of the mapping, refreshed by
    // `update_master_pointers`.  The mapped pages do not move when the
    // `Region` value does, so the cache stays valid across Vec growth.
    ptr: *mut u8,
}

// SAFETY: the raw pointer is derived from the mapping this region owns; the
// mapped pages live exactly as long as the region and are never handed out
// mutably except through the storage layer's single-writer discipline.
unsafe impl Send for Region {}
// SAFETY: shared access to a region only ever reads through the pointer;
// mutation requires `&mut` access to the owning database.
unsafe impl Sync for Region {}

impl Region {
    fn map(file: &FileHandle, base: u64, len: u64, writable: bool) -> Result<Region> {
        let mut options = MmapOptions::new();
        options.offset(base).len(usize::try_from(len).expect("region length fits in usize"));

        let mapping = if writable {
            // SAFETY: the mapping is backed by the store file, which the
            // owning database keeps open and never shrinks below the mapped
            // committed range while the mapping is live.
            let map = unsafe { options.map_mut(file.as_file()) }.context(IoSnafu {
                operation: "mmap",
                path: file.path(),
            })?;
            Mapping::ReadWrite(map)
        } else {
            // SAFETY: as above; read-only mappings are additionally never
            // written through.
            let map = unsafe { options.map(file.as_file()) }.context(IoSnafu {
                operation: "mmap",
                path: file.path(),
            })?;
            Mapping::ReadOnly(map)
        };

        let mut region = Region {
            base,
            len,
            mapping,
            ptr: std::ptr::null_mut(),
        };
        region.refresh_pointer();
        Ok(region)
    }

    fn refresh_pointer(&mut self) {
        self.ptr = match &mut self.mapping {
            Mapping::ReadOnly(map) => map.as_ptr() as *mut u8,
            Mapping::ReadWrite(map) => map.as_mut_ptr(),
        };
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// One past the last file offset this region covers.
    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.base && offset < self.end()
    }

    /// Base pointer of the mapping.  Writes through the returned pointer are
    /// only legal for read-write mappings and only into uncommitted bytes.
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub(crate) fn is_writable(&self) -> bool {
        matches!(self.mapping, Mapping::ReadWrite(_))
    }

    /// Flushes `[offset, offset + len)` (region-relative) to disk.
    pub(crate) fn flush_range(&self, file: &FileHandle, offset: u64, len: u64) -> Result<()> {
        match &self.mapping {
            Mapping::ReadWrite(map) => map
                .flush_range(
                    usize::try_from(offset).expect("region offset fits in usize"),
                    usize::try_from(len).expect("flush length fits in usize"),
                )
                .context(IoSnafu {
                    operation: "flush",
                    path: file.path(),
                }),
            Mapping::ReadOnly(_) => Ok(()),
        }
    }
}

/// The ordered, gap-free collection of regions covering the mapped prefix of
/// the file.
#[derive(Debug)]
pub struct RegionSet {
    regions: Vec<Region>,
    writable: bool,
    small_files: bool,
    min_region_size: u64,
}

impl RegionSet {
    pub fn new(writable: bool, small_files: bool, min_region_size: u64) -> RegionSet {
        RegionSet {
            regions: Vec::new(),
            writable,
            small_files,
            min_region_size,
        }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Total bytes covered by the mapped regions.
    pub fn mapped_len(&self) -> u64 {
        self.regions.last().map_or(0, Region::end)
    }

    /// Index of the region containing the given file offset.
    ///
    /// **Precondition**: `offset < mapped_len()`.
    pub fn find(&self, offset: u64) -> usize {
        debug_assert!(offset < self.mapped_len());
        // Regions are sorted by base and gap-free, so the containing region
        // is the last one whose base does not exceed the offset.
        self.regions.partition_point(|region| region.base() <= offset) - 1
    }

    fn next_region_len(&self) -> u64 {
        match self.regions.last() {
            None => self.min_region_size,
            Some(last) => (last.len() * 2).min(MAX_REGION_SIZE),
        }
    }

    /// Ensures that regions cover at least `[0, new_logical)`.
    ///
    /// Appends regions (doubling policy) until the requested range is
    /// covered.  For a writable set the file is first grown to the new
    /// region boundary, so that every mapped byte is backed — except in
    /// small-files mode, where the file stays trimmed to the logical size
    /// and the database extends it over a range before any write lands
    /// there.  Idempotent and safe to call repeatedly with non-decreasing
    /// arguments.
    ///
    /// # Errors
    ///
    /// Surfaces the OS error if growing the file or mapping a region fails.
    pub fn map_bytes(&mut self, file: &FileHandle, new_logical: u64) -> Result<()> {
        while self.mapped_len() < new_logical {
            let base = self.mapped_len();
            let len = self.next_region_len();
            // Grow the file out to the new region boundary.  Never shrink:
            // the file may already be larger than the range being mapped
            // (reopening a store that grew in an earlier run).
            if self.writable && !self.small_files && file.size()? < base + len {
                file.truncate(base + len)?;
            }
            trace!(base, len, "Mapping additional store region.");
            self.regions.push(Region::map(file, base, len, self.writable)?);
        }
        Ok(())
    }

    /// Discards regions lying entirely beyond `logical_size` and trims the
    /// file back to the end of the last remaining region.
    ///
    /// # Errors
    ///
    /// Surfaces the OS error if the truncate fails.
    pub fn truncate_to_physical_size(&mut self, file: &FileHandle, logical_size: u64) -> Result<()> {
        while self
            .regions
            .last()
            .is_some_and(|region| region.base() >= logical_size)
        {
            let region = self.regions.pop().expect("last region was just observed");
            trace!(base = region.base(), len = region.len(), "Unmapping unused tail region.");
        }
        file.truncate(self.mapped_len())
    }

    /// Recomputes the cached base-pointer table used by address translation.
    pub fn update_master_pointers(&mut self) {
        for region in &mut self.regions {
            region.refresh_pointer();
        }
    }
}
