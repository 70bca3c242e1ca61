//! Logical-address translation over the region set.
//!
//! `Storage` owns the store file and its mapped regions, and provides the
//! primitives everything above it is built from: pointer translation for
//! addresses that fall inside a single region, span detection, and
//! scatter-gather copies for byte ranges that cross region boundaries.
//!
//! All translation functions require the addressed bytes to be mapped; the
//! database layer guarantees that by validating requests against the logical
//! size first.

use crate::{address::Address, error::Result, io::FileHandle, region::RegionSet};

#[derive(Debug)]
pub struct Storage {
    file: FileHandle,
    regions: RegionSet,
    writable: bool,
}

impl Storage {
    pub fn new(
        file: FileHandle,
        writable: bool,
        small_files: bool,
        min_region_size: u64,
    ) -> Storage {
        Storage {
            file,
            regions: RegionSet::new(writable, small_files, min_region_size),
            writable,
        }
    }

    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    /// Grows the mapped range to cover `[0, new_logical)`.  See
    /// [`RegionSet::map_bytes`].
    pub fn map_bytes(&mut self, old_logical: u64, new_logical: u64) -> Result<()> {
        if new_logical > self.regions.mapped_len() {
            trace!(old_logical, new_logical, "Growing mapped range.");
        }
        self.regions.map_bytes(&self.file, new_logical)
    }

    /// Discards mappings wholly beyond `logical_size` and trims the file.
    pub fn truncate_to_physical_size(&mut self, logical_size: u64) -> Result<()> {
        self.regions.truncate_to_physical_size(&self.file, logical_size)
    }

    /// Recomputes the cached region base-pointer table.
    pub fn update_master_pointers(&mut self) {
        self.regions.update_master_pointers();
    }

    /// True when `[addr, addr + size)` straddles a region boundary.
    pub fn request_spans_regions(&self, addr: Address, size: usize) -> bool {
        if size == 0 {
            return false;
        }
        let first = self.regions.find(addr.absolute());
        !self.regions.regions()[first].contains(addr.absolute() + size as u64 - 1)
    }

    /// Raw pointer to the byte at `addr`.
    ///
    /// **Precondition**: the byte at `addr` is mapped.
    pub fn address_to_pointer(&self, addr: Address) -> *const u8 {
        let region = &self.regions.regions()[self.regions.find(addr.absolute())];
        // Pointer arithmetic stays inside the region because `find`
        // returned the region containing the address.
        let offset = addr.absolute() - region.base();
        // SAFETY: `offset < region.len()`, so the result is in bounds of the
        // region's mapping.
        unsafe { region.base_ptr().add(offset as usize).cast_const() }
    }

    /// Raw mutable pointer to the byte at `addr`.
    ///
    /// **Preconditions**: the byte at `addr` is mapped, and the store was
    /// opened writable.
    pub fn address_to_mut_pointer(&self, addr: Address) -> *mut u8 {
        let region = &self.regions.regions()[self.regions.find(addr.absolute())];
        debug_assert!(region.is_writable());
        let offset = addr.absolute() - region.base();
        // SAFETY: as for `address_to_pointer`.
        unsafe { region.base_ptr().add(offset as usize) }
    }

    /// Borrows `[addr, addr + len)` as a slice.
    ///
    /// **Preconditions**: the range is mapped and does not span regions.
    pub fn mapped_slice(&self, addr: Address, len: usize) -> &[u8] {
        if len == 0 {
            return &[];
        }
        debug_assert!(!self.request_spans_regions(addr, len));
        // SAFETY: the range is mapped and lies within one region, and the
        // returned borrow of `self` keeps the region set from being mutated
        // or dropped while the slice is live.
        unsafe { std::slice::from_raw_parts(self.address_to_pointer(addr), len) }
    }

    /// Borrows `[addr, addr + len)` as a mutable slice.
    ///
    /// **Preconditions**: as [`mapped_slice`](Storage::mapped_slice), plus
    /// the store is writable and the caller holds the instance exclusively
    /// (enforced by the `&mut self` on the database entry points).
    pub fn mapped_slice_mut(&mut self, addr: Address, len: usize) -> &mut [u8] {
        if len == 0 {
            return &mut [];
        }
        debug_assert!(!self.request_spans_regions(addr, len));
        // SAFETY: as `mapped_slice`; the `&mut self` borrow guarantees no
        // other slice into the mapping is live.
        unsafe { std::slice::from_raw_parts_mut(self.address_to_mut_pointer(addr), len) }
    }

    /// Scatter-copies `[addr, addr + buf.len())` out of the store into
    /// `buf`, walking every region the range touches.
    ///
    /// **Precondition**: the range is mapped.
    pub fn copy_from_store(&self, addr: Address, buf: &mut [u8]) {
        let mut copied = 0usize;
        while copied < buf.len() {
            let (ptr, n) = self.segment(addr, buf.len(), copied);
            // SAFETY: `segment` returns a pointer to `n` mapped bytes, and
            // `buf[copied..copied + n]` is in bounds; source and destination
            // cannot overlap since `buf` is ordinary heap/stack memory.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr().add(copied), n);
            }
            copied += n;
        }
    }

    /// Scatter-copies `bytes` into the store at `addr`, walking every region
    /// the range touches.
    ///
    /// **Preconditions**: the range is mapped, the store is writable, and
    /// the range lies in uncommitted space (the database checks this before
    /// any write handle exists).
    pub fn copy_to_store(&self, addr: Address, bytes: &[u8]) {
        debug_assert!(self.writable);
        let mut copied = 0usize;
        while copied < bytes.len() {
            let (ptr, n) = self.segment(addr, bytes.len(), copied);
            // SAFETY: as `copy_from_store`, with the transfer direction
            // reversed; writing through the pointer is legal because the
            // region is mapped read-write and the range is uncommitted.
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr().add(copied), ptr.cast_mut(), n);
            }
            copied += n;
        }
    }

    /// The mapped segment starting `done` bytes into the request: a pointer
    /// to the first byte and the number of contiguous bytes available in the
    /// containing region (capped at the remaining request length).
    fn segment(&self, addr: Address, total: usize, done: usize) -> (*const u8, usize) {
        let position = Address::new(addr.absolute() + done as u64);
        let region = &self.regions.regions()[self.regions.find(position.absolute())];
        let available = region.end() - position.absolute();
        let n = (total - done).min(usize::try_from(available).expect("segment length fits in usize"));
        (self.address_to_pointer(position), n)
    }

    /// Flushes the mapped bytes of `[addr, addr + len)` to disk.
    ///
    /// # Errors
    ///
    /// Surfaces the OS error if an msync fails.
    pub fn flush_range(&self, addr: Address, len: usize) -> Result<()> {
        let mut done = 0usize;
        while done < len {
            let position = addr.absolute() + done as u64;
            let region = &self.regions.regions()[self.regions.find(position)];
            let offset = position - region.base();
            let available = region.end() - position;
            let n = ((len - done) as u64).min(available);
            region.flush_range(&self.file, offset, n)?;
            done += usize::try_from(n).expect("flush length fits in usize");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileHandle;

    fn storage_with_regions(min_region_size: u64, mapped: u64) -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("should create temporary directory");
        let file = FileHandle::create_unique(dir.path()).expect("should create file");
        let mut storage = Storage::new(file, true, false, min_region_size);
        storage.map_bytes(0, mapped).expect("mapping should succeed");
        (dir, storage)
    }

    #[test]
    fn span_detection_matches_region_boundaries() {
        let (_dir, storage) = storage_with_regions(4096, 8192);

        assert!(!storage.request_spans_regions(Address::new(0), 4096));
        assert!(!storage.request_spans_regions(Address::new(4096), 100));
        assert!(storage.request_spans_regions(Address::new(4090), 12));
        assert!(!storage.request_spans_regions(Address::new(4095), 1));
        assert!(storage.request_spans_regions(Address::new(4095), 2));
        assert!(!storage.request_spans_regions(Address::new(4000), 0));
    }

    #[test]
    fn scatter_copy_round_trips_across_the_seam() {
        let (_dir, storage) = storage_with_regions(4096, 4096 + 8192);

        let pattern: Vec<u8> = (0..200u16).map(|i| (i % 251) as u8).collect();
        let addr = Address::new(4096 - 100);
        assert!(storage.request_spans_regions(addr, pattern.len()));

        storage.copy_to_store(addr, &pattern);
        let mut readback = vec![0u8; pattern.len()];
        storage.copy_from_store(addr, &mut readback);
        assert_eq!(readback, pattern);

        // The two halves are visible through the individual regions too.
        assert_eq!(storage.mapped_slice(addr, 100), &pattern[..100]);
        assert_eq!(
            storage.mapped_slice(Address::new(4096), 100),
            &pattern[100..]
        );
    }

    #[test]
    fn pointer_translation_is_region_relative() {
        let (_dir, storage) = storage_with_regions(4096, 8192);

        storage.copy_to_store(Address::new(5000), b"marker");
        let slice = storage.mapped_slice(Address::new(5000), 6);
        assert_eq!(slice, b"marker");

        let ptr = storage.address_to_pointer(Address::new(5000));
        // SAFETY: the six bytes at 5000 were just written and are mapped.
        let via_ptr = unsafe { std::slice::from_raw_parts(ptr, 6) };
        assert_eq!(via_ptr, b"marker");
    }
}
