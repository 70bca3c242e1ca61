//! Store configuration and the handful of tuning constants shared across the
//! crate.

use std::{fmt, path::Path, sync::Arc};

// The floor for a single mapped region.  4MiB keeps the number of regions
// (and therefore the cost of the address-to-region search) small even for
// multi-gigabyte stores, while not wasting much address space on tiny ones.
pub const DEFAULT_MIN_REGION_SIZE: u64 = 4 * 1024 * 1024;

// Regions double in size as the store grows, up to this cap.  Beyond the cap
// the set grows linearly, one cap-sized region at a time.
pub const MAX_REGION_SIZE: u64 = 1024 * 1024 * 1024;

/// How the store is being opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-only: `sync` and `get` work, nothing can be written, and a
    /// missing store file is an error.
    ReadOnly,
    /// Read-write; a missing store file is created atomically.
    Writable,
    /// Read-write, but a missing store file is an error rather than being
    /// created.
    WritableNoCreate,
}

impl AccessMode {
    pub(crate) fn is_writable(self) -> bool {
        matches!(self, AccessMode::Writable | AccessMode::WritableNoCreate)
    }
}

/// Hook invoked when a modified store is closed, handing the file over to an
/// external garbage-collection process.  The collector itself is not part of
/// this crate; the default spawner only emits a trace event.
pub trait VacuumSpawner: Send + Sync {
    fn start(&self, store_path: &Path);
}

#[derive(Debug)]
pub(crate) struct NoopVacuum;

impl VacuumSpawner for NoopVacuum {
    fn start(&self, store_path: &Path) {
        trace!(path = %store_path.display(), "No vacuum spawner configured; skipping collection.");
    }
}

/// Store tuning knobs.
///
/// Built through [`StoreConfigBuilder`]; the defaults are correct for
/// production use and every test that does not explicitly probe a knob.
#[derive(Clone)]
pub struct StoreConfig {
    /// Smallest size, in bytes, of a mapped region.  Must be a power of two
    /// and large enough to hold the store leader and one trailer.
    pub(crate) min_region_size: u64,

    /// When set, the physical file is kept trimmed to the logical size
    /// instead of being rounded up to the next region boundary.  Useful when
    /// many small stores share a disk; costs a truncate per allocation.
    pub(crate) small_files: bool,

    /// When set (the default), a commit flushes the new trailer bytes to disk
    /// before publishing the new revision in the header.  Turning this off
    /// keeps commits atomic in memory and crash-consistent on reopen, but the
    /// most recent revisions may be lost on power failure.
    pub(crate) sync_on_commit: bool,

    /// When cleared, trailer checksum comparison is skipped during
    /// validation.  Structural checks (trailer within the file, chain
    /// ordering) always run.
    pub(crate) crc_checks: bool,

    /// Invoked from `close` when the store was modified.
    pub(crate) vacuum: Arc<dyn VacuumSpawner>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfigBuilder::new()
            .build()
            .expect("default store configuration must be valid")
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("min_region_size", &self.min_region_size)
            .field("small_files", &self.small_files)
            .field("sync_on_commit", &self.sync_on_commit)
            .field("crc_checks", &self.crc_checks)
            .finish_non_exhaustive()
    }
}

/// Builder for [`StoreConfig`].
#[derive(Clone)]
pub struct StoreConfigBuilder {
    min_region_size: Option<u64>,
    small_files: bool,
    sync_on_commit: bool,
    crc_checks: bool,
    vacuum: Option<Arc<dyn VacuumSpawner>>,
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            min_region_size: None,
            small_files: false,
            sync_on_commit: true,
            crc_checks: true,
            vacuum: None,
        }
    }

    /// Sets the smallest size, in bytes, of a single mapped region.
    ///
    /// Must be a power of two, and at least large enough to hold the store
    /// leader plus one trailer.  Defaults to 4MiB.
    pub fn min_region_size(mut self, bytes: u64) -> Self {
        self.min_region_size = Some(bytes);
        self
    }

    /// Keeps the physical file trimmed to the logical store size rather than
    /// rounded up to the next region boundary.  Defaults to off.
    pub fn small_files(mut self, enabled: bool) -> Self {
        self.small_files = enabled;
        self
    }

    /// Controls whether a commit flushes the trailer to disk before the new
    /// revision is published.  Defaults to on.
    pub fn sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }

    /// Controls whether trailer checksums are verified during validation.
    /// Defaults to on.
    pub fn crc_checks(mut self, enabled: bool) -> Self {
        self.crc_checks = enabled;
        self
    }

    /// Installs the hook that hands a modified store over to an external
    /// collector on close.  Defaults to a no-op.
    pub fn vacuum(mut self, spawner: Arc<dyn VacuumSpawner>) -> Self {
        self.vacuum = Some(spawner);
        self
    }

    /// Consumes this builder and constructs a `StoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns a description of the offending parameter if `min_region_size`
    /// is not a power of two or is too small to hold the store leader and the
    /// initial trailer.
    pub fn build(self) -> Result<StoreConfig, String> {
        let min_region_size = self.min_region_size.unwrap_or(DEFAULT_MIN_REGION_SIZE);

        if !min_region_size.is_power_of_two() {
            return Err(format!(
                "min_region_size must be a power of two, got {min_region_size}"
            ));
        }
        let floor = crate::layout::LEADER_SIZE + crate::layout::TRAILER_SIZE;
        if min_region_size < floor {
            return Err(format!(
                "min_region_size must be at least {floor} bytes, got {min_region_size}"
            ));
        }

        Ok(StoreConfig {
            min_region_size,
            small_files: self.small_files,
            sync_on_commit: self.sync_on_commit,
            crc_checks: self.crc_checks,
            vacuum: self.vacuum.unwrap_or_else(|| Arc::new(NoopVacuum)),
        })
    }
}

/// Number of padding bytes needed to bring `value` up to a multiple of
/// `align`.  `align` must be a power of two.
pub(crate) const fn alignment_padding(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value.wrapping_neg() & (align - 1)
}
