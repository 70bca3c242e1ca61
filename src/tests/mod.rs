use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use crate::{AccessMode, Database, StoreConfig, StoreConfigBuilder};

mod corruption;
mod properties;
mod transactions;

/// Region size used throughout the tests: small enough that spanning
/// requests are easy to construct, large enough to hold the store leader.
pub(crate) const TEST_REGION_SIZE: u64 = 4096;

/// Installs a fmt subscriber honoring `RUST_LOG` so failing tests can be
/// re-run with tracing output.  Safe to call from every test.
pub(crate) fn install_tracing() {
    static INSTALLED: OnceCell<()> = OnceCell::new();
    INSTALLED.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Runs `f` with a scratch directory that is removed afterwards.
pub(crate) fn with_temp_dir<F>(f: F)
where
    F: FnOnce(&Path),
{
    install_tracing();
    let dir = tempfile::tempdir().expect("should create temporary directory");
    f(dir.path());
}

/// The configuration used by most tests: small regions so spanning is cheap
/// to provoke, and small-files mode so scratch stores stay tiny.
pub(crate) fn test_config() -> StoreConfig {
    StoreConfigBuilder::new()
        .min_region_size(TEST_REGION_SIZE)
        .small_files(true)
        .build()
        .expect("test configuration should be valid")
}

pub(crate) fn store_path(dir: &Path) -> PathBuf {
    dir.join("store.db")
}

/// Opens (creating on first use) a writable store with the test
/// configuration.
pub(crate) fn open_writable(dir: &Path) -> Database {
    Database::open_with_config(&store_path(dir), AccessMode::Writable, test_config())
        .expect("should open writable store")
}

/// Opens an existing store read-only with the test configuration.
pub(crate) fn open_readonly(dir: &Path) -> Database {
    Database::open_with_config(&store_path(dir), AccessMode::ReadOnly, test_config())
        .expect("should open read-only store")
}
