use std::path::Path;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use workcache_service::locking::LockMode;
use workcache_service::workspace::{ProviderOptions, WorkspaceKey};
use workcache_test as test;

pub use test::{CriticalSectionLog, TempDir};

/// Setup tests and create a temporary base directory.
///
/// The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as guard until
/// the test has finished.
pub fn setup_base_dir() -> TempDir {
    test::setup();
    test::tempdir()
}

/// Provider options for `base` with the given lock mode and a short lock timeout.
pub fn options(base: &Path, lock_mode: LockMode) -> ProviderOptions {
    ProviderOptions::new(base)
        .with_lock_mode(lock_mode)
        .with_lock_timeout(Duration::from_secs(10))
}

#[track_caller]
pub fn key(key: &str) -> WorkspaceKey {
    WorkspaceKey::new(key).unwrap()
}

/// Pretends `path` was last used `age` ago.
pub fn set_age(path: &Path, age: Duration) {
    let then = SystemTime::now() - age;
    filetime::set_file_mtime(path, FileTime::from_system_time(then)).unwrap();
}
