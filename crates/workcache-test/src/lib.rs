//! Helpers for testing workspace providers.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while
//!    providers may still create workspaces in it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `workcache` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("workcache_service=trace,workcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// An append-only log of critical sections, shared through the file system.
///
/// Every participant appends a `start` line when entering and an `end` line when leaving its
/// critical section. Lines are appended with `O_APPEND`, so the log reflects the real order even
/// when the writers do not coordinate.
#[derive(Clone, Debug)]
pub struct CriticalSectionLog {
    path: PathBuf,
}

impl CriticalSectionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(&self, who: &str) {
        self.append(&format!("start {who}"));
    }

    pub fn end(&self, who: &str) {
        self.append(&format!("end {who}"));
    }

    fn append(&self, line: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .unwrap();
        file.write_all(format!("{line}\n").as_bytes()).unwrap();
    }

    /// All lines logged so far.
    pub fn lines(&self) -> Vec<String> {
        fs::read_to_string(&self.path)
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Asserts that critical sections never overlapped, returning how many were logged.
    ///
    /// # Panics
    ///
    /// Panics if a section started before the previous one ended, or one ended that was not
    /// the one currently running.
    pub fn assert_no_interleaving(&self) -> usize {
        let mut current: Option<String> = None;
        let mut sections = 0;
        for line in self.lines() {
            match line.split_once(' ') {
                Some(("start", who)) => {
                    if let Some(running) = &current {
                        panic!("{who} entered while {running} was inside");
                    }
                    current = Some(who.to_owned());
                }
                Some(("end", who)) => {
                    assert_eq!(current.as_deref(), Some(who), "unexpected end of {who}");
                    current = None;
                    sections += 1;
                }
                _ => panic!("malformed log line {line:?}"),
            }
        }
        assert!(current.is_none(), "log ends inside a critical section");
        sections
    }
}
