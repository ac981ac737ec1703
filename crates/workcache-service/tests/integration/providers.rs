use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use workcache_service::WorkspaceError;
use workcache_service::history::{ExecutionHistoryStore, FileHistoryStore};
use workcache_service::locking::LockMode;
use workcache_service::workspace::{
    CacheBasedWorkspaceProvider, FineGrainedWorkspaceProvider, MAX_KEY_LEN, MoveOutcome,
    NonLockingWorkspaceProvider, WorkspaceKey, WorkspaceProvider,
};

use crate::{key, options, setup_base_dir};

#[test]
fn test_build_output_is_kept() -> anyhow::Result<()> {
    let base = setup_base_dir();
    let provider =
        FineGrainedWorkspaceProvider::open(options(base.path(), LockMode::OnDemandExclusive))?;
    let key = key("abc123");

    let result = provider.with_workspace(&key, |dir, _history| {
        assert_eq!(dir, base.path().join("abc123"));
        fs::write(dir.join("output.txt"), "hello")?;
        anyhow::Ok("done")
    })?;
    assert_eq!(result, "done");

    let output = base.path().join("abc123").join("output.txt");
    assert_eq!(fs::read_to_string(&output)?, "hello");

    // the lock was released, neither this nor another provider has to wait
    let again = provider.with_workspace(&key, |dir, _history| {
        anyhow::Ok(fs::read_to_string(dir.join("output.txt"))?)
    })?;
    assert_eq!(again, "hello");

    let mut options = options(base.path(), LockMode::OnDemandExclusive);
    options.lock_timeout = Duration::from_millis(100);
    let other = FineGrainedWorkspaceProvider::open(options)?;
    other.with_workspace(&key, |_dir, _history| anyhow::Ok(()))?;

    provider.close()?;
    other.close()?;
    Ok(())
}

#[test]
fn test_location_is_deterministic() {
    let base = setup_base_dir();
    let coarse =
        CacheBasedWorkspaceProvider::open(options(base.path(), LockMode::OnDemand)).unwrap();
    let fine_grained =
        FineGrainedWorkspaceProvider::open(options(base.path(), LockMode::OnDemand)).unwrap();
    let key = key("deterministic");

    let first = coarse.get_workspace(&key);
    let second = coarse.get_workspace(&key);
    let third = fine_grained.get_workspace(&key);

    assert_eq!(first, second);
    assert_eq!(first.immutable_location(), third.immutable_location());
    assert_eq!(first.immutable_location(), base.path().join("deterministic"));
    assert_eq!(first.key(), &key);
    assert_ne!(
        first.immutable_location(),
        coarse.get_workspace(&crate::key("deterministic2")).immutable_location()
    );
    // resolving a workspace does not create it
    assert!(!first.immutable_location().exists());

    coarse.close().unwrap();
    fine_grained.close().unwrap();
}

#[test]
fn test_invalid_keys_never_escape_the_base() {
    for invalid in ["", "..", "../escape", "a/b", ".cache.lock"] {
        assert!(
            matches!(
                WorkspaceKey::new(invalid),
                Err(WorkspaceError::InvalidKey { .. })
            ),
            "{invalid:?} was accepted"
        );
    }
}

#[test]
fn test_longest_key_is_usable() {
    let base = setup_base_dir();
    let provider =
        FineGrainedWorkspaceProvider::open(options(base.path(), LockMode::OnDemandExclusive))
            .unwrap();
    let longest = key(&"x".repeat(MAX_KEY_LEN));

    // the per-key lock file and the history entry both append to the key
    provider
        .with_workspace(&longest, |dir, history| {
            fs::write(dir.join("output"), "built")?;
            history.store(&longest, b"previous run")?;
            anyhow::Ok(())
        })
        .unwrap();
    assert!(base.path().join(".locks").join(format!("{longest}.lock")).exists());
    assert!(base.path().join(".history").join(format!("{longest}.bin")).exists());

    let produced = key(&format!("{}y", "x".repeat(MAX_KEY_LEN - 1)));
    let workspace = provider.atomic_move_workspace(&produced);
    let outcome = workspace
        .with_temporary_workspace(|temp| {
            fs::write(temp.join("artifact"), "binary")?;
            anyhow::Ok(workspace.move_into_place(temp)?)
        })
        .unwrap();
    assert_eq!(outcome, MoveOutcome::Moved);
    assert!(workspace.is_present());

    provider.close().unwrap();
}

#[test]
fn test_closed_provider_is_unusable() {
    let base = setup_base_dir();
    let provider =
        FineGrainedWorkspaceProvider::open(options(base.path(), LockMode::OnDemand)).unwrap();
    let key = key("closed");

    provider
        .with_workspace(&key, |_dir, _history| Ok::<_, WorkspaceError>(()))
        .unwrap();
    assert_eq!(provider.open_caches(), 1);

    provider.close().unwrap();
    provider.close().unwrap();

    let err = provider
        .with_workspace(&key, |_dir, _history| Ok::<_, WorkspaceError>(()))
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::IllegalState(_)), "{err:?}");
    assert!(provider.workspace(&key).is_err());
}

#[test]
fn test_exclusive_mode_holds_cache_until_close() {
    let base = setup_base_dir();
    let provider =
        CacheBasedWorkspaceProvider::open(options(base.path(), LockMode::Exclusive)).unwrap();

    let mut contender = options(base.path(), LockMode::Exclusive);
    contender.lock_timeout = Duration::from_millis(100);
    let err = CacheBasedWorkspaceProvider::open(contender.clone()).unwrap_err();
    assert!(err.is_lock_timeout(), "{err:?}");

    provider.close().unwrap();
    let provider = CacheBasedWorkspaceProvider::open(contender).unwrap();
    provider.close().unwrap();
}

#[test]
fn test_action_error_is_returned_as_is() {
    let base = setup_base_dir();
    let provider =
        CacheBasedWorkspaceProvider::open(options(base.path(), LockMode::OnDemandExclusive))
            .unwrap();
    let key = key("failing");

    let err = provider
        .with_workspace(&key, |dir, _history| {
            fs::write(dir.join("partial"), "half")?;
            Err::<(), _>(anyhow::anyhow!("compiler crashed"))
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "compiler crashed");

    // the directory stays as the action left it and the lock is free again
    assert!(base.path().join("failing").join("partial").exists());
    provider
        .with_workspace(&key, |_dir, _history| Ok::<_, WorkspaceError>(()))
        .unwrap();
    provider.close().unwrap();
}

#[test]
fn test_fine_grained_keys_do_not_wait_for_each_other() {
    let base = setup_base_dir();
    let provider =
        FineGrainedWorkspaceProvider::open(options(base.path(), LockMode::OnDemandExclusive))
            .unwrap();
    let (done_tx, done_rx) = mpsc::channel();

    thread::scope(|s| {
        let provider = &provider;
        let holder = s.spawn(move || {
            provider
                .with_workspace(&key("first"), |_dir, _history| {
                    // only finishes if "second" can run while "first" is locked
                    done_rx.recv_timeout(Duration::from_secs(5)).map_err(|e| {
                        WorkspaceError::IllegalState(format!("second key never ran: {e}"))
                    })
                })
                .unwrap();
        });

        provider
            .with_workspace(&key("second"), |_dir, _history| {
                Ok::<_, WorkspaceError>(())
            })
            .unwrap();
        done_tx.send(()).unwrap();
        holder.join().unwrap();
    });

    assert_eq!(provider.open_caches(), 2);
    provider.close().unwrap();
}

#[derive(Debug, Default)]
struct MemoryHistory {
    entries: Mutex<HashMap<WorkspaceKey, Vec<u8>>>,
}

impl ExecutionHistoryStore for MemoryHistory {
    fn load(&self, key: &WorkspaceKey) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &WorkspaceKey, history: &[u8]) -> io::Result<()> {
        self.entries.lock().insert(key.clone(), history.to_vec());
        Ok(())
    }

    fn remove(&self, key: &WorkspaceKey) -> io::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[test]
fn test_external_history() {
    let base = setup_base_dir();
    let history = Arc::new(MemoryHistory::default());
    let provider = CacheBasedWorkspaceProvider::open(
        options(base.path(), LockMode::OnDemand).with_external_history(history.clone()),
    )
    .unwrap();
    let key = key("with-history");

    provider
        .with_workspace(&key, |_dir, history| {
            assert_eq!(history.load(&key)?, None);
            history.store(&key, b"previous run")?;
            anyhow::Ok(())
        })
        .unwrap();

    assert_eq!(
        history.entries.lock().get(&key).map(Vec::as_slice),
        Some(&b"previous run"[..])
    );
    assert!(!base.path().join(".history").exists());
    provider.close().unwrap();
}

#[test]
fn test_internal_history_is_kept_in_base() {
    let base = setup_base_dir();
    let provider =
        FineGrainedWorkspaceProvider::open(options(base.path(), LockMode::OnDemand)).unwrap();
    let key = key("with-history");

    provider
        .with_workspace(&key, |_dir, history| {
            history.store(&key, b"previous run")?;
            anyhow::Ok(())
        })
        .unwrap();

    let stored = FileHistoryStore::new(base.path().join(".history"));
    assert_eq!(
        stored.load(&key).unwrap().as_deref(),
        Some(&b"previous run"[..])
    );
    assert!(base.path().join(".history").join("with-history.bin").exists());
    provider.close().unwrap();
}

#[test]
fn test_non_locking_mutate() {
    let base = setup_base_dir();
    let provider =
        NonLockingWorkspaceProvider::open(options(base.path(), LockMode::Exclusive)).unwrap();
    let key = key("scratch");

    let workspace = provider.allocate_workspace(&key);
    assert_eq!(workspace.immutable_location(), base.path().join("scratch"));
    assert!(!workspace.immutable_location().exists());

    let written = workspace
        .mutate(|dir, _history| {
            fs::write(dir.join("file"), "content")?;
            anyhow::Ok(dir.to_owned())
        })
        .unwrap();
    assert_eq!(fs::read_to_string(written.join("file")).unwrap(), "content");

    // no lock files, even though the options ask for an exclusive lock
    assert!(!base.path().join(".cache.lock").exists());
    assert!(!base.path().join(".locks").exists());

    // a second provider is not locked out
    let other =
        NonLockingWorkspaceProvider::open(options(base.path(), LockMode::Exclusive)).unwrap();
    other
        .with_workspace(&key, |_dir, _history| Ok::<_, WorkspaceError>(()))
        .unwrap();

    provider.close().unwrap();
    other.close().unwrap();
}
