use std::thread;
use std::time::Duration;

use workcache_service::WorkspaceError;
use workcache_service::locking::LockMode;
use workcache_service::workspace::{
    CacheBasedWorkspaceProvider, FineGrainedWorkspaceProvider, WorkspaceProvider,
};

use crate::{CriticalSectionLog, key, options, setup_base_dir};

const THREADS: usize = 4;
const ROUNDS: usize = 10;

/// Runs `THREADS` threads taking turns on `providers`, each entering `ROUNDS` critical sections.
fn hammer<P>(providers: &[P], keys: &[&str], log: &CriticalSectionLog)
where
    P: WorkspaceProvider + Sync,
{
    thread::scope(|s| {
        for t in 0..THREADS {
            let provider = &providers[t % providers.len()];
            let key = key(keys[t % keys.len()]);
            s.spawn(move || {
                for round in 0..ROUNDS {
                    let who = format!("thread{t}-round{round}");
                    provider
                        .with_workspace(&key, |_dir, _history| {
                            log.start(&who);
                            thread::sleep(Duration::from_millis(1));
                            log.end(&who);
                            Ok::<_, WorkspaceError>(())
                        })
                        .unwrap();
                }
            });
        }
    });
}

#[test]
fn test_same_key_is_mutually_exclusive() {
    let base = setup_base_dir();
    let log = CriticalSectionLog::new(base.path().join("sections.log"));
    let providers = [(); 2].map(|_| {
        FineGrainedWorkspaceProvider::open(options(base.path(), LockMode::OnDemandExclusive))
            .unwrap()
    });

    hammer(&providers, &["shared"], &log);

    assert_eq!(log.assert_no_interleaving(), THREADS * ROUNDS);
    for provider in providers {
        provider.close().unwrap();
    }
}

#[test]
fn test_coarse_lock_covers_every_key() {
    let base = setup_base_dir();
    let log = CriticalSectionLog::new(base.path().join("sections.log"));
    let providers = [(); 2].map(|_| {
        CacheBasedWorkspaceProvider::open(options(base.path(), LockMode::OnDemandExclusive))
            .unwrap()
    });

    hammer(&providers, &["first", "second"], &log);

    assert_eq!(log.assert_no_interleaving(), THREADS * ROUNDS);
    for provider in providers {
        provider.close().unwrap();
    }
}

#[test]
fn test_exclusive_mode_serializes_threads() {
    let base = setup_base_dir();
    let log = CriticalSectionLog::new(base.path().join("sections.log"));
    let provider =
        CacheBasedWorkspaceProvider::open(options(base.path(), LockMode::Exclusive)).unwrap();

    hammer(std::slice::from_ref(&provider), &["first", "second"], &log);

    assert_eq!(log.assert_no_interleaving(), THREADS * ROUNDS);
    provider.close().unwrap();
}

#[test]
fn test_readers_share_the_lock() {
    let base = setup_base_dir();
    let providers = [(); 2].map(|_| {
        FineGrainedWorkspaceProvider::open(options(base.path(), LockMode::OnDemand)).unwrap()
    });
    let key = key("read-mostly");
    let first = providers[0].workspace(&key).unwrap();
    let second = providers[1].workspace(&key).unwrap();

    let both_inside = first
        .with_read_lock(|| {
            second.with_read_lock(|| Ok::<_, WorkspaceError>(true))
        })
        .unwrap();
    assert!(both_inside);

    for provider in providers {
        provider.close().unwrap();
    }
}
