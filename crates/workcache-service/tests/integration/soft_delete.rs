use std::fs;
use std::sync::Arc;
use std::time::Duration;

use workcache_service::WorkspaceError;
use workcache_service::caching::{
    CleanupFrequency, CleanupStrategy, MarkerFileSoftDeleter, SoftDeleter,
};
use workcache_service::locking::LockMode;
use workcache_service::workspace::{
    CacheBasedWorkspaceProvider, FineGrainedWorkspaceProvider, ProviderOptions, WorkspaceProvider,
};

use crate::{key, options, set_age, setup_base_dir};

const DAY: Duration = Duration::from_secs(24 * 3600);

#[test]
fn test_ensure_un_soft_deleted() {
    let base = setup_base_dir();
    let soft_deleter = Arc::new(MarkerFileSoftDeleter::new(base.path().join(".soft-deleted")));
    let provider = FineGrainedWorkspaceProvider::open(
        options(base.path(), LockMode::OnDemand).with_soft_deleter(soft_deleter.clone()),
    )
    .unwrap();
    let key = key("marked");
    let workspace = provider.workspace(&key).unwrap();

    assert!(!workspace.is_soft_deleted().unwrap());
    soft_deleter.soft_delete(&key).unwrap();
    assert!(workspace.is_soft_deleted().unwrap());

    workspace.ensure_un_soft_deleted().unwrap();
    assert!(!workspace.is_soft_deleted().unwrap());
    assert!(!soft_deleter.is_soft_deleted(&key).unwrap());

    // clearing twice is fine
    workspace.ensure_un_soft_deleted().unwrap();
    provider.close().unwrap();
}

#[test]
fn test_using_a_workspace_resurrects_it() {
    let base = setup_base_dir();
    let soft_deleter = MarkerFileSoftDeleter::new(base.path().join(".soft-deleted"));
    let provider =
        CacheBasedWorkspaceProvider::open(options(base.path(), LockMode::OnDemand)).unwrap();
    let key = key("marked");

    soft_deleter.soft_delete(&key).unwrap();
    provider
        .with_workspace(&key, |_dir, _history| Ok::<_, WorkspaceError>(()))
        .unwrap();

    assert!(!soft_deleter.is_soft_deleted(&key).unwrap());
    provider.close().unwrap();
}

fn cleaning_options(base: &std::path::Path) -> ProviderOptions {
    options(base, LockMode::OnDemandExclusive).with_cleanup(CleanupStrategy::new(
        || Some(DAY),
        || CleanupFrequency::Always,
    ))
}

#[test]
fn test_unused_workspace_is_swept_on_close() {
    let base = setup_base_dir();
    let soft_deleter = MarkerFileSoftDeleter::new(base.path().join(".soft-deleted"));
    let stale = key("stale");
    let fresh = key("fresh");

    let provider = CacheBasedWorkspaceProvider::open(cleaning_options(base.path())).unwrap();
    for key in [&stale, &fresh] {
        provider
            .with_workspace(key, |dir, _history| {
                fs::write(dir.join("output"), "data")?;
                anyhow::Ok(())
            })
            .unwrap();
    }
    set_age(&base.path().join("stale"), 2 * DAY);

    // the first pass only marks
    provider.close().unwrap();
    assert!(soft_deleter.is_soft_deleted(&stale).unwrap());
    assert!(!soft_deleter.is_soft_deleted(&fresh).unwrap());
    assert!(base.path().join("stale").exists());

    // the next one removes it
    let provider = FineGrainedWorkspaceProvider::open(cleaning_options(base.path())).unwrap();
    provider.close().unwrap();
    assert!(!base.path().join("stale").exists());
    assert!(!soft_deleter.is_soft_deleted(&stale).unwrap());
    assert!(base.path().join("fresh").join("output").exists());
}

#[test]
fn test_workspace_used_between_passes_survives() {
    let base = setup_base_dir();
    let soft_deleter = MarkerFileSoftDeleter::new(base.path().join(".soft-deleted"));
    let key = key("revived");

    let provider = CacheBasedWorkspaceProvider::open(cleaning_options(base.path())).unwrap();
    provider
        .with_workspace(&key, |_dir, _history| Ok::<_, WorkspaceError>(()))
        .unwrap();
    set_age(&base.path().join("revived"), 2 * DAY);
    provider.close().unwrap();
    assert!(soft_deleter.is_soft_deleted(&key).unwrap());

    let provider = CacheBasedWorkspaceProvider::open(cleaning_options(base.path())).unwrap();
    provider
        .with_workspace(&key, |_dir, _history| Ok::<_, WorkspaceError>(()))
        .unwrap();
    provider.close().unwrap();

    assert!(base.path().join("revived").exists());
    assert!(!soft_deleter.is_soft_deleted(&key).unwrap());
}
