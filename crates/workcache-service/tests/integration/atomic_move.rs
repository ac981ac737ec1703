use std::fs;
use std::sync::Barrier;
use std::thread;

use workcache_service::WorkspaceError;
use workcache_service::locking::LockMode;
use workcache_service::workspace::{
    CacheBasedWorkspaceProvider, MoveOutcome, NonLockingWorkspaceProvider, WorkspaceProvider,
};

use crate::{key, options, setup_base_dir};

#[test]
fn test_move_into_place() {
    let base = setup_base_dir();
    let provider =
        NonLockingWorkspaceProvider::open(options(base.path(), LockMode::None)).unwrap();
    let workspace = provider.atomic_move_workspace(&key("produced"));
    assert!(!workspace.is_present());

    let outcome = workspace
        .with_temporary_workspace(|temp| {
            assert!(temp.starts_with(base.path().join(".tmp")));
            fs::write(temp.join("artifact"), "binary")?;
            anyhow::Ok(workspace.move_into_place(temp)?)
        })
        .unwrap();

    assert_eq!(outcome, MoveOutcome::Moved);
    assert!(workspace.is_present());
    assert_eq!(
        fs::read_to_string(base.path().join("produced").join("artifact")).unwrap(),
        "binary"
    );
    assert_eq!(fs::read_dir(base.path().join(".tmp")).unwrap().count(), 0);
    provider.close().unwrap();
}

#[test]
fn test_first_producer_wins() {
    let base = setup_base_dir();
    let provider =
        CacheBasedWorkspaceProvider::open(options(base.path(), LockMode::OnDemand)).unwrap();
    let key = key("raced");
    let barrier = Barrier::new(2);

    let outcomes: Vec<MoveOutcome> = thread::scope(|s| {
        let handles: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|producer| {
                let workspace = provider.atomic_move_workspace(&key);
                let barrier = &barrier;
                s.spawn(move || {
                    workspace
                        .with_temporary_workspace(|temp| {
                            fs::write(temp.join("producer"), producer)?;
                            barrier.wait();
                            anyhow::Ok(workspace.move_into_place(temp)?)
                        })
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(
        outcomes.iter().filter(|o| **o == MoveOutcome::Moved).count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == MoveOutcome::AlreadyPresent)
            .count(),
        1
    );

    let winner = fs::read_to_string(base.path().join("raced").join("producer")).unwrap();
    assert!(winner == "first" || winner == "second");
    assert_eq!(fs::read_dir(base.path().join(".tmp")).unwrap().count(), 0);
    provider.close().unwrap();
}

#[test]
fn test_failed_producer_leaves_nothing_behind() {
    let base = setup_base_dir();
    let provider =
        NonLockingWorkspaceProvider::open(options(base.path(), LockMode::None)).unwrap();
    let workspace = provider.atomic_move_workspace(&key("abandoned"));

    let err = workspace
        .with_temporary_workspace(|temp| {
            fs::write(temp.join("half"), "written")
                .map_err(|e| WorkspaceError::Io {
                    path: temp.to_owned(),
                    source: e,
                })?;
            Err::<(), _>(WorkspaceError::IllegalState("producer gave up".into()))
        })
        .unwrap_err();

    assert!(matches!(err, WorkspaceError::IllegalState(_)));
    assert!(!workspace.is_present());
    assert_eq!(fs::read_dir(base.path().join(".tmp")).unwrap().count(), 0);
    provider.close().unwrap();
}

#[test]
fn test_location_occupied_by_file() {
    let base = setup_base_dir();
    let provider =
        NonLockingWorkspaceProvider::open(options(base.path(), LockMode::None)).unwrap();
    let workspace = provider.atomic_move_workspace(&key("occupied"));
    fs::write(base.path().join("occupied"), "not a workspace").unwrap();

    let err = workspace
        .with_temporary_workspace(|temp| {
            fs::write(temp.join("artifact"), "binary").unwrap();
            workspace.move_into_place(temp)
        })
        .unwrap_err();

    assert!(matches!(err, WorkspaceError::IllegalState(_)), "{err:?}");
    assert!(!workspace.is_present());
    assert_eq!(
        fs::read_to_string(base.path().join("occupied")).unwrap(),
        "not a workspace"
    );
    assert_eq!(fs::read_dir(base.path().join(".tmp")).unwrap().count(), 0);
    provider.close().unwrap();
}

#[test]
fn test_move_from_outside_the_base() {
    let base = setup_base_dir();
    let provider =
        NonLockingWorkspaceProvider::open(options(base.path(), LockMode::None)).unwrap();
    let workspace = provider.atomic_move_workspace(&key("imported"));

    // a directory elsewhere, possibly on another file system
    let outside = workcache_test::tempdir();
    fs::create_dir_all(outside.path().join("nested")).unwrap();
    fs::write(outside.path().join("nested/artifact"), "binary").unwrap();

    let outcome = workspace.move_into_place(outside.path()).unwrap();

    assert_eq!(outcome, MoveOutcome::Moved);
    assert_eq!(
        fs::read_to_string(base.path().join("imported/nested/artifact")).unwrap(),
        "binary"
    );
    let leftovers: Vec<_> = fs::read_dir(base.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(".imported-"))
        .collect();
    assert!(leftovers.is_empty());
    provider.close().unwrap();
}
