use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use workcache_service::WorkspaceError;
use workcache_service::coalesce::InFlightOperations;
use workcache_service::locking::LockMode;
use workcache_service::workspace::{
    FineGrainedWorkspaceProvider, LockingWorkspace, WorkspaceProvider,
};

use crate::{key, options, setup_base_dir};

const N: usize = 50;

fn wait_for_waiters(in_flight: &InFlightOperations, location: &Path, n: usize) {
    let key = location.to_string_lossy();
    while in_flight.waiters(&key) < n {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_concurrent_requests_execute_once() {
    let base = setup_base_dir();
    let in_flight = Arc::new(InFlightOperations::new());
    let providers = [(); 2].map(|_| {
        FineGrainedWorkspaceProvider::open(
            options(base.path(), LockMode::OnDemandExclusive).with_in_flight(in_flight.clone()),
        )
        .unwrap()
    });
    let executions = AtomicUsize::new(0);

    let results: Vec<String> = thread::scope(|s| {
        let handles: Vec<_> = (0..N)
            .map(|i| {
                let provider = &providers[i % 2];
                let in_flight = &in_flight;
                let executions = &executions;
                s.spawn(move || {
                    let workspace = provider.workspace(&key("shared")).unwrap();
                    workspace
                        .get_if_running_or_compute(
                            |output: &String| format!("{output} (shared)"),
                            || {
                                wait_for_waiters(in_flight, workspace.immutable_location(), N - 1);
                                executions.fetch_add(1, Ordering::SeqCst);
                                build(&workspace)
                            },
                        )
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(results.iter().filter(|r| *r == "built").count(), 1);
    assert_eq!(
        results.iter().filter(|r| *r == "built (shared)").count(),
        N - 1
    );
    assert!(in_flight.is_empty());

    for provider in providers {
        provider.close().unwrap();
    }
}

fn build(workspace: &LockingWorkspace) -> Result<String, WorkspaceError> {
    workspace.with_file_lock(|| {
        let dir = workspace.immutable_location();
        fs::create_dir_all(dir).map_err(|e| WorkspaceError::Io {
            path: dir.to_owned(),
            source: e,
        })?;
        Ok("built".to_owned())
    })
}

#[test]
fn test_failure_reaches_every_request() {
    let base = setup_base_dir();
    let in_flight = Arc::new(InFlightOperations::new());
    let provider = FineGrainedWorkspaceProvider::open(
        options(base.path(), LockMode::OnDemand).with_in_flight(in_flight.clone()),
    )
    .unwrap();
    let workspace = provider.workspace(&key("broken")).unwrap();
    let executions = AtomicUsize::new(0);

    let errors: Vec<WorkspaceError> = thread::scope(|s| {
        let handles: Vec<_> = (0..N)
            .map(|_| {
                s.spawn(|| {
                    workspace
                        .get_if_running_or_compute(
                            |output: &String| output.clone(),
                            || {
                                wait_for_waiters(&in_flight, workspace.immutable_location(), N - 1);
                                executions.fetch_add(1, Ordering::SeqCst);
                                Err(io::Error::other("linker failed"))
                            },
                        )
                        .unwrap_err()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    let sources: Vec<_> = errors
        .iter()
        .map(|err| match err {
            WorkspaceError::ActionFailed { source, .. } => source,
            other => panic!("unexpected error {other:?}"),
        })
        .collect();
    assert_eq!(sources[0].to_string(), "linker failed");
    assert!(sources.iter().all(|source| source.ptr_eq(sources[0])));

    provider.close().unwrap();
}

#[test]
fn test_completed_computation_runs_again() {
    let base = setup_base_dir();
    let provider =
        FineGrainedWorkspaceProvider::open(options(base.path(), LockMode::OnDemand)).unwrap();
    let workspace = provider.workspace(&key("repeated")).unwrap();
    let executions = AtomicUsize::new(0);

    let compute = || {
        workspace.get_if_running_or_compute(
            |output: &usize| *output,
            || Ok::<_, WorkspaceError>(executions.fetch_add(1, Ordering::SeqCst)),
        )
    };

    assert_eq!(compute().unwrap(), 0);
    assert_eq!(compute().unwrap(), 1);

    let err = workspace
        .get_if_running_or_compute(
            |output: &usize| *output,
            || Err::<usize, _>(io::Error::other("flaky")),
        )
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::ActionFailed { .. }));

    // a failure is not remembered either
    assert_eq!(compute().unwrap(), 2);
    provider.close().unwrap();
}

#[test]
fn test_lock_timeout_inside_computation() {
    let base = setup_base_dir();
    let mut fast = options(base.path(), LockMode::OnDemandExclusive);
    fast.lock_timeout = Duration::from_millis(100);
    let holder = FineGrainedWorkspaceProvider::open(fast.clone()).unwrap();
    let contender = FineGrainedWorkspaceProvider::open(fast).unwrap();
    let key = key("contended");

    holder
        .with_workspace(&key, |_dir, _history| {
            let workspace = contender.workspace(&key)?;
            let err = workspace
                .get_if_running_or_compute(
                    |output: &()| *output,
                    || workspace.with_file_lock(|| Ok::<_, WorkspaceError>(())),
                )
                .unwrap_err();
            assert!(err.is_lock_timeout(), "{err:?}");
            Ok::<_, WorkspaceError>(())
        })
        .unwrap();

    holder.close().unwrap();
    contender.close().unwrap();
}
