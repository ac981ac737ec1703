use std::path::{Path, PathBuf};

use crate::caching::SweepLocking;
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::history::ExecutionHistoryStore;

use super::{
    AtomicMoveWorkspace, ProviderContext, ProviderOptions, Workspace, WorkspaceKey,
    WorkspaceProvider,
};

/// A provider that never locks.
///
/// For callers that already made sure nobody else uses a workspace, for example because every
/// directory is only ever used once. The configured lock mode is ignored.
#[derive(Debug)]
pub struct NonLockingWorkspaceProvider {
    context: ProviderContext,
}

impl NonLockingWorkspaceProvider {
    pub fn open(options: ProviderOptions) -> WorkspaceResult<Self> {
        Ok(Self {
            context: options.into_context()?,
        })
    }

    pub fn allocate_workspace(&self, key: &WorkspaceKey) -> MutableWorkspace<'_> {
        MutableWorkspace {
            key: key.clone(),
            location: self.context.layout.workspace_dir(key),
            context: &self.context,
        }
    }

    pub fn atomic_move_workspace(&self, key: &WorkspaceKey) -> AtomicMoveWorkspace {
        self.context.atomic_move_workspace(key)
    }

    pub fn base_dir(&self) -> &Path {
        self.context.layout.base_dir()
    }
}

/// A workspace allocated without a lock, see [`NonLockingWorkspaceProvider`].
#[derive(Debug)]
pub struct MutableWorkspace<'a> {
    key: WorkspaceKey,
    location: PathBuf,
    context: &'a ProviderContext,
}

impl MutableWorkspace<'_> {
    pub fn key(&self) -> &WorkspaceKey {
        &self.key
    }

    pub fn immutable_location(&self) -> &Path {
        &self.location
    }

    /// Runs `action` in the workspace directory, creating it first.
    pub fn mutate<T, E, F>(self, action: F) -> Result<T, E>
    where
        F: FnOnce(&Path, &dyn ExecutionHistoryStore) -> Result<T, E>,
        E: From<WorkspaceError>,
    {
        let location = self.context.prepare(&self.key)?;
        action(&location, &*self.context.history)
    }
}

impl WorkspaceProvider for NonLockingWorkspaceProvider {
    fn get_workspace(&self, key: &WorkspaceKey) -> Workspace {
        self.context.workspace(key)
    }

    fn with_workspace<T, E, F>(&self, key: &WorkspaceKey, action: F) -> Result<T, E>
    where
        F: FnOnce(&Path, &dyn ExecutionHistoryStore) -> Result<T, E>,
        E: From<WorkspaceError>,
    {
        self.allocate_workspace(key).mutate(action)
    }

    /// Runs the cleanup if it is due, relying on the caller's exclusivity for the sweep.
    fn close(&self) -> WorkspaceResult<()> {
        self.context
            .cache_cleanup(SweepLocking::HeldByCaller)
            .run_if_due()?;
        Ok(())
    }
}
