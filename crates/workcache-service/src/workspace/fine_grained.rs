use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::caching::{CacheOptions, PersistentCache, SweepLocking};
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::history::ExecutionHistoryStore;
use crate::locking::LockAccess;

use super::{
    AtomicMoveWorkspace, LockingWorkspace, ProviderContext, ProviderOptions, Workspace,
    WorkspaceKey, WorkspaceProvider,
};

/// The per-key cache, opened on first use.
#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Vacant,
    Open(Arc<PersistentCache>),
    /// The provider was closed, the slot may not be opened anymore.
    Closed,
}

type CacheSlot = Arc<Mutex<SlotState>>;

/// A provider with one [`PersistentCache`] and lock file per key.
///
/// Different keys never wait for each other, only requests for the same key serialize.
/// The per-key caches are opened on first access and kept until the provider is closed.
#[derive(Debug)]
pub struct FineGrainedWorkspaceProvider {
    context: ProviderContext,
    /// `None` once the provider is closed.
    caches: Mutex<Option<HashMap<WorkspaceKey, CacheSlot>>>,
}

impl FineGrainedWorkspaceProvider {
    pub fn open(options: ProviderOptions) -> WorkspaceResult<Self> {
        let context = options.into_context()?;
        Ok(Self {
            context,
            caches: Mutex::new(Some(HashMap::new())),
        })
    }

    /// The workspace for `key`, with the operations for coalesced computations.
    ///
    /// This opens the cache of `key` if it is not open yet, which in
    /// [`LockMode::Exclusive`](crate::locking::LockMode::Exclusive) waits for its lock.
    pub fn workspace(&self, key: &WorkspaceKey) -> WorkspaceResult<LockingWorkspace> {
        let cache = self.cache_for(key)?;
        Ok(LockingWorkspace::new(key.clone(), &self.context, cache))
    }

    pub fn atomic_move_workspace(&self, key: &WorkspaceKey) -> AtomicMoveWorkspace {
        self.context.atomic_move_workspace(key)
    }

    pub fn base_dir(&self) -> &Path {
        self.context.layout.base_dir()
    }

    /// The number of per-key caches opened so far.
    pub fn open_caches(&self) -> usize {
        self.caches.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Resolves the cache of `key`, opening it exactly once.
    fn cache_for(&self, key: &WorkspaceKey) -> WorkspaceResult<Arc<PersistentCache>> {
        let slot = self.slot_for(key)?;
        self.open_slot(key, &slot)
    }

    fn slot_for(&self, key: &WorkspaceKey) -> WorkspaceResult<CacheSlot> {
        let mut caches = self.caches.lock();
        let caches = caches.as_mut().ok_or_else(closed_error)?;
        Ok(Arc::clone(caches.entry(key.clone()).or_default()))
    }

    fn open_slot(
        &self,
        key: &WorkspaceKey,
        slot: &CacheSlot,
    ) -> WorkspaceResult<Arc<PersistentCache>> {
        // only requests for this key wait while the cache is opened
        let mut slot = slot.lock();
        match &*slot {
            SlotState::Open(cache) => return Ok(Arc::clone(cache)),
            // `close` ran between resolving the slot and locking it
            SlotState::Closed => return Err(closed_error()),
            SlotState::Vacant => {}
        }

        let layout = &self.context.layout;
        let mut options = CacheOptions::new(
            key.as_str(),
            layout.workspace_dir(key),
            layout.key_lock_file(key),
        );
        options.lock_mode = self.context.lock_mode;
        options.lock_timeout = self.context.lock_timeout;

        let cache = PersistentCache::open(options)?;
        *slot = SlotState::Open(Arc::clone(&cache));
        Ok(cache)
    }
}

fn closed_error() -> WorkspaceError {
    WorkspaceError::illegal_state("workspace provider has already been closed")
}

impl WorkspaceProvider for FineGrainedWorkspaceProvider {
    fn get_workspace(&self, key: &WorkspaceKey) -> Workspace {
        self.context.workspace(key)
    }

    fn with_workspace<T, E, F>(&self, key: &WorkspaceKey, action: F) -> Result<T, E>
    where
        F: FnOnce(&Path, &dyn ExecutionHistoryStore) -> Result<T, E>,
        E: From<WorkspaceError>,
    {
        let cache = self.cache_for(key)?;
        cache.with_file_lock(LockAccess::Exclusive, || {
            // a sweep may have removed the directory since the cache was opened
            let location = self.context.prepare(key)?;
            action(&location, &*self.context.history)
        })
    }

    /// Closes every per-key cache, then runs the cleanup if it is due.
    ///
    /// All caches are closed even if some fail, the first error is returned.
    fn close(&self) -> WorkspaceResult<()> {
        let Some(caches) = self.caches.lock().take() else {
            return Ok(());
        };

        let mut first_error = None;
        for (key, slot) in caches {
            let SlotState::Open(cache) = std::mem::replace(&mut *slot.lock(), SlotState::Closed)
            else {
                continue;
            };
            if let Err(err) = cache.close() {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "Failed to close workspace cache",
                );
                first_error.get_or_insert(err);
            }
        }

        if let Err(err) = self
            .context
            .cache_cleanup(SweepLocking::PerKey)
            .run_if_due()
        {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to clean up workspaces",
            );
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
