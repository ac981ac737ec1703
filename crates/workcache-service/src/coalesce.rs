//! Coalescing of concurrent in-process computations for the same key.
//!
//! This only deduplicates *overlapping* requests. As soon as a computation finishes its record is
//! removed again, so the next request for the same key computes afresh. Persisting results is the
//! job of the workspace directory, not of this module.

use std::any::Any;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::{SharedError, WorkspaceError, WorkspaceResult};
use crate::utils::defer::defer;

/// The single-assignment outcome of one computation.
enum SlotState<T> {
    Pending,
    Resolved(Arc<T>),
    Failed(SharedError),
}

struct ResultSlot<T> {
    state: Mutex<SlotState<T>>,
    published: Condvar,
}

impl<T> ResultSlot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            published: Condvar::new(),
        }
    }

    fn publish(&self, outcome: Result<Arc<T>, SharedError>) {
        let mut state = self.state.lock();
        if !matches!(*state, SlotState::Pending) {
            tracing::error!("in-flight result published twice");
            return;
        }
        *state = match outcome {
            Ok(value) => SlotState::Resolved(value),
            Err(error) => SlotState::Failed(error),
        };
        self.published.notify_all();
    }

    fn wait(&self) -> Result<Arc<T>, SharedError> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SlotState::Pending => self.published.wait(&mut state),
                SlotState::Resolved(value) => return Ok(Arc::clone(value)),
                SlotState::Failed(error) => return Err(error.clone()),
            }
        }
    }
}

/// A registered computation. The slot is type-erased so that one map can hold computations of
/// different result types.
struct Record {
    slot: Arc<dyn Any + Send + Sync>,
    waiters: AtomicUsize,
}

/// The registry of computations currently running in this process.
///
/// Share one instance between every provider that should coalesce with each other.
#[derive(Default)]
pub struct InFlightOperations {
    records: Mutex<HashMap<String, Arc<Record>>>,
}

impl InFlightOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `action` unless a computation for `key` is already running.
    ///
    /// The first caller for a key becomes the executor: it runs `action` on its own thread and
    /// publishes the outcome. Callers arriving while it runs become waiters: they block until the
    /// outcome is published and then return `result_mapper` applied to the executor's value.
    /// If the action fails, the executor and every waiter get
    /// [`ActionFailed`](WorkspaceError::ActionFailed) wrapping the very same error.
    ///
    /// The record is removed before the outcome is published, so a caller arriving after the
    /// action returned runs it again. A panicking action is published as a failure before the
    /// panic continues, so waiters never hang.
    pub fn get_if_running_or_compute<T, M, A, E>(
        &self,
        key: &str,
        result_mapper: M,
        action: A,
    ) -> WorkspaceResult<T>
    where
        T: Clone + Send + Sync + 'static,
        M: FnOnce(&T) -> T,
        A: FnOnce() -> Result<T, E>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let slot = Arc::new(ResultSlot::<T>::new());
        let running = {
            let mut records = self.records.lock();
            match records.entry(key.to_owned()) {
                Entry::Occupied(entry) => {
                    let record = Arc::clone(entry.get());
                    record.waiters.fetch_add(1, Ordering::SeqCst);
                    Err(record)
                }
                Entry::Vacant(entry) => {
                    let record = Arc::new(Record {
                        slot: slot.clone(),
                        waiters: AtomicUsize::new(0),
                    });
                    entry.insert(Arc::clone(&record));
                    Ok(record)
                }
            }
        };

        match running {
            Ok(record) => self.execute(key, &record, &slot, action),
            Err(record) => Self::wait_for(key, &record, result_mapper),
        }
    }

    fn execute<T, A, E>(
        &self,
        key: &str,
        record: &Arc<Record>,
        slot: &ResultSlot<T>,
        action: A,
    ) -> WorkspaceResult<T>
    where
        T: Clone,
        A: FnOnce() -> Result<T, E>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        tracing::debug!(key, "Running computation");
        metric!(counter("workspace.coalesce.executor") += 1);

        let on_panic = defer(|| {
            let _ = self.finish(key, record);
            slot.publish(Err(SharedError::new(format!(
                "computation for {key:?} panicked"
            ))));
        });
        let outcome = action().map(Arc::new).map_err(SharedError::new);
        on_panic.disarm();

        let finished = self.finish(key, record);
        slot.publish(outcome.clone());
        finished?;

        match outcome {
            Ok(value) => Ok(Arc::try_unwrap(value).unwrap_or_else(|shared| T::clone(&shared))),
            Err(source) => Err(WorkspaceError::ActionFailed {
                key: key.to_owned(),
                source,
            }),
        }
    }

    fn wait_for<T, M>(key: &str, record: &Record, result_mapper: M) -> WorkspaceResult<T>
    where
        T: Send + Sync + 'static,
        M: FnOnce(&T) -> T,
    {
        let slot = Arc::clone(&record.slot)
            .downcast::<ResultSlot<T>>()
            .map_err(|_| {
                WorkspaceError::illegal_state(format!(
                    "computation for {key:?} is running with a different result type"
                ))
            })?;

        tracing::debug!(key, "Waiting for running computation");
        metric!(counter("workspace.coalesce.waiter") += 1);

        match slot.wait() {
            Ok(value) => Ok(result_mapper(&value)),
            Err(source) => Err(WorkspaceError::ActionFailed {
                key: key.to_owned(),
                source,
            }),
        }
    }

    /// Removes the record of a finished computation from the map.
    fn finish(&self, key: &str, record: &Arc<Record>) -> WorkspaceResult<()> {
        let mut records = self.records.lock();
        match records.get(key) {
            Some(registered) if Arc::ptr_eq(registered, record) => {
                records.remove(key);
                Ok(())
            }
            _ => Err(WorkspaceError::illegal_state(format!(
                "computation for {key:?} was removed by someone else"
            ))),
        }
    }

    /// Whether a computation for `key` is currently running.
    pub fn is_running(&self, key: &str) -> bool {
        self.records.lock().contains_key(key)
    }

    /// The number of callers currently waiting for the computation of `key`.
    pub fn waiters(&self, key: &str) -> usize {
        self.records
            .lock()
            .get(key)
            .map_or(0, |record| record.waiters.load(Ordering::SeqCst))
    }

    /// The number of computations currently running.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for InFlightOperations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let records = self.records.lock();
        f.debug_set().entries(records.keys()).finish()
    }
}
