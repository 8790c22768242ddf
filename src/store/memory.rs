use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::{
    CommandCompletion, CommandState, CommandStore, CommandTable, RecordingCommand,
    RecordingRequest, StoreError,
};

struct Inner {
    table: CommandTable,
    /// Bumped on every mutation that changed the table.
    version: u64,
    /// Version the last `wait_for_change` returned at.
    observed: u64,
}

/// Process-local store. Waiters are woken through a condition variable.
pub struct InMemoryCommandStore {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for InMemoryCommandStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                table: CommandTable::default(),
                version: 0,
                observed: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the table. Waiters are woken only if `changed` says the
    /// result reflects a real update.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut CommandTable) -> Result<T, StoreError>,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T, StoreError> {
        let mut inner = self.lock();
        let result = f(&mut inner.table)?;
        if changed(&result) {
            inner.version += 1;
            self.changed.notify_all();
        }
        Ok(result)
    }
}

impl CommandStore for InMemoryCommandStore {
    fn get_active(&self) -> Result<Option<RecordingCommand>, StoreError> {
        Ok(self.lock().table.active().cloned())
    }

    fn get(&self, id: Uuid) -> Result<Option<RecordingCommand>, StoreError> {
        Ok(self.lock().table.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<RecordingCommand>, StoreError> {
        Ok(self.lock().table.list())
    }

    fn submit(&self, request: RecordingRequest) -> Result<RecordingCommand, StoreError> {
        self.mutate(|table| table.submit(request), |_| true)
    }

    fn request_stop(&self, id: Uuid) -> Result<RecordingCommand, StoreError> {
        self.mutate(|table| table.request_stop(id), |_| true)
    }

    fn compare_and_set(
        &self,
        id: Uuid,
        expected: CommandState,
        new: CommandState,
    ) -> Result<bool, StoreError> {
        self.mutate(
            |table| table.compare_and_set(id, expected, new),
            |swapped| *swapped,
        )
    }

    fn finish(&self, id: Uuid, completion: CommandCompletion) -> Result<(), StoreError> {
        self.mutate(|table| table.finish(id, completion), |_| true)
    }

    fn wait_for_change(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.version == inner.observed {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .changed
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        inner.observed = inner.version;
        true
    }
}
