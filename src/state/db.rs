//! Transactional access to the state tables.
//!
//! [`StateDb`] is the one object shared by every worker. All mutations go
//! through a scoped transaction: scopes nest (a depth counter tracks them),
//! only the outermost scope writes to the backend, and a failure at any depth
//! rolls the whole outermost transaction back when it ends. Call sites can
//! therefore wrap their own mutations without knowing whether a caller has
//! already opened a transaction.
//!
//! The lock is re-entrant per thread and its guard is `!Send`, so a
//! transaction can never be held across an `.await`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StateError};

use super::backend::{LocalStateBackend, MemoryStateBackend, StateBackend};
use super::schema::{ResourceRow, Scope, Tables};

/// Shared handle to the state tables.
#[derive(Clone)]
pub struct StateDb {
    inner: Arc<ReentrantMutex<RefCell<DbInner>>>,
}

#[derive(Debug)]
struct DbInner {
    backend: Box<dyn StateBackend>,
    /// Last state written to the backend.
    committed: Tables,
    /// State including uncommitted changes of the open transaction.
    working: Tables,
    /// Number of open transaction scopes.
    depth: u32,
    /// Set when any scope of the open transaction failed.
    failed: bool,
}

impl DbInner {
    fn rollback(&mut self) {
        self.working = self.committed.clone();
        self.failed = false;
    }
}

/// One transaction scope.
///
/// Commit it with [`Transaction::commit`]; dropping it uncommitted (an early
/// return through `?`, or a panic) marks the whole transaction as failed.
#[must_use = "a transaction that is dropped without commit() is rolled back"]
pub struct Transaction<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<DbInner>>,
    finished: bool,
}

impl Transaction<'_> {
    /// Ends this scope.
    ///
    /// At depth zero the transaction is written to the backend, or rolled
    /// back if any nested scope failed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::RolledBack`] if a nested scope failed, or the
    /// backend's error if the write fails (the transaction is rolled back).
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let mut inner = self.guard.borrow_mut();
        inner.depth -= 1;
        if inner.depth > 0 {
            return Ok(());
        }

        if inner.failed {
            debug!("Rolling back transaction after a nested failure");
            inner.rollback();
            return Err(StateError::RolledBack.into());
        }

        let DbInner {
            backend, working, ..
        } = &mut *inner;
        match backend.save(working) {
            Ok(()) => {
                inner.committed = inner.working.clone();
                Ok(())
            }
            Err(err) => {
                warn!("Failed to persist state, rolling back: {err}");
                inner.rollback();
                Err(err)
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut inner = self.guard.borrow_mut();
        inner.depth -= 1;
        inner.failed = true;
        if inner.depth == 0 {
            debug!("Rolling back failed transaction");
            inner.rollback();
        }
    }
}

impl std::fmt::Debug for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDb").finish_non_exhaustive()
    }
}

impl StateDb {
    /// Opens the tables stored in `backend`, or starts empty ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state cannot be loaded.
    pub fn open(backend: Box<dyn StateBackend>) -> Result<Self> {
        let tables = backend.load()?.unwrap_or_default();
        debug!("Opened state at {}", backend.describe());
        Ok(Self {
            inner: Arc::new(ReentrantMutex::new(RefCell::new(DbInner {
                backend,
                committed: tables.clone(),
                working: tables,
                depth: 0,
                failed: false,
            }))),
        })
    }

    /// Opens the state file under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state cannot be loaded.
    pub fn open_local(dir: &Path) -> Result<Self> {
        Self::open(Box::new(LocalStateBackend::with_base_dir(dir)))
    }

    /// Opens an empty in-memory state.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_memory_backend(MemoryStateBackend::new())
    }

    /// Opens a state backed by the given (possibly pre-populated) memory backend.
    #[must_use]
    pub fn with_memory_backend(backend: MemoryStateBackend) -> Self {
        let tables = backend.snapshot().unwrap_or_default();
        Self {
            inner: Arc::new(ReentrantMutex::new(RefCell::new(DbInner {
                backend: Box::new(backend),
                committed: tables.clone(),
                working: tables,
                depth: 0,
                failed: false,
            }))),
        }
    }

    /// Opens a transaction scope, nested in any scope already open on this
    /// thread.
    pub fn begin(&self) -> Transaction<'_> {
        let guard = self.inner.lock();
        {
            let mut inner = guard.borrow_mut();
            if inner.depth == 0 {
                inner.failed = false;
            }
            inner.depth += 1;
        }
        Transaction {
            guard,
            finished: false,
        }
    }

    /// Runs `f` inside a transaction scope, committing on `Ok` and marking
    /// the transaction failed on `Err`.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or the commit error.
    pub fn transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let tx = self.begin();
        match f() {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                drop(tx);
                Err(err)
            }
        }
    }

    /// Current nesting depth on the lock holder.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.inner.lock().borrow().depth
    }

    /// Reads the tables, including uncommitted changes of a transaction open
    /// on this thread.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        f(&inner.working)
    }

    /// Mutates the tables inside a transaction scope.
    ///
    /// # Errors
    ///
    /// Returns the closure's error or the commit error.
    pub fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        self.transaction(|| {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            f(&mut inner.working)
        })
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Creates a deployment and returns its uuid.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn create_deployment(&self, uuid: Option<&str>) -> Result<String> {
        let uuid = uuid.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let id = uuid.clone();
        self.write(move |tables| {
            tables.insert_deployment(&uuid, Utc::now());
            Ok(())
        })?;
        debug!(deployment = %id, "deployment created");
        Ok(id)
    }

    /// Uuids of all deployments.
    #[must_use]
    pub fn deployment_ids(&self) -> Vec<String> {
        self.read(|tables| tables.deployments.keys().cloned().collect())
    }

    /// Returns true if the deployment exists.
    #[must_use]
    pub fn has_deployment(&self, uuid: &str) -> bool {
        self.read(|tables| tables.deployments.contains_key(uuid))
    }

    /// Deletes a deployment that owns no resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the deployment is unknown or still has resources.
    pub fn delete_deployment(&self, uuid: &str) -> Result<()> {
        self.write(|tables| {
            let count = tables.resources_of(uuid).count();
            if count > 0 {
                return Err(StateError::DeploymentNotEmpty {
                    id: uuid.to_string(),
                    count,
                }
                .into());
            }
            if !tables.remove_deployment(uuid) {
                return Err(StateError::DeploymentNotFound {
                    id: uuid.to_string(),
                }
                .into());
            }
            Ok(())
        })
    }

    // ── Resources ──────────────────────────────────────────────────

    /// Adds a resource row and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn insert_resource(&self, deployment: &str, name: &str, type_tag: &str) -> Result<u64> {
        self.write(|tables| Ok(tables.insert_resource(deployment, name, type_tag)))
    }

    /// Removes a resource row and all its attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn delete_resource(&self, id: u64) -> Result<()> {
        self.write(|tables| {
            tables.remove_resource(id);
            Ok(())
        })
    }

    /// Resource rows of a deployment by ascending id.
    #[must_use]
    pub fn resources(&self, deployment: &str) -> Vec<(u64, ResourceRow)> {
        self.read(|tables| {
            tables
                .resources_of(deployment)
                .map(|(id, row)| (id, row.clone()))
                .collect()
        })
    }

    // ── Attributes ─────────────────────────────────────────────────

    /// Reads one raw attribute value.
    #[must_use]
    pub fn get_attr(&self, scope: &Scope, key: &str) -> Option<String> {
        self.read(|tables| tables.attr(scope, key).cloned())
    }

    /// All raw attributes of one owner.
    #[must_use]
    pub fn attrs(&self, scope: &Scope) -> BTreeMap<String, String> {
        self.read(|tables| tables.attrs(scope))
    }

    /// Writes one raw attribute value; `None` deletes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn set_attr(&self, scope: &Scope, key: &str, value: Option<String>) -> Result<()> {
        self.write(|tables| {
            tables.set_attr(scope, key, value);
            Ok(())
        })
    }
}
