//! Storage backends for the state tables.
//!
//! A backend only loads and saves whole table snapshots; transactions and
//! attribute semantics live in [`StateDb`](super::StateDb).

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StateError};

use super::schema::{self, Tables};

/// Default state directory name.
pub const STATE_DIR: &str = ".statecraft";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Persists table snapshots.
pub trait StateBackend: Send + fmt::Debug {
    /// Loads the stored tables, migrating older layouts.
    ///
    /// Returns `None` if nothing has been stored yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state cannot be read or decoded.
    fn load(&self) -> Result<Option<Tables>>;

    /// Replaces the stored tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the tables cannot be written.
    fn save(&mut self, tables: &Tables) -> Result<()>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Local file-based backend.
#[derive(Debug)]
pub struct LocalStateBackend {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
}

impl LocalStateBackend {
    /// Creates a backend with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        Self {
            base_dir,
            state_path,
        }
    }

    /// Directory holding the state file and lock files.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Ensures the state directory exists.
    fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).map_err(|e| StateError::WriteFailed {
                message: format!("Failed to create state directory: {e}"),
            })?;
        }
        Ok(())
    }
}

impl StateBackend for LocalStateBackend {
    fn load(&self) -> Result<Option<Tables>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path)
            .map_err(|e| StateError::corrupted(format!("Failed to read state file: {e}")))?;

        let doc: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;

        let (tables, _found) = schema::migrate(doc)?;
        Ok(Some(tables))
    }

    fn save(&mut self, tables: &Tables) -> Result<()> {
        self.ensure_dir()?;

        let content = serde_json::to_string_pretty(tables).map_err(|e| {
            StateError::serialization(format!("Failed to serialize state: {e}"))
        })?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");
        let write_failed = |what: &str, e: std::io::Error| StateError::WriteFailed {
            message: format!("Failed to {what} state file: {e}"),
        };

        let mut file = fs::File::create(&temp_path).map_err(|e| write_failed("create", e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| write_failed("write", e))?;
        file.sync_all().map_err(|e| write_failed("sync", e))?;
        fs::rename(&temp_path, &self.state_path).map_err(|e| write_failed("rename", e))?;

        debug!("State saved to {}", self.state_path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        self.state_path.display().to_string()
    }
}

/// In-memory backend; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateBackend {
    stored: Arc<Mutex<Option<Tables>>>,
    saves: Arc<Mutex<u64>>,
}

impl MemoryStateBackend {
    /// Creates an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last saved tables.
    #[must_use]
    pub fn snapshot(&self) -> Option<Tables> {
        self.stored.lock().clone()
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

impl StateBackend for MemoryStateBackend {
    fn load(&self) -> Result<Option<Tables>> {
        Ok(self.stored.lock().clone())
    }

    fn save(&mut self, tables: &Tables) -> Result<()> {
        *self.stored.lock() = Some(tables.clone());
        *self.saves.lock() += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        String::from("memory")
    }
}
