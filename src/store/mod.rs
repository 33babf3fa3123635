//! Durable state for the repair loop.
//!
//! - [`StateStore`] keeps the latest [`LoopState`] in `state.json`
//! - [`events::EventLog`] appends one JSON line per completed iteration
//!
//! Saves are atomic: the state is written to `state.json.tmp`, synced, then
//! renamed over `state.json` while holding an exclusive lock on
//! `state.json.lock`. A crash mid-write leaves the previous state intact.

pub mod events;

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{AutorepairError, Result};
use crate::r#loop::state::{LoopState, STATE_VERSION};

pub use events::{EventLog, EventOutcome, LoopEvent};

/// State file name.
const STATE_FILE: &str = "state.json";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Persists the loop state atomically.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn state_file_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    #[must_use]
    pub fn tmp_file_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}{TMP_SUFFIX}"))
    }

    #[must_use]
    pub fn lock_file_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}{LOCK_SUFFIX}"))
    }

    /// Save state atomically.
    pub fn save(&self, state: &LoopState) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            AutorepairError::store(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;

        let lock_file = File::create(self.lock_file_path())?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| AutorepairError::store(format!("Failed to acquire state lock: {e}")))?;

        let tmp_path = self.tmp_file_path();
        let json = serde_json::to_string_pretty(state)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, self.state_file_path()).map_err(|e| {
            AutorepairError::store(format!("Failed to replace state file: {e}"))
        })?;

        debug!("Saved loop state (loop {})", state.loop_count);
        Ok(())
    }

    /// Load the last saved state.
    ///
    /// Returns `None` when no state exists, or when the file is unreadable as
    /// state (corrupted or from an incompatible version). Unusable files are
    /// left in place for inspection and overwritten by the next save.
    pub fn load(&self) -> Result<Option<LoopState>> {
        let state_path = self.state_file_path();

        let lock_path = self.lock_file_path();
        let _lock = if lock_path.exists() {
            let lock_file = File::open(&lock_path)?;
            FileExt::lock_shared(&lock_file).map_err(|e| {
                AutorepairError::store(format!("Failed to acquire state lock: {e}"))
            })?;
            Some(lock_file)
        } else {
            None
        };

        let mut file = match File::open(&state_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let state: LoopState = match serde_json::from_str(&contents) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    "Corrupted state file at {}: {}. Starting fresh.",
                    state_path.display(),
                    e
                );
                return Ok(None);
            }
        };

        if !state.is_version_compatible() {
            warn!(
                "Incompatible state version {} (supported: {}). Starting fresh.",
                state.version, STATE_VERSION
            );
            return Ok(None);
        }

        Ok(Some(state))
    }

    /// Remove saved state. The event log is kept for audit.
    pub fn reset(&self) -> Result<()> {
        for path in [self.state_file_path(), self.tmp_file_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.state_file_path().exists()
    }
}
