//! Canonical paths for local debrief state.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use debrief_sync::config::paths;
//!
//! let queue_file = paths::pending_queue()?;
//! let audio_dir = paths::audio_cache()?;
//! ```
//!
//! | Location | Purpose |
//! |----------|---------|
//! | `$DEBRIEF_HOME/pending.jsonl` | Pending upload queue (event log) |
//! | `$DEBRIEF_HOME/audio_cache/` | Decrypted audio, one `<id>.m4a` per debrief |
//! | `paths.contacts` or `$DEBRIEF_HOME/contacts.json` | Address book |

use std::path::{Path, PathBuf};

use anyhow::Result;

use super::ResolvedConfig;

pub const PENDING_QUEUE_FILE: &str = "pending.jsonl";
pub const AUDIO_CACHE_DIR: &str = "audio_cache";

/// Get the debrief home directory (~/.debrief)
pub fn debrief_home() -> Result<PathBuf> {
    crate::config::debrief_home()
}

/// Pending upload queue file (~/.debrief/pending.jsonl)
pub fn pending_queue() -> Result<PathBuf> {
    Ok(pending_queue_in(&debrief_home()?))
}

/// Decrypted audio cache directory (~/.debrief/audio_cache/)
pub fn audio_cache() -> Result<PathBuf> {
    Ok(audio_cache_in(&debrief_home()?))
}

/// Address book file
pub fn contacts_file() -> Result<PathBuf> {
    Ok(crate::config::config()?.contacts_file.clone())
}

pub fn pending_queue_in(home: &Path) -> PathBuf {
    home.join(PENDING_QUEUE_FILE)
}

pub fn audio_cache_in(home: &Path) -> PathBuf {
    home.join(AUDIO_CACHE_DIR)
}

impl ResolvedConfig {
    pub fn pending_queue_path(&self) -> PathBuf {
        pending_queue_in(&self.home)
    }

    pub fn audio_cache_dir(&self) -> PathBuf {
        audio_cache_in(&self.home)
    }
}
