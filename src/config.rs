//! Configuration for the debrief sync engine.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (DEBRIEF_HOME, DEBRIEF_API_URL, DEBRIEF_USER_ID, DEBRIEF_API_TOKEN)
//! 2. Config file (.debrief/config.yaml)
//! 3. Defaults (~/.debrief)
//!
//! Config file discovery:
//! - Searches current directory and parents for .debrief/config.yaml
//! - `paths.home` is relative to the .debrief/ directory, `paths.contacts`
//!   to the project root (the parent of .debrief/)

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::TimelineSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub api: Option<ApiConfig>,
    #[serde(default)]
    pub sync: Option<SyncConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Local state directory (relative to .debrief/)
    pub home: Option<String>,
    /// Address book JSON file (relative to the project root)
    pub contacts: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub url: Option<String>,
    pub user_id: Option<String>,
}

/// Every field optional; missing ones fall back to [`SyncSettings::default`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    pub page_size: Option<usize>,
    pub load_more_threshold: Option<usize>,
    pub search_debounce_ms: Option<u64>,
    pub contact_cache_capacity: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub subscription_poll_secs: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Local state directory (pending queue, audio cache)
    pub home: PathBuf,
    /// Address book JSON file
    pub contacts_file: PathBuf,
    pub api_url: Option<String>,
    pub user_id: Option<String>,
    /// Bearer token for the API (environment only, never in the file)
    #[serde(skip)]
    pub api_token: Option<String>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub sync: SyncSettings,
}

/// Sync tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSettings {
    pub page_size: usize,
    pub load_more_threshold: usize,
    pub search_debounce_ms: u64,
    pub contact_cache_capacity: usize,
    pub request_timeout_secs: u64,
    pub subscription_poll_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 20,
            load_more_threshold: 5,
            search_debounce_ms: 300,
            contact_cache_capacity: 100,
            request_timeout_secs: 30,
            subscription_poll_secs: 5,
        }
    }
}

impl SyncSettings {
    fn merged(config: Option<&SyncConfig>) -> Self {
        let defaults = Self::default();
        let Some(c) = config else {
            return defaults;
        };
        Self {
            page_size: c.page_size.unwrap_or(defaults.page_size).max(1),
            load_more_threshold: c.load_more_threshold.unwrap_or(defaults.load_more_threshold),
            search_debounce_ms: c.search_debounce_ms.unwrap_or(defaults.search_debounce_ms),
            contact_cache_capacity: c
                .contact_cache_capacity
                .unwrap_or(defaults.contact_cache_capacity),
            request_timeout_secs: c.request_timeout_secs.unwrap_or(defaults.request_timeout_secs),
            subscription_poll_secs: c
                .subscription_poll_secs
                .unwrap_or(defaults.subscription_poll_secs),
        }
    }

    pub fn timeline(&self) -> TimelineSettings {
        TimelineSettings {
            page_size: self.page_size,
            load_more_threshold: self.load_more_threshold,
            search_debounce: Duration::from_millis(self.search_debounce_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn subscription_poll(&self) -> Duration {
        Duration::from_secs(self.subscription_poll_secs.max(1))
    }
}

/// Values taken from the process environment
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    api_url: Option<String>,
    user_id: Option<String>,
    api_token: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            home: var("DEBRIEF_HOME"),
            api_url: var("DEBRIEF_API_URL"),
            user_id: var("DEBRIEF_USER_ID"),
            api_token: var("DEBRIEF_API_TOKEN"),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".debrief").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".debrief");
    resolve_config(find_config_file(), EnvOverrides::from_env(), default_home)
}

fn resolve_config(
    config_file: Option<PathBuf>,
    env: EnvOverrides,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let file = match &config_file {
        Some(path) => Some(load_config_file(path)?),
        None => None,
    };

    let debrief_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let project_root = debrief_dir.parent().unwrap_or(Path::new("."));

    let home = match (&env.home, file.as_ref().and_then(|f| f.paths.home.as_deref())) {
        (Some(env_home), _) => PathBuf::from(env_home),
        (None, Some(home)) => resolve_path(debrief_dir, home),
        (None, None) => default_home,
    };

    let contacts_file = match file.as_ref().and_then(|f| f.paths.contacts.as_deref()) {
        Some(contacts) => resolve_path(project_root, contacts),
        None => home.join("contacts.json"),
    };

    let api = file.as_ref().and_then(|f| f.api.as_ref());
    let api_url = env
        .api_url
        .or_else(|| api.and_then(|a| a.url.clone()));
    let user_id = env
        .user_id
        .or_else(|| api.and_then(|a| a.user_id.clone()));

    let sync = SyncSettings::merged(file.as_ref().and_then(|f| f.sync.as_ref()));

    Ok(ResolvedConfig {
        home,
        contacts_file,
        api_url,
        user_id,
        api_token: env.api_token,
        config_file,
        sync,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the debrief home directory (local state).
pub fn debrief_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
