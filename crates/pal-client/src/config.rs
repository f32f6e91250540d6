//! Client configuration, read from `PAL_*` environment variables.

use std::time::Duration;

/// Directory set meaning "watch everything" (the repository root).
pub const ALL_DIRECTORIES: &str = ".";

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PalConfig {
    /// Base URL of the policy distribution server.
    pub server_url: String,
    /// Optional client token; absent means no authorization header.
    pub client_token: Option<String>,
    /// Watched policy directories; empty means watch everything.
    pub policy_dirs: Vec<String>,
    /// Raw topics the data updater subscribes to.
    pub data_topics: Vec<String>,
    /// Store path the base policy data is written under.
    pub data_root: String,
    pub keep_alive: Duration,
    /// Whether an inline engine runner manages the store in-process.
    pub inline_engine: bool,
    /// Upper bound on graceful shutdown of the background runners.
    pub shutdown_timeout: Duration,
}

impl Default for PalConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:7002".into(),
            client_token: None,
            policy_dirs: Vec::new(),
            data_topics: vec!["policy_data".into()],
            data_root: String::new(),
            keep_alive: Duration::from_secs(0),
            inline_engine: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl PalConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: env_string("PAL_SERVER_URL").unwrap_or(defaults.server_url),
            client_token: env_string("PAL_CLIENT_TOKEN"),
            policy_dirs: env_list("PAL_POLICY_DIRS"),
            data_topics: env_string("PAL_DATA_TOPICS")
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.data_topics),
            data_root: env_string("PAL_DATA_ROOT").unwrap_or(defaults.data_root),
            keep_alive: env_secs("PAL_KEEP_ALIVE_SECS").unwrap_or(defaults.keep_alive),
            inline_engine: env_truthy("PAL_INLINE_ENGINE"),
            shutdown_timeout: env_secs("PAL_SHUTDOWN_TIMEOUT_SECS")
                .unwrap_or(defaults.shutdown_timeout),
        }
    }

    /// The directory set a full resync covers.
    pub fn all_directories(&self) -> Vec<String> {
        if self.policy_dirs.is_empty() {
            vec![ALL_DIRECTORIES.to_string()]
        } else {
            self.policy_dirs.clone()
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_list(key: &str) -> Vec<String> {
    env_string(key).map(|raw| split_list(&raw)).unwrap_or_default()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn env_secs(key: &str) -> Option<Duration> {
    env_string(key)?.parse::<u64>().ok().map(Duration::from_secs)
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_dir_set_resolves_to_watch_everything() {
        let cfg = PalConfig::default();
        assert_eq!(cfg.all_directories(), vec![ALL_DIRECTORIES.to_string()]);
    }

    #[test]
    fn configured_dirs_resolve_to_themselves() {
        let cfg = PalConfig {
            policy_dirs: vec!["authz".into(), "rbac".into()],
            ..PalConfig::default()
        };
        assert_eq!(cfg.all_directories(), vec!["authz", "rbac"]);
    }

    #[test]
    fn list_splitting_trims_and_drops_empties() {
        assert_eq!(split_list("authz, rbac,,  "), vec!["authz", "rbac"]);
    }
}
