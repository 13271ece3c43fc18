use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use sysinfo::{ProcessRefreshKind, System, UpdateKind, Users};

use crate::store::PolicyConfig;

const APP_DIR: &str = "focusgate";

#[cfg(target_os = "windows")]
const DEFAULT_HOSTS_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";
#[cfg(not(target_os = "windows"))]
const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// Get the local data directory for focusgate.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    let mut path =
        dirs::data_local_dir().ok_or_else(|| anyhow::anyhow!("Failed to get local data dir"))?;
    path.push(APP_DIR);
    Ok(path)
}

/// Default location of the agent configuration file.
///
/// # Errors
///
/// Returns an error if the user configuration directory cannot be determined.
pub fn default_config_path() -> Result<PathBuf> {
    let mut path =
        dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Failed to get config dir"))?;
    path.push(APP_DIR);
    path.push("config.toml");
    Ok(path)
}

/// Name of the interactive user, without any `DOMAIN\` prefix.
///
/// The account owning this process is asked for first; the login environment
/// variables are only consulted when the OS lookup fails.
#[must_use]
pub fn current_user_name() -> Option<String> {
    os_account_name()
        .or_else(|| {
            ["USERNAME", "USER", "LOGNAME"]
                .iter()
                .find_map(|key| std::env::var(key).ok())
        })
        .map(|raw| strip_domain(&raw).to_string())
        .filter(|name| !name.is_empty())
}

fn os_account_name() -> Option<String> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_process_specifics(
        pid,
        ProcessRefreshKind::new().with_user(UpdateKind::Always),
    );
    let uid = system.process(pid)?.user_id()?.clone();
    let users = Users::new_with_refreshed_list();
    users.get_user_by_id(&uid).map(|user| user.name().to_string())
}

fn strip_domain(account: &str) -> &str {
    account.rsplit('\\').next().unwrap_or(account)
}

fn default_markers() -> Vec<String> {
    [
        "participant call-participant text-center ember-view",
        "sms-textarea message-input form-control",
        "interaction-icon roster-email ember-view",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

/// Agent configuration, read from `config.toml`.
///
/// Every field has a default so a missing or partial file still yields a
/// usable agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Client id used for configuration fetches and the push channel path
    pub client: String,
    /// Identity matched against push updates; defaults to the OS user name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Bootstrap monitored executable names
    pub processes: BTreeSet<String>,
    /// Bootstrap blocked domains
    pub urls: BTreeSet<String>,
    /// Substring identifying the monitored browser tab
    pub monitored_url: String,
    /// Markup fragments that indicate an interaction is in progress
    pub markers: Vec<String>,
    pub debug_endpoint: String,
    pub config_endpoint: String,
    pub push_endpoint: String,
    pub poll_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub reconnect_min_secs: u64,
    pub reconnect_max_secs: u64,
    /// Push channel silence before a keepalive ping is sent
    pub keepalive_secs: u64,
    pub hosts_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            client: String::from("bac"),
            identity: None,
            processes: BTreeSet::new(),
            urls: BTreeSet::new(),
            monitored_url: String::from("https://apps.mypurecloud.com"),
            markers: default_markers(),
            debug_endpoint: String::from("http://localhost:9222"),
            config_endpoint: String::from("http://localhost:8080"),
            push_endpoint: String::from("ws://localhost:8080/api/v1/ws"),
            poll_interval_secs: 2,
            probe_timeout_secs: 5,
            fetch_timeout_secs: 10,
            reconnect_min_secs: 1,
            reconnect_max_secs: 60,
            keepalive_secs: 30,
            hosts_path: PathBuf::from(DEFAULT_HOSTS_PATH),
        }
    }
}

impl AgentConfig {
    /// Load the configuration.
    ///
    /// An explicit path must exist. Without one, the default location is used
    /// and a missing file falls back to built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = default_config_path()?;
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    log::debug!("No config at {}, using defaults", path.display());
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML for this schema.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the agent cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }
        if self.probe_timeout_secs == 0
            || self.fetch_timeout_secs == 0
            || self.keepalive_secs == 0
        {
            anyhow::bail!("timeouts must be greater than zero");
        }
        if self.reconnect_min_secs == 0 || self.reconnect_min_secs > self.reconnect_max_secs {
            anyhow::bail!("reconnect_min_secs must be in 1..=reconnect_max_secs");
        }
        if self.markers.iter().any(|marker| marker.trim().is_empty()) {
            anyhow::bail!("markers must not contain empty strings");
        }
        if self.monitored_url.trim().is_empty() {
            anyhow::bail!("monitored_url must not be empty");
        }
        Ok(())
    }

    /// Identity used to match push updates.
    #[must_use]
    pub fn resolved_identity(&self) -> String {
        self.identity
            .clone()
            .or_else(current_user_name)
            .unwrap_or_else(|| String::from("unknown"))
    }

    /// The static policy supplied at startup.
    #[must_use]
    pub fn bootstrap_policy(&self) -> PolicyConfig {
        PolicyConfig::new(self.processes.iter().cloned(), self.urls.iter().cloned())
    }

    /// WebSocket URL of the push channel for this identity.
    #[must_use]
    pub fn push_url(&self, identity: &str) -> String {
        format!(
            "{}/{identity}/{}",
            self.push_endpoint.trim_end_matches('/'),
            self.client
        )
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    #[must_use]
    pub fn reconnect_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.reconnect_min_secs),
            Duration::from_secs(self.reconnect_max_secs),
        )
    }
}
