//! Scheduler configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// `RocksDB` directory.
    #[serde(default = "SchedulerConfig::default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds to wait for an agent to reconnect after a reboot or deploy.
    #[serde(default = "SchedulerConfig::default_agent_restart_timeout")]
    pub agent_restart_timeout_seconds: u64,

    /// Seconds to wait for an agent to reconnect after a post-install reboot.
    #[serde(default = "SchedulerConfig::default_installation_reboot_timeout")]
    pub installation_reboot_timeout_seconds: u64,

    /// Seconds an RPC waits for a session before failing with `NoSession`.
    #[serde(default = "SchedulerConfig::default_session_wait_timeout")]
    pub session_wait_timeout_seconds: u64,

    /// Seconds of agent silence after which an in-flight RPC times out.
    #[serde(default = "SchedulerConfig::default_contact_timeout")]
    pub contact_timeout_seconds: u64,

    /// Journal size passed to mkfs, in megabytes.
    #[serde(default)]
    pub journal_size: Option<String>,

    /// Extra mkfs options for MGS targets.
    #[serde(default)]
    pub mkfs_options_mgs: Option<String>,

    /// Extra mkfs options for MDT targets.
    #[serde(default)]
    pub mkfs_options_mdt: Option<String>,

    /// Extra mkfs options for OST targets.
    #[serde(default)]
    pub mkfs_options_ost: Option<String>,

    /// URL agents are deployed against.
    #[serde(default = "SchedulerConfig::default_server_http_url")]
    pub server_http_url: String,

    /// URL of the agent transport service.
    #[serde(default = "SchedulerConfig::default_http_agent_url")]
    pub http_agent_url: String,

    /// Maximum number of concurrently executing jobs.
    #[serde(default = "SchedulerConfig::default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,

    /// Seconds a request id is remembered for de-duplication.
    #[serde(default = "SchedulerConfig::default_request_dedup_window")]
    pub request_dedup_window_seconds: u64,

    /// Master timeout when waiting for a target resource, in seconds.
    #[serde(default = "SchedulerConfig::default_target_wait_timeout")]
    pub target_wait_timeout_seconds: u64,

    /// Activity timeout when waiting for a target resource, in seconds.
    #[serde(default = "SchedulerConfig::default_target_activity_timeout")]
    pub target_activity_timeout_seconds: u64,

    /// Seconds a cancelled RPC id is remembered.
    #[serde(default = "SchedulerConfig::default_cancelled_rpc_expiry")]
    pub cancelled_rpc_expiry_seconds: u64,
}

impl SchedulerConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from("/var/lib/lustre-manager")
    }

    const fn default_agent_restart_timeout() -> u64 {
        600
    }

    const fn default_installation_reboot_timeout() -> u64 {
        1800
    }

    const fn default_session_wait_timeout() -> u64 {
        30
    }

    const fn default_contact_timeout() -> u64 {
        60
    }

    fn default_server_http_url() -> String {
        "https://localhost/".to_string()
    }

    fn default_http_agent_url() -> String {
        "http://localhost:8081".to_string()
    }

    const fn default_max_parallel_jobs() -> usize {
        16
    }

    const fn default_request_dedup_window() -> u64 {
        300
    }

    const fn default_target_wait_timeout() -> u64 {
        300
    }

    const fn default_target_activity_timeout() -> u64 {
        60
    }

    const fn default_cancelled_rpc_expiry() -> u64 {
        600 // 10 minutes
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `DATA_DIR`: `RocksDB` directory
    /// - `AGENT_RESTART_TIMEOUT`: reboot/deploy reconnect wait, seconds
    /// - `INSTALLATION_REBOOT_TIMEOUT`: post-install reconnect wait, seconds
    /// - `SESSION_WAIT_TIMEOUT`: wait for a session before `NoSession`, seconds
    /// - `CONTACT_TIMEOUT`: agent silence before `Timeout`, seconds
    /// - `JOURNAL_SIZE`: mkfs journal size
    /// - `LUSTRE_MKFS_OPTIONS_MGS`, `LUSTRE_MKFS_OPTIONS_MDT`,
    ///   `LUSTRE_MKFS_OPTIONS_OST`: extra mkfs options per target role
    /// - `SERVER_HTTP_URL`: URL agents are deployed against
    /// - `HTTP_AGENT_URL`: agent transport service URL
    /// - `MAX_PARALLEL_JOBS`: concurrently executing jobs
    /// - `REQUEST_DEDUP_WINDOW`: request id memory, seconds
    /// - `TARGET_WAIT_TIMEOUT`, `TARGET_ACTIVITY_TIMEOUT`: target resource waits
    /// - `CANCELLED_RPC_EXPIRY`: cancelled RPC id memory, seconds
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SERVER_HTTP_URL") {
            config.server_http_url = val;
        }
        if let Ok(val) = std::env::var("HTTP_AGENT_URL") {
            config.http_agent_url = val;
        }
        if let Ok(val) = std::env::var("JOURNAL_SIZE") {
            config.journal_size = Some(val);
        }
        if let Ok(val) = std::env::var("LUSTRE_MKFS_OPTIONS_MGS") {
            config.mkfs_options_mgs = Some(val);
        }
        if let Ok(val) = std::env::var("LUSTRE_MKFS_OPTIONS_MDT") {
            config.mkfs_options_mdt = Some(val);
        }
        if let Ok(val) = std::env::var("LUSTRE_MKFS_OPTIONS_OST") {
            config.mkfs_options_ost = Some(val);
        }

        let numeric: [(&str, &mut u64); 8] = [
            ("AGENT_RESTART_TIMEOUT", &mut config.agent_restart_timeout_seconds),
            (
                "INSTALLATION_REBOOT_TIMEOUT",
                &mut config.installation_reboot_timeout_seconds,
            ),
            ("SESSION_WAIT_TIMEOUT", &mut config.session_wait_timeout_seconds),
            ("CONTACT_TIMEOUT", &mut config.contact_timeout_seconds),
            ("REQUEST_DEDUP_WINDOW", &mut config.request_dedup_window_seconds),
            ("TARGET_WAIT_TIMEOUT", &mut config.target_wait_timeout_seconds),
            ("TARGET_ACTIVITY_TIMEOUT", &mut config.target_activity_timeout_seconds),
            ("CANCELLED_RPC_EXPIRY", &mut config.cancelled_rpc_expiry_seconds),
        ];
        for (name, slot) in numeric {
            if let Ok(val) = std::env::var(name) {
                if let Ok(n) = val.parse() {
                    *slot = n;
                }
            }
        }

        if let Ok(val) = std::env::var("MAX_PARALLEL_JOBS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_parallel_jobs = n.max(1);
            }
        }

        config
    }

    /// Extra mkfs options for a target role (`mgs`, `mdt` or `ost`).
    #[must_use]
    pub fn mkfs_options(&self, role: &str) -> Option<&str> {
        match role {
            "mgs" => self.mkfs_options_mgs.as_deref(),
            "mdt" => self.mkfs_options_mdt.as_deref(),
            "ost" => self.mkfs_options_ost.as_deref(),
            _ => None,
        }
    }

    /// Get the agent restart timeout as a `Duration`.
    #[must_use]
    pub const fn agent_restart_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_restart_timeout_seconds)
    }

    /// Get the installation reboot timeout as a `Duration`.
    #[must_use]
    pub const fn installation_reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.installation_reboot_timeout_seconds)
    }

    /// Get the session wait timeout as a `Duration`.
    #[must_use]
    pub const fn session_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.session_wait_timeout_seconds)
    }

    /// Get the contact timeout as a `Duration`.
    #[must_use]
    pub const fn contact_timeout(&self) -> Duration {
        Duration::from_secs(self.contact_timeout_seconds)
    }

    /// Get the request de-duplication window as a `Duration`.
    #[must_use]
    pub const fn request_dedup_window(&self) -> Duration {
        Duration::from_secs(self.request_dedup_window_seconds)
    }

    /// Get the target wait master timeout as a `Duration`.
    #[must_use]
    pub const fn target_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.target_wait_timeout_seconds)
    }

    /// Get the target wait activity timeout as a `Duration`.
    #[must_use]
    pub const fn target_activity_timeout(&self) -> Duration {
        Duration::from_secs(self.target_activity_timeout_seconds)
    }

    /// Get the cancelled RPC expiry as a `Duration`.
    #[must_use]
    pub const fn cancelled_rpc_expiry(&self) -> Duration {
        Duration::from_secs(self.cancelled_rpc_expiry_seconds)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            agent_restart_timeout_seconds: Self::default_agent_restart_timeout(),
            installation_reboot_timeout_seconds: Self::default_installation_reboot_timeout(),
            session_wait_timeout_seconds: Self::default_session_wait_timeout(),
            contact_timeout_seconds: Self::default_contact_timeout(),
            journal_size: None,
            mkfs_options_mgs: None,
            mkfs_options_mdt: None,
            mkfs_options_ost: None,
            server_http_url: Self::default_server_http_url(),
            http_agent_url: Self::default_http_agent_url(),
            max_parallel_jobs: Self::default_max_parallel_jobs(),
            request_dedup_window_seconds: Self::default_request_dedup_window(),
            target_wait_timeout_seconds: Self::default_target_wait_timeout(),
            target_activity_timeout_seconds: Self::default_target_activity_timeout(),
            cancelled_rpc_expiry_seconds: Self::default_cancelled_rpc_expiry(),
        }
    }
}
