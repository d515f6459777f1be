use std::path::PathBuf;
use std::time::Duration;

use crate::UserId;

pub const DEFAULT_CLI_PATH: &str = "/opt/cray/dw_wlm/default/bin/dw_wlm_cli";

/// How often the background agent reconciles with the external subsystem.
pub const DEFAULT_AGENT_INTERVAL: Duration = Duration::from_secs(30);

/// Plugin configuration. Populated by the embedding scheduler from its own
/// configuration layer; parsing that layer is out of scope here.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Name under which reservations refer to this plugin's capacity.
    pub plugin_name: String,
    /// Path to the DataWarp workload-manager CLI.
    pub cli_path: PathBuf,
    /// Directory for per-job artifacts and the limit snapshot.
    pub state_save_dir: PathBuf,
    /// Pool that backs job-scratch allocations. Learned from the first
    /// reported pool when unset.
    pub default_pool: Option<String>,
    /// Allocation quantum of the default pool, refreshed by the agent.
    pub granularity: u64,
    /// Per-user cap on cumulative allocation size.
    pub user_size_limit: Option<u64>,
    /// When set, only these users may request burst buffers.
    pub allow_users: Option<Vec<UserId>>,
    pub deny_users: Option<Vec<UserId>>,
    /// Allow unprivileged users to create/destroy persistent buffers.
    pub enable_persistent: bool,
    /// Run without an external subsystem; capacity accounting comes from the
    /// snapshot alone.
    pub emulate: bool,
    /// Restrict the operator state report to the requesting user's records.
    pub private_data: bool,
    /// Write numeric nid lists (`--nidlistfile`) instead of host names
    /// (`--nodehostnamefile`).
    pub native_nid_files: bool,
    /// Log every external command and its output.
    pub debug_flag: bool,

    pub agent_interval: Duration,
    pub stage_in_timeout: Duration,
    pub stage_out_timeout: Duration,
    /// Timeout for setup, pre_run, post_run, teardown and the show_* calls.
    pub other_timeout: Duration,
    /// Timeout for submit-time validation calls (job_process, paths).
    pub validate_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            plugin_name: "datawarp".to_string(),
            cli_path: PathBuf::from(DEFAULT_CLI_PATH),
            state_save_dir: PathBuf::from("/var/spool/dwflow"),
            default_pool: None,
            granularity: 1,
            user_size_limit: None,
            allow_users: None,
            deny_users: None,
            enable_persistent: false,
            emulate: false,
            private_data: false,
            native_nid_files: false,
            debug_flag: false,
            agent_interval: DEFAULT_AGENT_INTERVAL,
            stage_in_timeout: Duration::from_secs(24 * 60 * 60),
            stage_out_timeout: Duration::from_secs(24 * 60 * 60),
            other_timeout: Duration::from_secs(5),
            validate_timeout: Duration::from_secs(5),
        }
    }
}

impl BufferConfig {
    pub fn user_allowed(&self, user_id: UserId) -> bool {
        if let Some(allow) = &self.allow_users {
            if !allow.contains(&user_id) {
                return false;
            }
        }
        if let Some(deny) = &self.deny_users {
            if deny.contains(&user_id) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_lists() {
        let mut config = BufferConfig::default();
        assert!(config.user_allowed(10));

        config.allow_users = Some(vec![10, 11]);
        assert!(config.user_allowed(10));
        assert!(!config.user_allowed(12));

        config.deny_users = Some(vec![11]);
        assert!(!config.user_allowed(11));
        assert!(config.user_allowed(10));
    }
}
