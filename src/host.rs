use std::time::SystemTime;

use crate::{JobId, UserId};

/// Mutable submit-time view of a job, before it has an id. `job_validate`
/// rewrites `burst_buffer` into the canonical form that every later phase
/// re-reads.
#[derive(Debug, Clone, Default)]
pub struct JobDescriptor {
    pub user_id: UserId,
    /// Batch script body; interactive submissions carry `None` and put their
    /// request in `burst_buffer` directly.
    pub script: Option<String>,
    pub burst_buffer: Option<String>,
    pub max_nodes: Option<u32>,
    pub account: String,
    pub partition: String,
    pub qos: String,
}

/// Read-only view of a queued or running job as the host scheduler sees it
/// on a scheduling tick.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: JobId,
    pub user_id: UserId,
    pub account: String,
    pub partition: String,
    pub qos: String,
    /// Canonical burst-buffer string produced by `job_validate`.
    pub burst_buffer: String,
    /// Batch script body; interactive jobs have none and get a synthesized
    /// script for the CLI.
    pub script: Option<String>,
    pub is_pending: bool,
    /// Expected (pending) or actual (running) start time.
    pub start_time: SystemTime,
    /// Expected completion time, when the host can project one.
    pub end_time: Option<SystemTime>,
    /// Nodes planned for the job during scheduling.
    pub sched_nodes: Option<String>,
    /// Nodes actually allocated once the job starts.
    pub alloc_nodes: Option<String>,
}

impl JobInfo {
    pub fn has_burst_buffer(&self) -> bool {
        !self.burst_buffer.is_empty()
    }
}

/// Why a job was put on hold by this plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFailReason {
    /// A burst-buffer operation against the external subsystem failed.
    BurstBufferOp,
}

impl JobFailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobFailReason::BurstBufferOp => "FAIL_BURST_BUFFER_OP",
        }
    }
}

/// Burst-buffer portion of a host-level reservation.
#[derive(Debug, Clone, Default)]
pub struct BbReservation {
    /// Plugin name the reservation was made against; `None` matches any.
    pub plugin: Option<String>,
    pub used_space: u64,
    /// Generic-resource counts held by the reservation.
    pub gres: Vec<(String, u64)>,
}

/// Accounting defaults for a user, consulted when a session appears that we
/// have no attribution for.
#[derive(Debug, Clone, Default)]
pub struct AssocDefaults {
    pub account: String,
    pub partition: String,
    pub qos: String,
    /// Association id in the accounting subsystem, if one exists. Cached on
    /// allocations as a non-owning handle and refreshed on each agent pass.
    pub assoc_id: Option<u64>,
}

/// Integration surface of the host scheduler. All methods are expected to
/// take the host's own job locks internally; callers never invoke them while
/// holding the plugin state mutex (lock ordering of the concurrency model).
pub trait HostScheduler: Send + Sync + 'static {
    fn job(&self, job_id: JobId) -> Option<JobInfo>;

    /// Record a failure reason + description on the job and hold it
    /// (priority zero).
    fn fail_job(&self, job_id: JobId, reason: JobFailReason, desc: String);

    /// Append environment variables (`KEY=VALUE` lines) to the job's
    /// supplemental environment.
    fn add_job_env(&self, job_id: JobId, env: Vec<String>);

    /// Burst-buffer usage of all current reservations.
    fn reservations(&self) -> Vec<BbReservation>;

    fn default_association(&self, user_id: UserId) -> AssocDefaults;

    /// Association handle for an explicit (user, account, partition) triple.
    fn association_id(&self, user_id: UserId, account: &str, partition: &str) -> Option<u64> {
        let _ = (user_id, account, partition);
        None
    }

    fn is_super_user(&self, user_id: UserId) -> bool;

    /// Operators may create/destroy persistent buffers even when the site
    /// has not enabled that for everyone.
    fn is_operator(&self, user_id: UserId) -> bool {
        self.is_super_user(user_id)
    }

    /// Ask the host to run a scheduling pass soon (stage-in finished).
    fn kick_scheduler(&self);
}
