use std::time::SystemTime;

use serde::Serialize;

use crate::{JobId, UserId};

/// Buckets of the chained allocation table, keyed by `user_id % BUCKETS`.
pub const ALLOC_BUCKETS: usize = 100;

/// Lifecycle state of a buffer plan, an allocation, or a persistent-buffer
/// sub-operation. The declaration order is meaningful: phases compare with
/// `<` / `>=` (e.g. "not yet staging" is `state < StagingIn`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufState {
    Pending,
    Allocating,
    Allocated,
    Deleting,
    Deleted,
    StagingIn,
    StagedIn,
    Running,
    StagingOut,
    Teardown,
    Complete,
}

impl BufState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufState::Pending => "pending",
            BufState::Allocating => "allocating",
            BufState::Allocated => "allocated",
            BufState::Deleting => "deleting",
            BufState::Deleted => "deleted",
            BufState::StagingIn => "staging_in",
            BufState::StagedIn => "staged_in",
            BufState::Running => "running",
            BufState::StagingOut => "staging_out",
            BufState::Teardown => "teardown",
            BufState::Complete => "complete",
        }
    }
}

impl std::fmt::Display for BufState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistentAction {
    Create,
    Destroy,
    Use,
}

/// A persistent-buffer operation embedded in a job's plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentReq {
    pub name: String,
    pub action: PersistentAction,
    pub size: u64,
    pub access: Option<String>,
    pub buffer_type: Option<String>,
    pub hurry: bool,
    pub state: BufState,
}

impl PersistentReq {
    pub fn create(name: String, size: u64, access: Option<String>, buffer_type: Option<String>) -> Self {
        PersistentReq {
            name,
            action: PersistentAction::Create,
            size,
            access,
            buffer_type,
            hurry: false,
            state: BufState::Pending,
        }
    }

    pub fn destroy(name: String, hurry: bool) -> Self {
        PersistentReq {
            name,
            action: PersistentAction::Destroy,
            size: 0,
            access: None,
            buffer_type: None,
            hurry,
            state: BufState::Pending,
        }
    }

    pub fn use_existing() -> Self {
        PersistentReq {
            name: String::new(),
            action: PersistentAction::Use,
            size: 0,
            access: None,
            buffer_type: None,
            hurry: false,
            state: BufState::Pending,
        }
    }

    /// Create/destroy work that has not reached a settled state yet.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            BufState::Pending | BufState::Allocating | BufState::Deleting | BufState::Teardown
        ) && self.action != PersistentAction::Use
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GresRequest {
    pub name: String,
    pub count: u64,
}

/// Per-job burst-buffer plan, cached under the job id from the first
/// inspection of its canonical directive string until teardown completes.
#[derive(Debug, Clone)]
pub struct BufferPlan {
    pub job_id: JobId,
    pub user_id: UserId,
    pub account: String,
    pub partition: String,
    pub qos: String,
    pub state: BufState,
    /// When the plan entered its current state; stage timeouts compare
    /// against this.
    pub state_time: SystemTime,
    /// Job-scratch bytes (swap already folded in), pool-granularity rounded.
    pub total_bytes: u64,
    /// Sum of embedded persistent-create sizes.
    pub persist_add: u64,
    pub swap_gib: u64,
    pub swap_nodes: u64,
    pub access: Option<String>,
    pub buffer_type: Option<String>,
    pub gres: Vec<GresRequest>,
    pub bufs: Vec<PersistentReq>,
    pub use_persistent: bool,
    /// The canonical directive string this plan was decoded from.
    pub canonical: String,
}

impl BufferPlan {
    pub fn set_state(&mut self, state: BufState) {
        self.state = state;
        self.state_time = SystemTime::now();
    }

    pub fn has_job_scratch(&self) -> bool {
        self.total_bytes > 0
    }
}

/// One live buffer in the external subsystem, as tracked locally. The token
/// (`name`) is the job id rendered as a string for job scratch, or the
/// user-chosen name for persistent buffers.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub name: String,
    pub job_id: JobId,
    pub user_id: UserId,
    pub size: u64,
    pub account: String,
    pub partition: String,
    pub qos: String,
    pub state: BufState,
    pub create_time: SystemTime,
    /// Last time the external subsystem reported this buffer.
    pub seen_time: SystemTime,
    pub state_time: SystemTime,
    /// Projected time the owning job will need the buffer; preemption
    /// compares this against candidate start times.
    pub use_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub cancelled: bool,
    /// Non-owning handle into the accounting subsystem, refreshed on every
    /// agent pass; never dereferenced here.
    pub assoc_id: Option<u64>,
    pub gres: Vec<GresRequest>,
}

impl Allocation {
    pub fn new(name: String, job_id: JobId, user_id: UserId, size: u64) -> Self {
        let now = SystemTime::now();
        Allocation {
            name,
            job_id,
            user_id,
            size,
            account: String::new(),
            partition: String::new(),
            qos: String::new(),
            state: BufState::Allocated,
            create_time: now,
            seen_time: now,
            state_time: now,
            use_time: None,
            end_time: None,
            cancelled: false,
            assoc_id: None,
            gres: Vec::new(),
        }
    }

    pub fn set_state(&mut self, state: BufState) {
        self.state = state;
        self.state_time = SystemTime::now();
    }

    pub fn is_persistent(&self) -> bool {
        self.job_id == 0
    }
}

/// Chained hash table of allocations, bucketed by owner user id. Lookups by
/// (name, user) and by job id are the two access patterns.
pub struct AllocTable {
    buckets: Vec<Vec<Allocation>>,
}

impl Default for AllocTable {
    fn default() -> Self {
        AllocTable {
            buckets: (0..ALLOC_BUCKETS).map(|_| Vec::new()).collect(),
        }
    }
}

impl AllocTable {
    fn bucket(user_id: UserId) -> usize {
        user_id as usize % ALLOC_BUCKETS
    }

    pub fn insert(&mut self, alloc: Allocation) {
        self.buckets[Self::bucket(alloc.user_id)].push(alloc);
    }

    pub fn find(&self, name: &str, user_id: UserId) -> Option<&Allocation> {
        self.buckets[Self::bucket(user_id)]
            .iter()
            .find(|a| a.user_id == user_id && a.name == name)
    }

    pub fn find_mut(&mut self, name: &str, user_id: UserId) -> Option<&mut Allocation> {
        self.buckets[Self::bucket(user_id)]
            .iter_mut()
            .find(|a| a.user_id == user_id && a.name == name)
    }

    /// Find a named buffer regardless of owner, preferring `user_id`'s own.
    /// Destroy requests resolve the target this way so that ownership can be
    /// checked before anything is torn down.
    pub fn find_by_name(&self, name: &str, user_id: UserId) -> Option<&Allocation> {
        self.find(name, user_id)
            .or_else(|| self.iter().find(|a| a.name == name))
    }

    pub fn find_job(&self, job_id: JobId) -> Option<&Allocation> {
        debug_assert_ne!(job_id, 0);
        self.iter().find(|a| a.job_id == job_id)
    }

    pub fn find_job_mut(&mut self, job_id: JobId) -> Option<&mut Allocation> {
        debug_assert_ne!(job_id, 0);
        self.iter_mut().find(|a| a.job_id == job_id)
    }

    pub fn remove(&mut self, name: &str, user_id: UserId) -> Option<Allocation> {
        let bucket = &mut self.buckets[Self::bucket(user_id)];
        let idx = bucket
            .iter()
            .position(|a| a.user_id == user_id && a.name == name)?;
        Some(bucket.swap_remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.buckets.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Allocation> {
        self.buckets.iter_mut().flatten()
    }

    /// Remove every allocation failing the predicate and return the removed
    /// records.
    pub fn drain_filter(&mut self, mut keep: impl FnMut(&Allocation) -> bool) -> Vec<Allocation> {
        let mut removed = Vec::new();
        for bucket in &mut self.buckets {
            let mut idx = 0;
            while idx < bucket.len() {
                if keep(&bucket[idx]) {
                    idx += 1;
                } else {
                    removed.push(bucket.swap_remove(idx));
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
