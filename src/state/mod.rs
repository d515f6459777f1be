pub mod limits;
pub mod record;
pub mod snapshot;

use std::collections::HashMap;
use std::time::SystemTime;

use serde::Serialize;

use crate::config::BufferConfig;
use crate::state::limits::LimitTable;
use crate::state::record::{AllocTable, Allocation, BufferPlan};
use crate::JobId;

/// Capacity pool other than the default one, exposed as a generic resource.
#[derive(Debug, Clone, Serialize)]
pub struct GresPool {
    pub name: String,
    pub granularity: u64,
    pub avail: u64,
    pub used: u64,
}

/// Everything guarded by the plugin's single state mutex: the allocation and
/// plan tables, the usage counters, and the capacity figures mirrored from
/// the external subsystem.
pub struct BbState {
    pub allocs: AllocTable,
    pub plans: HashMap<JobId, BufferPlan>,
    pub limits: LimitTable,
    pub total_space: u64,
    pub used_space: u64,
    pub granularity: u64,
    pub default_pool: Option<String>,
    pub gres_pools: Vec<GresPool>,
    /// Stamp of the last completed external sync; allocations last seen
    /// before it have vanished externally.
    pub last_load_time: Option<SystemTime>,
    /// Most recent persistent-buffer creation; drives snapshot writes.
    pub persist_create_time: Option<SystemTime>,
    pub last_save_time: Option<SystemTime>,
    /// Earliest projected completion among charged job buffers, used for
    /// start-time estimates when capacity is exhausted.
    pub next_end_time: Option<SystemTime>,
}

impl BbState {
    pub fn new(config: &BufferConfig) -> Self {
        BbState {
            allocs: AllocTable::default(),
            plans: HashMap::new(),
            limits: LimitTable::default(),
            total_space: 0,
            used_space: 0,
            granularity: config.granularity.max(1),
            default_pool: config.default_pool.clone(),
            gres_pools: Vec::new(),
            last_load_time: None,
            persist_create_time: None,
            last_save_time: None,
            next_end_time: None,
        }
    }

    pub fn gres_pool(&self, name: &str) -> Option<&GresPool> {
        self.gres_pools.iter().find(|p| p.name == name)
    }

    /// Insert a locally created allocation and charge it against the usage
    /// counters and the used-space figure. (The agent overwrites used space
    /// from the pool report outside emulation mode.)
    pub fn charge_new(&mut self, alloc: Allocation) {
        self.limits.add(
            alloc.user_id,
            &alloc.account,
            &alloc.partition,
            &alloc.qos,
            alloc.size,
        );
        self.used_space += alloc.size;
        if let Some(end) = alloc.end_time {
            self.bump_next_end_time(end);
        }
        if alloc.is_persistent() {
            self.persist_create_time = Some(SystemTime::now());
        }
        self.allocs.insert(alloc);
    }

    /// Insert an allocation discovered from the external subsystem: it is
    /// already counted in the externally reported used space, so only the
    /// usage counters are charged.
    pub fn adopt(&mut self, alloc: Allocation, charge_limits: bool) {
        if charge_limits {
            self.limits.add(
                alloc.user_id,
                &alloc.account,
                &alloc.partition,
                &alloc.qos,
                alloc.size,
            );
        }
        if alloc.is_persistent() {
            self.persist_create_time = Some(SystemTime::now());
        }
        self.allocs.insert(alloc);
    }

    /// Remove an allocation, give its size back to the usage counters and
    /// the used-space figure, and return the record.
    pub fn release(&mut self, name: &str, user_id: crate::UserId) -> Option<Allocation> {
        let alloc = self.allocs.remove(name, user_id)?;
        self.limits.remove(
            alloc.user_id,
            &alloc.account,
            &alloc.partition,
            &alloc.qos,
            alloc.size,
        );
        self.used_space = self.used_space.saturating_sub(alloc.size);
        Some(alloc)
    }

    pub fn bump_next_end_time(&mut self, end: SystemTime) {
        match self.next_end_time {
            Some(current) if current <= end => {}
            _ => self.next_end_time = Some(end),
        }
    }

    /// Rebuild the usage counters from the allocation table (startup
    /// recovery path).
    pub fn apply_limits(&mut self) {
        self.limits.clear();
        let entries: Vec<_> = self
            .allocs
            .iter()
            .map(|a| {
                (
                    a.user_id,
                    a.account.clone(),
                    a.partition.clone(),
                    a.qos.clone(),
                    a.size,
                )
            })
            .collect();
        for (user_id, account, partition, qos, size) in entries {
            self.limits.add(user_id, &account, &partition, &qos, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::record::Allocation;

    fn state() -> BbState {
        BbState::new(&BufferConfig::default())
    }

    fn alloc(name: &str, job_id: JobId, user_id: u32, size: u64) -> Allocation {
        let mut alloc = Allocation::new(name.to_string(), job_id, user_id, size);
        alloc.account = "acct".to_string();
        alloc.partition = "debug".to_string();
        alloc.qos = "normal".to_string();
        alloc
    }

    #[test]
    fn test_charge_release_roundtrip() {
        let mut state = state();
        state.charge_new(alloc("77", 77, 1001, 1 << 30));
        assert_eq!(state.used_space, 1 << 30);
        assert_eq!(state.limits.user_size(1001), 1 << 30);

        let released = state.release("77", 1001).unwrap();
        assert_eq!(released.job_id, 77);
        assert_eq!(state.used_space, 0);
        assert_eq!(state.limits.user_size(1001), 0);
        assert!(state.release("77", 1001).is_none());
    }

    #[test]
    fn test_adopt_does_not_touch_used_space() {
        let mut state = state();
        state.used_space = 5 << 30;
        state.adopt(alloc("foo", 0, 1001, 1 << 30), true);
        assert_eq!(state.used_space, 5 << 30);
        assert_eq!(state.limits.user_size(1001), 1 << 30);
        assert!(state.persist_create_time.is_some());
    }

    #[test]
    fn test_apply_limits_rebuilds() {
        let mut state = state();
        state.adopt(alloc("foo", 0, 1001, 1 << 30), false);
        state.adopt(alloc("bar", 0, 1001, 2 << 30), false);
        assert_eq!(state.limits.user_size(1001), 0);
        state.apply_limits();
        assert_eq!(state.limits.user_size(1001), 3 << 30);
    }

    #[test]
    fn test_next_end_time_tracks_minimum() {
        let mut state = state();
        let now = SystemTime::now();
        state.bump_next_end_time(now + std::time::Duration::from_secs(100));
        state.bump_next_end_time(now + std::time::Duration::from_secs(10));
        state.bump_next_end_time(now + std::time::Duration::from_secs(50));
        assert_eq!(state.next_end_time, Some(now + std::time::Duration::from_secs(10)));
    }
}
