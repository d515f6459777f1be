use std::collections::HashMap;

use serde::Serialize;

use crate::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AssocKey {
    user_id: UserId,
    account: String,
    partition: String,
    qos: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserUsage {
    pub user_id: UserId,
    pub size: u64,
}

/// Usage counters backing the quota checks: cumulative allocation size per
/// user and per (user, account, partition, qos) attribution. Counters go up
/// when an allocation is charged and down when it is released; the table
/// never owns the allocations themselves.
#[derive(Debug, Default)]
pub struct LimitTable {
    users: HashMap<UserId, u64>,
    assocs: HashMap<AssocKey, u64>,
}

impl LimitTable {
    pub fn add(&mut self, user_id: UserId, account: &str, partition: &str, qos: &str, size: u64) {
        if size == 0 {
            return;
        }
        *self.users.entry(user_id).or_default() += size;
        let key = AssocKey {
            user_id,
            account: account.to_string(),
            partition: partition.to_string(),
            qos: qos.to_string(),
        };
        *self.assocs.entry(key).or_default() += size;
    }

    pub fn remove(&mut self, user_id: UserId, account: &str, partition: &str, qos: &str, size: u64) {
        if size == 0 {
            return;
        }
        if let Some(total) = self.users.get_mut(&user_id) {
            *total = total.saturating_sub(size);
            if *total == 0 {
                self.users.remove(&user_id);
            }
        }
        let key = AssocKey {
            user_id,
            account: account.to_string(),
            partition: partition.to_string(),
            qos: qos.to_string(),
        };
        if let Some(total) = self.assocs.get_mut(&key) {
            *total = total.saturating_sub(size);
            if *total == 0 {
                self.assocs.remove(&key);
            }
        }
    }

    pub fn user_size(&self, user_id: UserId) -> u64 {
        self.users.get(&user_id).copied().unwrap_or(0)
    }

    /// Admission-time check: would charging `add` bytes keep the user within
    /// the configured limit?
    pub fn within_user_limit(&self, user_id: UserId, add: u64, limit: Option<u64>) -> bool {
        match limit {
            Some(limit) => self.user_size(user_id) + add <= limit,
            None => true,
        }
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.assocs.clear();
    }

    pub fn user_usage(&self) -> Vec<UserUsage> {
        let mut usage: Vec<_> = self
            .users
            .iter()
            .map(|(&user_id, &size)| UserUsage { user_id, size })
            .collect();
        usage.sort_by_key(|u| u.user_id);
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_roundtrip() {
        let mut limits = LimitTable::default();
        limits.add(1001, "acct", "debug", "normal", 1 << 30);
        limits.add(1001, "acct", "debug", "normal", 1 << 30);
        limits.add(1001, "other", "debug", "normal", 1 << 30);
        assert_eq!(limits.user_size(1001), 3 << 30);

        limits.remove(1001, "acct", "debug", "normal", 1 << 30);
        assert_eq!(limits.user_size(1001), 2 << 30);

        // Over-removal saturates instead of wrapping
        limits.remove(1001, "acct", "debug", "normal", 10 << 30);
        limits.remove(1001, "other", "debug", "normal", 1 << 30);
        assert_eq!(limits.user_size(1001), 0);
        assert!(limits.user_usage().is_empty());
    }

    #[test]
    fn test_user_limit_check() {
        let mut limits = LimitTable::default();
        limits.add(1001, "a", "p", "q", 3 << 30);
        assert!(limits.within_user_limit(1001, 1 << 30, Some(4 << 30)));
        assert!(!limits.within_user_limit(1001, 2 << 30, Some(4 << 30)));
        assert!(limits.within_user_limit(1001, u64::MAX / 2, None));
        assert!(limits.within_user_limit(2000, 4 << 30, Some(4 << 30)));
    }
}
