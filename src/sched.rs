//! Admission control: decide whether a pending job's buffers can be
//! allocated now, must wait, or can be made to fit by preempting in-progress
//! stage-ins of jobs that will run later.

use std::time::SystemTime;

use crate::common::size::round_to_granularity;
use crate::host::{BbReservation, JobInfo};
use crate::state::BbState;
use crate::state::record::BufState;
use crate::{JobId, UserId};

/// Verdict of the admission test.
///
/// * `Start` — the job may be allocated now; the caller proceeds.
/// * `OverLimit` — the request exceeds a configured limit; skip this job
///   and keep iterating other candidates.
/// * `NoCapacity` — not enough free capacity right now. The queue is sorted
///   by start time, so the caller stops iterating entirely. Any selected
///   preemption victims have already been flipped to teardown in the state
///   table; the caller enqueues their hurried teardowns after releasing the
///   state lock and retries the candidate on a later tick.
#[derive(Debug)]
pub enum Admission {
    Start,
    OverLimit,
    NoCapacity { preempted: Vec<Victim> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    pub job_id: JobId,
    pub user_id: UserId,
}

/// `Probe` answers without selecting victims or mutating any allocation;
/// used for start-time estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitMode {
    Schedule,
    Probe,
}

struct GresNeed {
    name: String,
    need: i64,
}

pub fn test_size_limit(
    state: &mut BbState,
    job: &JobInfo,
    reservations: &[BbReservation],
    user_size_limit: Option<u64>,
    plugin_name: &str,
    now: SystemTime,
    mode: AdmitMode,
) -> Admission {
    let Some(plan) = state.plans.get(&job.job_id) else {
        return Admission::OverLimit;
    };
    let add_space =
        round_to_granularity(plan.total_bytes, state.granularity) + plan.persist_add;
    let gres_request = plan.gres.clone();

    // A request no limit setting could ever satisfy is skipped outright.
    if let Some(limit) = user_size_limit {
        if add_space > limit {
            log::debug!("Job {} requested space above the user limit", job.job_id);
            return Admission::OverLimit;
        }
    }

    let resv_space: u64 = reservations
        .iter()
        .filter(|r| r.plugin.as_deref().map_or(true, |p| p == plugin_name))
        .map(|r| round_to_granularity(r.used_space, state.granularity))
        .sum();

    let mut user_need: i64 = match user_size_limit {
        Some(limit) => {
            (state.limits.user_size(job.user_id) as i64 + add_space as i64) - limit as i64
        }
        None => 0,
    }
    .max(0);

    let mut total_need: i64 = (state.used_space as i64 + add_space as i64 + resv_space as i64)
        - state.total_space as i64;
    total_need = total_need.max(0);

    let mut gres_needs: Vec<GresNeed> = Vec::new();
    for request in &gres_request {
        let Some(pool) = state.gres_pool(&request.name) else {
            log::debug!(
                "Job {} requests undefined generic resource {}",
                job.job_id,
                request.name
            );
            return Admission::OverLimit;
        };
        let count = round_to_granularity(request.count, pool.granularity.max(1));
        if count > pool.avail {
            log::debug!(
                "Job {} requests more {} than configured",
                job.job_id,
                request.name
            );
            return Admission::OverLimit;
        }
        let reserved: u64 = reservations
            .iter()
            .filter(|r| r.plugin.as_deref().map_or(true, |p| p == plugin_name))
            .flat_map(|r| r.gres.iter())
            .filter(|(name, _)| name == &request.name)
            .map(|(_, count)| count)
            .sum();
        let free = pool.avail as i64 - pool.used as i64 - reserved as i64;
        let need = (count as i64 - free.max(0)).max(0);
        if need > 0 {
            gres_needs.push(GresNeed {
                name: request.name.clone(),
                need,
            });
        }
    }

    if total_need == 0 && user_need == 0 && gres_needs.is_empty() {
        return Admission::Start;
    }
    if mode == AdmitMode::Probe {
        return Admission::NoCapacity { preempted: vec![] };
    }

    // Candidate victims: charged job buffers whose owners will not need them
    // before this job would start.
    #[derive(Clone)]
    struct Candidate {
        name: String,
        job_id: JobId,
        user_id: UserId,
        size: u64,
        use_time: SystemTime,
        gres: Vec<(String, u64)>,
    }
    let candidates: Vec<Candidate> = state
        .allocs
        .iter()
        .filter(|a| {
            a.job_id != 0
                && !a.cancelled
                && a.state < BufState::Teardown
                && a.use_time.map_or(false, |t| t > now && t > job.start_time)
        })
        .map(|a| Candidate {
            name: a.name.clone(),
            job_id: a.job_id,
            user_id: a.user_id,
            size: a.size,
            use_time: a.use_time.unwrap_or(now),
            gres: a.gres.iter().map(|g| (g.name.clone(), g.count)).collect(),
        })
        .collect();

    let total_avail: i64 = candidates.iter().map(|c| c.size as i64).sum();
    let user_avail: i64 = candidates
        .iter()
        .filter(|c| c.user_id == job.user_id)
        .map(|c| c.size as i64)
        .sum();
    let gres_covered = gres_needs.iter().all(|need| {
        let avail: i64 = candidates
            .iter()
            .flat_map(|c| c.gres.iter())
            .filter(|(name, _)| name == &need.name)
            .map(|(_, count)| *count as i64)
            .sum();
        avail >= need.need
    });

    if total_avail < total_need || user_avail < user_need || !gres_covered {
        return Admission::NoCapacity { preempted: vec![] };
    }

    // Victims are taken furthest-use-first; a user's own deficit can only be
    // relieved by the user's own buffers.
    let mut ordered = candidates;
    ordered.sort_by(|a, b| b.use_time.cmp(&a.use_time));

    let mut preempted = Vec::new();
    for candidate in ordered {
        if total_need <= 0 && user_need <= 0 && gres_needs.iter().all(|g| g.need <= 0) {
            break;
        }
        let mut do_preempt = false;
        if user_need > 0 && candidate.user_id == job.user_id {
            do_preempt = true;
            user_need -= candidate.size as i64;
            total_need -= candidate.size as i64;
        }
        if total_need > user_need && candidate.user_id != job.user_id {
            do_preempt = true;
            total_need -= candidate.size as i64;
        }
        for need in gres_needs.iter_mut().filter(|g| g.need > 0) {
            let have: i64 = candidate
                .gres
                .iter()
                .filter(|(name, _)| name == &need.name)
                .map(|(_, count)| *count as i64)
                .sum();
            let credited = have.min(need.need);
            if credited > 0 {
                need.need -= credited;
                do_preempt = true;
            }
        }
        if do_preempt {
            if let Some(alloc) = state.allocs.find_mut(&candidate.name, candidate.user_id) {
                alloc.set_state(BufState::Teardown);
                alloc.end_time = None;
                alloc.cancelled = true;
            }
            log::info!(
                "Preempting stage-in of job {} for job {}",
                candidate.job_id,
                job.job_id
            );
            preempted.push(Victim {
                job_id: candidate.job_id,
                user_id: candidate.user_id,
            });
        }
    }

    Admission::NoCapacity { preempted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::state::record::{Allocation, BufferPlan, GresRequest};
    use crate::state::GresPool;
    use std::time::{Duration, SystemTime};

    const GIB: u64 = 1 << 30;

    fn job(job_id: JobId, user_id: UserId, start_in: u64) -> JobInfo {
        JobInfo {
            job_id,
            user_id,
            account: "acct".to_string(),
            partition: "debug".to_string(),
            qos: "normal".to_string(),
            burst_buffer: String::new(),
            script: None,
            is_pending: true,
            start_time: SystemTime::now() + Duration::from_secs(start_in),
            end_time: None,
            sched_nodes: None,
            alloc_nodes: None,
        }
    }

    fn plan(job_id: JobId, user_id: UserId, total_bytes: u64) -> BufferPlan {
        BufferPlan {
            job_id,
            user_id,
            account: "acct".to_string(),
            partition: "debug".to_string(),
            qos: "normal".to_string(),
            state: crate::state::record::BufState::Pending,
            state_time: SystemTime::now(),
            total_bytes,
            persist_add: 0,
            swap_gib: 0,
            swap_nodes: 0,
            access: None,
            buffer_type: None,
            gres: vec![],
            bufs: vec![],
            use_persistent: false,
            canonical: String::new(),
        }
    }

    fn state_with(total: u64, used: u64) -> BbState {
        let mut state = BbState::new(&BufferConfig::default());
        state.total_space = total;
        state.used_space = used;
        state
    }

    fn admit(state: &mut BbState, job: &JobInfo, limit: Option<u64>) -> Admission {
        test_size_limit(
            state,
            job,
            &[],
            limit,
            "datawarp",
            SystemTime::now(),
            AdmitMode::Schedule,
        )
    }

    #[test]
    fn test_admit_when_space_available() {
        let mut state = state_with(10 * GIB, 2 * GIB);
        let job = job(1, 1001, 60);
        state.plans.insert(1, plan(1, 1001, 2 * GIB));
        assert!(matches!(admit(&mut state, &job, None), Admission::Start));
    }

    #[test]
    fn test_defer_when_capacity_short() {
        let mut state = state_with(10 * GIB, 9 * GIB);
        let job = job(1, 1001, 60);
        state.plans.insert(1, plan(1, 1001, 2 * GIB));
        match admit(&mut state, &job, None) {
            Admission::NoCapacity { preempted } => assert!(preempted.is_empty()),
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_request_above_limit_skips() {
        let mut state = state_with(100 * GIB, 0);
        let job = job(1, 1001, 60);
        state.plans.insert(1, plan(1, 1001, 50 * GIB));
        assert!(matches!(
            admit(&mut state, &job, Some(10 * GIB)),
            Admission::OverLimit
        ));
    }

    #[test]
    fn test_reservations_count_against_capacity() {
        let mut state = state_with(10 * GIB, 4 * GIB);
        let job = job(1, 1001, 60);
        state.plans.insert(1, plan(1, 1001, 4 * GIB));
        let resv = [BbReservation {
            plugin: Some("datawarp".to_string()),
            used_space: 4 * GIB,
            gres: vec![],
        }];
        let verdict = test_size_limit(
            &mut state,
            &job,
            &resv,
            None,
            "datawarp",
            SystemTime::now(),
            AdmitMode::Schedule,
        );
        assert!(matches!(verdict, Admission::NoCapacity { .. }));
    }

    #[test]
    fn test_undefined_gres_skips() {
        let mut state = state_with(10 * GIB, 0);
        let job = job(1, 1001, 60);
        let mut p = plan(1, 1001, 0);
        p.gres.push(GresRequest {
            name: "nodes".to_string(),
            count: 2,
        });
        state.plans.insert(1, p);
        assert!(matches!(admit(&mut state, &job, None), Admission::OverLimit));

        state.gres_pools.push(GresPool {
            name: "nodes".to_string(),
            granularity: 1,
            avail: 4,
            used: 0,
        });
        assert!(matches!(admit(&mut state, &job, None), Admission::Start));
    }

    #[test]
    fn test_preemption_selects_later_stage_in() {
        let mut state = state_with(10 * GIB, 5 * GIB);
        let job = job(1, 1001, 60);
        state.plans.insert(1, plan(1, 1001, 6 * GIB));

        let mut victim = Allocation::new("42".to_string(), 42, 2002, 5 * GIB);
        victim.use_time = Some(SystemTime::now() + Duration::from_secs(3600));
        state.allocs.insert(victim);

        match admit(&mut state, &job, None) {
            Admission::NoCapacity { preempted } => {
                assert_eq!(
                    preempted,
                    vec![Victim {
                        job_id: 42,
                        user_id: 2002
                    }]
                );
            }
            other => panic!("unexpected verdict {other:?}"),
        }
        let alloc = state.allocs.find_job(42).unwrap();
        assert_eq!(alloc.state, crate::state::record::BufState::Teardown);
        assert!(alloc.cancelled);
        assert!(alloc.end_time.is_none());
    }

    #[test]
    fn test_no_preemption_of_imminent_use() {
        let mut state = state_with(10 * GIB, 5 * GIB);
        let job = job(1, 1001, 3600);
        state.plans.insert(1, plan(1, 1001, 6 * GIB));

        // Victim would be used before the candidate starts
        let mut victim = Allocation::new("42".to_string(), 42, 2002, 5 * GIB);
        victim.use_time = Some(SystemTime::now() + Duration::from_secs(60));
        state.allocs.insert(victim);

        match admit(&mut state, &job, None) {
            Admission::NoCapacity { preempted } => assert!(preempted.is_empty()),
            other => panic!("unexpected verdict {other:?}"),
        }
        assert!(!state.allocs.find_job(42).unwrap().cancelled);
    }

    #[test]
    fn test_user_deficit_charged_to_own_buffers_first() {
        let mut state = state_with(100 * GIB, 0);
        let job = job(1, 1001, 60);
        state.plans.insert(1, plan(1, 1001, 4 * GIB));

        // The user already holds 8 GiB against a 10 GiB limit.
        let mut own = Allocation::new("42".to_string(), 42, 1001, 8 * GIB);
        own.account = "acct".to_string();
        own.use_time = Some(SystemTime::now() + Duration::from_secs(3600));
        state.charge_new(own);
        let mut other = Allocation::new("43".to_string(), 43, 2002, 8 * GIB);
        other.use_time = Some(SystemTime::now() + Duration::from_secs(7200));
        state.allocs.insert(other);

        match admit(&mut state, &job, Some(10 * GIB)) {
            Admission::NoCapacity { preempted } => {
                assert_eq!(preempted.len(), 1);
                assert_eq!(preempted[0].job_id, 42);
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_probe_mode_does_not_preempt() {
        let mut state = state_with(10 * GIB, 5 * GIB);
        let job = job(1, 1001, 60);
        state.plans.insert(1, plan(1, 1001, 6 * GIB));
        let mut victim = Allocation::new("42".to_string(), 42, 2002, 5 * GIB);
        victim.use_time = Some(SystemTime::now() + Duration::from_secs(3600));
        state.allocs.insert(victim);

        let verdict = test_size_limit(
            &mut state,
            &job,
            &[],
            None,
            "datawarp",
            SystemTime::now(),
            AdmitMode::Probe,
        );
        match verdict {
            Admission::NoCapacity { preempted } => assert!(preempted.is_empty()),
            other => panic!("unexpected verdict {other:?}"),
        }
        assert!(!state.allocs.find_job(42).unwrap().cancelled);
    }
}
