//! Background synchronizer: periodically reconciles the in-memory tables
//! with the pools, instances and sessions the external subsystem reports,
//! enforces staging timeouts, reclaims vestigial buffers, and checkpoints
//! the durable limit state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::common::error::DwOpResult;
use crate::dw::client::DwFunction;
use crate::dw::report::{self, Instance, Pool, Session};
use crate::host::JobFailReason;
use crate::lifecycle::{self, run_step, StepOutcome};
use crate::service::Core;
use crate::state::record::{Allocation, BufState};
use crate::state::snapshot::{self, SnapshotRecord};
use crate::state::GresPool;
use crate::{JobId, UserId};

pub(crate) async fn agent_process(core: Arc<Core>) {
    initial_load(&core).await;
    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => break,
            _ = tokio::time::sleep(core.config.agent_interval) => {}
        }
        load_state(&core, false).await;
        refresh_assocs(&core);
        timeout_pass(&core);
        save_limits(&core);
    }
    log::debug!("Burst buffer agent terminating");
}

/// Startup pass: discover external state without attribution, re-apply the
/// snapshotted limit attribution, rebuild the usage counters, and tear down
/// buffers whose jobs the host no longer knows.
async fn initial_load(core: &Arc<Core>) {
    load_state(core, true).await;
    if !core.config.emulate {
        if let Some(configs) = fetch(core, DwFunction::ShowConfigurations, report::parse_configurations).await
        {
            log::debug!("DataWarp reports {} configurations", configs.len());
        }
    }
    recover_limit_state(core);
    {
        let mut state = core.lock_state();
        state.apply_limits();
    }
    refresh_assocs(core);
    purge_vestigial(core);
}

async fn fetch<T>(
    core: &Core,
    function: DwFunction,
    parse: fn(&str) -> DwOpResult<Vec<T>>,
) -> Option<Vec<T>> {
    match run_step(core, function, vec![], core.config.other_timeout).await {
        StepOutcome::Ok(output) => match parse(&output.stdout) {
            Ok(records) => Some(records),
            Err(e) => {
                log::error!("Cannot parse {} report: {e:?}", function.label());
                None
            }
        },
        StepOutcome::Failed(_) => None,
    }
}

fn job_id_of_token(token: &str) -> JobId {
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Pull pools, instances and sessions from the external subsystem and fold
/// them into the state tables. In emulation mode there is nothing external
/// to consult; capacity comes from configuration and the snapshot.
pub(crate) async fn load_state(core: &Arc<Core>, init: bool) {
    if core.config.emulate {
        return;
    }

    let Some(pools) = fetch(core, DwFunction::ShowPools, report::parse_pools).await else {
        log::error!("Failed to read DataWarp pool entries");
        return;
    };
    sync_pools(core, pools);

    let instances = fetch(core, DwFunction::ShowInstances, report::parse_instances)
        .await
        .unwrap_or_else(|| {
            log::info!("DataWarp reported no instances");
            Vec::new()
        });
    let Some(sessions) = fetch(core, DwFunction::ShowSessions, report::parse_sessions).await else {
        // Without a session report, every allocation would look vanished;
        // leave the load stamp alone and retry next pass.
        return;
    };
    sync_sessions(core, sessions, instances, init);
}

fn sync_pools(core: &Arc<Core>, pools: Vec<Pool>) {
    let mut state = core.lock_state();
    if state.default_pool.is_none() {
        if let Some(first) = pools.first() {
            log::info!("Setting default burst buffer pool to {}", first.id);
            state.default_pool = Some(first.id.clone());
        }
    }
    let default_pool = state.default_pool.clone();

    let mut gres_pools = Vec::new();
    for pool in pools {
        if default_pool.as_deref() == Some(pool.id.as_str()) {
            state.granularity = pool.granularity.max(1);
            state.total_space = pool.quantity * pool.granularity;
            state.used_space = pool.quantity.saturating_sub(pool.free) * pool.granularity;
        } else {
            gres_pools.push(GresPool {
                name: pool.id,
                granularity: pool.granularity.max(1),
                avail: pool.quantity,
                used: pool.quantity.saturating_sub(pool.free),
            });
        }
    }
    state.gres_pools = gres_pools;
}

fn sync_sessions(core: &Arc<Core>, sessions: Vec<Session>, instances: Vec<Instance>, init: bool) {
    let now = SystemTime::now();
    // An instance belongs to the session whose token matches its label.
    let instance_bytes: HashMap<&str, u64> = instances
        .iter()
        .map(|i| (i.label.as_str(), i.bytes))
        .collect();

    struct Newcomer {
        token: String,
        user_id: UserId,
        size: u64,
    }
    let mut need_defaults: Vec<Newcomer> = Vec::new();

    {
        let mut state = core.lock_state();
        state.last_load_time = Some(now);
        for session in &sessions {
            if let Some(alloc) = state.allocs.find_mut(&session.token, session.user_id) {
                alloc.seen_time = now;
                continue;
            }
            if !init {
                log::error!("Unexpected burst buffer {} found", session.token);
            }

            let size = instance_bytes.get(session.token.as_str()).copied().unwrap_or(0);
            let mut alloc = Allocation::new(
                session.token.clone(),
                job_id_of_token(&session.token),
                session.user_id,
                size,
            );
            alloc.seen_time = now;

            if init {
                // Attribution comes later from the snapshot
                state.adopt(alloc, false);
                continue;
            }
            // Copy attribution from any other buffer of the same user
            let donor = state
                .allocs
                .iter()
                .find(|a| a.user_id == session.user_id)
                .map(|a| (a.account.clone(), a.partition.clone(), a.qos.clone()));
            match donor {
                Some((account, partition, qos)) => {
                    alloc.account = account;
                    alloc.partition = partition;
                    alloc.qos = qos;
                    state.adopt(alloc, true);
                }
                None => need_defaults.push(Newcomer {
                    token: session.token.clone(),
                    user_id: session.user_id,
                    size,
                }),
            }
        }
    }

    // Accounting defaults require host calls, which never happen under the
    // state lock.
    for newcomer in need_defaults {
        let assoc = core.host.default_association(newcomer.user_id);
        let mut state = core.lock_state();
        if state.allocs.find(&newcomer.token, newcomer.user_id).is_some() {
            continue;
        }
        let mut alloc = Allocation::new(
            newcomer.token.clone(),
            job_id_of_token(&newcomer.token),
            newcomer.user_id,
            newcomer.size,
        );
        alloc.seen_time = now;
        alloc.account = assoc.account;
        alloc.partition = assoc.partition;
        alloc.qos = assoc.qos;
        alloc.assoc_id = assoc.assoc_id;
        state.adopt(alloc, true);
    }
}

/// Re-attribute account/partition/QoS from the limit snapshot onto the
/// allocations discovered from the external subsystem. In emulation mode the
/// snapshot is the only source, so missing allocations are recreated from it
/// (sizes included, job ids recovered from numeric names).
fn recover_limit_state(core: &Arc<Core>) {
    let records = match snapshot::load(&core.config.state_save_dir, core.config.emulate) {
        Ok(records) => records,
        Err(e) => {
            log::error!("Cannot recover burst buffer limit state: {e}");
            return;
        }
    };
    if records.is_empty() {
        return;
    }

    let now = SystemTime::now();
    let mut state = core.lock_state();
    let count = records.len();
    for record in records {
        if core.config.emulate && state.allocs.find(&record.name, record.user_id).is_none() {
            let mut alloc = Allocation::new(
                record.name.clone(),
                job_id_of_token(&record.name),
                record.user_id,
                record.size.unwrap_or(0),
            );
            alloc.seen_time = now;
            state.used_space += alloc.size;
            state.allocs.insert(alloc);
        }
        if let Some(alloc) = state.allocs.find_mut(&record.name, record.user_id) {
            alloc.account = record.account;
            alloc.partition = record.partition;
            alloc.qos = record.qos;
            alloc.create_time =
                SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(record.create_time.max(0) as u64);
            if let Some(size) = record.size {
                alloc.size = size;
            }
        }
    }
    log::info!("Recovered state of {count} burst buffers");
}

/// Refresh the cached non-owning accounting handles. They are lookup keys,
/// not references; each pass re-resolves them so staleness is bounded by the
/// agent interval.
fn refresh_assocs(core: &Arc<Core>) {
    let entries: Vec<(String, UserId, String, String)> = {
        let state = core.lock_state();
        state
            .allocs
            .iter()
            .map(|a| (a.name.clone(), a.user_id, a.account.clone(), a.partition.clone()))
            .collect()
    };
    for (name, user_id, account, partition) in entries {
        let assoc_id = core.host.association_id(user_id, &account, &partition);
        let mut state = core.lock_state();
        if let Some(alloc) = state.allocs.find_mut(&name, user_id) {
            alloc.assoc_id = assoc_id;
        }
    }
}

/// Tear down job buffers whose jobs the host scheduler no longer knows
/// (restart cleanup).
fn purge_vestigial(core: &Arc<Core>) {
    let jobs: Vec<(JobId, UserId)> = {
        let state = core.lock_state();
        state
            .allocs
            .iter()
            .filter(|a| a.job_id != 0)
            .map(|a| (a.job_id, a.user_id))
            .collect()
    };
    for (job_id, user_id) in jobs {
        if core.host.job(job_id).is_none() {
            log::info!("Purging vestigial buffer for job {job_id}");
            lifecycle::queue_teardown(core, job_id, user_id, false);
        }
    }
}

/// Timeout and reclamation scan, run on every agent pass:
/// vanished buffers are released, completed buffers of forgotten jobs are
/// dropped, and staging phases that outlived their configured threshold
/// force the job into teardown.
pub(crate) fn timeout_pass(core: &Arc<Core>) {
    let now = SystemTime::now();

    if !core.config.emulate {
        let mut state = core.lock_state();
        if let Some(last_load) = state.last_load_time {
            let stale: Vec<(String, UserId, JobId)> = state
                .allocs
                .iter()
                .filter(|a| a.seen_time < last_load)
                .map(|a| (a.name.clone(), a.user_id, a.job_id))
                .collect();
            for (name, user_id, job_id) in stale {
                if job_id == 0 {
                    log::info!("Persistent burst buffer {name} purged");
                } else {
                    log::debug!("Burst buffer for job {job_id} purged");
                }
                state.release(&name, user_id);
            }
        }
    }

    let complete: Vec<(String, UserId, JobId)> = {
        let state = core.lock_state();
        state
            .allocs
            .iter()
            .filter(|a| a.job_id != 0 && a.state == BufState::Complete)
            .map(|a| (a.name.clone(), a.user_id, a.job_id))
            .collect()
    };
    for (name, user_id, job_id) in complete {
        if core.host.job(job_id).is_none() {
            let mut state = core.lock_state();
            state.release(&name, user_id);
            state.plans.remove(&job_id);
        }
    }

    let overdue: Vec<(JobId, UserId, &'static str)> = {
        let state = core.lock_state();
        state
            .plans
            .values()
            .filter_map(|plan| {
                let (limit, phase) = match plan.state {
                    BufState::StagingIn => (core.config.stage_in_timeout, "stage-in"),
                    BufState::StagingOut => (core.config.stage_out_timeout, "stage-out"),
                    _ => return None,
                };
                let elapsed = now.duration_since(plan.state_time).unwrap_or_default();
                (elapsed > limit).then_some((plan.job_id, plan.user_id, phase))
            })
            .collect()
    };
    for (job_id, user_id, phase) in overdue {
        log::error!("Burst buffer {phase} timed out for job {job_id}");
        core.host.fail_job(
            job_id,
            JobFailReason::BurstBufferOp,
            format!("{}: {phase} timed out", core.plugin_label()),
        );
        {
            let mut state = core.lock_state();
            if let Some(plan) = state.plans.get_mut(&job_id) {
                plan.set_state(BufState::Teardown);
            }
            if let Some(alloc) = state.allocs.find_job_mut(job_id) {
                alloc.set_state(BufState::Teardown);
            }
        }
        lifecycle::queue_teardown(core, job_id, user_id, true);
    }

    {
        let mut state = core.lock_state();
        state.next_end_time = state.allocs.iter().filter_map(|a| a.end_time).min();
    }
}

/// Checkpoint the limit snapshot when a persistent buffer was created since
/// the last save. A failed write leaves the previous snapshot intact and is
/// retried on the next pass.
pub(crate) fn save_limits(core: &Arc<Core>) {
    let records = {
        let state = core.lock_state();
        let due = match (state.persist_create_time, state.last_save_time) {
            (Some(created), Some(saved)) => created > saved,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !due {
            return;
        }
        state
            .allocs
            .iter()
            .filter(|a| core.config.emulate || a.is_persistent())
            .map(|a| SnapshotRecord {
                account: a.account.clone(),
                create_time: a
                    .create_time
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
                name: a.name.clone(),
                partition: a.partition.clone(),
                qos: a.qos.clone(),
                user_id: a.user_id,
                size: core.config.emulate.then_some(a.size),
            })
            .collect::<Vec<_>>()
    };

    match snapshot::save(&core.config.state_save_dir, &records, core.config.emulate) {
        Ok(()) => {
            let mut state = core.lock_state();
            state.last_save_time = Some(SystemTime::now());
            log::debug!("Saved burst buffer limit state ({} records)", records.len());
        }
        Err(e) => log::error!("Cannot save burst buffer limit state: {e}"),
    }
}
