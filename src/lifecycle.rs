//! Per-job lifecycle workers. Every external command runs off the hot path
//! in a detached task; workers re-enter the state mutex to advance the plan,
//! which serializes the transitions of a single job id. The state mutex is
//! never held across an external command.

use std::sync::Arc;
use std::time::Duration;

use crate::common::fsutils;
use crate::common::size::{human_size, round_to_granularity};
use crate::dw::client::{
    self, DwFunction, DwRequest,
};
use crate::dw::runner::CmdOutput;
use crate::host::{JobFailReason, JobInfo};
use crate::service::Core;
use crate::state::record::{Allocation, BufState, PersistentAction};
use crate::state::BbState;
use crate::{JobId, UserId};

/// Fallback script handed to teardown when the job's own script is gone.
const DUMMY_SCRIPT: &str = "#!/bin/bash\nexit 0\n";

pub(crate) enum StepOutcome {
    Ok(CmdOutput),
    /// Human-readable failure (spawn error, timeout, or nonzero exit).
    Failed(String),
}

/// Run one external step and fold spawn errors and nonzero exits into a
/// single failure message for the job's state description.
pub(crate) async fn run_step(
    core: &Core,
    function: DwFunction,
    args: Vec<String>,
    timeout: Duration,
) -> StepOutcome {
    match core.dw.run(DwRequest::new(function, args, timeout)).await {
        Ok(output) if output.success() => StepOutcome::Ok(output),
        Ok(output) => {
            log::error!(
                "{} failed, status: {}, response: {}",
                function.label(),
                output.code,
                output.message()
            );
            StepOutcome::Failed(output.message().to_string())
        }
        Err(e) => {
            log::error!("{} could not run: {e:?}", function.label());
            StepOutcome::Failed(e.to_string())
        }
    }
}

fn fail_job_op(core: &Core, job_id: JobId, label: &str, message: &str) {
    core.host.fail_job(
        job_id,
        JobFailReason::BurstBufferOp,
        format!("{}: {}: {}", core.plugin_label(), label, message),
    );
}

fn teardown_token_gone(output: &CmdOutput) -> bool {
    let probe = |text: &str| text.to_lowercase().contains("token not found");
    probe(&output.stderr) || probe(&output.stdout)
}

// Stage-in ------------------------------------------------------------------

/// Write the per-job artifacts and launch the setup + data_in worker.
/// Caller has already moved the plan to `staging_in`.
pub(crate) fn queue_stage_in(
    core: &Arc<Core>,
    job: &JobInfo,
    total_bytes: u64,
    pool: String,
) -> anyhow::Result<()> {
    let state_dir = &core.config.state_save_dir;
    let dir = fsutils::create_job_dir(state_dir, job.job_id)?;
    let script = dir.join("script");

    let mut nid_file = None;
    if let Some(nodes) = &job.sched_nodes {
        let path = dir.join("client_nids");
        match fsutils::write_nid_file(&path, nodes, core.config.native_nid_files) {
            Ok(()) => nid_file = Some(path),
            Err(e) => log::error!("Cannot write nid file for job {}: {}", job.job_id, e),
        }
    }

    let setup_args = client::setup_args(
        job.job_id,
        job.user_id,
        &pool,
        total_bytes,
        &script,
        nid_file.as_deref(),
        core.config.native_nid_files,
    );
    let data_in_args = client::data_in_args(job.job_id, &script);

    let core = core.clone();
    let (job_id, user_id) = (job.job_id, job.user_id);
    tokio::spawn(async move {
        run_stage_in(core, job_id, user_id, setup_args, data_in_args).await;
    });
    Ok(())
}

async fn run_stage_in(
    core: Arc<Core>,
    job_id: JobId,
    user_id: UserId,
    setup_args: Vec<String>,
    data_in_args: Vec<String>,
) {
    match run_step(&core, DwFunction::Setup, setup_args, core.config.other_timeout).await {
        StepOutcome::Failed(message) => {
            stage_in_failed(&core, job_id, user_id, DwFunction::Setup.label(), &message);
            return;
        }
        StepOutcome::Ok(_) => {
            let job = core.host.job(job_id);
            let mut state = core.lock_state();
            let granularity = state.granularity;
            let alloc = match state.plans.get_mut(&job_id) {
                Some(plan) => {
                    plan.set_state(BufState::StagingIn);
                    let mut alloc = Allocation::new(job_id.to_string(), job_id, user_id, 0);
                    alloc.size = round_to_granularity(plan.total_bytes, granularity);
                    alloc.account = plan.account.clone();
                    alloc.partition = plan.partition.clone();
                    alloc.qos = plan.qos.clone();
                    alloc.state = BufState::StagingIn;
                    alloc.gres = plan.gres.clone();
                    if let Some(job) = &job {
                        alloc.use_time = Some(job.start_time);
                        alloc.end_time = job.end_time;
                    }
                    Some(alloc)
                }
                None => {
                    log::error!("Setup finished but no buffer plan exists for job {job_id}");
                    None
                }
            };
            if let Some(alloc) = alloc {
                log::debug!(
                    "Charged {} job buffer for job {job_id}",
                    human_size(alloc.size)
                );
                state.charge_new(alloc);
            }
        }
    }

    match run_step(
        &core,
        DwFunction::DataIn,
        data_in_args,
        core.config.stage_in_timeout,
    )
    .await
    {
        StepOutcome::Ok(_) => {
            {
                let mut state = core.lock_state();
                if let Some(plan) = state.plans.get_mut(&job_id) {
                    plan.set_state(BufState::StagedIn);
                }
                if let Some(alloc) = state.allocs.find_job_mut(job_id) {
                    alloc.set_state(BufState::StagedIn);
                }
            }
            log::debug!("Stage-in complete for job {job_id}");
            core.host.kick_scheduler();
        }
        StepOutcome::Failed(message) => {
            stage_in_failed(&core, job_id, user_id, DwFunction::DataIn.label(), &message);
        }
    }
}

fn stage_in_failed(core: &Arc<Core>, job_id: JobId, user_id: UserId, label: &str, message: &str) {
    fail_job_op(core, job_id, label, message);
    {
        let mut state = core.lock_state();
        if let Some(plan) = state.plans.get_mut(&job_id) {
            plan.set_state(BufState::Teardown);
        }
        if let Some(alloc) = state.allocs.find_job_mut(job_id) {
            alloc.set_state(BufState::Teardown);
        }
    }
    queue_teardown(core, job_id, user_id, true);
}

// Stage-out -----------------------------------------------------------------

/// Launch the data_out + post_run worker. Caller has already moved the plan
/// to `staging_out`.
pub(crate) fn queue_stage_out(core: &Arc<Core>, job: &JobInfo) {
    let script = fsutils::job_script_path(&core.config.state_save_dir, job.job_id);
    let data_out_args = client::data_out_args(job.job_id, &script);
    let post_run_args = client::post_run_args(job.job_id, &script);

    let core = core.clone();
    let (job_id, user_id) = (job.job_id, job.user_id);
    tokio::spawn(async move {
        run_stage_out(core, job_id, user_id, data_out_args, post_run_args).await;
    });
}

async fn run_stage_out(
    core: Arc<Core>,
    job_id: JobId,
    user_id: UserId,
    data_out_args: Vec<String>,
    post_run_args: Vec<String>,
) {
    let mut failure = None;
    match run_step(
        &core,
        DwFunction::DataOut,
        data_out_args,
        core.config.stage_out_timeout,
    )
    .await
    {
        StepOutcome::Ok(_) => {
            match run_step(
                &core,
                DwFunction::PostRun,
                post_run_args,
                core.config.other_timeout,
            )
            .await
            {
                StepOutcome::Ok(_) => {}
                StepOutcome::Failed(message) => {
                    failure = Some((DwFunction::PostRun.label(), message));
                }
            }
        }
        StepOutcome::Failed(message) => failure = Some((DwFunction::DataOut.label(), message)),
    }

    let hurry = match failure {
        None => {
            log::debug!("Stage-out complete for job {job_id}");
            false
        }
        Some((label, message)) => {
            fail_job_op(&core, job_id, label, &message);
            true
        }
    };
    {
        let mut state = core.lock_state();
        if let Some(plan) = state.plans.get_mut(&job_id) {
            plan.set_state(BufState::Teardown);
        }
        if let Some(alloc) = state.allocs.find_job_mut(job_id) {
            alloc.set_state(BufState::Teardown);
        }
    }
    queue_teardown(&core, job_id, user_id, hurry);
}

// Pre-run -------------------------------------------------------------------

pub(crate) fn queue_pre_run(core: &Arc<Core>, job: &JobInfo, nid_file: Option<std::path::PathBuf>) {
    let script = fsutils::job_script_path(&core.config.state_save_dir, job.job_id);
    let args = client::pre_run_args(
        job.job_id,
        &script,
        nid_file.as_deref(),
        core.config.native_nid_files,
    );
    let core = core.clone();
    let (job_id, user_id) = (job.job_id, job.user_id);
    tokio::spawn(async move {
        match run_step(&core, DwFunction::PreRun, args, core.config.other_timeout).await {
            StepOutcome::Ok(_) => {}
            StepOutcome::Failed(message) => {
                fail_job_op(&core, job_id, DwFunction::PreRun.label(), &message);
                {
                    let mut state = core.lock_state();
                    if let Some(plan) = state.plans.get_mut(&job_id) {
                        plan.set_state(BufState::Teardown);
                    }
                    if let Some(alloc) = state.allocs.find_job_mut(job_id) {
                        alloc.set_state(BufState::Teardown);
                    }
                }
                queue_teardown(&core, job_id, user_id, true);
            }
        }
    });
}

// Teardown ------------------------------------------------------------------

/// Enqueue a teardown of the job's buffers. Teardown runs for every job
/// that might have a buffer, so a missing script gets a generated stand-in.
pub(crate) fn queue_teardown(core: &Arc<Core>, job_id: JobId, user_id: UserId, hurry: bool) {
    let mut script = fsutils::job_script_path(&core.config.state_save_dir, job_id);
    if !script.exists() {
        script = core.config.state_save_dir.join("burst_buffer_script");
        if !script.exists() {
            if let Err(e) = fsutils::write_file(&script, DUMMY_SCRIPT) {
                log::error!("Cannot write fallback teardown script: {e}");
            }
        }
    }
    let args = client::teardown_args(&job_id.to_string(), &script, hurry);

    let core = core.clone();
    tokio::spawn(async move {
        run_teardown(core, job_id, user_id, args).await;
    });
}

async fn run_teardown(core: Arc<Core>, job_id: JobId, user_id: UserId, args: Vec<String>) {
    let result = core
        .dw
        .run(DwRequest::new(
            DwFunction::Teardown,
            args,
            core.config.other_timeout,
        ))
        .await;

    let settled = match &result {
        // The external subsystem legitimately may have no record of the
        // token; that teardown already happened is not a failure.
        Ok(output) => output.success() || teardown_token_gone(output),
        Err(_) => false,
    };
    if !settled {
        match result {
            Ok(output) => log::error!(
                "teardown for job {job_id} failed, status: {}, response: {}",
                output.code,
                output.message()
            ),
            Err(e) => log::error!("teardown for job {job_id} could not run: {e:?}"),
        }
        return;
    }

    let job_known = core.host.job(job_id).is_some();
    let mut state = core.lock_state();
    fsutils::purge_job_files(&core.config.state_save_dir, job_id);
    if job_known {
        let target = state
            .allocs
            .find_job(job_id)
            .map(|a| (a.name.clone(), a.user_id));
        if let Some((name, owner)) = target {
            state.release(&name, owner);
        }
        if let Some(plan) = state.plans.get_mut(&job_id) {
            plan.set_state(BufState::Complete);
        }
    } else {
        // Host restarted and forgot the job; clear the vestigial record.
        state.release(&job_id.to_string(), user_id);
        state.plans.remove(&job_id);
    }
}

// Persistent buffers --------------------------------------------------------

enum BufWork {
    Create {
        name: String,
        size: u64,
        access: Option<String>,
        buffer_type: Option<String>,
    },
    Destroy {
        name: String,
        hurry: bool,
        owner: UserId,
    },
}

/// Drive the persistent create/destroy sub-operations of a job's plan.
/// Returns the number of sub-operations still in flight; the plan cannot
/// proceed to staging until this reaches zero. Destroys are deferred until
/// the job is ready to run.
pub(crate) fn create_bufs(core: &Arc<Core>, job: &JobInfo, job_ready: bool) -> usize {
    let is_super = core.host.is_super_user(job.user_id);
    let mut pending = 0;
    let mut work = Vec::new();
    let mut denied: Vec<String> = Vec::new();

    {
        let mut guard = core.lock_state();
        let BbState {
            plans,
            allocs,
            limits,
            used_space,
            ..
        } = &mut *guard;
        let Some(plan) = plans.get_mut(&job.job_id) else {
            return 0;
        };
        let (account, partition, qos) =
            (plan.account.clone(), plan.partition.clone(), plan.qos.clone());

        let mut charged = 0u64;
        let mut plan_state = plan.state;
        for buf in plan.bufs.iter_mut() {
            match buf.action {
                PersistentAction::Use => continue,
                _ if buf.state == BufState::Allocating || buf.state == BufState::Deleting => {
                    pending += 1;
                }
                _ if buf.state != BufState::Pending => {}
                PersistentAction::Create => {
                    pending += 1;
                    charged += buf.size;
                    plan_state = BufState::Allocating;
                    buf.state = BufState::Allocating;
                    work.push(BufWork::Create {
                        name: buf.name.clone(),
                        size: buf.size,
                        access: buf.access.clone(),
                        buffer_type: buf.buffer_type.clone(),
                    });
                }
                PersistentAction::Destroy if job_ready => {
                    let Some(alloc) = allocs.find_by_name(&buf.name, job.user_id) else {
                        log::info!(
                            "destroy_persistent: no burst buffer named '{}' found for job {}",
                            buf.name,
                            job.job_id
                        );
                        continue;
                    };
                    pending += 1;
                    if alloc.user_id != job.user_id && !is_super {
                        log::info!(
                            "destroy_persistent: user {} may not destroy buffer {} owned by user {}",
                            job.user_id,
                            buf.name,
                            alloc.user_id
                        );
                        denied.push(buf.name.clone());
                        continue;
                    }
                    plan_state = BufState::Deleting;
                    buf.state = BufState::Deleting;
                    work.push(BufWork::Destroy {
                        name: buf.name.clone(),
                        hurry: buf.hurry,
                        owner: alloc.user_id,
                    });
                }
                PersistentAction::Destroy => {
                    pending += 1;
                }
            }
        }
        plan.state = plan_state;
        if charged > 0 {
            limits.add(job.user_id, &account, &partition, &qos, charged);
            *used_space += charged;
        }
    }

    for name in denied {
        core.host.fail_job(
            job.job_id,
            JobFailReason::BurstBufferOp,
            format!("{}: Delete buffer {} permission denied", core.plugin_label(), name),
        );
    }

    let pool = core.pool_name();
    for item in work {
        match item {
            BufWork::Create {
                name,
                size,
                access,
                buffer_type,
            } => {
                let args = client::create_persistent_args(
                    &name,
                    job.user_id,
                    &pool,
                    size,
                    access.as_deref(),
                    buffer_type.as_deref(),
                );
                let core = core.clone();
                let (job_id, user_id) = (job.job_id, job.user_id);
                tokio::spawn(async move {
                    run_create_persistent(core, job_id, user_id, name, size, args).await;
                });
            }
            BufWork::Destroy { name, hurry, owner } => {
                let core = core.clone();
                let job_id = job.job_id;
                tokio::spawn(async move {
                    run_destroy_persistent(core, job_id, owner, name, hurry).await;
                });
            }
        }
    }

    pending
}

async fn run_create_persistent(
    core: Arc<Core>,
    job_id: JobId,
    user_id: UserId,
    name: String,
    size: u64,
    args: Vec<String>,
) {
    match run_step(
        &core,
        DwFunction::CreatePersistent,
        args,
        core.config.other_timeout,
    )
    .await
    {
        StepOutcome::Ok(_) => {
            let mut state = core.lock_state();
            reset_buf_state(&mut state, user_id, job_id, &name, BufState::Allocated);
            let attribution = state.plans.get(&job_id).map(|plan| {
                (plan.account.clone(), plan.partition.clone(), plan.qos.clone())
            });
            // The limit charge was taken when the create was queued; only
            // the record itself is new here. Names are unique per user, so
            // a re-create refreshes the existing record.
            let known = state.allocs.find(&name, user_id).is_some();
            if known {
                if let Some(alloc) = state.allocs.find_mut(&name, user_id) {
                    alloc.size = size;
                    alloc.set_state(BufState::Allocated);
                }
            } else {
                let mut alloc = Allocation::new(name.clone(), 0, user_id, size);
                alloc.state = BufState::Allocated;
                if let Some((account, partition, qos)) = attribution {
                    alloc.account = account;
                    alloc.partition = partition;
                    alloc.qos = qos;
                }
                state.allocs.insert(alloc);
            }
            state.persist_create_time = Some(std::time::SystemTime::now());
            log::debug!("Created persistent burst buffer {name} for job {job_id}");
        }
        StepOutcome::Failed(message) => {
            fail_job_op(
                &core,
                job_id,
                DwFunction::CreatePersistent.label(),
                &message,
            );
            let mut state = core.lock_state();
            reset_buf_state(&mut state, user_id, job_id, &name, BufState::Pending);
        }
    }
}

async fn run_destroy_persistent(
    core: Arc<Core>,
    job_id: JobId,
    user_id: UserId,
    name: String,
    hurry: bool,
) {
    let script = fsutils::job_script_path(&core.config.state_save_dir, job_id);
    let args = client::teardown_args(&name, &script, hurry);
    let result = core
        .dw
        .run(DwRequest::new(
            DwFunction::Teardown,
            args,
            core.config.other_timeout,
        ))
        .await;

    let settled = match &result {
        Ok(output) => output.success() || teardown_token_gone(output),
        Err(_) => false,
    };
    if settled {
        let mut state = core.lock_state();
        reset_buf_state(&mut state, user_id, job_id, &name, BufState::Deleted);
        if let Some(alloc) = state.allocs.find_mut(&name, user_id) {
            alloc.set_state(BufState::Complete);
            alloc.job_id = job_id;
        }
        state.release(&name, user_id);
        log::debug!("Destroyed persistent burst buffer {name} for job {job_id}");
    } else {
        let message = match result {
            Ok(output) => output.message().to_string(),
            Err(e) => e.to_string(),
        };
        fail_job_op(&core, job_id, "destroy_persistent", &message);
        let mut state = core.lock_state();
        reset_buf_state(&mut state, user_id, job_id, &name, BufState::Pending);
    }
}

/// Settle one persistent sub-operation and derive the plan's aggregate
/// state: once no sub-operation is active, `allocating` becomes `allocated`
/// and `deleting` becomes `deleted`. A create rolled back to `pending`
/// returns its optimistic limit charge.
fn reset_buf_state(
    state: &mut BbState,
    user_id: UserId,
    job_id: JobId,
    name: &str,
    new_state: BufState,
) {
    let Some(plan) = state.plans.get_mut(&job_id) else {
        log::error!("Could not find buffer plan for job {job_id}");
        return;
    };
    let (account, partition, qos) =
        (plan.account.clone(), plan.partition.clone(), plan.qos.clone());

    let mut decharge = 0u64;
    if let Some(buf) = plan.bufs.iter_mut().find(|b| b.name == name) {
        let old_state = buf.state;
        buf.state = new_state;
        if old_state == BufState::Allocating && new_state == BufState::Pending {
            decharge = buf.size;
        }
    }

    let active = plan.bufs.iter().any(|b| b.is_active());
    if !active {
        if plan.state == BufState::Allocating {
            plan.state = BufState::Allocated;
        } else if plan.state == BufState::Deleting {
            plan.state = BufState::Deleted;
        }
    }

    if decharge > 0 {
        state
            .limits
            .remove(user_id, &account, &partition, &qos, decharge);
        state.used_space = state.used_space.saturating_sub(decharge);
    }
}
