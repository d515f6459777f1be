//! Entry points invoked by the host scheduler. Each operation is a thin
//! layer over the parser, the planner and the lifecycle workers; none of
//! them blocks on an external command except submit-time validation, which
//! deliberately runs the (fast) validation functions inline so the user gets
//! an immediate answer.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::agent;
use crate::common::error::DwError;
use crate::common::fsutils;
use crate::common::size::{bytes_to_mb, parse_capacity, round_to_granularity, Capacity};
use crate::config::BufferConfig;
use crate::directive::{self, PlanSpec};
use crate::dw::client::{self, DwBackend, DwFunction};
use crate::host::{HostScheduler, JobDescriptor, JobFailReason, JobInfo};
use crate::lifecycle::{self, run_step, StepOutcome};
use crate::sched::{self, AdmitMode, Admission};
use crate::state::limits::UserUsage;
use crate::state::record::{BufState, BufferPlan};
use crate::state::{BbState, GresPool};
use crate::{JobId, UserId};

const MB: u64 = 1024 * 1024;
const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Shared innards of the service: the single state mutex plus the handles to
/// the host scheduler and the external subsystem.
pub struct Core {
    pub(crate) config: BufferConfig,
    pub(crate) state: Mutex<BbState>,
    pub(crate) host: Arc<dyn HostScheduler>,
    pub(crate) dw: Arc<dyn DwBackend>,
    pub(crate) cancel: CancellationToken,
}

impl Core {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BbState> {
        self.state.lock().expect("burst buffer state mutex poisoned")
    }

    pub(crate) fn plugin_label(&self) -> String {
        format!("burst_buffer/{}", self.config.plugin_name)
    }

    pub(crate) fn pool_name(&self) -> String {
        self.lock_state()
            .default_pool
            .clone()
            .unwrap_or_else(|| "wlm_pool".to_string())
    }
}

/// Stage-in / stage-out progress as reported to the host scheduler:
/// `1` done, `0` in progress, `-1` not started or failed.
pub type StageStatus = i8;

#[derive(Debug, Serialize)]
pub struct AllocationReport {
    pub name: String,
    pub job_id: JobId,
    pub user_id: UserId,
    pub size: u64,
    pub account: String,
    pub partition: String,
    pub qos: String,
    pub state: BufState,
    pub create_time: u64,
}

/// Public state for operator queries; the RPC wire format is the host's
/// concern.
#[derive(Debug, Serialize)]
pub struct StateReport {
    pub name: String,
    pub total_space: u64,
    pub used_space: u64,
    pub granularity: u64,
    pub default_pool: Option<String>,
    pub gres_pools: Vec<GresPool>,
    pub allocations: Vec<AllocationReport>,
    pub usage: Vec<UserUsage>,
}

#[derive(Clone)]
pub struct BbService {
    core: Arc<Core>,
}

/// Build the service together with its background process. The returned
/// future performs the initial external sync + limit recovery and then runs
/// the periodic agent; spawn it on the runtime that hosts the workers.
pub fn create_service(
    config: BufferConfig,
    host: Arc<dyn HostScheduler>,
    dw: Arc<dyn DwBackend>,
) -> (BbService, impl Future<Output = ()>) {
    let state = BbState::new(&config);
    let core = Arc::new(Core {
        config,
        state: Mutex::new(state),
        host,
        dw,
        cancel: CancellationToken::new(),
    });
    let process = agent::agent_process(core.clone());
    (BbService { core }, process)
}

impl BbService {
    /// Submit-time validation: translate the job's directives into the
    /// canonical burst-buffer string, then check permissions and the user
    /// size limit. Parse and permission errors are returned synchronously;
    /// the job never enters the plan table.
    pub fn job_validate(&self, desc: &mut JobDescriptor, submit_uid: UserId) -> crate::Result<()> {
        let core = &self.core;
        let persist_allowed =
            core.config.enable_persistent || core.host.is_operator(submit_uid);
        let granularity = core.lock_state().granularity;

        let spec = match &desc.script {
            Some(script) => directive::parse_batch_script(
                script,
                desc.max_nodes,
                persist_allowed,
                granularity,
            )?,
            None => match &desc.burst_buffer {
                Some(buffer_spec) => {
                    directive::parse_interactive(buffer_spec, desc.max_nodes, granularity)?
                }
                None => None,
            },
        };

        let Some(spec) = spec else {
            desc.burst_buffer = None;
            return Ok(());
        };
        desc.burst_buffer = Some(directive::encode(&spec));

        if desc.user_id == 0 {
            return Err(DwError::PermissionDenied(
                "user root may not allocate burst buffers".to_string(),
            ));
        }
        if !core.config.user_allowed(desc.user_id) {
            return Err(DwError::PermissionDenied(format!(
                "user {} is not permitted to use burst buffers",
                desc.user_id
            )));
        }

        let state = core.lock_state();
        if !state.limits.within_user_limit(
            desc.user_id,
            spec.validate_size(),
            core.config.user_size_limit,
        ) {
            return Err(DwError::LimitExceeded(format!(
                "burst buffer request of {} bytes exceeds the per-user limit",
                spec.validate_size()
            )));
        }
        Ok(())
    }

    /// Secondary validation, after the job has an id: write the per-job
    /// artifacts, let the CLI validate the script (`job_process`), fetch the
    /// buffer environment variables (`paths`), and start stage-in right away
    /// when capacity allows.
    pub async fn job_validate2(&self, job: &JobInfo) -> crate::Result<()> {
        let core = &self.core;
        if !job.has_burst_buffer() {
            return Ok(());
        }
        let Some(spec) = self.build_plan(job) else {
            return Ok(());
        };

        let dir = fsutils::create_job_dir(&core.config.state_save_dir, job.job_id)
            .map_err(DwError::SnapshotIo)?;
        let script_path = dir.join("script");
        let script_body = match &job.script {
            Some(body) => body.clone(),
            None => directive::build_job_script(&spec),
        };
        fsutils::write_file(&script_path, &script_body).map_err(DwError::SnapshotIo)?;

        let outcome = run_step(
            core,
            DwFunction::JobProcess,
            client::job_process_args(&script_path),
            core.config.validate_timeout,
        )
        .await;
        if let StepOutcome::Failed(message) = outcome {
            self.drop_plan(job.job_id);
            return Err(DwError::InvalidRequest(format!(
                "{}: {}",
                core.plugin_label(),
                message
            )));
        }

        let path_file = dir.join("pathfile");
        let outcome = run_step(
            core,
            DwFunction::Paths,
            client::paths_args(&script_path, job.job_id, &path_file),
            core.config.validate_timeout,
        )
        .await;
        match outcome {
            StepOutcome::Failed(message) => {
                self.drop_plan(job.job_id);
                return Err(DwError::InvalidRequest(format!(
                    "{}: {}",
                    core.plugin_label(),
                    message
                )));
            }
            StepOutcome::Ok(_) => {
                if let Ok(content) = std::fs::read_to_string(&path_file) {
                    let env: Vec<String> = content
                        .lines()
                        .filter(|line| line.contains('='))
                        .map(str::to_string)
                        .collect();
                    if !env.is_empty() {
                        core.host.add_job_env(job.job_id, env);
                    }
                }
            }
        }

        // Start buffer allocation and stage-in immediately if space allows
        let verdict = self.admit(job, AdmitMode::Schedule);
        match verdict {
            Admission::Start => {
                let _ = self.alloc_job_bb(job, false);
            }
            Admission::NoCapacity { preempted } => self.teardown_victims(preempted),
            Admission::OverLimit => {}
        }
        Ok(())
    }

    /// The job's burst-buffer TRES request in MB (job scratch only,
    /// persistent buffers excluded).
    pub fn job_set_tres_cnt(&self, job: &JobInfo) -> u64 {
        if self.build_plan(job).is_none() {
            return 0;
        }
        let state = self.core.lock_state();
        state
            .plans
            .get(&job.job_id)
            .map(|plan| plan.total_bytes / MB)
            .unwrap_or(0)
    }

    /// Best guess of when the job's buffers could be allocated.
    pub fn job_get_est_start(&self, job: &JobInfo) -> SystemTime {
        let now = SystemTime::now();
        if !job.has_burst_buffer() || self.build_plan(job).is_none() {
            return now;
        }

        let core = &self.core;
        let (plan_state, only_persistent_ops, next_end_time) = {
            let state = core.lock_state();
            let plan = &state.plans[&job.job_id];
            (
                plan.state,
                plan.total_bytes == 0 && plan.persist_add == 0 && plan.swap_gib == 0,
                state.next_end_time,
            )
        };

        if only_persistent_ops {
            // Only deleting or using persistent buffers, can run now
            now
        } else if plan_state == BufState::Pending {
            match self.admit(job, AdmitMode::Probe) {
                Admission::Start => now,
                Admission::OverLimit => now + YEAR,
                Admission::NoCapacity { .. } => next_end_time
                    .map(|end| end.max(now))
                    .unwrap_or(now + Duration::from_secs(1)),
            }
        } else {
            // Allocation or staging already in progress
            now + Duration::from_secs(1)
        }
    }

    /// Walk the pending queue in start-time order and begin stage-in for
    /// every job the planner admits. A capacity verdict stops the walk; a
    /// limit verdict only skips the candidate.
    pub fn try_stage_in(&self, queue: &[JobInfo]) {
        let core = &self.core;
        let mut candidates: Vec<&JobInfo> = queue
            .iter()
            .filter(|job| job.is_pending && job.has_burst_buffer())
            .filter(|job| self.build_plan(job).is_some())
            .collect();
        candidates.sort_by_key(|job| job.start_time);

        self.refresh_use_times();

        for job in candidates {
            let already_staging = {
                let state = core.lock_state();
                state
                    .plans
                    .get(&job.job_id)
                    .map_or(false, |plan| plan.state >= BufState::StagingIn)
            };
            if already_staging {
                continue;
            }
            match self.admit(job, AdmitMode::Schedule) {
                Admission::Start => {
                    let _ = self.alloc_job_bb(job, true);
                }
                Admission::OverLimit => continue,
                Admission::NoCapacity { preempted } => {
                    self.teardown_victims(preempted);
                    break;
                }
            }
        }
    }

    /// `1` staged in, `0` stage-in underway, `-1` not started (optionally
    /// starting it now when `test_only` is false).
    pub fn job_test_stage_in(&self, job: &JobInfo, test_only: bool) -> StageStatus {
        if !job.has_burst_buffer() {
            return 1;
        }
        if self.build_plan(job).is_none() {
            return -1;
        }
        let (plan_state, total_bytes) = {
            let state = self.core.lock_state();
            let plan = &state.plans[&job.job_id];
            (plan.state, plan.total_bytes)
        };

        if plan_state < BufState::StagingIn {
            if !test_only
                && matches!(self.admit(job, AdmitMode::Schedule), Admission::Start)
                && self.alloc_job_bb(job, false).unwrap_or(false)
            {
                if total_bytes == 0 {
                    return 1; // Persistent work only, nothing to stage
                }
                return 0;
            }
            -1
        } else if plan_state == BufState::StagingIn {
            0
        } else {
            1
        }
    }

    /// Claim the buffers for a starting job: finish pending persistent work,
    /// record the allocated nodes, and run `pre_run`.
    pub fn job_begin(&self, job: &JobInfo) -> crate::Result<()> {
        let core = &self.core;
        if !job.has_burst_buffer() {
            return Ok(());
        }
        let Some(nodes) = &job.alloc_nodes else {
            return Err(DwError::Generic(format!(
                "job {} lacks a node allocation",
                job.job_id
            )));
        };
        if self.build_plan(job).is_none() {
            core.host.fail_job(
                job.job_id,
                JobFailReason::BurstBufferOp,
                "Could not find burst buffer record".to_string(),
            );
            lifecycle::queue_teardown(core, job.job_id, job.user_id, true);
            return Err(DwError::Generic(format!(
                "no burst buffer record for job {}",
                job.job_id
            )));
        }

        if lifecycle::create_bufs(core, job, true) > 0 {
            core.host.fail_job(
                job.job_id,
                JobFailReason::BurstBufferOp,
                "Error managing persistent burst buffers".to_string(),
            );
            lifecycle::queue_teardown(core, job.job_id, job.user_id, true);
            return Err(DwError::external(
                "create_persistent",
                "persistent buffer work still pending at job start",
            ));
        }

        let dir = fsutils::job_dir(&core.config.state_save_dir, job.job_id);
        let nid_file = dir.join("client_nids");
        let nid_file = match fsutils::write_nid_file(&nid_file, nodes, core.config.native_nid_files)
        {
            Ok(()) => Some(nid_file),
            Err(e) => {
                log::error!("Cannot write nid file for job {}: {}", job.job_id, e);
                None
            }
        };

        {
            let mut state = core.lock_state();
            if let Some(plan) = state.plans.get_mut(&job.job_id) {
                plan.set_state(BufState::Running);
            }
        }
        lifecycle::queue_pre_run(core, job, nid_file);
        Ok(())
    }

    /// Enqueue the stage-out → post-run → teardown pipeline.
    pub fn job_start_stage_out(&self, job: &JobInfo) {
        let core = &self.core;
        if !job.has_burst_buffer() || self.build_plan(job).is_none() {
            return;
        }
        let mut teardown_only = false;
        {
            let mut state = core.lock_state();
            let Some(plan) = state.plans.get_mut(&job.job_id) else {
                return;
            };
            if !plan.has_job_scratch() {
                plan.set_state(BufState::Teardown);
                teardown_only = true;
            } else if plan.state < BufState::StagingOut {
                plan.set_state(BufState::StagingOut);
            } else {
                return;
            }
        }
        if teardown_only {
            lifecycle::queue_teardown(core, job.job_id, job.user_id, false);
        } else {
            lifecycle::queue_stage_out(core, job);
        }
    }

    /// `1` stage-out finished, `0` underway, `-1` never started.
    pub fn job_test_stage_out(&self, job: &JobInfo) -> StageStatus {
        if !job.has_burst_buffer() {
            return 1;
        }
        let state = self.core.lock_state();
        let Some(plan) = state.plans.get(&job.job_id) else {
            // No job buffers; the job only used persistent buffers
            return 1;
        };
        if plan.state < BufState::StagingOut {
            -1
        } else if plan.state == BufState::StagingOut {
            0
        } else {
            1
        }
    }

    /// Terminate staging and release all buffer resources of the job.
    /// Persistent-buffer actions that already completed are not reversed.
    pub fn job_cancel(&self, job: &JobInfo) {
        let core = &self.core;
        let proceed = {
            let mut state = core.lock_state();
            let proceed = match state.plans.get_mut(&job.job_id) {
                None => false,
                Some(plan) if plan.state == BufState::Pending => false,
                Some(plan) => {
                    plan.set_state(BufState::Teardown);
                    true
                }
            };
            if proceed {
                if let Some(alloc) = state.allocs.find_job_mut(job.job_id) {
                    alloc.set_state(BufState::Teardown);
                }
            }
            proceed
        };
        if proceed {
            lifecycle::queue_teardown(core, job.job_id, job.user_id, true);
        }
    }

    /// Serialize the public state for operator queries. With private data
    /// enabled, non-operators only see their own buffers.
    pub fn state_report(&self, uid: Option<UserId>) -> StateReport {
        let core = &self.core;
        let filter_uid = match uid {
            Some(uid) if core.config.private_data && !core.host.is_operator(uid) => Some(uid),
            _ => None,
        };
        let state = core.lock_state();
        let allocations = state
            .allocs
            .iter()
            .filter(|a| filter_uid.map_or(true, |uid| a.user_id == uid))
            .map(|a| AllocationReport {
                name: a.name.clone(),
                job_id: a.job_id,
                user_id: a.user_id,
                size: a.size,
                account: a.account.clone(),
                partition: a.partition.clone(),
                qos: a.qos.clone(),
                state: a.state,
                create_time: a
                    .create_time
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            })
            .collect();
        StateReport {
            name: core.config.plugin_name.clone(),
            total_space: state.total_space,
            used_space: state.used_space,
            granularity: state.granularity,
            default_pool: state.default_pool.clone(),
            gres_pools: state.gres_pools.clone(),
            allocations,
            usage: state.limits.user_usage(),
        }
    }

    /// Translate a raw burst-buffer size list (`[pool:]size[,...]`) into the
    /// host's TRES counting unit (MB).
    pub fn xlate_bb_to_tres(&self, buffer_spec: &str) -> Option<String> {
        let core = &self.core;
        let granularity = core.lock_state().granularity;
        let mut total_mb = 0u64;
        for token in buffer_spec.split(',') {
            let token = match token.split_once(':') {
                Some((pool, rest)) => {
                    if pool != core.config.plugin_name {
                        continue;
                    }
                    rest
                }
                None => token,
            };
            if let Ok(Capacity::Bytes(bytes)) = parse_capacity(token) {
                total_mb += bytes_to_mb(round_to_granularity(bytes, granularity));
            }
        }
        (total_mb > 0).then(|| format!("{}={}", core.config.plugin_name, total_mb))
    }

    /// Total burst-buffer capacity in MB.
    pub fn system_size_mb(&self) -> u64 {
        self.core.lock_state().total_space / MB
    }

    /// Stop the background agent. Pending workers finish on their own.
    pub fn shutdown(&self) {
        self.core.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    // Internal ---------------------------------------------------------------

    /// Decode the job's canonical string into a cached plan. Returns the
    /// decoded spec (or `None` when the job requests no buffers).
    fn build_plan(&self, job: &JobInfo) -> Option<PlanSpec> {
        if !job.has_burst_buffer() {
            return None;
        }
        let mut state = self.core.lock_state();
        let granularity = state.granularity;
        let spec = directive::decode(&job.burst_buffer, granularity)?;
        if !state.plans.contains_key(&job.job_id) {
            let plan = BufferPlan {
                job_id: job.job_id,
                user_id: job.user_id,
                account: job.account.clone(),
                partition: job.partition.clone(),
                qos: job.qos.clone(),
                state: BufState::Pending,
                state_time: SystemTime::now(),
                total_bytes: spec.job_bytes,
                persist_add: spec.persist_add(),
                swap_gib: spec.swap_gib,
                swap_nodes: spec.swap_nodes,
                access: spec.access.clone(),
                buffer_type: spec.buffer_type.clone(),
                gres: spec.gres.clone(),
                bufs: spec.bufs.clone(),
                use_persistent: spec.uses_persistent(),
                canonical: job.burst_buffer.clone(),
            };
            state.plans.insert(job.job_id, plan);
        }
        Some(spec)
    }

    fn drop_plan(&self, job_id: JobId) {
        self.core.lock_state().plans.remove(&job_id);
    }

    fn admit(&self, job: &JobInfo, mode: AdmitMode) -> Admission {
        let core = &self.core;
        let reservations = core.host.reservations();
        let mut state = core.lock_state();
        sched::test_size_limit(
            &mut state,
            job,
            &reservations,
            core.config.user_size_limit,
            &core.config.plugin_name,
            SystemTime::now(),
            mode,
        )
    }

    fn teardown_victims(&self, victims: Vec<sched::Victim>) {
        for victim in victims {
            lifecycle::queue_teardown(&self.core, victim.job_id, victim.user_id, true);
        }
    }

    /// Refresh projected buffer use times from the host's current start
    /// estimates before an admission pass.
    fn refresh_use_times(&self) {
        let core = &self.core;
        let job_ids: Vec<JobId> = {
            let state = core.lock_state();
            state
                .allocs
                .iter()
                .filter(|a| a.job_id != 0)
                .map(|a| a.job_id)
                .collect()
        };
        for job_id in job_ids {
            let info = core.host.job(job_id);
            let mut state = core.lock_state();
            if let Some(alloc) = state.allocs.find_job_mut(job_id) {
                match &info {
                    Some(info) => {
                        alloc.use_time = Some(info.start_time);
                        alloc.end_time = info.end_time;
                    }
                    None => alloc.use_time = None,
                }
            }
        }
    }

    /// Allocate buffers for an admitted job: finish persistent work first,
    /// then launch stage-in (or jump straight to `staged_in` when the plan
    /// has no job scratch). Returns `Ok(true)` once staging was started or
    /// nothing needed staging.
    fn alloc_job_bb(&self, job: &JobInfo, job_ready: bool) -> crate::Result<bool> {
        let core = &self.core;
        if lifecycle::create_bufs(core, job, job_ready) > 0 {
            return Ok(false);
        }
        let pool = core.pool_name();
        let stage = {
            let mut state = core.lock_state();
            let Some(plan) = state.plans.get_mut(&job.job_id) else {
                return Ok(true);
            };
            if plan.has_job_scratch() {
                if plan.state < BufState::StagingIn {
                    plan.set_state(BufState::StagingIn);
                    Some(plan.total_bytes)
                } else {
                    None
                }
            } else {
                if plan.state < BufState::StagedIn {
                    plan.set_state(BufState::StagedIn);
                }
                None
            }
        };
        if let Some(total_bytes) = stage {
            if let Err(e) = lifecycle::queue_stage_in(core, job, total_bytes, pool) {
                log::error!("Cannot queue stage-in for job {}: {e:?}", job.job_id);
                {
                    let mut state = core.lock_state();
                    if let Some(plan) = state.plans.get_mut(&job.job_id) {
                        plan.set_state(BufState::Teardown);
                    }
                }
                lifecycle::queue_teardown(core, job.job_id, job.user_id, true);
                return Err(DwError::Generic(e.to_string()));
            }
        }
        Ok(true)
    }
}
