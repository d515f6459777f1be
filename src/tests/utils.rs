//! Shared fixtures for cross-module scenario tests: a scripted stand-in for
//! the DataWarp CLI and an in-memory host scheduler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::common::error::DwOpResult;
use crate::dw::client::{DwBackend, DwFunction, DwRequest};
use crate::dw::runner::CmdOutput;
use crate::host::{
    AssocDefaults, BbReservation, HostScheduler, JobFailReason, JobInfo,
};
use crate::{JobId, UserId};

pub const GIB: u64 = 1 << 30;

// Stub DataWarp backend ------------------------------------------------------

/// Scripted CLI stand-in. Every request is recorded; responses come from a
/// per-function queue, falling back to a per-function default (empty reports
/// for the `show_*` family, plain success otherwise).
pub struct StubDw {
    calls: Mutex<Vec<(DwFunction, Vec<String>)>>,
    queued: Mutex<HashMap<DwFunction, VecDeque<CmdOutput>>>,
    defaults: Mutex<HashMap<DwFunction, CmdOutput>>,
}

impl StubDw {
    pub fn new() -> Arc<Self> {
        let stub = StubDw {
            calls: Mutex::new(Vec::new()),
            queued: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
        };
        stub.set_pool(16, 16, 1);
        stub.set_default(DwFunction::ShowInstances, CmdOutput::ok(r#"{"instances": []}"#));
        stub.set_default(DwFunction::ShowSessions, CmdOutput::ok(r#"{"sessions": []}"#));
        stub.set_default(
            DwFunction::ShowConfigurations,
            CmdOutput::ok(r#"{"configurations": []}"#),
        );
        Arc::new(stub)
    }

    /// Default pool report: `total`/`free` in GiB.
    pub fn set_pool(&self, total_gib: u64, free_gib: u64, granularity: u64) {
        let quantity = total_gib * GIB / granularity.max(1);
        let free = free_gib * GIB / granularity.max(1);
        self.set_default(
            DwFunction::ShowPools,
            CmdOutput::ok(&format!(
                r#"{{"pools": [{{"id": "wlm_pool", "units": "bytes", "granularity": {}, "quantity": {}, "free": {}}}]}}"#,
                granularity.max(1),
                quantity,
                free
            )),
        );
    }

    pub fn set_default(&self, function: DwFunction, output: CmdOutput) {
        self.defaults.lock().unwrap().insert(function, output);
    }

    pub fn push_response(&self, function: DwFunction, output: CmdOutput) {
        self.queued
            .lock()
            .unwrap()
            .entry(function)
            .or_default()
            .push_back(output);
    }

    pub fn calls(&self) -> Vec<(DwFunction, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, function: DwFunction) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, _)| *f == function)
            .count()
    }

    pub fn args_of(&self, function: DwFunction) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, _)| *f == function)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

impl DwBackend for StubDw {
    fn run(&self, request: DwRequest) -> Pin<Box<dyn Future<Output = DwOpResult<CmdOutput>> + Send>> {
        self.calls
            .lock()
            .unwrap()
            .push((request.function, request.args.clone()));
        let output = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&request.function)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.defaults.lock().unwrap().get(&request.function).cloned())
            .unwrap_or_else(|| CmdOutput::ok(""));
        Box::pin(async move { Ok(output) })
    }
}

// In-memory host scheduler ---------------------------------------------------

#[derive(Default)]
pub struct MemoryHost {
    jobs: Mutex<HashMap<JobId, JobInfo>>,
    failures: Mutex<HashMap<JobId, (JobFailReason, String)>>,
    env: Mutex<HashMap<JobId, Vec<String>>>,
    super_users: Mutex<HashSet<UserId>>,
    reservations: Mutex<Vec<BbReservation>>,
    kicks: AtomicUsize,
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryHost::default())
    }

    pub fn add_job(&self, job: JobInfo) {
        self.jobs.lock().unwrap().insert(job.job_id, job);
    }

    pub fn remove_job(&self, job_id: JobId) {
        self.jobs.lock().unwrap().remove(&job_id);
    }

    pub fn add_super_user(&self, user_id: UserId) {
        self.super_users.lock().unwrap().insert(user_id);
    }

    pub fn failure_of(&self, job_id: JobId) -> Option<(JobFailReason, String)> {
        self.failures.lock().unwrap().get(&job_id).cloned()
    }

    /// A failed job has been held (priority zero).
    pub fn is_held(&self, job_id: JobId) -> bool {
        self.failures.lock().unwrap().contains_key(&job_id)
    }

    pub fn env_of(&self, job_id: JobId) -> Vec<String> {
        self.env.lock().unwrap().get(&job_id).cloned().unwrap_or_default()
    }

    pub fn kick_count(&self) -> usize {
        self.kicks.load(Ordering::SeqCst)
    }
}

impl HostScheduler for MemoryHost {
    fn job(&self, job_id: JobId) -> Option<JobInfo> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    fn fail_job(&self, job_id: JobId, reason: JobFailReason, desc: String) {
        self.failures.lock().unwrap().insert(job_id, (reason, desc));
    }

    fn add_job_env(&self, job_id: JobId, env: Vec<String>) {
        self.env.lock().unwrap().entry(job_id).or_default().extend(env);
    }

    fn reservations(&self) -> Vec<BbReservation> {
        self.reservations.lock().unwrap().clone()
    }

    fn default_association(&self, _user_id: UserId) -> AssocDefaults {
        AssocDefaults {
            account: "default_acct".to_string(),
            partition: "default_part".to_string(),
            qos: "normal".to_string(),
            assoc_id: Some(1),
        }
    }

    fn is_super_user(&self, user_id: UserId) -> bool {
        self.super_users.lock().unwrap().contains(&user_id)
    }

    fn kick_scheduler(&self) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
    }
}

// Helpers --------------------------------------------------------------------

pub fn job_info(job_id: JobId, user_id: UserId, burst_buffer: &str) -> JobInfo {
    JobInfo {
        job_id,
        user_id,
        account: "science".to_string(),
        partition: "batch".to_string(),
        qos: "premium".to_string(),
        burst_buffer: burst_buffer.to_string(),
        script: None,
        is_pending: true,
        start_time: SystemTime::now() + Duration::from_secs(60),
        end_time: None,
        sched_nodes: Some("nid00[001-002]".to_string()),
        alloc_nodes: Some("nid00[001-002]".to_string()),
    }
}

/// Poll until `predicate` holds; panics after two seconds.
pub async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
