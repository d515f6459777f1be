use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use crate::common::error::DwOpResult;
use crate::common::size::dw_capacity_str;
use crate::dw::runner::{run_command, CmdOutput};
use crate::{JobId, UserId};

/// Caller tag reported to the CLI on setup.
const CALLER: &str = "SLURM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DwFunction {
    JobProcess,
    Paths,
    Setup,
    DataIn,
    PreRun,
    DataOut,
    PostRun,
    Teardown,
    CreatePersistent,
    ShowPools,
    ShowInstances,
    ShowSessions,
    ShowConfigurations,
}

impl DwFunction {
    /// Value of the `--function` flag.
    pub fn flag(&self) -> &'static str {
        match self {
            DwFunction::JobProcess => "job_process",
            DwFunction::Paths => "paths",
            DwFunction::Setup => "setup",
            DwFunction::DataIn => "data_in",
            DwFunction::PreRun => "pre_run",
            DwFunction::DataOut => "data_out",
            DwFunction::PostRun => "post_run",
            DwFunction::Teardown => "teardown",
            DwFunction::CreatePersistent => "create_persistent",
            DwFunction::ShowPools => "show_pools",
            DwFunction::ShowInstances => "show_instances",
            DwFunction::ShowSessions => "show_sessions",
            DwFunction::ShowConfigurations => "show_configurations",
        }
    }

    /// Name used in logs and job state descriptions. The staging steps keep
    /// their historical `dws_` prefixed names, which operators grep for.
    pub fn label(&self) -> &'static str {
        match self {
            DwFunction::DataIn => "dws_data_in",
            DwFunction::DataOut => "dws_data_out",
            DwFunction::PreRun => "dws_pre_run",
            DwFunction::PostRun => "dws_post_run",
            other => other.flag(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DwRequest {
    pub function: DwFunction,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl DwRequest {
    pub fn new(function: DwFunction, args: Vec<String>, timeout: Duration) -> Self {
        DwRequest {
            function,
            args,
            timeout,
        }
    }
}

/// Handler that can talk to the data-movement subsystem. The production
/// implementation shells out to the CLI; tests substitute a scripted stub.
pub trait DwBackend: Send + Sync + 'static {
    fn run(&self, request: DwRequest) -> Pin<Box<dyn Future<Output = DwOpResult<CmdOutput>> + Send>>;
}

pub struct DwCli {
    cli_path: PathBuf,
}

impl DwCli {
    pub fn new(cli_path: PathBuf) -> Self {
        DwCli { cli_path }
    }
}

impl DwBackend for DwCli {
    fn run(&self, request: DwRequest) -> Pin<Box<dyn Future<Output = DwOpResult<CmdOutput>> + Send>> {
        let program = self.cli_path.clone();
        Box::pin(async move {
            let mut argv = vec!["--function".to_string(), request.function.flag().to_string()];
            argv.extend(request.args);
            run_command(&program, &argv, request.timeout).await
        })
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn nid_flag(native: bool) -> &'static str {
    if native {
        "--nidlistfile"
    } else {
        "--nodehostnamefile"
    }
}

pub fn job_process_args(script: &Path) -> Vec<String> {
    vec!["--job".to_string(), path_arg(script)]
}

pub fn paths_args(script: &Path, job_id: JobId, path_file: &Path) -> Vec<String> {
    vec![
        "--job".to_string(),
        path_arg(script),
        "--token".to_string(),
        job_id.to_string(),
        "--pathfile".to_string(),
        path_arg(path_file),
    ]
}

pub fn setup_args(
    job_id: JobId,
    user_id: UserId,
    pool: &str,
    size: u64,
    script: &Path,
    nid_file: Option<&Path>,
    native: bool,
) -> Vec<String> {
    let mut args = vec![
        "--token".to_string(),
        job_id.to_string(),
        "--caller".to_string(),
        CALLER.to_string(),
        "--user".to_string(),
        user_id.to_string(),
        "--capacity".to_string(),
        format!("{}:{}", pool, dw_capacity_str(size)),
        "--job".to_string(),
        path_arg(script),
    ];
    if let Some(nid_file) = nid_file {
        args.push(nid_flag(native).to_string());
        args.push(path_arg(nid_file));
    }
    args
}

pub fn data_in_args(job_id: JobId, script: &Path) -> Vec<String> {
    vec![
        "--token".to_string(),
        job_id.to_string(),
        "--job".to_string(),
        path_arg(script),
    ]
}

pub fn pre_run_args(job_id: JobId, script: &Path, nid_file: Option<&Path>, native: bool) -> Vec<String> {
    let mut args = data_in_args(job_id, script);
    if let Some(nid_file) = nid_file {
        args.push(nid_flag(native).to_string());
        args.push(path_arg(nid_file));
    }
    args
}

pub fn data_out_args(job_id: JobId, script: &Path) -> Vec<String> {
    data_in_args(job_id, script)
}

pub fn post_run_args(job_id: JobId, script: &Path) -> Vec<String> {
    data_in_args(job_id, script)
}

/// Teardown of a job buffer (token = job id) or a persistent buffer
/// (token = buffer name).
pub fn teardown_args(token: &str, script: &Path, hurry: bool) -> Vec<String> {
    let mut args = vec![
        "--token".to_string(),
        token.to_string(),
        "--job".to_string(),
        path_arg(script),
    ];
    if hurry {
        args.push("--hurry".to_string());
    }
    args
}

pub fn create_persistent_args(
    name: &str,
    user_id: UserId,
    pool: &str,
    size: u64,
    access: Option<&str>,
    buffer_type: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        "CLI".to_string(),
        "-t".to_string(),
        name.to_string(),
        "-u".to_string(),
        user_id.to_string(),
        "-C".to_string(),
        format!("{pool}:{size}"),
    ];
    if let Some(access) = access {
        args.push("-a".to_string());
        args.push(access.to_string());
    }
    if let Some(buffer_type) = buffer_type {
        args.push("-T".to_string());
        args.push(buffer_type.to_string());
    }
    args
}
