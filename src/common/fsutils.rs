use std::path::{Path, PathBuf};

use crate::JobId;

/// Per-job artifact directory: `<state_dir>/hash.<jid % 10>/job.<jid>`.
pub fn job_dir(state_dir: &Path, job_id: JobId) -> PathBuf {
    state_dir
        .join(format!("hash.{}", job_id % 10))
        .join(format!("job.{job_id}"))
}

pub fn create_job_dir(state_dir: &Path, job_id: JobId) -> std::io::Result<PathBuf> {
    let dir = job_dir(state_dir, job_id);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn job_script_path(state_dir: &Path, job_id: JobId) -> PathBuf {
    job_dir(state_dir, job_id).join("script")
}

pub fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)
}

/// Write the job's compute nodes, one per line, for the CLI's node-list
/// flags. `native` selects numeric nids over host names.
pub fn write_nid_file(path: &Path, node_list: &str, native: bool) -> std::io::Result<()> {
    use crate::common::strutils::{expand_host_list, numeric_nids};

    let hosts = expand_host_list(node_list);
    let lines = if native { numeric_nids(&hosts) } else { hosts };
    if lines.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("node list '{node_list}' has no usable entries"),
        ));
    }
    let mut buf = lines.join("\n");
    buf.push('\n');
    write_file(path, &buf)
}

/// Remove the files created for a job and its directory. Missing files are
/// not an error; teardown runs for every job that might have had a buffer.
pub fn purge_job_files(state_dir: &Path, job_id: JobId) {
    let dir = job_dir(state_dir, job_id);
    for name in [
        "script",
        "client_nids",
        "pathfile",
        "setup_env",
        "data_in_env",
        "pre_run_env",
        "post_run_env",
        "data_out_env",
        "teardown_env",
    ] {
        let _ = std::fs::remove_file(dir.join(name));
    }
    let _ = std::fs::remove_dir(&dir);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_dir_layout() {
        let dir = job_dir(Path::new("/var/spool/bb"), 1234);
        assert_eq!(dir, Path::new("/var/spool/bb/hash.4/job.1234"));
    }

    #[test]
    fn test_purge_job_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = create_job_dir(tmp.path(), 7).unwrap();
        write_file(&dir.join("script"), "#!/bin/bash\n").unwrap();
        write_file(&dir.join("client_nids"), "1\n2\n").unwrap();
        purge_job_files(tmp.path(), 7);
        assert!(!dir.exists());
    }
}
