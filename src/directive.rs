//! Translation of job-script `#BB`/`#DW` directives (or an interactive
//! buffer string) into the canonical burst-buffer specification, and back.
//! The canonical string is the durable representation: it is stored on the
//! job record at submit time and every later phase decodes it instead of the
//! raw script.

use crate::common::error::DwError;
use crate::common::size::{dw_capacity_str, parse_capacity, round_to_granularity, Capacity};
use crate::state::record::{GresRequest, PersistentAction, PersistentReq};

const GIB: u64 = 1 << 30;

/// Decoded burst-buffer specification of one job. Persistent operations keep
/// their script order so that encoding is a faithful inverse of decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSpec {
    /// Job-scratch bytes reported in `SLURM_JOB=SIZE=`; swap space is
    /// already folded in.
    pub job_bytes: u64,
    pub access: Option<String>,
    pub buffer_type: Option<String>,
    pub swap_gib: u64,
    pub swap_nodes: u64,
    pub gres: Vec<GresRequest>,
    pub bufs: Vec<PersistentReq>,
}

impl PlanSpec {
    pub fn is_empty(&self) -> bool {
        self.job_bytes == 0 && self.swap_gib == 0 && self.gres.is_empty() && self.bufs.is_empty()
    }

    /// Sum of embedded persistent-create sizes.
    pub fn persist_add(&self) -> u64 {
        self.bufs
            .iter()
            .filter(|b| b.action == PersistentAction::Create)
            .map(|b| b.size)
            .sum()
    }

    /// Bytes counted against the submitting user at validation time.
    pub fn validate_size(&self) -> u64 {
        self.job_bytes + self.persist_add()
    }

    pub fn uses_persistent(&self) -> bool {
        self.bufs.iter().any(|b| b.action == PersistentAction::Use)
    }
}

fn invalid(message: impl Into<String>) -> DwError {
    DwError::InvalidRequest(message.into())
}

/// Value of `key` within `line`, terminated by whitespace or a comma (the
/// interactive form chains tokens with commas).
fn find_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || c == ',')
        .unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}

fn parse_rounded_capacity(value: &str, granularity: u64) -> crate::Result<Capacity> {
    match parse_capacity(value).map_err(|e| invalid(e.to_string()))? {
        Capacity::Bytes(bytes) => Ok(Capacity::Bytes(round_to_granularity(bytes, granularity))),
        nodes => Ok(nodes),
    }
}

/// Scan a batch script for burst-buffer directives. Directives must precede
/// the first non-comment line. `persist_allowed` reflects the submitter's
/// privilege (operator, or a site that enabled persistence for everyone).
pub fn parse_batch_script(
    script: &str,
    max_nodes: Option<u32>,
    persist_allowed: bool,
    granularity: u64,
) -> crate::Result<Option<PlanSpec>> {
    let mut spec = PlanSpec::default();
    let mut byte_cnt = 0u64;
    let mut node_cnt = 0u64;

    for line in script.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with('#') {
            break;
        }
        if let Some(directive) = line.strip_prefix("#BB") {
            let directive = directive.trim_start();
            if directive.starts_with("create_persistent") {
                if !persist_allowed {
                    return Err(invalid("user not enabled to create persistent burst buffers"));
                }
                let size = match find_value(directive, "capacity=") {
                    Some(value) => match parse_rounded_capacity(value, granularity)? {
                        Capacity::Bytes(bytes) if bytes > 0 => bytes,
                        _ => return Err(invalid("create_persistent requires a byte capacity")),
                    },
                    None => return Err(invalid("create_persistent requires capacity=")),
                };
                let name = find_value(directive, "name=")
                    .ok_or_else(|| invalid("create_persistent requires name="))?;
                if name.starts_with(|c: char| c.is_ascii_digit()) {
                    return Err(invalid(format!(
                        "persistent buffer name '{name}' may not begin with a digit"
                    )));
                }
                let access = find_value(directive, "access=").map(str::to_string);
                let buffer_type = find_value(directive, "type=").map(str::to_string);
                spec.bufs
                    .push(PersistentReq::create(name.to_string(), size, access, buffer_type));
            } else if directive.starts_with("destroy_persistent") {
                if !persist_allowed {
                    return Err(invalid(
                        "user not enabled to destroy persistent burst buffers",
                    ));
                }
                let name = find_value(directive, "name=")
                    .ok_or_else(|| invalid("destroy_persistent requires name="))?;
                let hurry = directive.contains("hurry");
                spec.bufs
                    .push(PersistentReq::destroy(name.to_string(), hurry));
            }
        } else if let Some(directive) = line.strip_prefix("#DW") {
            let directive = directive.trim_start();
            if directive.starts_with("jobdw") {
                let value = find_value(directive, "capacity=")
                    .ok_or_else(|| invalid("jobdw requires capacity="))?;
                match parse_rounded_capacity(value, granularity)? {
                    Capacity::Bytes(0) => return Err(invalid("jobdw capacity may not be zero")),
                    Capacity::Bytes(bytes) => byte_cnt += bytes,
                    Capacity::Nodes(nodes) => node_cnt += nodes,
                }
                if let Some(access) = find_value(directive, "access_mode=") {
                    spec.access = Some(access.to_string());
                }
                if let Some(buffer_type) = find_value(directive, "type=") {
                    spec.buffer_type = Some(buffer_type.to_string());
                }
            } else if let Some(swap) = directive.strip_prefix("swap") {
                let swap = swap.trim_start_matches([' ', '\t', '=']);
                let digits: String = swap.chars().take_while(|c| c.is_ascii_digit()).collect();
                spec.swap_gib += digits
                    .parse::<u64>()
                    .map_err(|_| invalid(format!("invalid swap specification '{swap}'")))?;
            } else if directive.starts_with("persistentdw") {
                spec.bufs.push(PersistentReq::use_existing());
            }
        }
    }

    finish_spec(spec, byte_cnt, node_cnt, max_nodes, granularity)
}

/// Interactive submissions carry `capacity=`/`swap=` tokens in a single
/// free-form line instead of a script.
pub fn parse_interactive(
    buffer_spec: &str,
    max_nodes: Option<u32>,
    granularity: u64,
) -> crate::Result<Option<PlanSpec>> {
    let mut spec = PlanSpec::default();
    let mut byte_cnt = 0u64;
    let mut node_cnt = 0u64;

    if let Some(value) = find_value(buffer_spec, "capacity=") {
        match parse_rounded_capacity(value, granularity)? {
            Capacity::Bytes(0) => return Err(invalid("capacity may not be zero")),
            Capacity::Bytes(bytes) => byte_cnt += bytes,
            Capacity::Nodes(nodes) => node_cnt += nodes,
        }
    }
    if let Some(value) = find_value(buffer_spec, "swap=") {
        let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
        spec.swap_gib = digits
            .parse::<u64>()
            .map_err(|_| invalid(format!("invalid swap specification '{value}'")))?;
    }

    finish_spec(spec, byte_cnt, node_cnt, max_nodes, granularity)
}

fn finish_spec(
    mut spec: PlanSpec,
    byte_cnt: u64,
    node_cnt: u64,
    max_nodes: Option<u32>,
    granularity: u64,
) -> crate::Result<Option<PlanSpec>> {
    let mut job_bytes = byte_cnt;
    if spec.swap_gib > 0 {
        let nodes = match max_nodes {
            Some(nodes) if nodes > 0 => u64::from(nodes),
            _ => {
                log::info!("Swap space requested without a node count specification");
                1
            }
        };
        spec.swap_nodes = nodes;
        job_bytes += spec.swap_gib * nodes * GIB;
    }
    spec.job_bytes = round_to_granularity(job_bytes, granularity);
    if node_cnt > 0 {
        spec.gres.push(GresRequest {
            name: "nodes".to_string(),
            count: node_cnt,
        });
    }

    if spec.is_empty() {
        Ok(None)
    } else {
        Ok(Some(spec))
    }
}

/// Render the canonical whitespace-separated burst-buffer string.
pub fn encode(spec: &PlanSpec) -> String {
    let mut parts = Vec::new();
    if spec.swap_gib > 0 {
        parts.push(format!(
            "SLURM_SWAP={}GB({}Nodes)",
            spec.swap_gib, spec.swap_nodes
        ));
    }
    if spec.job_bytes > 0 {
        let mut token = format!("SLURM_JOB=SIZE={}", spec.job_bytes);
        if let Some(access) = &spec.access {
            token.push_str(&format!(",ACCESS={access}"));
        }
        if let Some(buffer_type) = &spec.buffer_type {
            token.push_str(&format!(",TYPE={buffer_type}"));
        }
        parts.push(token);
    }
    if !spec.gres.is_empty() {
        let entries: Vec<String> = spec
            .gres
            .iter()
            .map(|g| format!("{}:{}", g.name, g.count))
            .collect();
        parts.push(format!("SLURM_GRES={}", entries.join(",")));
    }
    for buf in &spec.bufs {
        match buf.action {
            PersistentAction::Create => {
                let mut token =
                    format!("SLURM_PERSISTENT_CREATE=NAME={},SIZE={}", buf.name, buf.size);
                if let Some(access) = &buf.access {
                    token.push_str(&format!(",ACCESS={access}"));
                }
                if let Some(buffer_type) = &buf.buffer_type {
                    token.push_str(&format!(",TYPE={buffer_type}"));
                }
                parts.push(token);
            }
            PersistentAction::Destroy => {
                let mut token = format!("SLURM_PERSISTENT_DESTROY=NAME={}", buf.name);
                if buf.hurry {
                    token.push_str(",HURRY");
                }
                parts.push(token);
            }
            PersistentAction::Use => parts.push("SLURM_PERSISTENT_USE".to_string()),
        }
    }
    parts.join(" ")
}

/// Decode a canonical burst-buffer string. Returns `None` when the string
/// holds no buffer request.
pub fn decode(canonical: &str, granularity: u64) -> Option<PlanSpec> {
    let mut spec = PlanSpec::default();
    let mut have_bb = false;

    for token in canonical.split_whitespace() {
        if let Some(value) = token.strip_prefix("SLURM_JOB=") {
            have_bb = true;
            for field in value.split(',') {
                if let Some(size) = field.strip_prefix("SIZE=") {
                    if let Ok(Capacity::Bytes(bytes)) = parse_capacity(size) {
                        spec.job_bytes += round_to_granularity(bytes, granularity);
                    }
                } else if let Some(access) = field.strip_prefix("ACCESS=") {
                    spec.access = Some(access.to_string());
                } else if let Some(buffer_type) = field.strip_prefix("TYPE=") {
                    spec.buffer_type = Some(buffer_type.to_string());
                }
            }
        } else if let Some(value) = token.strip_prefix("SLURM_SWAP=") {
            // Format: <gib>GB(<nodes>Nodes)
            let (gib, nodes) = match value.split_once("GB(") {
                Some((gib, rest)) => (gib, rest.trim_end_matches("Nodes)")),
                None => continue,
            };
            spec.swap_gib = gib.parse().unwrap_or(0);
            spec.swap_nodes = nodes.parse().unwrap_or(1);
            if spec.swap_gib > 0 {
                have_bb = true;
            }
        } else if let Some(value) = token.strip_prefix("SLURM_GRES=") {
            for entry in value.split(',') {
                have_bb = true;
                let (name, count) = match entry.split_once(':') {
                    Some((name, count)) => (name, count.parse().unwrap_or(1)),
                    None => (entry, 1),
                };
                spec.gres.push(GresRequest {
                    name: name.to_string(),
                    count,
                });
            }
        } else if let Some(value) = token.strip_prefix("SLURM_PERSISTENT_CREATE=") {
            have_bb = true;
            let mut buf = PersistentReq::create(String::new(), 0, None, None);
            for field in value.split(',') {
                if let Some(name) = field.strip_prefix("NAME=") {
                    buf.name = name.to_string();
                } else if let Some(size) = field.strip_prefix("SIZE=") {
                    if let Ok(Capacity::Bytes(bytes)) = parse_capacity(size) {
                        buf.size = round_to_granularity(bytes, granularity);
                    }
                } else if let Some(access) = field.strip_prefix("ACCESS=") {
                    buf.access = Some(access.to_string());
                } else if let Some(buffer_type) = field.strip_prefix("TYPE=") {
                    buf.buffer_type = Some(buffer_type.to_string());
                }
            }
            spec.bufs.push(buf);
        } else if let Some(value) = token.strip_prefix("SLURM_PERSISTENT_DESTROY=") {
            have_bb = true;
            let mut buf = PersistentReq::destroy(String::new(), false);
            for field in value.split(',') {
                if let Some(name) = field.strip_prefix("NAME=") {
                    buf.name = name.to_string();
                } else if field == "HURRY" {
                    buf.hurry = true;
                }
            }
            spec.bufs.push(buf);
        } else if token == "SLURM_PERSISTENT_USE" {
            have_bb = true;
            spec.bufs.push(PersistentReq::use_existing());
        }
    }

    have_bb.then_some(spec)
}

/// Synthesize the job script handed to the CLI for interactive submissions,
/// which have no script of their own.
pub fn build_job_script(spec: &PlanSpec) -> String {
    let mut script = String::from("#!/bin/bash\n");
    if spec.swap_gib > 0 {
        script.push_str(&format!("#DW swap={}GiB\n", spec.swap_gib));
    }
    let scratch = spec
        .job_bytes
        .saturating_sub(spec.swap_gib * spec.swap_nodes * GIB);
    if scratch > 0 {
        script.push_str(&format!("#DW jobdw capacity={}", dw_capacity_str(scratch)));
        if let Some(access) = &spec.access {
            script.push_str(&format!(" access_mode={access}"));
        }
        if let Some(buffer_type) = &spec.buffer_type {
            script.push_str(&format!(" type={buffer_type}"));
        }
        script.push('\n');
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAN: u64 = 1;

    #[test]
    fn test_jobdw_basic() {
        let script = "#!/bin/bash\n#DW jobdw capacity=1GiB access_mode=striped type=scratch\nsrun app\n";
        let spec = parse_batch_script(script, Some(4), false, GRAN)
            .unwrap()
            .unwrap();
        assert_eq!(spec.job_bytes, 1 << 30);
        assert_eq!(spec.access.as_deref(), Some("striped"));
        assert_eq!(spec.buffer_type.as_deref(), Some("scratch"));
        assert_eq!(
            encode(&spec),
            "SLURM_JOB=SIZE=1073741824,ACCESS=striped,TYPE=scratch"
        );
    }

    #[test]
    fn test_directives_stop_at_first_command() {
        let script = "#!/bin/bash\necho hi\n#DW jobdw capacity=1GiB\n";
        assert!(parse_batch_script(script, None, false, GRAN)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_swap_folds_into_size() {
        let script = "#!/bin/bash\n#DW swap 2\n#DW jobdw capacity=1GiB\n";
        let spec = parse_batch_script(script, Some(3), false, GRAN)
            .unwrap()
            .unwrap();
        assert_eq!(spec.swap_gib, 2);
        assert_eq!(spec.swap_nodes, 3);
        assert_eq!(spec.job_bytes, (1 << 30) + 2 * 3 * (1 << 30));
        let canonical = encode(&spec);
        assert!(canonical.starts_with("SLURM_SWAP=2GB(3Nodes) SLURM_JOB=SIZE="));
    }

    #[test]
    fn test_swap_without_node_count_assumes_one() {
        let script = "#!/bin/bash\n#DW swap 4\n";
        let spec = parse_batch_script(script, None, false, GRAN)
            .unwrap()
            .unwrap();
        assert_eq!(spec.swap_nodes, 1);
        assert_eq!(spec.job_bytes, 4 << 30);
    }

    #[test]
    fn test_node_capacity_becomes_gres() {
        let script = "#!/bin/bash\n#DW jobdw capacity=4nodes\n";
        let spec = parse_batch_script(script, None, false, GRAN)
            .unwrap()
            .unwrap();
        assert_eq!(spec.job_bytes, 0);
        assert_eq!(
            spec.gres,
            vec![GresRequest {
                name: "nodes".to_string(),
                count: 4
            }]
        );
        assert_eq!(encode(&spec), "SLURM_GRES=nodes:4");
    }

    #[test]
    fn test_persistent_create_destroy() {
        let script = "#!/bin/bash\n\
            #BB create_persistent name=foo capacity=1GiB access=striped type=scratch\n\
            #BB destroy_persistent name=bar hurry\n\
            #DW persistentdw name=baz\n";
        let spec = parse_batch_script(script, None, true, GRAN)
            .unwrap()
            .unwrap();
        assert_eq!(spec.bufs.len(), 3);
        assert_eq!(spec.bufs[0].action, PersistentAction::Create);
        assert_eq!(spec.bufs[0].size, 1 << 30);
        assert_eq!(spec.bufs[1].action, PersistentAction::Destroy);
        assert!(spec.bufs[1].hurry);
        assert_eq!(spec.bufs[2].action, PersistentAction::Use);
        assert_eq!(spec.persist_add(), 1 << 30);
        assert_eq!(
            encode(&spec),
            "SLURM_PERSISTENT_CREATE=NAME=foo,SIZE=1073741824,ACCESS=striped,TYPE=scratch \
             SLURM_PERSISTENT_DESTROY=NAME=bar,HURRY SLURM_PERSISTENT_USE"
        );
    }

    #[test]
    fn test_persistent_requires_privilege() {
        let script = "#!/bin/bash\n#BB create_persistent name=foo capacity=1GiB\n";
        assert!(matches!(
            parse_batch_script(script, None, false, GRAN),
            Err(crate::Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_persistent_name_may_not_start_with_digit() {
        let script = "#!/bin/bash\n#BB create_persistent name=9lives capacity=1GiB\n";
        assert!(parse_batch_script(script, None, true, GRAN).is_err());
    }

    #[test]
    fn test_create_requires_capacity_and_name() {
        let no_capacity = "#!/bin/bash\n#BB create_persistent name=foo\n";
        assert!(parse_batch_script(no_capacity, None, true, GRAN).is_err());
        let no_name = "#!/bin/bash\n#BB create_persistent capacity=1GiB\n";
        assert!(parse_batch_script(no_name, None, true, GRAN).is_err());
    }

    #[test]
    fn test_capacity_rounds_to_granularity() {
        let script = "#!/bin/bash\n#DW jobdw capacity=1000\n";
        let spec = parse_batch_script(script, None, false, 4096)
            .unwrap()
            .unwrap();
        assert_eq!(spec.job_bytes, 4096);
    }

    #[test]
    fn test_interactive() {
        let spec = parse_interactive("capacity=2GiB,swap=1", Some(2), GRAN)
            .unwrap()
            .unwrap();
        assert_eq!(spec.swap_gib, 1);
        assert_eq!(spec.job_bytes, (2 << 30) + 2 * (1 << 30));

        assert!(parse_interactive("nothing here", None, GRAN)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_decode_encode_idempotence() {
        let cases = [
            "SLURM_JOB=SIZE=1073741824",
            "SLURM_SWAP=2GB(3Nodes) SLURM_JOB=SIZE=7516192768,ACCESS=striped",
            "SLURM_GRES=nodes:4",
            "SLURM_PERSISTENT_CREATE=NAME=foo,SIZE=1073741824,TYPE=scratch",
            "SLURM_PERSISTENT_DESTROY=NAME=foo,HURRY",
            "SLURM_PERSISTENT_DESTROY=NAME=foo",
            "SLURM_PERSISTENT_USE",
            "SLURM_JOB=SIZE=1073741824 SLURM_GRES=nodes:2 SLURM_PERSISTENT_USE",
        ];
        for case in cases {
            let spec = decode(case, GRAN).unwrap();
            assert_eq!(encode(&spec), case, "case: {case}");
        }
    }

    #[test]
    fn test_parse_then_encode_then_decode() {
        let script = "#!/bin/bash\n#DW swap 1\n#DW jobdw capacity=1GiB\n#BB create_persistent name=foo capacity=2GiB\n";
        let spec = parse_batch_script(script, Some(2), true, GRAN)
            .unwrap()
            .unwrap();
        let canonical = encode(&spec);
        let decoded = decode(&canonical, GRAN).unwrap();
        assert_eq!(decoded, spec);
        assert_eq!(encode(&decoded), canonical);
    }

    #[test]
    fn test_decode_empty() {
        assert!(decode("", GRAN).is_none());
        assert!(decode("UNRELATED=1", GRAN).is_none());
    }

    #[test]
    fn test_build_job_script() {
        let spec = parse_interactive("capacity=1GiB,swap=2", Some(1), GRAN)
            .unwrap()
            .unwrap();
        let script = build_job_script(&spec);
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#DW swap=2GiB"));
        assert!(script.contains("#DW jobdw capacity=1GiB"));
    }
}
