/// Expand a compressed host list such as `nid00[010-012,100],login1` into
/// individual host names. Plain comma-separated names pass through.
pub fn expand_host_list(list: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    let mut rest = list.trim();
    while !rest.is_empty() {
        let (token, remainder) = split_host_token(rest);
        expand_host_token(token, &mut hosts);
        rest = remainder.trim_start_matches(',');
    }
    hosts
}

/// Split off the first host token, keeping any bracketed range intact.
fn split_host_token(input: &str) -> (&str, &str) {
    let mut depth = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => return (&input[..idx], &input[idx..]),
            _ => {}
        }
    }
    (input, "")
}

fn expand_host_token(token: &str, out: &mut Vec<String>) {
    let token = token.trim();
    if token.is_empty() {
        return;
    }
    let (prefix, ranges) = match token.find('[') {
        Some(open) if token.ends_with(']') => (&token[..open], &token[open + 1..token.len() - 1]),
        _ => {
            out.push(token.to_string());
            return;
        }
    };
    for range in ranges.split(',') {
        match range.split_once('-') {
            Some((lo, hi)) => {
                let width = lo.len();
                let (Ok(lo), Ok(hi)) = (lo.parse::<u64>(), hi.parse::<u64>()) else {
                    out.push(format!("{prefix}{range}"));
                    continue;
                };
                for n in lo..=hi {
                    out.push(format!("{prefix}{n:0width$}"));
                }
            }
            None => out.push(format!("{prefix}{range}")),
        }
    }
}

/// Extract the numeric nid component of each host name (`nid00012` -> `12`),
/// as expected by the CLI's `--nidlistfile` flavor.
pub fn numeric_nids(hosts: &[String]) -> Vec<String> {
    hosts
        .iter()
        .filter_map(|host| {
            let digits: String = host.chars().skip_while(|c| !c.is_ascii_digit()).collect();
            digits.parse::<u64>().ok().map(|n| n.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_plain() {
        assert_eq!(expand_host_list("a,b,c"), vec!["a", "b", "c"]);
        assert_eq!(expand_host_list("single"), vec!["single"]);
        assert!(expand_host_list("").is_empty());
    }

    #[test]
    fn test_expand_ranges() {
        assert_eq!(
            expand_host_list("nid00[010-012]"),
            vec!["nid00010", "nid00011", "nid00012"]
        );
        assert_eq!(
            expand_host_list("n[1-2,5],login1"),
            vec!["n1", "n2", "n5", "login1"]
        );
    }

    #[test]
    fn test_numeric_nids() {
        let hosts = expand_host_list("nid00[010-011]");
        assert_eq!(numeric_nids(&hosts), vec!["10", "11"]);
        assert!(numeric_nids(&["nonid".to_string()]).is_empty());
    }
}
