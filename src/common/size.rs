use nom::branch::alt;
use nom::bytes::complete::tag_no_case;
use nom::combinator::{map, opt};
use nom::sequence::tuple;

use crate::common::parser::{consume_all, p_u64, NomResult};

/// A capacity request from a directive. DataWarp accepts either a byte
/// quantity or a whole-node count; the two are tracked by distinct generic
/// resources downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Bytes(u64),
    Nodes(u64),
}

fn p_unit(input: &str) -> NomResult<u64> {
    alt((
        map(alt((tag_no_case("kib"), tag_no_case("kb"), tag_no_case("k"))), |_| 1u64 << 10),
        map(alt((tag_no_case("mib"), tag_no_case("mb"), tag_no_case("m"))), |_| 1u64 << 20),
        map(alt((tag_no_case("gib"), tag_no_case("gb"), tag_no_case("g"))), |_| 1u64 << 30),
        map(alt((tag_no_case("tib"), tag_no_case("tb"), tag_no_case("t"))), |_| 1u64 << 40),
        map(alt((tag_no_case("pib"), tag_no_case("pb"), tag_no_case("p"))), |_| 1u64 << 50),
    ))(input)
}

fn p_capacity(input: &str) -> NomResult<Capacity> {
    let nodes = map(
        tuple((p_u64, alt((tag_no_case("nodes"), tag_no_case("n"))))),
        |(count, _)| Capacity::Nodes(count),
    );
    let bytes = map(tuple((p_u64, opt(p_unit))), |(count, unit)| {
        Capacity::Bytes(count * unit.unwrap_or(1))
    });
    alt((nodes, bytes))(input)
}

/// Parse a capacity token such as `1GiB`, `100GB`, `4096`, or `2nodes`.
pub fn parse_capacity(input: &str) -> anyhow::Result<Capacity> {
    consume_all(p_capacity, input.trim())
        .map_err(|e| anyhow::anyhow!("invalid capacity specification '{input}': {e}"))
}

/// Round `size` up to a multiple of the pool granularity.
pub fn round_to_granularity(size: u64, granularity: u64) -> u64 {
    if granularity <= 1 || size == 0 {
        return size;
    }
    size.div_ceil(granularity) * granularity
}

pub fn bytes_to_mb(size: u64) -> u64 {
    const MB: u64 = 1024 * 1024;
    size.div_ceil(MB)
}

pub fn human_size(size: u64) -> String {
    if size < 2048 {
        format!("{} B", size)
    } else if size < 2 * 1024 * 1024 {
        format!("{} KiB", size / 1024)
    } else if size < 2 * 1024 * 1024 * 1024 {
        format!("{} MiB", size / (1024 * 1024))
    } else {
        format!("{} GiB", size / (1024 * 1024 * 1024))
    }
}

/// Format a byte count the way the DataWarp CLI expects capacities
/// (`pool:<size>`); whole units are used when the count divides evenly.
pub fn dw_capacity_str(size: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1 << 50, "PiB"),
        (1 << 40, "TiB"),
        (1 << 30, "GiB"),
        (1 << 20, "MiB"),
    ];
    for (factor, suffix) in UNITS {
        if size >= factor && size % factor == 0 {
            return format!("{}{}", size / factor, suffix);
        }
    }
    size.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_capacity("4096").unwrap(), Capacity::Bytes(4096));
        assert_eq!(parse_capacity("1GiB").unwrap(), Capacity::Bytes(1 << 30));
        assert_eq!(parse_capacity("100GB").unwrap(), Capacity::Bytes(100 << 30));
        assert_eq!(parse_capacity("2TiB").unwrap(), Capacity::Bytes(2 << 40));
        assert_eq!(parse_capacity("10k").unwrap(), Capacity::Bytes(10 << 10));
    }

    #[test]
    fn test_parse_nodes() {
        assert_eq!(parse_capacity("2nodes").unwrap(), Capacity::Nodes(2));
        assert_eq!(parse_capacity("16n").unwrap(), Capacity::Nodes(16));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_capacity("").is_err());
        assert!(parse_capacity("GiB").is_err());
        assert!(parse_capacity("1X").is_err());
    }

    #[test]
    fn test_granularity() {
        assert_eq!(round_to_granularity(0, 1 << 30), 0);
        assert_eq!(round_to_granularity(1, 1 << 30), 1 << 30);
        assert_eq!(round_to_granularity(1 << 30, 1 << 30), 1 << 30);
        assert_eq!(round_to_granularity((1 << 30) + 1, 1 << 30), 2 << 30);
        assert_eq!(round_to_granularity(12345, 1), 12345);
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0).as_str(), "0 B");
        assert_eq!(human_size(300_000).as_str(), "292 KiB");
        assert_eq!(human_size(50_000_000).as_str(), "47 MiB");
    }

    #[test]
    fn test_dw_capacity_str() {
        assert_eq!(dw_capacity_str(1 << 30), "1GiB");
        assert_eq!(dw_capacity_str(3 << 40), "3TiB");
        assert_eq!(dw_capacity_str(1000), "1000");
    }
}
