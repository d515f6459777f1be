//! Durable limit state. The external subsystem has nowhere to store the
//! account/partition/QoS attribution of named persistent buffers, so it is
//! checkpointed here and re-applied after a restart.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const SNAPSHOT_VERSION: u16 = 1;
pub const SNAPSHOT_FILE: &str = "burst_buffer_cray_state";

/// Upper bound on an encoded string, as a corruption guard on recovery.
const MAX_STR_LEN: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub account: String,
    pub create_time: i64,
    pub name: String,
    pub partition: String,
    pub qos: String,
    pub user_id: u32,
    /// Present only in emulation mode, where the external subsystem cannot
    /// be asked for sizes.
    pub size: Option<u64>,
}

fn write_str<W: Write>(out: &mut W, value: &str) -> std::io::Result<()> {
    out.write_u32::<BigEndian>(value.len() as u32)?;
    out.write_all(value.as_bytes())
}

fn read_str<R: Read>(input: &mut R) -> std::io::Result<String> {
    let len = input.read_u32::<BigEndian>()?;
    if len > MAX_STR_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("string length {len} exceeds snapshot limit"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

pub fn encode(records: &[SnapshotRecord], emulate: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + records.len() * 64);
    // The writes below cannot fail on a Vec
    buf.write_u16::<BigEndian>(SNAPSHOT_VERSION).unwrap();
    buf.write_u32::<BigEndian>(records.len() as u32).unwrap();
    for record in records {
        write_str(&mut buf, &record.account).unwrap();
        buf.write_i64::<BigEndian>(record.create_time).unwrap();
        write_str(&mut buf, &record.name).unwrap();
        write_str(&mut buf, &record.partition).unwrap();
        write_str(&mut buf, &record.qos).unwrap();
        buf.write_u32::<BigEndian>(record.user_id).unwrap();
        if emulate {
            buf.write_u64::<BigEndian>(record.size.unwrap_or(0)).unwrap();
        }
    }
    buf
}

pub fn decode(data: &[u8], emulate: bool) -> std::io::Result<Vec<SnapshotRecord>> {
    let mut input = data;
    let version = input.read_u16::<BigEndian>()?;
    if version != SNAPSHOT_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("snapshot version {version} is not supported"),
        ));
    }
    let count = input.read_u32::<BigEndian>()?;
    let mut records = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let account = read_str(&mut input)?;
        let create_time = input.read_i64::<BigEndian>()?;
        let name = read_str(&mut input)?;
        let partition = read_str(&mut input)?;
        let qos = read_str(&mut input)?;
        let user_id = input.read_u32::<BigEndian>()?;
        let size = if emulate {
            Some(input.read_u64::<BigEndian>()?)
        } else {
            None
        };
        records.push(SnapshotRecord {
            account,
            create_time,
            name,
            partition,
            qos,
            user_id,
            size,
        });
    }
    Ok(records)
}

fn snapshot_paths(state_dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
    (
        state_dir.join(SNAPSHOT_FILE),
        state_dir.join(format!("{SNAPSHOT_FILE}.old")),
        state_dir.join(format!("{SNAPSHOT_FILE}.new")),
    )
}

/// Write the snapshot with the three-file shuffle: the data lands in `.new`,
/// the current file rotates to `.old`, and `.new` is renamed into place, so
/// a concurrent reader always sees a complete file. A failed write unlinks
/// the partial `.new` and leaves the previous snapshot untouched.
pub fn save(state_dir: &Path, records: &[SnapshotRecord], emulate: bool) -> std::io::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let (current, old, new) = snapshot_paths(state_dir);

    let data = encode(records, emulate);
    if let Err(e) = std::fs::write(&new, &data) {
        let _ = std::fs::remove_file(&new);
        return Err(e);
    }

    if current.exists() {
        let _ = std::fs::remove_file(&old);
        if let Err(e) = std::fs::rename(&current, &old) {
            log::debug!("Cannot rotate {} to {}: {}", current.display(), old.display(), e);
        }
    }
    std::fs::rename(&new, &current)?;
    Ok(())
}

/// Read the snapshot, falling back to the `.old` rotation when the current
/// file is missing or unreadable. A missing snapshot is an empty state, not
/// an error.
pub fn load(state_dir: &Path, emulate: bool) -> std::io::Result<Vec<SnapshotRecord>> {
    let (current, old, _) = snapshot_paths(state_dir);
    for (idx, path) in [&current, &old].into_iter().enumerate() {
        match std::fs::read(path) {
            Ok(data) => match decode(&data, emulate) {
                Ok(records) => return Ok(records),
                Err(e) => {
                    log::error!("Corrupt burst buffer snapshot {}: {}", path.display(), e);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                log::error!("Cannot read burst buffer snapshot {}: {}", path.display(), e);
            }
        }
        if idx == 0 {
            log::info!("Trying backup burst buffer snapshot; information may be lost");
        }
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, user_id: u32) -> SnapshotRecord {
        SnapshotRecord {
            account: "acct".to_string(),
            create_time: 1_700_000_000,
            name: name.to_string(),
            partition: "debug".to_string(),
            qos: "normal".to_string(),
            user_id,
            size: None,
        }
    }

    #[test]
    fn test_encode_decode() {
        let records = vec![record("foo", 1001), record("bar", 1002)];
        let decoded = decode(&encode(&records, false), false).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_emulation_size_field() {
        let mut rec = record("1234", 1001);
        rec.size = Some(1 << 30);
        let decoded = decode(&encode(&[rec.clone()], true), true).unwrap();
        assert_eq!(decoded[0].size, Some(1 << 30));
    }

    #[test]
    fn test_version_mismatch() {
        let mut data = encode(&[record("foo", 1)], false);
        data[0] = 0xff;
        assert!(decode(&data, false).is_err());
    }

    #[test]
    fn test_truncated_data() {
        let data = encode(&[record("foo", 1)], false);
        assert!(decode(&data[..data.len() - 3], false).is_err());
    }

    #[test]
    fn test_save_rotates_and_loads() {
        let tmp = tempfile::tempdir().unwrap();
        save(tmp.path(), &[record("foo", 1001)], false).unwrap();
        save(tmp.path(), &[record("foo", 1001), record("bar", 1002)], false).unwrap();

        assert!(tmp.path().join(SNAPSHOT_FILE).exists());
        assert!(tmp.path().join(format!("{SNAPSHOT_FILE}.old")).exists());
        assert!(!tmp.path().join(format!("{SNAPSHOT_FILE}.new")).exists());

        let records = load(tmp.path(), false).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load(tmp.path(), false).unwrap().is_empty());
    }

    #[test]
    fn test_load_falls_back_to_old() {
        let tmp = tempfile::tempdir().unwrap();
        let (current, old, _) = snapshot_paths(tmp.path());
        std::fs::write(&old, encode(&[record("foo", 1001)], false)).unwrap();
        std::fs::write(&current, b"garbage").unwrap();
        let records = load(tmp.path(), false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "foo");
    }
}
