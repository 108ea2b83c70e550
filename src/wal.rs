// Append-only log framing shared by the graph and vector stores.
// Records are length-prefixed and checksummed; readers stop at the first
// torn or corrupt record and truncate the file there, so a crash mid-append
// rolls the partial record back.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::path::Path;
use tracing::warn;

/// Append one framed record and sync it to disk.
pub fn append_record(file: &mut std::fs::File, bytes: &[u8]) -> Result<()> {
    let len = bytes.len() as u32;
    let crc = crc32c::crc32c(bytes);
    file.write_all(&len.to_le_bytes())?;
    file.write_all(&crc.to_le_bytes())?;
    file.write_all(bytes)?;
    file.sync_data().context("syncing log")?;
    Ok(())
}

/// Read every valid record from a log file, truncating any torn tail.
/// A missing file yields no records.
pub fn read_records(path: &Path) -> Result<Vec<Vec<u8>>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    drop(file);

    let mut records = Vec::new();
    let mut offset = 0usize;
    let valid_end = loop {
        if offset + 8 > bytes.len() {
            break offset;
        }
        let len =
            u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("4 bytes")) as usize;
        let crc = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().expect("4 bytes"));
        let body_start = offset + 8;
        let body_end = body_start + len;
        if body_end > bytes.len() {
            break offset;
        }
        let body = &bytes[body_start..body_end];
        if crc32c::crc32c(body) != crc {
            break offset;
        }
        records.push(body.to_vec());
        offset = body_end;
    };

    if valid_end < bytes.len() {
        warn!(
            path = %path.display(),
            discarded = bytes.len() - valid_end,
            "truncating torn log tail"
        );
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_end as u64)?;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_torn_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.log");

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        append_record(&mut file, b"first")?;
        append_record(&mut file, b"second")?;
        // Torn tail: a length prefix with no body.
        file.write_all(&[0x10, 0x00, 0x00, 0x00, 0x01])?;
        drop(file);

        let records = read_records(&path)?;
        assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec()]);

        // The tail was truncated; a second read sees clean records only.
        let records = read_records(&path)?;
        assert_eq!(records.len(), 2);
        Ok(())
    }

    #[test]
    fn corrupt_crc_stops_replay() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("crc.log");

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        append_record(&mut file, b"good")?;
        let bad = b"bad!";
        file.write_all(&(bad.len() as u32).to_le_bytes())?;
        file.write_all(&0xdead_beefu32.to_le_bytes())?;
        file.write_all(bad)?;
        drop(file);

        let records = read_records(&path)?;
        assert_eq!(records, vec![b"good".to_vec()]);
        Ok(())
    }

    #[test]
    fn missing_file_is_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(read_records(&dir.path().join("absent.log"))?.is_empty());
        Ok(())
    }
}
