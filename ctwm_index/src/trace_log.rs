//! Append-only log of executed basic-block ids, 4-byte little-endian each.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

pub const TRACE_PATH_ENV: &str = "SYMSAN_CTWM_TRACE_PATH";
pub const DEFAULT_TRACE_PATH: &str = "ctwm_trace.log";

/// Resolved trace log location: `$SYMSAN_CTWM_TRACE_PATH` or the default.
pub fn trace_path() -> PathBuf {
    match std::env::var(TRACE_PATH_ENV) {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => PathBuf::from(DEFAULT_TRACE_PATH),
    }
}

pub struct TraceLog {
    file: File,
}

impl TraceLog {
    pub fn open_default() -> io::Result<Self> {
        Self::open(&trace_path())
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn record(&mut self, bb_id: u32) -> io::Result<()> {
        self.file.write_u32::<LittleEndian>(bb_id)
    }
}

/// Read a trace log back as the sequence of recorded ids.
pub fn read_trace(path: &Path) -> io::Result<Vec<u32>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut ids = Vec::new();
    loop {
        match reader.read_u32::<LittleEndian>() {
            Ok(id) => ids.push(id),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(ids)
}

/// Raw byte view of one id, as written to the log.
pub fn encode_id(bb_id: u32) -> [u8; 4] {
    bb_id.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_little_endian_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");

        let mut log = TraceLog::open(&path).unwrap();
        log.record(1).unwrap();
        log.record(0x0102_0304).unwrap();
        drop(log);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw, [1, 0, 0, 0, 0x04, 0x03, 0x02, 0x01]);

        // append mode, a reopened log extends the file
        let mut log = TraceLog::open(&path).unwrap();
        log.record(2).unwrap();
        drop(log);
        assert_eq!(read_trace(&path).unwrap(), vec![1, 0x0102_0304, 2]);
    }

    #[test]
    fn encode_matches_wire_format() {
        assert_eq!(encode_id(0xAABBCCDD), [0xDD, 0xCC, 0xBB, 0xAA]);
    }
}
