//! Trace file format
//!
//! A trace is a flat sequence of records in observation order, with no header
//! or footer. Each record starts with a one-byte tag:
//!
//! * `0x01` Allocation: id `u32`, address `u64`, size `u32`
//! * `0x02` Free: id `u32`
//!
//! All integers are little-endian.

use crate::ledger::AllocationRecord;
use binrw::io::{Cursor, NoSeek};
use binrw::{binrw, BinRead, BinWrite};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// One event in a trace file
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceRecord {
    #[brw(magic = 1u8)]
    Allocation(AllocationRecord),
    #[brw(magic = 2u8)]
    Free { id: u32 },
}

impl TraceRecord {
    /// Append the encoded record to `out`
    pub fn store<W: Write>(&self, out: &mut W) -> io::Result<()> {
        self.write(&mut NoSeek::new(out)).map_err(into_io_error)
    }
}

/// Decode every record of a trace stream
///
/// A truncated final record or an unknown tag is an error.
pub fn read_trace<R: Read>(mut input: R) -> io::Result<Vec<TraceRecord>> {
    let mut data = Vec::new();
    input.read_to_end(&mut data)?;

    let mut reader = Cursor::new(data.as_slice());
    let mut records = Vec::new();
    while (reader.position() as usize) < data.len() {
        records.push(TraceRecord::read(&mut reader).map_err(into_io_error)?);
    }
    Ok(records)
}

fn into_io_error(err: binrw::Error) -> io::Error {
    match err {
        binrw::Error::Io(e) => e,
        other => io::Error::new(ErrorKind::InvalidData, other.to_string()),
    }
}

/// Path of the trace file for a test case
pub fn trace_file_path(output_directory: &Path, testcase_id: u64) -> PathBuf {
    output_directory.join(format!("t{}.trace", testcase_id))
}

/// Writer for a single test case's trace file
///
/// Records go to `<path>.partial`; [`TraceWriter::finish`] renames it to the
/// final path. A writer that was not successfully finished deletes its
/// partial file when dropped, so an aborted test case never leaves a trace
/// that looks complete.
#[derive(Debug)]
pub struct TraceWriter {
    out: Option<BufWriter<File>>,
    partial_path: PathBuf,
    final_path: PathBuf,
    finished: bool,
}

impl TraceWriter {
    /// Create the partial trace file for `final_path`
    pub fn create(final_path: impl Into<PathBuf>) -> io::Result<Self> {
        let final_path = final_path.into();
        let mut partial = final_path.clone().into_os_string();
        partial.push(".partial");
        let partial_path = PathBuf::from(partial);

        let file = File::create(&partial_path)?;
        Ok(Self {
            out: Some(BufWriter::new(file)),
            partial_path,
            final_path,
            finished: false,
        })
    }

    /// Append a record
    pub fn append(&mut self, record: &TraceRecord) -> io::Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "Trace writer already finished"))?;
        record.store(out)
    }

    /// Flush, close and move the trace to its final path
    pub fn finish(mut self) -> io::Result<PathBuf> {
        if let Some(out) = self.out.take() {
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&self.partial_path, &self.final_path)?;
        self.finished = true;
        Ok(self.final_path.clone())
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Close before removing
        self.out.take();
        if let Err(e) = fs::remove_file(&self.partial_path) {
            tracing::warn!(
                "Failed to remove incomplete trace {:?}: {}",
                self.partial_path,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encoding() {
        let mut bytes = Vec::new();
        TraceRecord::Allocation(AllocationRecord {
            id: 0,
            address: 0x5000,
            size: 64,
        })
        .store(&mut bytes)
        .unwrap();
        TraceRecord::Free { id: 0 }.store(&mut bytes).unwrap();

        #[rustfmt::skip]
        let expected: &[u8] = &[
            0x01, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x50, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x40, 0x00, 0x00, 0x00,
            0x02, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_read_trace_until_end() {
        let records = vec![
            TraceRecord::Allocation(AllocationRecord { id: 0, address: 0x10, size: 1 }),
            TraceRecord::Allocation(AllocationRecord { id: 1, address: 0x20, size: 2 }),
            TraceRecord::Free { id: 1 },
        ];
        let mut bytes = Vec::new();
        for r in &records {
            r.store(&mut bytes).unwrap();
        }

        assert_eq!(read_trace(bytes.as_slice()).unwrap(), records);
        assert!(read_trace(&[0u8; 0][..]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let mut bytes = Vec::new();
        TraceRecord::Free { id: 7 }.store(&mut bytes).unwrap();
        bytes.pop();

        assert!(read_trace(bytes.as_slice()).is_err());
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let err = read_trace(&[0x09u8][..]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_writer_finish_renames() {
        let dir = tempfile::tempdir().unwrap();
        let path = trace_file_path(dir.path(), 3);

        let mut writer = TraceWriter::create(&path).unwrap();
        writer.append(&TraceRecord::Free { id: 1 }).unwrap();
        assert!(!path.exists());

        let finished = writer.finish().unwrap();
        assert_eq!(finished, path);
        assert!(!dir.path().join("t3.trace.partial").exists());
        let records = read_trace(File::open(&path).unwrap()).unwrap();
        assert_eq!(records, vec![TraceRecord::Free { id: 1 }]);
    }

    #[test]
    fn test_unfinished_writer_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = trace_file_path(dir.path(), 4);

        {
            let mut writer = TraceWriter::create(&path).unwrap();
            writer.append(&TraceRecord::Free { id: 1 }).unwrap();
            assert!(dir.path().join("t4.trace.partial").exists());
        }

        assert!(!path.exists());
        assert!(!dir.path().join("t4.trace.partial").exists());
    }

    #[test]
    fn test_failed_rename_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = trace_file_path(dir.path(), 5);
        // A non-empty directory at the final path makes the rename fail
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        let mut writer = TraceWriter::create(&path).unwrap();
        writer.append(&TraceRecord::Free { id: 1 }).unwrap();
        assert!(writer.finish().is_err());

        assert!(!dir.path().join("t5.trace.partial").exists());
        assert!(path.is_dir());
    }
}
