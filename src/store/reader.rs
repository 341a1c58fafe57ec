//! Lazy forward-only reading of sample records.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::PathBuf;

use crate::error::{Result, TelemetryError};
use crate::store::format;
use crate::types::TelemetrySample;

/// Iterator over a contiguous sequence range of one session.
///
/// Owns its own file handle, so any number of readers can run concurrently
/// with each other and with the writer. The range is fixed at construction
/// (already clamped to the durable watermark); re-issue `read_range` with a
/// later start to follow a growing session.
pub struct RangeReader {
    reader: BufReader<File>,
    path: PathBuf,
    next_sequence: u64,
    end: u64,
}

impl RangeReader {
    pub(super) fn new(
        file: File,
        path: PathBuf,
        data_start: u64,
        range: Range<u64>,
    ) -> Result<Self> {
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(data_start + range.start * format::RECORD_SIZE as u64))
            .map_err(|e| TelemetryError::store_error("seeking to range start", &path, e))?;
        Ok(Self { reader, path, next_sequence: range.start, end: range.end })
    }

    /// Sequence the next call to `next` would yield.
    pub fn position(&self) -> u64 {
        self.next_sequence
    }

    fn read_one(&mut self) -> Result<TelemetrySample> {
        let mut record = [0u8; format::RECORD_SIZE];
        self.reader
            .read_exact(&mut record)
            .map_err(|e| TelemetryError::store_error("reading sample record", &self.path, e))?;

        let sample = format::decode_record(&record);
        if sample.sequence != self.next_sequence {
            return Err(TelemetryError::corrupt(
                "sample record",
                format!("expected sequence {}, found {}", self.next_sequence, sample.sequence),
            ));
        }
        self.next_sequence += 1;
        Ok(sample)
    }
}

impl Iterator for RangeReader {
    type Item = Result<TelemetrySample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_sequence >= self.end {
            return None;
        }
        match self.read_one() {
            Ok(sample) => Some(Ok(sample)),
            Err(e) => {
                // Poison the iterator; a short read means corruption or a
                // failing disk, not data that will appear later.
                self.end = self.next_sequence;
                Some(Err(e))
            }
        }
    }
}
