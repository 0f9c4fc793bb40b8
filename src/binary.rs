//! Binary ttyrec codec.
//!
//! Every record is a 12-byte little-endian header `[sec:i32][usec:i32][len:i32]`
//! followed by `len` raw payload bytes. Recorders are routinely killed in the
//! middle of a write, so a short trailing header or payload marks the end of
//! the stream rather than an error.
use std::io::{ErrorKind, Read, Write};

use rand::rngs::StdRng;
use tracing::debug;

use crate::error::{Error, Result};
use crate::jitter::{seeded_rng, Jitter, DEFAULT_MAX_DELAY};
use crate::record::{secs_to_micros, Entry, Timestamp};

pub const HEADER_SIZE: usize = 12;

/// Result of decoding one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Entry(Entry),
    EndOfStream,
}

fn le_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Lazy decoder over any byte source; yields entries with empty options.
///
/// The `usec` field is folded into the timestamp as is, so a recorder that
/// wrote it outside `0..1_000_000` (or negative) decodes to the equivalent
/// normalized instant. Re-encoding such a record writes the normalized
/// `(sec, usec)` pair and is therefore not byte-identical to the input.
pub struct BinaryReader<R> {
    inner: R,
    records: usize,
    finished: bool,
}

impl<R: Read> BinaryReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            records: 0,
            finished: false,
        }
    }

    /// Number of complete records decoded so far.
    pub fn records_read(&self) -> usize {
        self.records
    }

    pub fn read_record(&mut self) -> Result<Decoded> {
        let mut header = [0u8; HEADER_SIZE];
        if let Err(e) = self.inner.read_exact(&mut header) {
            if e.kind() == ErrorKind::UnexpectedEof {
                debug!(records = self.records, "binary stream ended");
                return Ok(Decoded::EndOfStream);
            }
            return Err(e.into());
        }
        let secs = le_i32(&header[0..4]);
        let usecs = le_i32(&header[4..8]);
        let length = le_i32(&header[8..12]);
        if length < 0 {
            return Err(Error::NegativeLength {
                record: self.records + 1,
                length,
            });
        }

        let wanted = length as usize;
        let mut payload = Vec::with_capacity(wanted.min(1 << 16));
        (&mut self.inner)
            .take(wanted as u64)
            .read_to_end(&mut payload)?;
        if payload.len() < wanted {
            debug!(
                record = self.records + 1,
                declared = wanted,
                available = payload.len(),
                "truncated trailing payload, treating as end of stream"
            );
            return Ok(Decoded::EndOfStream);
        }

        self.records += 1;
        let timestamp = Timestamp::from_parts(i64::from(secs), i64::from(usecs));
        Ok(Decoded::Entry(Entry::new(timestamp, payload)))
    }
}

impl<R: Read> Iterator for BinaryReader<R> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Decoded::Entry(entry)) => Some(Ok(entry)),
            Ok(Decoded::EndOfStream) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Encoder; input-tagged entries are expanded into one record per byte.
pub struct BinaryWriter<W: Write> {
    inner: W,
    offset: i64, // accumulated expansion time in microseconds, saturating
    rng: StdRng,
    records: usize,
}

impl<W: Write> BinaryWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            offset: 0,
            rng: seeded_rng(0),
            records: 0,
        }
    }

    pub fn records_written(&self) -> usize {
        self.records
    }

    fn write_record(&mut self, timestamp: Timestamp, payload: &[u8]) -> Result<()> {
        let len = i32::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge {
            len: payload.len(),
        })?;
        let (secs, usecs) = timestamp.to_parts();
        let secs = i32::try_from(secs).map_err(|_| Error::TimestampOutOfRange(timestamp))?;

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&secs.to_le_bytes());
        header[4..8].copy_from_slice(&(usecs as i32).to_le_bytes());
        header[8..12].copy_from_slice(&len.to_le_bytes());
        self.inner.write_all(&header)?;
        self.inner.write_all(payload)?;
        self.records += 1;
        Ok(())
    }

    pub fn write_entry(&mut self, entry: &Entry) -> Result<()> {
        let start = entry.timestamp.shifted(self.offset);
        let delay = match entry.options.input_delay() {
            Some(delay) if !entry.payload.is_empty() => delay,
            _ => return self.write_record(start, &entry.payload),
        };
        let jitter = entry
            .options
            .jitter_amount()
            .map(|amount| Jitter::new(amount, DEFAULT_MAX_DELAY, false))
            .transpose()?;

        // typewriter expansion: first byte at the entry time, then one step apart
        let mut stamp = start;
        for (k, byte) in entry.payload.iter().enumerate() {
            if k > 0 {
                let step = match &jitter {
                    Some(j) => j.apply(delay, &mut self.rng),
                    None => delay,
                };
                stamp = stamp.shifted(secs_to_micros(step));
            }
            self.write_record(stamp, std::slice::from_ref(byte))?;
        }
        self.offset = self.offset.saturating_add(stamp.micros_since(start));
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
