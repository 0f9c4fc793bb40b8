//! Hand-editable text form of a recording.
//!
//! ```text
//! [2013-02-08 10:00:00.000000] 7
//! bash $
//! [0.500000] 2 i
//! ls
//! ```
//!
//! Each record is a header line `[TS] LEN[ OPTIONS]`, then exactly `LEN` raw
//! bytes and a newline. Only the first `TS` is absolute; later ones are signed
//! second offsets from the previous record. Because the file is meant to be
//! edited by hand, any grammar violation aborts the read with the record
//! index and an approximate line number.
use std::io::{BufRead, Read, Write};

use once_cell::sync::Lazy;
use regex::Regex;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::warn;

use crate::error::{Error, Result};
use crate::record::{Entry, Options, Timestamp};

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]");
const TIMESTAMP_PARSE: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");

static ASCII_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[([0-9:. -]*)\] ([0-9]+)(?: ([A-Za-z0-9,.=]*))?$").expect("static regex")
});

/// The local UTC offset, or UTC when it cannot be determined safely.
pub fn local_zone() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or_else(|e| {
        warn!(error = %e, "local UTC offset unavailable, using UTC");
        UtcOffset::UTC
    })
}

fn format_absolute(ts: Timestamp, offset: UtcOffset) -> Result<String> {
    let nanos = i128::from(ts.as_micros()) * 1_000;
    let dt = OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|_| Error::TimestampOutOfRange(ts))?
        .to_offset(offset);
    dt.format(TIMESTAMP_FORMAT)
        .map_err(|_| Error::TimestampOutOfRange(ts))
}

fn parse_absolute(raw: &str, offset: UtcOffset) -> Option<Timestamp> {
    let dt = PrimitiveDateTime::parse(raw, TIMESTAMP_PARSE).ok()?;
    let micros = dt.assume_offset(offset).unix_timestamp_nanos().div_euclid(1_000);
    i64::try_from(micros).ok().map(Timestamp::from_micros)
}

/// Render a gap as signed seconds with six fractional digits.
fn format_offset(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    format!("{sign}{}.{:06}", abs / 1_000_000, abs % 1_000_000)
}

/// Parse `[-]SECS[.FRACTION]` into microseconds without going through floats.
fn parse_offset(raw: &str) -> Option<i64> {
    let (negative, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (whole, frac) = body.split_once('.').unwrap_or((body, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if !digits(whole) || !digits(frac) {
        return None;
    }
    let secs: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut micros: i64 = 0;
    for (k, c) in frac.chars().enumerate() {
        let d = i64::from(c.to_digit(10)?);
        match k {
            0..=5 => micros = micros * 10 + d,
            6 if d >= 5 => micros += 1,
            _ => {}
        }
    }
    for _ in frac.len()..6 {
        micros *= 10;
    }
    let total = secs.checked_mul(1_000_000)?.checked_add(micros)?;
    Some(if negative { -total } else { total })
}

/// Lazy decoder for the text form.
pub struct AsciiReader<R> {
    inner: R,
    zone: UtcOffset,
    record: usize,
    line: usize,
    previous: Option<Timestamp>,
    finished: bool,
}

impl<R: BufRead> AsciiReader<R> {
    /// `zone` is the UTC offset the absolute first timestamp is written in.
    pub fn new(inner: R, zone: UtcOffset) -> Self {
        Self {
            inner,
            zone,
            record: 0,
            line: 0,
            previous: None,
            finished: false,
        }
    }

    fn malformed(&self, line: usize, reason: impl Into<String>) -> Error {
        Error::MalformedRecord {
            record: self.record,
            line,
            reason: reason.into(),
        }
    }

    fn read_entry(&mut self) -> Result<Option<Entry>> {
        let mut header = Vec::new();
        if self.inner.read_until(b'\n', &mut header)? == 0 {
            return Ok(None);
        }
        self.record += 1;
        self.line += 1;
        let header_line = self.line;

        if header.pop() != Some(b'\n') {
            return Err(self.malformed(header_line, "header line is not terminated"));
        }
        let text = std::str::from_utf8(&header)
            .map_err(|_| self.malformed(header_line, "header line is not ASCII"))?;
        let caps = ASCII_HEAD.captures(text).ok_or_else(|| {
            self.malformed(header_line, format!("header does not match the grammar: {text:?}"))
        })?;

        let stamp = &caps[1];
        let timestamp = match self.previous {
            None => parse_absolute(stamp, self.zone).ok_or_else(|| {
                self.malformed(header_line, format!("invalid absolute timestamp {stamp:?}"))
            })?,
            Some(prev) => {
                let delta = parse_offset(stamp).ok_or_else(|| {
                    self.malformed(header_line, format!("invalid time offset {stamp:?}"))
                })?;
                prev.shifted(delta)
            }
        };
        let length: usize = caps[2]
            .parse()
            .ok()
            .filter(|len| i32::try_from(*len).is_ok())
            .ok_or_else(|| self.malformed(header_line, "payload length out of range"))?;
        let options = match caps.get(3) {
            Some(m) => m
                .as_str()
                .parse::<Options>()
                .map_err(|e| self.malformed(header_line, e.to_string()))?,
            None => Options::default(),
        };

        let mut payload = Vec::with_capacity(length.min(1 << 16));
        (&mut self.inner)
            .take(length as u64)
            .read_to_end(&mut payload)?;
        if payload.len() < length {
            return Err(self.malformed(
                header_line,
                format!("payload has {} bytes, expected {length}", payload.len()),
            ));
        }
        self.line += payload.iter().filter(|b| **b == b'\n').count();

        let mut separator = [0u8; 1];
        let got = self.inner.read(&mut separator)?;
        if got == 0 || separator[0] != b'\n' {
            return Err(self.malformed(header_line, "missing record separator"));
        }
        self.line += 1;

        self.previous = Some(timestamp);
        Ok(Some(Entry {
            timestamp,
            payload,
            options,
        }))
    }
}

impl<R: BufRead> Iterator for AsciiReader<R> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let out = self.read_entry().transpose();
        if !matches!(out, Some(Ok(_))) {
            self.finished = true;
        }
        out
    }
}

/// Encoder for the text form.
pub struct AsciiWriter<W: Write> {
    inner: W,
    zone: UtcOffset,
    previous: Option<Timestamp>,
}

impl<W: Write> AsciiWriter<W> {
    pub fn new(inner: W, zone: UtcOffset) -> Self {
        Self {
            inner,
            zone,
            previous: None,
        }
    }

    pub fn write_entry(&mut self, entry: &Entry) -> Result<()> {
        let stamp = match self.previous {
            None => format_absolute(entry.timestamp, self.zone)?,
            Some(prev) => format_offset(entry.timestamp.micros_since(prev)),
        };
        if i32::try_from(entry.payload.len()).is_err() {
            return Err(Error::PayloadTooLarge {
                len: entry.payload.len(),
            });
        }
        if entry.options.is_empty() {
            writeln!(self.inner, "[{stamp}] {}", entry.payload.len())?;
        } else {
            writeln!(self.inner, "[{stamp}] {} {}", entry.payload.len(), entry.options)?;
        }
        self.inner.write_all(&entry.payload)?;
        self.inner.write_all(b"\n")?;
        self.previous = Some(entry.timestamp);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(text: &[u8]) -> Result<Vec<Entry>> {
        AsciiReader::new(text, UtcOffset::UTC).collect()
    }

    fn write_all(entries: &[Entry]) -> Vec<u8> {
        let mut w = AsciiWriter::new(Vec::new(), UtcOffset::UTC);
        for e in entries {
            w.write_entry(e).unwrap();
        }
        w.into_inner()
    }

    #[test]
    fn offsets_format_and_parse() {
        assert_eq!(format_offset(500_000), "0.500000");
        assert_eq!(format_offset(-1_250_000), "-1.250000");
        assert_eq!(format_offset(3_000_001), "3.000001");
        assert_eq!(parse_offset("0.5"), Some(500_000));
        assert_eq!(parse_offset("-1.250000"), Some(-1_250_000));
        assert_eq!(parse_offset("2"), Some(2_000_000));
        assert_eq!(parse_offset("0.0000015"), Some(2));
        assert_eq!(parse_offset("1:2"), None);
        assert_eq!(parse_offset("-"), None);
    }

    #[test]
    fn writes_documented_layout() {
        let mut opts = Options::default();
        opts.mark_input();
        let entries = vec![
            Entry::new(Timestamp::from_parts(1_360_317_600, 0), b"bash $ ".to_vec()),
            Entry::new(Timestamp::from_parts(1_360_317_600, 500_000), b"ls".to_vec())
                .with_options(opts),
        ];
        let text = String::from_utf8(write_all(&entries)).unwrap();
        assert_eq!(
            text,
            "[2013-02-08 10:00:00.000000] 7\nbash $ \n[0.500000] 2 i\nls\n"
        );
    }

    #[test]
    fn reads_back_what_it_writes() {
        let entries = vec![
            Entry::new(Timestamp::from_parts(100, 250), b"multi\nline\n".to_vec()),
            Entry::new(Timestamp::from_parts(101, 0), b"x".to_vec())
                .with_options("i=0.05,j".parse().unwrap()),
            Entry::new(Timestamp::from_parts(100, 900_000), Vec::new()),
        ];
        assert_eq!(read_all(&write_all(&entries)).unwrap(), entries);
    }

    #[test]
    fn accepts_trailing_space_without_options() {
        let out = read_all(b"[2013-02-08 10:00:00.000000] 2 \nab\n").unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].options.is_empty());
    }

    #[test]
    fn sub_microsecond_digits_floor_before_epoch() {
        let before = parse_absolute("1969-12-31 23:59:59.9999996", UtcOffset::UTC).unwrap();
        assert_eq!(before, Timestamp::from_micros(-1));
        let after = parse_absolute("1970-01-01 00:00:00.0000004", UtcOffset::UTC).unwrap();
        assert_eq!(after, Timestamp::from_micros(0));
    }

    #[test]
    fn accepts_short_fraction_in_absolute_timestamp() {
        let out = read_all(b"[1970-01-01 00:00:01.5] 1\na\n").unwrap();
        assert_eq!(out[0].timestamp, Timestamp::from_parts(1, 500_000));
    }

    #[test]
    fn local_zone_shifts_absolute_time() {
        let zone = UtcOffset::from_hms(2, 0, 0).unwrap();
        let entries: Vec<Entry> = AsciiReader::new(&b"[1970-01-01 02:00:01.000000] 1\na\n"[..], zone)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries[0].timestamp, Timestamp::from_parts(1, 0));
    }

    #[test]
    fn bad_header_reports_record_and_line() {
        let text = b"[1970-01-01 00:00:01.000000] 3\na\nb\n[oops] 1\nx\n";
        let err = read_all(text).unwrap_err();
        match err {
            Error::MalformedRecord { record, line, .. } => {
                assert_eq!(record, 2);
                assert_eq!(line, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn short_payload_is_an_error() {
        let err = read_all(b"[1970-01-01 00:00:01.000000] 10\nabc\n").unwrap_err();
        assert!(matches!(err, Error::MalformedRecord { record: 1, line: 1, .. }));
    }

    #[test]
    fn missing_separator_is_an_error() {
        let err = read_all(b"[1970-01-01 00:00:01.000000] 2\nabc").unwrap_err();
        assert!(err.to_string().contains("separator"));
    }

    #[test]
    fn invalid_options_are_malformed_records() {
        let err = read_all(b"[1970-01-01 00:00:01.000000] 1 zz\na\n").unwrap_err();
        match err {
            Error::MalformedRecord { reason, .. } => assert!(reason.contains("unknown key")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reader_stops_after_error() {
        let mut reader = AsciiReader::new(&b"garbage\n[0.1] 1\na\n"[..], UtcOffset::UTC);
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }
}
