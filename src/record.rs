//! The data shape flowing through every codec and effect.
//!
//! A recording is a sequence of [`Entry`] values: a microsecond
//! [`Timestamp`], the raw bytes the terminal produced (or the user typed) and
//! a small set of [`Options`] tags. Payload bytes are never interpreted.
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Per-character delay used when an `i` tag carries no value.
pub const DEFAULT_INPUT_DELAY: f64 = 0.1;
/// Jitter amount used when a `j` tag carries no value.
pub const DEFAULT_JITTER: f64 = 0.2;

const MICROS_PER_SEC: i64 = 1_000_000;

/// Convert fractional seconds to whole microseconds (round to nearest,
/// saturating at the `i64` range).
pub fn secs_to_micros(secs: f64) -> i64 {
    (secs * MICROS_PER_SEC as f64).round() as i64
}

pub fn micros_to_secs(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_SEC as f64
}

/// Point in time, microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Build from a `(seconds, microseconds)` pair as stored in binary headers.
    pub const fn from_parts(secs: i64, usecs: i64) -> Self {
        Self(secs * MICROS_PER_SEC + usecs)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self(secs_to_micros(secs))
    }

    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        Self(i64::try_from(micros).unwrap_or(i64::MAX))
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        micros_to_secs(self.0)
    }

    /// Split into whole seconds and the `0..1_000_000` microsecond remainder.
    pub const fn to_parts(self) -> (i64, i64) {
        (self.0.div_euclid(MICROS_PER_SEC), self.0.rem_euclid(MICROS_PER_SEC))
    }

    pub const fn shifted(self, micros: i64) -> Self {
        Self(self.0.saturating_add(micros))
    }

    /// Signed gap `self - earlier` in microseconds.
    pub const fn micros_since(self, earlier: Timestamp) -> i64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (secs, usecs) = self.to_parts();
        write!(f, "{secs}.{usecs:06}")
    }
}

/// A tag that is either bare (`i`) or carries a number (`i=0.05`).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Tag {
    pub value: Option<f64>,
}

impl Tag {
    pub const fn bare() -> Self {
        Self { value: None }
    }

    pub const fn with_value(value: f64) -> Self {
        Self { value: Some(value) }
    }
}

/// Per-entry tags: `i` marks user input (value = seconds per typed
/// character), `j` requests jitter on that per-character delay.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Options {
    pub input: Option<Tag>,
    pub jitter: Option<Tag>,
}

impl Options {
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.jitter.is_none()
    }

    pub fn is_input(&self) -> bool {
        self.input.is_some()
    }

    /// Tag the entry as input, keeping an existing `i` value.
    pub fn mark_input(&mut self) {
        if self.input.is_none() {
            self.input = Some(Tag::bare());
        }
    }

    /// Seconds between emitted characters, if this is an input entry.
    pub fn input_delay(&self) -> Option<f64> {
        self.input
            .map(|tag| tag.value.unwrap_or(DEFAULT_INPUT_DELAY))
    }

    /// Jitter amount requested through `j`, if any.
    pub fn jitter_amount(&self) -> Option<f64> {
        self.jitter.map(|tag| tag.value.unwrap_or(DEFAULT_JITTER))
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ',' | '.' | '=')
}

fn invalid(token: &str, reason: &'static str) -> Error {
    Error::InvalidOptions {
        token: token.to_string(),
        reason,
    }
}

fn parse_tag_value(token: &str, raw: &str) -> Result<f64> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(invalid(token, "value must be a non-negative decimal number"));
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| invalid(token, "value must be a non-negative decimal number"))
}

impl FromStr for Options {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut opts = Options::default();
        if s.is_empty() {
            return Ok(opts);
        }
        if !s.chars().all(is_token_char) {
            return Err(invalid(s, "only letters, digits and ',.=' are allowed"));
        }
        for token in s.split(',') {
            let (key, value) = match token.split_once('=') {
                Some((key, raw)) => (key, Some(parse_tag_value(token, raw)?)),
                None => (token, None),
            };
            let tag = Tag { value };
            match key {
                "i" => opts.input = Some(tag),
                "j" => opts.jitter = Some(tag),
                "" => return Err(invalid(token, "empty key")),
                _ => return Err(invalid(token, "unknown key (expected 'i' or 'j')")),
            }
        }
        Ok(opts)
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens = [("i", self.input), ("j", self.jitter)]
            .into_iter()
            .filter_map(|(key, tag)| {
                tag.map(|tag| match tag.value {
                    Some(v) => format!("{key}={v}"),
                    None => key.to_string(),
                })
            })
            .collect::<Vec<_>>();
        f.write_str(&tokens.join(","))
    }
}

/// One `(timestamp, payload, options)` unit of a terminal recording.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
    pub options: Options,
}

impl Entry {
    pub fn new(timestamp: Timestamp, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
            options: Options::default(),
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// A single-byte payload, conventionally one typed character.
    pub fn is_keystroke(&self) -> bool {
        self.payload.len() == 1
    }

    pub fn is_input(&self) -> bool {
        self.options.is_input()
    }
}
