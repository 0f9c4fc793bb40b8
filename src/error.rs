//! Error taxonomy shared by the codecs, effects and the pipeline.
//!
//! A truncated trailing record in a binary recording is not represented here:
//! the binary reader reports it as a normal end of stream.
use std::path::PathBuf;

use thiserror::Error;

use crate::record::Timestamp;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// ASCII header grammar mismatch, short payload or missing separator.
    #[error("error in entry {record} (line ~{line}): {reason}")]
    MalformedRecord {
        record: usize,
        line: usize,
        reason: String,
    },

    #[error("invalid options token {token:?}: {reason}")]
    InvalidOptions { token: String, reason: &'static str },

    #[error("{effect}: {reason}")]
    EffectPrecondition { effect: &'static str, reason: String },

    #[error("payload of {len} bytes does not fit a signed 32-bit length")]
    PayloadTooLarge { len: usize },

    #[error("record {record} declares a negative payload length ({length})")]
    NegativeLength { record: usize, length: i32 },

    #[error("timestamp {0} cannot be represented in this format")]
    TimestampOutOfRange(Timestamp),

    #[error("no source attached to the pipeline")]
    NoSource,

    #[error("recipe: {0}")]
    Recipe(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn precondition(effect: &'static str, reason: impl Into<String>) -> Self {
        Self::EffectPrecondition {
            effect,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_record_mentions_position() {
        let err = Error::MalformedRecord {
            record: 3,
            line: 7,
            reason: "missing record separator".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("entry 3"));
        assert!(msg.contains("line ~7"));
    }

    #[test]
    fn precondition_names_effect() {
        let err = Error::precondition("change_speed", "speed must be positive, got 0");
        assert_eq!(err.to_string(), "change_speed: speed must be positive, got 0");
    }
}
