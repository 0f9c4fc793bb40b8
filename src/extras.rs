//! Less common effects, usable through recipes or `Pipeline::raw_effect`.
use std::collections::VecDeque;

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::effects::Effect;
use crate::error::{Error, Result};
use crate::record::{micros_to_secs, Entry, Tag, Timestamp};

/// Slide the per-character delay of input entries from `start_delay` to
/// `end_delay` over the first `duration` seconds of the recording.
#[derive(Debug, Clone)]
pub struct LinearInputDelay {
    start_delay: f64,
    end_delay: f64,
    duration: f64,
    start: Option<Timestamp>,
}

impl LinearInputDelay {
    pub fn new(start_delay: f64, end_delay: f64, duration: f64) -> Result<Self> {
        for (name, value) in [("start_delay", start_delay), ("end_delay", end_delay)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::precondition(
                    "linear_input_delay",
                    format!("{name} must be a non-negative number, got {value}"),
                ));
            }
        }
        if !(duration.is_finite() && duration > 0.0) {
            return Err(Error::precondition(
                "linear_input_delay",
                format!("duration must be positive, got {duration}"),
            ));
        }
        Ok(Self {
            start_delay,
            end_delay,
            duration,
            start: None,
        })
    }

    fn delay_at(&self, elapsed: f64) -> f64 {
        let factor = elapsed.clamp(0.0, self.duration) / self.duration;
        self.start_delay * (1.0 - factor) + self.end_delay * factor
    }
}

impl Effect for LinearInputDelay {
    fn push(&mut self, mut entry: Entry, out: &mut VecDeque<Entry>) {
        match self.start {
            None => self.start = Some(entry.timestamp),
            Some(start) if entry.is_input() => {
                let elapsed = micros_to_secs(entry.timestamp.micros_since(start));
                entry.options.input = Some(Tag::with_value(self.delay_at(elapsed)));
            }
            Some(_) => {}
        }
        out.push_back(entry);
    }
}

// " \r" not followed by "\n", as emitted by shells redrawing on a resize
static WINDOW_SIZE_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?-u) \r([^\n]|$)").expect("static regex"));

/// Strip the ` \r` sequences terminals emit when the window is resized.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveWindowSize;

impl RemoveWindowSize {
    pub fn clean(payload: &[u8]) -> Vec<u8> {
        WINDOW_SIZE_NOISE.replace_all(payload, &b"${1}"[..]).into_owned()
    }
}

impl Effect for RemoveWindowSize {
    fn push(&mut self, mut entry: Entry, out: &mut VecDeque<Entry>) {
        if entry.payload.windows(2).any(|w| w == b" \r") {
            entry.payload = Self::clean(&entry.payload);
        }
        out.push_back(entry);
    }
}
