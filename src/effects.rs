//! Timing and content effects over a lazy entry stream.
//!
//! Every effect is a small state machine implementing [`Effect`]: it receives
//! one upstream entry at a time and pushes zero or more entries downstream.
//! [`Applied`] turns an effect plus an upstream iterator into a new lazy
//! iterator, so effects chain in caller order and nothing runs until the
//! consumer pulls. Parameters are validated when an effect is constructed.
use std::collections::VecDeque;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::extras::{LinearInputDelay, RemoveWindowSize};
use crate::jitter::{seeded_rng, Jitter};
use crate::record::{micros_to_secs, secs_to_micros, Entry, Timestamp};

/// A lazy, single-pass sequence of entries.
pub type Stream = Box<dyn Iterator<Item = Result<Entry>>>;

/// Cursor home + clear screen.
pub const CLEAR_SCREEN: &[u8] = b"\x1b[H\x1b[2J";

pub trait Effect {
    /// Consume one upstream entry, emitting any number of entries.
    fn push(&mut self, entry: Entry, out: &mut VecDeque<Entry>);

    /// Called once when upstream is exhausted; flush buffered state here.
    fn finish(&mut self, _out: &mut VecDeque<Entry>) {}
}

/// An effect applied to an upstream stream.
pub struct Applied<I, E> {
    upstream: I,
    effect: E,
    pending: VecDeque<Entry>,
    done: bool,
}

impl<I, E> Iterator for Applied<I, E>
where
    I: Iterator<Item = Result<Entry>>,
    E: Effect,
{
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            if self.done {
                return None;
            }
            match self.upstream.next() {
                Some(Ok(entry)) => self.effect.push(entry, &mut self.pending),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    self.effect.finish(&mut self.pending);
                }
            }
        }
    }
}

pub trait EffectExt: Iterator<Item = Result<Entry>> + Sized {
    fn apply<E: Effect>(self, effect: E) -> Applied<Self, E> {
        Applied {
            upstream: self,
            effect,
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<I: Iterator<Item = Result<Entry>>> EffectExt for I {}

impl<E: Effect + ?Sized> Effect for Box<E> {
    fn push(&mut self, entry: Entry, out: &mut VecDeque<Entry>) {
        (**self).push(entry, out);
    }

    fn finish(&mut self, out: &mut VecDeque<Entry>) {
        (**self).finish(out);
    }
}

fn non_negative(effect: &'static str, name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(Error::precondition(
            effect,
            format!("{name} must be a non-negative number, got {value}"),
        ))
    }
}

fn positive(effect: &'static str, name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(Error::precondition(
            effect,
            format!("{name} must be positive, got {value}"),
        ))
    }
}

/// Retime every keystroke to a fixed characters-per-minute cadence.
pub struct NormalizeInputSpeed {
    char_time: i64,
    last: Option<Timestamp>,
    offset: i64,
}

impl NormalizeInputSpeed {
    pub fn new(cpm: f64) -> Result<Self> {
        let cpm = positive("normalize_input_speed", "cpm", cpm)?;
        Ok(Self {
            char_time: secs_to_micros(60.0 / cpm),
            last: None,
            offset: 0,
        })
    }
}

impl Effect for NormalizeInputSpeed {
    fn push(&mut self, mut entry: Entry, out: &mut VecDeque<Entry>) {
        let original = entry.timestamp;
        if let Some(last) = self.last {
            if entry.is_keystroke() {
                let gap = original.micros_since(last);
                self.offset = self.offset.saturating_add(self.char_time.saturating_sub(gap));
            }
        }
        entry.timestamp = original.shifted(self.offset);
        self.last = Some(original);
        out.push_back(entry);
    }
}

/// Jitter the gap before every keystroke so typing looks less mechanical.
pub struct HumanizeInput {
    jitter: Jitter,
    rng: StdRng,
    last: Option<Timestamp>,
    offset: i64,
}

impl HumanizeInput {
    pub fn new(jitter: f64, max_delay: f64, cap_to_max: bool, seed: u64) -> Result<Self> {
        let jitter = Jitter::new(jitter, max_delay, cap_to_max).map_err(|e| match e {
            Error::EffectPrecondition { reason, .. } => Error::precondition("humanize_input", reason),
            other => other,
        })?;
        Ok(Self {
            jitter,
            rng: seeded_rng(seed),
            last: None,
            offset: 0,
        })
    }
}

impl Effect for HumanizeInput {
    fn push(&mut self, mut entry: Entry, out: &mut VecDeque<Entry>) {
        let original = entry.timestamp;
        if let Some(last) = self.last {
            if entry.is_keystroke() {
                let gap = original.micros_since(last);
                let wanted = self.jitter.apply(micros_to_secs(gap), &mut self.rng);
                self.offset = self.offset.saturating_add(secs_to_micros(wanted).saturating_sub(gap));
            }
        }
        entry.timestamp = original.shifted(self.offset);
        self.last = Some(original);
        out.push_back(entry);
    }
}

/// Shrink every gap longer than `max_delay` down to exactly `max_delay`.
///
/// The first gap is measured against the wall-clock time at which the effect
/// was instantiated, so a recording dated in the future gets pulled back.
pub struct CapDelays {
    max_delay: i64,
    last: Timestamp,
    offset: i64,
}

impl CapDelays {
    pub fn new(max_delay: f64) -> Result<Self> {
        Self::anchored(max_delay, Timestamp::now())
    }

    /// Like [`CapDelays::new`] with an explicit reference for the first gap.
    pub fn anchored(max_delay: f64, anchor: Timestamp) -> Result<Self> {
        let max_delay = non_negative("cap_delays", "max_delay", max_delay)?;
        Ok(Self {
            max_delay: secs_to_micros(max_delay),
            last: anchor,
            offset: 0,
        })
    }
}

impl Effect for CapDelays {
    fn push(&mut self, mut entry: Entry, out: &mut VecDeque<Entry>) {
        let original = entry.timestamp;
        let elapsed = original.micros_since(self.last);
        if elapsed > self.max_delay {
            self.offset = self.offset.saturating_add(self.max_delay.saturating_sub(elapsed));
        }
        entry.timestamp = original.shifted(self.offset);
        self.last = original;
        out.push_back(entry);
    }
}

/// Scale every gap by `1 / speed`.
///
/// The first entry has no gap to scale and is dropped.
pub struct ChangeSpeed {
    speed: f64,
    last: Option<Timestamp>,
    offset: i64,
}

impl ChangeSpeed {
    pub fn new(speed: f64) -> Result<Self> {
        Ok(Self {
            speed: positive("change_speed", "speed", speed)?,
            last: None,
            offset: 0,
        })
    }
}

impl Effect for ChangeSpeed {
    fn push(&mut self, mut entry: Entry, out: &mut VecDeque<Entry>) {
        let original = entry.timestamp;
        if let Some(last) = self.last {
            let elapsed = original.micros_since(last);
            let scaled = (elapsed as f64 / self.speed).round() as i64;
            self.offset = self.offset.saturating_add(scaled.saturating_sub(elapsed));
            entry.timestamp = original.shifted(self.offset);
            out.push_back(entry);
        }
        self.last = Some(original);
    }
}

/// Prepend a blank screen shown for `intro_delay` seconds.
pub struct AddIntro {
    delay: i64,
    shown: bool,
}

impl AddIntro {
    pub fn new(intro_delay: f64) -> Result<Self> {
        let delay = non_negative("add_intro", "intro_delay", intro_delay)?;
        Ok(Self {
            delay: secs_to_micros(delay),
            shown: false,
        })
    }
}

impl Effect for AddIntro {
    fn push(&mut self, entry: Entry, out: &mut VecDeque<Entry>) {
        if !self.shown {
            self.shown = true;
            out.push_back(Entry::new(
                entry.timestamp.shifted(-self.delay),
                CLEAR_SCREEN.to_vec(),
            ));
        }
        out.push_back(entry);
    }
}

/// Split a payload after every `\n`, `\r\n` or lone `\r`, keeping terminators.
pub fn split_lines(payload: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < payload.len() {
        match payload[i] {
            b'\n' => {
                lines.push(&payload[start..=i]);
                start = i + 1;
            }
            b'\r' => {
                let end = if payload.get(i + 1) == Some(&b'\n') { i + 1 } else { i };
                lines.push(&payload[start..=end]);
                start = end + 1;
                i = end;
            }
            _ => {}
        }
        i += 1;
    }
    if start < payload.len() {
        lines.push(&payload[start..]);
    }
    lines
}

/// Reveal multi-line output one line at a time.
pub struct DelayLines {
    delay: i64,
    offset: i64,
}

impl DelayLines {
    pub fn new(delay_per_line: f64) -> Result<Self> {
        let delay = non_negative("delay_lines", "delay_per_line", delay_per_line)?;
        Ok(Self {
            delay: secs_to_micros(delay),
            offset: 0,
        })
    }
}

impl Effect for DelayLines {
    fn push(&mut self, entry: Entry, out: &mut VecDeque<Entry>) {
        let lines = split_lines(&entry.payload);
        if lines.is_empty() {
            out.push_back(Entry {
                timestamp: entry.timestamp.shifted(self.offset),
                ..entry
            });
            return;
        }
        for (k, line) in lines.into_iter().enumerate() {
            if k > 0 {
                self.offset = self.offset.saturating_add(self.delay);
            }
            out.push_back(Entry {
                timestamp: entry.timestamp.shifted(self.offset),
                payload: line.to_vec(),
                options: entry.options,
            });
        }
    }
}

/// Pause before a run of input entries starts and after it ends.
pub struct DelayInput {
    before: i64,
    after: i64,
    offset: i64,
    in_input: bool,
    last_out: Option<Timestamp>,
}

impl DelayInput {
    pub fn new(delay_before: f64, delay_after: f64) -> Result<Self> {
        for (name, value) in [("delay_before", delay_before), ("delay_after", delay_after)] {
            if !value.is_finite() {
                return Err(Error::precondition(
                    "delay_input",
                    format!("{name} must be a finite number, got {value}"),
                ));
            }
        }
        Ok(Self {
            before: secs_to_micros(delay_before),
            after: secs_to_micros(delay_after),
            offset: 0,
            in_input: false,
            last_out: None,
        })
    }
}

impl Effect for DelayInput {
    fn push(&mut self, mut entry: Entry, out: &mut VecDeque<Entry>) {
        match (entry.is_input(), self.in_input) {
            (true, false) => {
                self.offset = self.offset.saturating_add(self.before);
                self.in_input = true;
            }
            (false, true) => {
                self.offset = self.offset.saturating_add(self.after);
                self.in_input = false;
            }
            _ => {}
        }
        let mut stamp = entry.timestamp.shifted(self.offset);
        if let Some(last) = self.last_out {
            if stamp < last {
                self.offset = self.offset.saturating_add(last.micros_since(stamp));
                stamp = last;
            }
        }
        entry.timestamp = stamp;
        self.last_out = Some(stamp);
        out.push_back(entry);
    }
}

/// Coalesce entries arriving less than `threshold` after a buffered one.
pub struct MergeLines {
    threshold: i64,
    merge_input: bool,
    pending: Option<Entry>,
}

impl MergeLines {
    pub fn new(threshold: f64, merge_input: bool) -> Result<Self> {
        let threshold = non_negative("merge_lines", "threshold", threshold)?;
        Ok(Self {
            threshold: secs_to_micros(threshold),
            merge_input,
            pending: None,
        })
    }

    fn mergeable(&self, head: &Entry, next: &Entry) -> bool {
        next.timestamp.micros_since(head.timestamp) < self.threshold
            && (self.merge_input || !(head.is_input() || next.is_input()))
    }
}

impl Effect for MergeLines {
    fn push(&mut self, entry: Entry, out: &mut VecDeque<Entry>) {
        let merge = self
            .pending
            .as_ref()
            .is_some_and(|head| self.mergeable(head, &entry));
        if merge {
            if let Some(head) = self.pending.as_mut() {
                head.payload.extend_from_slice(&entry.payload);
            }
            return;
        }
        if let Some(head) = self.pending.replace(entry) {
            out.push_back(head);
        }
    }

    fn finish(&mut self, out: &mut VecDeque<Entry>) {
        if let Some(head) = self.pending.take() {
            out.push_back(head);
        }
    }
}

/// Tag the entry following a shell prompt as user input.
pub struct MarkInput {
    suffix: Vec<u8>,
    next_is_input: bool,
}

impl MarkInput {
    pub fn new(prompt_suffix: impl Into<Vec<u8>>) -> Self {
        Self {
            suffix: prompt_suffix.into(),
            next_is_input: false,
        }
    }
}

impl Effect for MarkInput {
    fn push(&mut self, mut entry: Entry, out: &mut VecDeque<Entry>) {
        if self.next_is_input {
            self.next_is_input = false;
            entry.options.mark_input();
        } else if !self.suffix.is_empty() && entry.payload.ends_with(&self.suffix) {
            self.next_is_input = true;
        }
        out.push_back(entry);
    }
}

mod defaults {
    pub fn cpm() -> f64 { 350.0 }
    pub fn jitter() -> f64 { 0.2 }
    pub fn max_jitter_delay() -> f64 { 1.0 }
    pub fn max_delay() -> f64 { 3.0 }
    pub fn speed() -> f64 { 1.0 }
    pub fn intro_delay() -> f64 { 1.0 }
    pub fn delay_per_line() -> f64 { 0.1 }
    pub fn delay_after() -> f64 { 1.0 }
    pub fn threshold() -> f64 { 0.01 }
    pub fn prompt_suffix() -> String { " $ ".to_string() }
    pub fn start_delay() -> f64 { 0.1 }
    pub fn end_delay() -> f64 { 0.01 }
    pub fn duration() -> f64 { 600.0 }
}

/// Declarative description of one effect and its captured arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectSpec {
    NormalizeInputSpeed {
        #[serde(default = "defaults::cpm")]
        cpm: f64,
    },
    HumanizeInput {
        #[serde(default = "defaults::jitter")]
        jitter: f64,
        #[serde(default = "defaults::max_jitter_delay")]
        max_delay: f64,
        #[serde(default)]
        cap_to_max: bool,
        #[serde(default)]
        seed: u64,
    },
    CapDelays {
        #[serde(default = "defaults::max_delay")]
        max_delay: f64,
    },
    ChangeSpeed {
        #[serde(default = "defaults::speed")]
        speed: f64,
    },
    AddIntro {
        #[serde(default = "defaults::intro_delay")]
        intro_delay: f64,
    },
    DelayLines {
        #[serde(default = "defaults::delay_per_line")]
        delay_per_line: f64,
    },
    DelayInput {
        #[serde(default)]
        delay_before: f64,
        #[serde(default = "defaults::delay_after")]
        delay_after: f64,
    },
    MergeLines {
        #[serde(default = "defaults::threshold")]
        threshold: f64,
        #[serde(default)]
        merge_input: bool,
    },
    MarkInput {
        #[serde(default = "defaults::prompt_suffix")]
        prompt_suffix: String,
    },
    LinearInputDelay {
        #[serde(default = "defaults::start_delay")]
        start_delay: f64,
        #[serde(default = "defaults::end_delay")]
        end_delay: f64,
        #[serde(default = "defaults::duration")]
        duration: f64,
    },
    RemoveWindowSize,
}

impl EffectSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NormalizeInputSpeed { .. } => "normalize_input_speed",
            Self::HumanizeInput { .. } => "humanize_input",
            Self::CapDelays { .. } => "cap_delays",
            Self::ChangeSpeed { .. } => "change_speed",
            Self::AddIntro { .. } => "add_intro",
            Self::DelayLines { .. } => "delay_lines",
            Self::DelayInput { .. } => "delay_input",
            Self::MergeLines { .. } => "merge_lines",
            Self::MarkInput { .. } => "mark_input",
            Self::LinearInputDelay { .. } => "linear_input_delay",
            Self::RemoveWindowSize => "remove_window_size",
        }
    }

    /// Instantiate fresh effect state on top of `upstream`.
    pub fn attach(&self, upstream: Stream) -> Result<Stream> {
        let stream: Stream = match self {
            Self::NormalizeInputSpeed { cpm } => Box::new(upstream.apply(NormalizeInputSpeed::new(*cpm)?)),
            Self::HumanizeInput { jitter, max_delay, cap_to_max, seed } => Box::new(
                upstream.apply(HumanizeInput::new(*jitter, *max_delay, *cap_to_max, *seed)?),
            ),
            Self::CapDelays { max_delay } => Box::new(upstream.apply(CapDelays::new(*max_delay)?)),
            Self::ChangeSpeed { speed } => Box::new(upstream.apply(ChangeSpeed::new(*speed)?)),
            Self::AddIntro { intro_delay } => Box::new(upstream.apply(AddIntro::new(*intro_delay)?)),
            Self::DelayLines { delay_per_line } => Box::new(upstream.apply(DelayLines::new(*delay_per_line)?)),
            Self::DelayInput { delay_before, delay_after } => {
                Box::new(upstream.apply(DelayInput::new(*delay_before, *delay_after)?))
            }
            Self::MergeLines { threshold, merge_input } => {
                Box::new(upstream.apply(MergeLines::new(*threshold, *merge_input)?))
            }
            Self::MarkInput { prompt_suffix } => {
                Box::new(upstream.apply(MarkInput::new(prompt_suffix.as_bytes())))
            }
            Self::LinearInputDelay { start_delay, end_delay, duration } => Box::new(
                upstream.apply(LinearInputDelay::new(*start_delay, *end_delay, *duration)?),
            ),
            Self::RemoveWindowSize => Box::new(upstream.apply(RemoveWindowSize)),
        };
        Ok(stream)
    }

    /// Check the captured arguments without touching any stream.
    pub fn validate(&self) -> Result<()> {
        self.attach(Box::new(std::iter::empty())).map(drop)
    }
}
