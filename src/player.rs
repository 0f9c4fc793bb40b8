//! Real-time playback of a pipeline to a terminal.
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::jitter::{seeded_rng, Jitter, DEFAULT_MAX_DELAY};
use crate::pipeline::Pipeline;
use crate::record::{secs_to_micros, Entry, Timestamp};

/// Commands accepted while playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    TogglePause,
    Faster,
    Slower,
    Quit,
}

#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    pub speed: f64,
    /// Upper bound on any recorded gap, before speed scaling.
    pub max_idle: Option<Duration>,
    /// Factor applied by `Faster` and `Slower`.
    pub speed_step: f64,
    /// Type `i`-tagged entries one byte at a time.
    pub type_input: bool,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            max_idle: None,
            speed_step: 2.0,
            type_input: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSummary {
    pub entries: usize,
    pub quit: bool,
}

pub struct Player<W: Write> {
    out: W,
    controls: Receiver<Control>,
    options: PlaybackOptions,
    speed: f64,
    paused: bool,
    quit: bool,
    disconnected: bool,
    rng: StdRng,
}

impl<W: Write> Player<W> {
    pub fn new(out: W, controls: Receiver<Control>, options: PlaybackOptions) -> Result<Self> {
        if !(options.speed.is_finite() && options.speed > 0.0) {
            return Err(Error::precondition(
                "player",
                format!("speed must be positive, got {}", options.speed),
            ));
        }
        if !(options.speed_step.is_finite() && options.speed_step >= 1.0) {
            return Err(Error::precondition(
                "player",
                format!("speed_step must be at least 1, got {}", options.speed_step),
            ));
        }
        Ok(Self {
            out,
            controls,
            speed: options.speed,
            options,
            paused: false,
            quit: false,
            disconnected: false,
            rng: seeded_rng(0),
        })
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Play one full pass. A quit request stops at the next entry boundary
    /// and leaves the pipeline reset for a later pass.
    pub fn play(&mut self, pipeline: &mut Pipeline) -> Result<PlaybackSummary> {
        self.quit = false;
        let mut last: Option<Timestamp> = None;
        let mut entries = 0;
        loop {
            self.poll();
            if self.quit {
                pipeline.reset();
                info!(entries, "playback stopped");
                return Ok(PlaybackSummary { entries, quit: true });
            }
            let Some(entry) = pipeline.next_entry()? else {
                break;
            };
            let gap = last.map_or(0, |prev| entry.timestamp.micros_since(prev).max(0));
            self.wait(self.cap_idle(gap));
            if self.quit {
                continue;
            }
            self.write_entry(&entry)?;
            last = Some(entry.timestamp);
            entries += 1;
        }
        info!(entries, "playback finished");
        Ok(PlaybackSummary { entries, quit: false })
    }

    fn cap_idle(&self, gap: i64) -> i64 {
        match self.options.max_idle {
            Some(max) => gap.min(i64::try_from(max.as_micros()).unwrap_or(i64::MAX)),
            None => gap,
        }
    }

    fn write_entry(&mut self, entry: &Entry) -> Result<()> {
        let delay = match entry.options.input_delay() {
            Some(delay) if self.options.type_input && entry.payload.len() > 1 => delay,
            _ => {
                self.out.write_all(&entry.payload)?;
                self.out.flush()?;
                return Ok(());
            }
        };
        let jitter = entry
            .options
            .jitter_amount()
            .map(|amount| Jitter::new(amount, DEFAULT_MAX_DELAY, false))
            .transpose()?;
        for (k, byte) in entry.payload.iter().enumerate() {
            // once quit is requested the rest of the keystroke is flushed at once
            if k > 0 && !self.quit {
                let step = match &jitter {
                    Some(j) => j.apply(delay, &mut self.rng),
                    None => delay,
                };
                self.wait(secs_to_micros(step));
            }
            self.out.write_all(std::slice::from_ref(byte))?;
            self.out.flush()?;
        }
        Ok(())
    }

    fn handle(&mut self, control: Control) {
        match control {
            Control::TogglePause => self.paused = !self.paused,
            Control::Faster => self.speed *= self.options.speed_step,
            Control::Slower => self.speed /= self.options.speed_step,
            Control::Quit => self.quit = true,
        }
        debug!(?control, speed = self.speed, paused = self.paused, "playback control");
    }

    fn poll(&mut self) {
        loop {
            match self.controls.try_recv() {
                Ok(control) => self.handle(control),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    return;
                }
            }
        }
    }

    /// Sleep for `gap` microseconds of recording time, reacting to controls.
    fn wait(&mut self, gap: i64) {
        let mut remaining = gap;
        while remaining > 0 && !self.quit {
            if self.disconnected {
                self.paused = false;
                thread::sleep(self.real_time(remaining));
                return;
            }
            if self.paused {
                match self.controls.recv() {
                    Ok(control) => self.handle(control),
                    Err(_) => self.disconnected = true,
                }
                continue;
            }
            let started = Instant::now();
            let outcome = self.controls.recv_timeout(self.real_time(remaining));
            let slept = started.elapsed().as_micros() as f64 * self.speed;
            remaining -= slept as i64;
            match outcome {
                Ok(control) => self.handle(control),
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => self.disconnected = true,
            }
        }
    }

    fn real_time(&self, micros: i64) -> Duration {
        Duration::from_micros((micros.max(0) as f64 / self.speed) as u64)
    }
}
