//! Replayable chain of a source plus effects.
//!
//! A [`Pipeline`] records every chained call as an [`Operation`] and keeps a
//! live [`Stream`] built from them. The live stream is single-pass; once a
//! consumer drains it the pipeline re-runs its operation log against a fresh
//! source, so the same logical pipeline can be written or iterated again.
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use time::UtcOffset;
use tracing::{debug, warn};

use crate::ascii::{AsciiReader, AsciiWriter};
use crate::binary::{BinaryReader, BinaryWriter};
use crate::effects::{self, Effect, EffectSpec, Stream};
use crate::error::{Error, Result};
use crate::recipe::Recipe;
use crate::record::Entry;

/// On-disk representation of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Binary,
    Ascii,
}

impl Format {
    /// Guess from the file extension: `.txt`/`.ascii` are text, anything else binary.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("txt") || ext.eq_ignore_ascii_case("ascii") => {
                Self::Ascii
            }
            _ => Self::Binary,
        }
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "bin" | "ttyrec" => Ok(Self::Binary),
            "ascii" | "text" | "txt" => Ok(Self::Ascii),
            other => Err(format!("unknown format {other:?} (expected binary or ascii)")),
        }
    }
}

/// Where a pipeline's entries come from.
#[derive(Clone)]
pub enum Source {
    BinaryFile(PathBuf),
    AsciiFile { path: PathBuf, zone: UtcOffset },
    BinaryBytes(Arc<[u8]>),
    Entries(Arc<[Entry]>),
}

impl Source {
    fn open(&self) -> Result<Stream> {
        let stream: Stream = match self {
            Self::BinaryFile(path) => Box::new(BinaryReader::new(BufReader::new(open_file(path)?))),
            Self::AsciiFile { path, zone } => {
                Box::new(AsciiReader::new(BufReader::new(open_file(path)?), *zone))
            }
            Self::BinaryBytes(bytes) => Box::new(BinaryReader::new(Cursor::new(Arc::clone(bytes)))),
            Self::Entries(entries) => {
                let entries = Arc::clone(entries);
                Box::new((0..entries.len()).map(move |i| Ok::<_, Error>(entries[i].clone())))
            }
        };
        Ok(stream)
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BinaryFile(path) => write!(f, "binary file {path:?}"),
            Self::AsciiFile { path, .. } => write!(f, "ascii file {path:?}"),
            Self::BinaryBytes(bytes) => write!(f, "{} bytes of binary data", bytes.len()),
            Self::Entries(entries) => write!(f, "{} in-memory entries", entries.len()),
        }
    }
}

fn open_file(path: &Path) -> Result<File> {
    File::open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })
}

fn create_file(path: &Path) -> Result<File> {
    File::create(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Builds a fresh instance of a caller-supplied effect for every pass.
pub type EffectFactory = Arc<dyn Fn() -> Box<dyn Effect>>;

/// One recorded call, with the arguments it was made with.
#[derive(Clone)]
pub enum Operation {
    Attach(Source),
    Effect(EffectSpec),
    Custom { name: String, factory: EffectFactory },
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Self::Attach(_) => "attach",
            Self::Effect(spec) => spec.name(),
            Self::Custom { name, .. } => name,
        }
    }

    /// Put this operation on top of `upstream`; a source replaces it.
    fn chain(&self, upstream: Stream) -> Result<Stream> {
        match self {
            Self::Attach(source) => source.open(),
            Self::Effect(spec) => spec.attach(upstream),
            Self::Custom { factory, .. } => Ok(Box::new(effects::EffectExt::apply(upstream, factory()))),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attach(source) => f.debug_tuple("Attach").field(source).finish(),
            Self::Effect(spec) => f.debug_tuple("Effect").field(spec).finish(),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No source attached.
    Empty,
    /// A live stream is in progress.
    Built,
    /// No live stream; the next pull replays the operation log.
    Consumed,
}

pub struct Pipeline {
    ops: Vec<Operation>,
    live: Option<Stream>,
    // the last pull returned an error, so the next one ends the pass
    failed: bool,
    zone: UtcOffset,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("ops", &self.ops)
            .field("state", &self.state())
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            live: None,
            failed: false,
            zone: UtcOffset::UTC,
        }
    }

    /// UTC offset used for absolute timestamps in the ASCII form.
    pub fn with_zone(mut self, zone: UtcOffset) -> Self {
        self.zone = zone;
        self
    }

    pub fn state(&self) -> PipelineState {
        if self.ops.is_empty() {
            PipelineState::Empty
        } else if self.live.is_some() {
            PipelineState::Built
        } else {
            PipelineState::Consumed
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    /// Start a new operation log from `source`.
    pub fn attach(&mut self, source: Source) -> Result<&mut Self> {
        let stream = source.open()?;
        debug!(?source, "attached source");
        self.ops.clear();
        self.ops.push(Operation::Attach(source));
        self.live = Some(stream);
        self.failed = false;
        Ok(self)
    }

    pub fn read_binary(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        self.attach(Source::BinaryFile(path.as_ref().to_path_buf()))
    }

    pub fn read_ascii(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let zone = self.zone;
        self.attach(Source::AsciiFile {
            path: path.as_ref().to_path_buf(),
            zone,
        })
    }

    pub fn read(&mut self, path: impl AsRef<Path>, format: Format) -> Result<&mut Self> {
        match format {
            Format::Binary => self.read_binary(path),
            Format::Ascii => self.read_ascii(path),
        }
    }

    pub fn read_binary_bytes(&mut self, bytes: impl Into<Arc<[u8]>>) -> Result<&mut Self> {
        self.attach(Source::BinaryBytes(bytes.into()))
    }

    pub fn read_entries(&mut self, entries: Vec<Entry>) -> Result<&mut Self> {
        self.attach(Source::Entries(entries.into()))
    }

    fn push_operation(&mut self, op: Operation) -> Result<&mut Self> {
        if self.ops.is_empty() {
            return Err(Error::NoSource);
        }
        // a pass in progress picks the effect up; otherwise the next rebuild will
        if let Some(upstream) = self.live.take() {
            self.live = Some(op.chain(upstream)?);
        }
        debug!(operation = op.name(), "chained effect");
        self.ops.push(op);
        Ok(self)
    }

    /// Chain an effect; its arguments are validated before anything is recorded.
    pub fn apply(&mut self, spec: EffectSpec) -> Result<&mut Self> {
        if self.ops.is_empty() {
            return Err(Error::NoSource);
        }
        spec.validate()?;
        self.push_operation(Operation::Effect(spec))
    }

    /// Chain a caller-defined effect. `factory` runs once per pass, so every
    /// replay starts from fresh effect state.
    ///
    /// ```no_run
    /// use ttyrec_retime::extras::LinearInputDelay;
    /// use ttyrec_retime::Pipeline;
    ///
    /// # fn main() -> ttyrec_retime::Result<()> {
    /// let linear = LinearInputDelay::new(0.1, 0.01, 600.0)?;
    /// let mut pipeline = Pipeline::new();
    /// pipeline
    ///     .read_ascii("session.txt")?
    ///     .delay_lines(0.05)?
    ///     .raw_effect("linear_input_delay", move || linear.clone())?;
    /// pipeline.write_ascii("retimed.txt")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn raw_effect<E, F>(&mut self, name: &str, factory: F) -> Result<&mut Self>
    where
        E: Effect + 'static,
        F: Fn() -> E + 'static,
    {
        let factory: EffectFactory = Arc::new(move || Box::new(factory()) as Box<dyn Effect>);
        self.push_operation(Operation::Custom {
            name: name.to_string(),
            factory,
        })
    }

    pub fn apply_recipe(&mut self, recipe: &Recipe) -> Result<&mut Self> {
        for spec in &recipe.effects {
            self.apply(spec.clone())?;
        }
        Ok(self)
    }

    pub fn normalize_input_speed(&mut self, cpm: f64) -> Result<&mut Self> {
        self.apply(EffectSpec::NormalizeInputSpeed { cpm })
    }

    pub fn humanize_input(&mut self, jitter: f64, max_delay: f64, cap_to_max: bool) -> Result<&mut Self> {
        self.apply(EffectSpec::HumanizeInput {
            jitter,
            max_delay,
            cap_to_max,
            seed: 0,
        })
    }

    pub fn cap_delays(&mut self, max_delay: f64) -> Result<&mut Self> {
        self.apply(EffectSpec::CapDelays { max_delay })
    }

    pub fn change_speed(&mut self, speed: f64) -> Result<&mut Self> {
        self.apply(EffectSpec::ChangeSpeed { speed })
    }

    pub fn add_intro(&mut self, intro_delay: f64) -> Result<&mut Self> {
        self.apply(EffectSpec::AddIntro { intro_delay })
    }

    pub fn delay_lines(&mut self, delay_per_line: f64) -> Result<&mut Self> {
        self.apply(EffectSpec::DelayLines { delay_per_line })
    }

    pub fn delay_input(&mut self, delay_before: f64, delay_after: f64) -> Result<&mut Self> {
        self.apply(EffectSpec::DelayInput {
            delay_before,
            delay_after,
        })
    }

    pub fn merge_lines(&mut self, threshold: f64, merge_input: bool) -> Result<&mut Self> {
        self.apply(EffectSpec::MergeLines {
            threshold,
            merge_input,
        })
    }

    pub fn mark_input(&mut self, prompt_suffix: &str) -> Result<&mut Self> {
        self.apply(EffectSpec::MarkInput {
            prompt_suffix: prompt_suffix.to_string(),
        })
    }

    /// Replay the operation log into a fresh stream.
    fn build(&self) -> Result<Stream> {
        let mut stream: Option<Stream> = None;
        for op in &self.ops {
            stream = Some(match (op, stream.take()) {
                (Operation::Attach(source), _) => source.open()?,
                (op, Some(upstream)) => op.chain(upstream)?,
                (_, None) => return Err(Error::NoSource),
            });
        }
        stream.ok_or(Error::NoSource)
    }

    /// Forget the current pass; the next pull replays the operation log.
    pub fn reset(&mut self) {
        self.live = None;
        self.failed = false;
    }

    /// Pull the next entry; `None` means this pass is over and the next pull
    /// starts a fresh one.
    ///
    /// An error aborts the pass: the pull after it returns `None`.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        if self.ops.is_empty() {
            return Err(Error::NoSource);
        }
        if self.failed {
            self.failed = false;
            return Ok(None);
        }
        if self.live.is_none() {
            debug!(operations = self.ops.len(), "rebuilding pipeline");
            match self.build() {
                Ok(stream) => self.live = Some(stream),
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }
        match self.live.as_mut().and_then(|stream| stream.next()) {
            Some(Ok(entry)) => Ok(Some(entry)),
            Some(Err(e)) => {
                warn!(error = %e, "pipeline pass aborted");
                self.live = None;
                self.failed = true;
                Err(e)
            }
            None => {
                self.live = None;
                Ok(None)
            }
        }
    }

    /// Feed the rest of the current pass (or a fresh one) into `sink`.
    fn drain<F>(&mut self, mut sink: F) -> Result<usize>
    where
        F: FnMut(Entry) -> Result<()>,
    {
        self.failed = false;
        let mut count = 0;
        loop {
            let entry = match self.next_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => return Ok(count),
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            };
            if let Err(e) = sink(entry) {
                self.reset();
                return Err(e);
            }
            count += 1;
        }
    }

    /// Return the first `n` entries and discard the rest of this pass.
    pub fn peek(&mut self, n: usize) -> Result<Vec<Entry>> {
        let mut out = Vec::with_capacity(n.min(1024));
        self.failed = false;
        while out.len() < n {
            match self.next_entry() {
                Ok(Some(entry)) => out.push(entry),
                Ok(None) => return Ok(out),
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            }
        }
        self.reset();
        Ok(out)
    }

    pub fn collect_entries(&mut self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        self.drain(|entry| {
            out.push(entry);
            Ok(())
        })?;
        Ok(out)
    }

    /// Encode one full pass into a caller-owned writer, which is flushed but
    /// not closed. Returns the number of entries consumed.
    pub fn write_binary_to<W: Write>(&mut self, out: &mut W) -> Result<usize> {
        let mut writer = BinaryWriter::new(out);
        let count = self.drain(|entry| writer.write_entry(&entry))?;
        writer.flush()?;
        debug!(entries = count, records = writer.records_written(), "wrote binary recording");
        Ok(count)
    }

    pub fn write_ascii_to<W: Write>(&mut self, out: &mut W) -> Result<usize> {
        let mut writer = AsciiWriter::new(out, self.zone);
        let count = self.drain(|entry| writer.write_entry(&entry))?;
        writer.flush()?;
        debug!(entries = count, "wrote ascii recording");
        Ok(count)
    }

    pub fn write_binary(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let mut out = BufWriter::new(create_file(path.as_ref())?);
        self.write_binary_to(&mut out)
    }

    pub fn write_ascii(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let mut out = BufWriter::new(create_file(path.as_ref())?);
        self.write_ascii_to(&mut out)
    }

    pub fn write(&mut self, path: impl AsRef<Path>, format: Format) -> Result<usize> {
        match format {
            Format::Binary => self.write_binary(path),
            Format::Ascii => self.write_ascii(path),
        }
    }
}

impl Iterator for Pipeline {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ops.is_empty() {
            return None;
        }
        self.next_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Timestamp;

    fn sample() -> Vec<Entry> {
        vec![
            Entry::new(Timestamp::from_parts(100, 0), b"bash $ ".to_vec()),
            Entry::new(Timestamp::from_parts(101, 0), b"l".to_vec()),
            Entry::new(Timestamp::from_parts(101, 300_000), b"s".to_vec()),
            Entry::new(Timestamp::from_parts(109, 0), b"a\nb\n".to_vec()),
        ]
    }

    #[test]
    fn empty_pipeline_has_no_source() {
        let mut p = Pipeline::new();
        assert_eq!(p.state(), PipelineState::Empty);
        assert!(matches!(p.next_entry(), Err(Error::NoSource)));
        assert!(matches!(p.change_speed(2.0), Err(Error::NoSource)));
        assert!(p.next().is_none());
    }

    #[test]
    fn iteration_rebuilds_after_exhaustion() {
        let mut p = Pipeline::new();
        p.read_entries(sample()).unwrap().cap_delays(2.0).unwrap();
        assert_eq!(p.state(), PipelineState::Built);
        let first: Vec<Entry> = p.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(p.state(), PipelineState::Consumed);
        let second: Vec<Entry> = p.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        assert_eq!(first[3].timestamp, Timestamp::from_parts(103, 300_000));
    }

    #[test]
    fn operations_are_recorded_in_order() {
        let mut p = Pipeline::new();
        p.read_entries(sample())
            .unwrap()
            .mark_input(" $ ")
            .unwrap()
            .merge_lines(0.5, false)
            .unwrap();
        let names: Vec<&str> = p
            .operations()
            .iter()
            .map(Operation::name)
            .collect();
        assert_eq!(names, vec!["attach", "mark_input", "merge_lines"]);
    }

    /// Counts entries seen by one instance; every pass must get a fresh one.
    struct Numbered {
        seen: usize,
    }

    impl Effect for Numbered {
        fn push(&mut self, mut entry: Entry, out: &mut std::collections::VecDeque<Entry>) {
            self.seen += 1;
            entry.payload = format!("{}:", self.seen).into_bytes();
            out.push_back(entry);
        }
    }

    #[test]
    fn raw_effect_gets_fresh_state_every_pass() {
        let mut p = Pipeline::new();
        p.read_entries(sample())
            .unwrap()
            .raw_effect("numbered", || Numbered { seen: 0 })
            .unwrap();
        let first = p.collect_entries().unwrap();
        let second = p.collect_entries().unwrap();
        assert_eq!(first, second);
        assert_eq!(first[3].payload, b"4:");
        assert_eq!(p.operations()[1].name(), "numbered");
    }

    #[test]
    fn effect_added_between_passes_is_used_next_pass() {
        let mut p = Pipeline::new();
        p.read_entries(sample()).unwrap();
        assert_eq!(p.collect_entries().unwrap().len(), 4);
        assert_eq!(p.state(), PipelineState::Consumed);
        p.change_speed(2.0).unwrap();
        assert_eq!(p.state(), PipelineState::Consumed);
        assert_eq!(p.collect_entries().unwrap().len(), 3);
    }

    #[test]
    fn error_ends_the_pass() {
        let mut bytes = Vec::new();
        Pipeline::new()
            .read_entries(sample()[..1].to_vec())
            .unwrap()
            .write_binary_to(&mut bytes)
            .unwrap();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&(-1i32).to_le_bytes());

        let mut p = Pipeline::new();
        p.read_binary_bytes(bytes).unwrap();
        let pass: Vec<Result<Entry>> = p.by_ref().collect();
        assert_eq!(pass.len(), 2);
        assert!(pass[0].is_ok());
        assert!(matches!(pass[1], Err(Error::NegativeLength { .. })));
        assert_eq!(p.by_ref().filter_map(Result::ok).count(), 1);
        assert!(p.collect_entries().is_err());
        assert_eq!(p.by_ref().count(), 2);
    }

    #[test]
    fn invalid_effect_is_not_recorded() {
        let mut p = Pipeline::new();
        p.read_entries(sample()).unwrap();
        let err = p.change_speed(-1.0).unwrap_err();
        assert!(matches!(err, Error::EffectPrecondition { effect: "change_speed", .. }));
        assert_eq!(p.operations().len(), 1);
        assert_eq!(p.collect_entries().unwrap().len(), 4);
    }

    #[test]
    fn peek_discards_remainder() {
        let mut p = Pipeline::new();
        p.read_entries(sample()).unwrap();
        let head = p.peek(2).unwrap();
        assert_eq!(head.len(), 2);
        assert_eq!(p.collect_entries().unwrap().len(), 4);
        assert_eq!(p.peek(10).unwrap().len(), 4);
    }

    #[test]
    fn reattaching_starts_a_new_log() {
        let mut p = Pipeline::new();
        p.read_entries(sample()).unwrap().change_speed(2.0).unwrap();
        p.read_entries(vec![Entry::new(Timestamp::default(), b"x".to_vec())]).unwrap();
        assert_eq!(p.operations().len(), 1);
        assert_eq!(p.collect_entries().unwrap().len(), 1);
    }

    #[test]
    fn same_pipeline_writes_twice() {
        let mut p = Pipeline::new();
        p.read_entries(sample()).unwrap().mark_input(" $ ").unwrap();
        let mut a = Vec::new();
        let mut b = Vec::new();
        assert_eq!(p.write_ascii_to(&mut a).unwrap(), 4);
        assert_eq!(p.write_ascii_to(&mut b).unwrap(), 4);
        assert_eq!(a, b);
        assert!(String::from_utf8(a).unwrap().contains("] 1 i\nl\n"));
    }

    #[test]
    fn binary_bytes_source_replays() {
        let mut bytes = Vec::new();
        Pipeline::new()
            .read_entries(sample())
            .unwrap()
            .write_binary_to(&mut bytes)
            .unwrap();
        let mut p = Pipeline::new();
        p.read_binary_bytes(bytes.clone()).unwrap();
        let mut again = Vec::new();
        p.write_binary_to(&mut again).unwrap();
        assert_eq!(bytes, again);
        assert_eq!(p.collect_entries().unwrap(), sample());
    }

    #[test]
    fn missing_file_fails_on_attach() {
        let mut p = Pipeline::new();
        let err = p.read_binary("/definitely/not/here.ttyrec").unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
        assert_eq!(p.state(), PipelineState::Empty);
    }

    #[test]
    fn format_detection() {
        assert_eq!(Format::from_path(Path::new("demo.txt")), Format::Ascii);
        assert_eq!(Format::from_path(Path::new("demo.ttyrec")), Format::Binary);
        assert_eq!("ASCII".parse::<Format>().unwrap(), Format::Ascii);
        assert!("json".parse::<Format>().is_err());
    }
}
