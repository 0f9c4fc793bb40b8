//! ttyrec recording and retiming library.
//!
//! This crate provides the core types and logic used by the `ttyrec_retime`
//! converter binary and the `player` tool:
//!
//! - `record`: timestamps, per-entry options and the `Entry` record
//! - `binary` / `ascii`: lazy codecs for the binary ttyrec format and the
//!   editable text form, including typewriter expansion of input entries
//! - `effects`: composable timing and content transforms over entry streams
//! - `extras`: less common effects (input delay ramps, resize noise removal)
//! - `pipeline`: a replayable chain of one source plus effects, with sinks
//! - `recipe`: TOML-described effect chains
//! - `player`: real-time pacing of a pipeline onto a terminal
//!
//! ```no_run
//! use ttyrec_retime::Pipeline;
//!
//! # fn main() -> ttyrec_retime::Result<()> {
//! let mut pipeline = Pipeline::new();
//! pipeline
//!     .read_binary("session.ttyrec")?
//!     .mark_input(" $ ")?
//!     .normalize_input_speed(350.0)?
//!     .cap_delays(2.0)?;
//! pipeline.write_ascii("session.txt")?;
//! pipeline.write_binary("session-retimed.ttyrec")?;
//! # Ok(())
//! # }
//! ```
pub mod ascii;
pub mod binary;
pub mod effects;
pub mod error;
pub mod extras;
pub mod jitter;
pub mod pipeline;
pub mod player;
pub mod recipe;
pub mod record;

pub use effects::EffectSpec;
pub use error::{Error, Result};
pub use pipeline::{Format, Pipeline};
pub use recipe::Recipe;
pub use record::{Entry, Options, Timestamp};
