//! Audio output path of the recorder
//!
//! Interleaved capture blocks are split per channel, converted to packed
//! 24-bit PCM and written to one mono WAV file per recorded channel.

pub mod convert;
mod paths;
pub mod session;
pub mod sink;

pub use convert::{Rounding, SampleConverter, DEFAULT_ROUNDING};
pub use paths::{
    base_name, channel_file_name, channel_paths, create_output_dir, default_output_dir,
    timestamped_name, TIMESTAMP_NAME_FORMAT,
};
pub use session::{
    ConfigError, FileSinkOpener, RecordingSession, SessionConfig, SessionError, SessionOutcome,
    SessionPhase, SessionStats, SinkOpener,
};
pub use sink::{ChannelFileSink, SinkError, SinkReport, SinkWriter, BIT_DEPTH};
