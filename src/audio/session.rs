//! Recording session: capture source -> converter -> one sink per channel
//!
//! A session moves through `Idle -> Opening -> Recording -> Stopping -> Closed`
//! and never goes back. The control thread owns the phase and is the only
//! caller of `start` and `stop`; the capture thread only runs the block writer.
//! Sinks are shared with the block writer through a mutex and are taken out by
//! `stop` only after the source has stopped delivering.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::convert::{Rounding, SampleConverter};
use super::paths::{channel_paths, create_output_dir};
use super::sink::{ChannelFileSink, SinkError};
use crate::capture::{AudioBlock, CaptureBackend, CaptureConfig, CaptureSource, DeviceError};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Opening,
    Recording,
    Stopping,
    Closed,
}

/// Request problems caught before the device is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoChannels,
    DuplicateChannel(usize),
    ChannelOutOfRange { channel: usize, available: u16 },
    InvalidOutputName(String),
    InvalidSampleRate(u32),
    InvalidBlockSize(u32),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoChannels => write!(f, "No channels requested"),
            ConfigError::DuplicateChannel(c) => write!(f, "Channel {} requested twice", c),
            ConfigError::ChannelOutOfRange { channel, available } => write!(
                f,
                "Channel {} out of range: device has {} input channels",
                channel, available
            ),
            ConfigError::InvalidOutputName(name) => write!(f, "Invalid output name: {:?}", name),
            ConfigError::InvalidSampleRate(rate) => write!(f, "Invalid sample rate: {}", rate),
            ConfigError::InvalidBlockSize(frames) => {
                write!(f, "Invalid block size: {} frames", frames)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Anything that can end a session early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Config(ConfigError),
    Device(DeviceError),
    Sink(SinkError),
    /// `start` called on a session that already left `Idle`.
    AlreadyStarted(SessionPhase),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Config(e) => write!(f, "{}", e),
            SessionError::Device(e) => write!(f, "{}", e),
            SessionError::Sink(e) => write!(f, "{}", e),
            SessionError::AlreadyStarted(phase) => {
                write!(f, "Session already started (phase {:?})", phase)
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        SessionError::Config(e)
    }
}

impl From<DeviceError> for SessionError {
    fn from(e: DeviceError) -> Self {
        SessionError::Device(e)
    }
}

impl From<SinkError> for SessionError {
    fn from(e: SinkError) -> Self {
        SessionError::Sink(e)
    }
}

/// Everything a session needs, fixed at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub recording_id: Uuid,
    pub device_id: String,
    /// Zero-based device channels, in file order.
    pub channels: Vec<usize>,
    /// Channels the device is opened with; every entry of `channels` must be below it.
    pub device_channels: u16,
    pub sample_rate: u32,
    pub block_frames: u32,
    pub output_dir: PathBuf,
    /// File base name, without extension.
    pub base_name: String,
    pub rounding: Rounding,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        for (i, &channel) in self.channels.iter().enumerate() {
            if channel >= self.device_channels as usize {
                return Err(ConfigError::ChannelOutOfRange {
                    channel,
                    available: self.device_channels,
                });
            }
            if self.channels[..i].contains(&channel) {
                return Err(ConfigError::DuplicateChannel(channel));
            }
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.block_frames == 0 {
            return Err(ConfigError::InvalidBlockSize(self.block_frames));
        }
        if self.base_name.trim().is_empty() {
            return Err(ConfigError::InvalidOutputName(self.base_name.clone()));
        }
        Ok(())
    }

    /// Output files in request order.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        channel_paths(&self.output_dir, &self.base_name, self.channels.len())
    }

    fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device_id: self.device_id.clone(),
            channels: self.device_channels,
            sample_rate: self.sample_rate,
            block_frames: self.block_frames,
        }
    }
}

/// Creates the sink for one channel file.
pub trait SinkOpener: Send + Sync {
    fn open(&self, path: &Path, sample_rate: u32) -> Result<ChannelFileSink, SinkError>;
}

/// Plain buffered files.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSinkOpener;

impl SinkOpener for FileSinkOpener {
    fn open(&self, path: &Path, sample_rate: u32) -> Result<ChannelFileSink, SinkError> {
        ChannelFileSink::open(path, sample_rate)
    }
}

/// Counters kept by the block writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub blocks: u64,
    pub frames: u64,
    pub overruns: u64,
    pub dropped_blocks: u64,
}

/// What a finished session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub recording_id: Uuid,
    pub files: Vec<PathBuf>,
    /// Frames each file holds on disk, in `files` order.
    pub channel_frames: Vec<u64>,
    /// Length of the recorded audio.
    pub duration: Duration,
    pub stats: SessionStats,
    pub error: Option<String>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
struct Counters {
    blocks: AtomicU64,
    frames: AtomicU64,
    overruns: AtomicU64,
    dropped_blocks: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            blocks: self.blocks.load(Ordering::SeqCst),
            frames: self.frames.load(Ordering::SeqCst),
            overruns: self.overruns.load(Ordering::SeqCst),
            dropped_blocks: self.dropped_blocks.load(Ordering::SeqCst),
        }
    }
}

/// State shared between the control thread and the block writer.
#[derive(Default)]
struct Shared {
    sinks: Mutex<Option<Vec<ChannelFileSink>>>,
    faulted: AtomicBool,
    fault: Mutex<Option<SessionError>>,
    counters: Counters,
}

impl Shared {
    /// Record the first fault; later ones are only logged.
    fn set_fault(&self, err: SessionError) {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            log::error!("Recording fault: {}", err);
            *slot = Some(err);
            self.faulted.store(true, Ordering::SeqCst);
        } else {
            log::debug!("Further fault ignored: {}", err);
        }
    }

    fn fault(&self) -> Option<SessionError> {
        if !self.faulted.load(Ordering::SeqCst) {
            return None;
        }
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Runs on the capture thread for every block.
struct BlockWriter {
    shared: Arc<Shared>,
    channels: Vec<usize>,
    converter: SampleConverter,
    sample_rate: u32,
    scratch: Vec<u8>,
    next_sequence: Option<u64>,
}

impl BlockWriter {
    fn write(&mut self, block: &AudioBlock) {
        if self.shared.faulted.load(Ordering::SeqCst) {
            return;
        }
        let started = Instant::now();
        let counters = &self.shared.counters;

        if let Some(expected) = self.next_sequence {
            if block.sequence() > expected {
                let missed = block.sequence() - expected;
                counters.dropped_blocks.fetch_add(missed, Ordering::SeqCst);
                log::warn!(
                    "Capture skipped {} block(s) before sequence {}",
                    missed,
                    block.sequence()
                );
            }
        }
        self.next_sequence = Some(block.sequence() + 1);

        if let Some(&channel) = self.channels.iter().find(|&&c| c >= block.channels()) {
            self.shared.set_fault(SessionError::Device(DeviceError::UnsupportedFormat(format!(
                "block carries {} channels, channel {} requested",
                block.channels(),
                channel
            ))));
            return;
        }

        let mut first_error = None;
        {
            let mut guard = self
                .shared
                .sinks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(sinks) = guard.as_mut() else {
                return;
            };
            // Every channel gets this block, even after one of them failed.
            for (sink, &channel) in sinks.iter_mut().zip(&self.channels) {
                self.scratch.clear();
                self.converter
                    .convert_channel(block, channel, &mut self.scratch);
                if let Err(e) = sink.append(&self.scratch) {
                    first_error.get_or_insert(e);
                }
            }
        }

        counters.blocks.fetch_add(1, Ordering::SeqCst);
        counters
            .frames
            .fetch_add(block.frames() as u64, Ordering::SeqCst);

        if let Some(e) = first_error {
            self.shared.set_fault(SessionError::Sink(e));
        }

        let budget = block.duration(self.sample_rate);
        let elapsed = started.elapsed();
        if elapsed > budget {
            let overruns = counters.overruns.fetch_add(1, Ordering::SeqCst) + 1;
            if overruns == 1 || overruns % 100 == 0 {
                log::warn!(
                    "Block {} took {:?} to write, budget {:?} ({} overruns so far)",
                    block.sequence(),
                    elapsed,
                    budget,
                    overruns
                );
            }
        }
    }
}

/// One recording from one device into one file per requested channel.
pub struct RecordingSession {
    config: SessionConfig,
    opener: Arc<dyn SinkOpener>,
    phase: SessionPhase,
    source: Option<Box<dyn CaptureSource>>,
    shared: Arc<Shared>,
    files: Vec<PathBuf>,
    outcome: Option<SessionOutcome>,
}

impl RecordingSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_opener(config, Arc::new(FileSinkOpener))
    }

    pub fn with_opener(config: SessionConfig, opener: Arc<dyn SinkOpener>) -> Self {
        Self {
            config,
            opener,
            phase: SessionPhase::Idle,
            source: None,
            shared: Arc::new(Shared::default()),
            files: Vec::new(),
            outcome: None,
        }
    }

    pub fn recording_id(&self) -> Uuid {
        self.config.recording_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// First error raised while recording, if any.
    pub fn fault(&self) -> Option<SessionError> {
        self.shared.fault()
    }

    /// Open the device, create the channel files and start capturing.
    ///
    /// On failure the session is `Closed`, the device is released and any
    /// files already created are closed; `stop()` then returns the outcome.
    pub fn start(&mut self, backend: &dyn CaptureBackend) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Idle {
            return Err(SessionError::AlreadyStarted(self.phase));
        }

        if let Err(e) = self.config.validate() {
            let err = SessionError::Config(e);
            self.finish(Some(err.to_string()));
            return Err(err);
        }

        self.phase = SessionPhase::Opening;
        log::info!(
            "Session {}: opening {} for channels {:?}",
            self.config.recording_id,
            self.config.device_id,
            self.config.channels
        );

        let source = match backend.open(&self.config.capture_config()) {
            Ok(source) => source,
            Err(e) => {
                let err = SessionError::Device(e);
                self.finish(Some(err.to_string()));
                return Err(err);
            }
        };
        self.source = Some(source);

        if let Err(e) = self.open_sinks() {
            let err = SessionError::Sink(e);
            self.finish(Some(err.to_string()));
            return Err(err);
        }

        let mut writer = BlockWriter {
            shared: self.shared.clone(),
            channels: self.config.channels.clone(),
            converter: SampleConverter::new(self.config.rounding),
            sample_rate: self.config.sample_rate,
            scratch: Vec::with_capacity(self.config.block_frames as usize * 3),
            next_sequence: None,
        };
        let started = match self.source.as_mut() {
            Some(source) => source.start(Box::new(move |block: &AudioBlock| writer.write(block))),
            None => Err(DeviceError::Backend("capture source missing".to_string())),
        };
        if let Err(e) = started {
            let err = SessionError::Device(e);
            self.finish(Some(err.to_string()));
            return Err(err);
        }

        self.phase = SessionPhase::Recording;
        log::info!(
            "Session {}: recording {} channel(s) to {:?}",
            self.config.recording_id,
            self.files.len(),
            self.config.output_dir
        );
        Ok(())
    }

    fn open_sinks(&mut self) -> Result<(), SinkError> {
        create_output_dir(&self.config.output_dir).map_err(|e| SinkError::Create {
            path: self.config.output_dir.clone(),
            reason: e.to_string(),
        })?;

        let mut sinks = Vec::with_capacity(self.config.channels.len());
        let mut result = Ok(());
        for path in self.config.file_paths() {
            match self.opener.open(&path, self.config.sample_rate) {
                Ok(sink) => {
                    self.files.push(path);
                    sinks.push(sink);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        // Created sinks go to the shared slot either way so finish() closes them.
        *self
            .shared
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sinks);
        result
    }

    /// Stop capturing, close every file and report. Idempotent.
    pub fn stop(&mut self) -> SessionOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        self.finish(None)
    }

    fn finish(&mut self, start_error: Option<String>) -> SessionOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        self.phase = SessionPhase::Stopping;

        if let Some(mut source) = self.source.take() {
            source.stop();
        }

        let sinks = self
            .shared
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        let mut close_error = None;
        let mut channel_frames = Vec::with_capacity(sinks.len());
        for sink in sinks {
            match sink.close() {
                Ok(report) => channel_frames.push(report.frames),
                Err(e) => {
                    log::error!("Session {}: {}", self.config.recording_id, e);
                    channel_frames.push(e.frames_on_disk());
                    close_error.get_or_insert(e.to_string());
                }
            }
        }

        let stats = self.stats();
        let error = start_error
            .or_else(|| self.fault().map(|e| e.to_string()))
            .or(close_error);
        let duration =
            Duration::from_secs_f64(stats.frames as f64 / self.config.sample_rate.max(1) as f64);

        let outcome = SessionOutcome {
            recording_id: self.config.recording_id,
            files: self.files.clone(),
            channel_frames,
            duration,
            stats,
            error,
        };
        self.phase = SessionPhase::Closed;
        match &outcome.error {
            None => log::info!(
                "Session {}: closed, {} frames in {} file(s)",
                outcome.recording_id,
                stats.frames,
                outcome.files.len()
            ),
            Some(e) => log::warn!("Session {}: closed with error: {}", outcome.recording_id, e),
        }
        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.outcome.is_none() && self.phase != SessionPhase::Idle {
            log::warn!(
                "Session {} dropped while {:?}, stopping",
                self.config.recording_id,
                self.phase
            );
            self.finish(None);
        }
    }
}
