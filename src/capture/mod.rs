//! Audio capture backends
//!
//! A backend enumerates devices and opens a [`CaptureSource`]; a source
//! delivers interleaved [`AudioBlock`]s on its own thread until stopped.
//! All backends deliver through a [`BlockGate`], which is what makes
//! `stop()` a hard barrier: once it returns, the block callback is gone.

mod arecord;
mod cpal_backend;
mod simulated;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use arecord::{
    parse_card_list, parse_stream_channels, AlsaCard, ArecordBackend, RawPcmReader,
};
pub use cpal_backend::CpalBackend;
pub use simulated::{Signal, SimulatedBackend, SimulatedConfig};

/// Interleaved sample storage of one block.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    /// Normalized floats, nominally in [-1.0, 1.0].
    F32(Vec<f32>),
    /// Integers already scaled to the 24-bit range.
    I32(Vec<i32>),
}

impl Samples {
    fn len(&self) -> usize {
        match self {
            Samples::F32(v) => v.len(),
            Samples::I32(v) => v.len(),
        }
    }
}

/// One period of captured audio: `frames` x `channels` interleaved samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    sequence: u64,
    channels: usize,
    samples: Samples,
}

impl AudioBlock {
    pub fn new(sequence: u64, channels: usize, samples: Samples) -> Self {
        Self {
            sequence,
            channels: channels.max(1),
            samples,
        }
    }

    pub fn from_f32(sequence: u64, channels: usize, samples: Vec<f32>) -> Self {
        Self::new(sequence, channels, Samples::F32(samples))
    }

    pub fn from_i32(sequence: u64, channels: usize, samples: Vec<i32>) -> Self {
        Self::new(sequence, channels, Samples::I32(samples))
    }

    /// Monotonic per-source counter, used to spot dropped blocks.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Whole frames in the block; a trailing partial frame is ignored.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    /// Play-out time of the block at `sample_rate`.
    pub fn duration(&self, sample_rate: u32) -> Duration {
        if sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / sample_rate as f64)
    }
}

/// An input device as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub id: String,
    pub input_channels: u16,
}

/// Errors that can occur while opening or running a capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No device with the requested identifier.
    NotFound(String),
    /// Channel count, sample rate or sample format not supported.
    UnsupportedFormat(String),
    /// The device is claimed by someone else.
    Busy(String),
    /// Any other host or driver failure.
    Backend(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::NotFound(d) => write!(f, "Audio device not found: {}", d),
            DeviceError::UnsupportedFormat(e) => write!(f, "Unsupported capture format: {}", e),
            DeviceError::Busy(d) => write!(f, "Audio device busy: {}", d),
            DeviceError::Backend(e) => write!(f, "Audio backend error: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {}

/// What to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device_id: String,
    /// Interleaved channels to capture from the device.
    pub channels: u16,
    pub sample_rate: u32,
    /// Requested period size in frames.
    pub block_frames: u32,
}

/// Receives every captured block on the backend's delivery thread.
pub type BlockCallback = Box<dyn FnMut(&AudioBlock) + Send + 'static>;

/// Shared slot for the block callback.
///
/// Delivery and [`close`](Self::close) take the same lock, so `close` waits
/// for an in-flight block and later deliveries find the slot empty.
#[derive(Clone)]
pub struct BlockGate {
    slot: Arc<Mutex<Option<BlockCallback>>>,
}

impl BlockGate {
    pub fn new(callback: BlockCallback) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(callback))),
        }
    }

    /// Run the callback on `block`. Returns false once the gate is closed.
    pub fn deliver(&self, block: &AudioBlock) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(callback) => {
                callback(block);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drop the callback. Blocks until any in-flight delivery has returned.
    pub fn close(&self) {
        let callback = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(callback);
    }
}

/// Device enumeration and opening.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, DeviceError>;
}

/// An opened device.
pub trait CaptureSource: Send {
    /// Begin delivering blocks to `on_block` on the backend's own thread.
    fn start(&mut self, on_block: BlockCallback) -> Result<(), DeviceError>;

    /// Stop delivery and release the device. Idempotent. After it returns,
    /// `on_block` is never invoked again.
    fn stop(&mut self);
}

/// Which backend the daemon uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Default platform stream.
    #[default]
    Cpal,
    /// Blocking reads of raw PCM from a spawned `arecord`.
    Arecord,
    /// Generated audio, no hardware.
    Simulated,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Cpal => write!(f, "cpal"),
            BackendKind::Arecord => write!(f, "arecord"),
            BackendKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// Build the backend selected in settings.
pub fn create_backend(settings: &crate::settings::AppSettings) -> Arc<dyn CaptureBackend> {
    match settings.backend {
        BackendKind::Cpal => Arc::new(CpalBackend::new()),
        BackendKind::Arecord => Arc::new(ArecordBackend::new(settings.arecord_command.clone())),
        BackendKind::Simulated => Arc::new(SimulatedBackend::new(settings.simulated.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn block_reports_whole_frames() {
        let block = AudioBlock::from_f32(3, 4, vec![0.0; 4 * 256 + 2]);
        assert_eq!(block.frames(), 256);
        assert_eq!(block.sequence(), 3);
        assert_eq!(block.duration(48_000), Duration::from_secs_f64(256.0 / 48_000.0));
    }

    #[test]
    fn gate_stops_delivery_after_close() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let gate = BlockGate::new(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let block = AudioBlock::from_f32(0, 1, vec![0.0; 8]);

        assert!(gate.deliver(&block));
        assert!(gate.deliver(&block));
        gate.close();
        assert!(!gate.is_open());
        assert!(!gate.deliver(&block));
        gate.close();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backend_kind_uses_snake_case_names() {
        let kind: BackendKind = serde_json::from_str("\"arecord\"").unwrap();
        assert_eq!(kind, BackendKind::Arecord);
        assert_eq!(serde_json::to_string(&BackendKind::Simulated).unwrap(), "\"simulated\"");
    }
}
