//! Simulated capture device
//!
//! Generates deterministic multichannel audio on a worker thread. Used for
//! dry runs without hardware and as the test double for sessions and the
//! supervisor: it can script open failures, claims devices exclusively, and
//! counts open handles so leaked sources show up in tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{
    AudioBlock, BlockCallback, BlockGate, CaptureBackend, CaptureConfig, CaptureSource,
    DeviceError, DeviceInfo,
};

/// Waveform produced on every channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// Channel `c` holds the constant `(c + 1) / 64`. Makes demux errors obvious.
    ChannelLevel,
    /// A sine of `frequency` Hz at half scale, phase-shifted per channel.
    Sine { frequency: f32 },
}

/// Settings for the simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    pub device_id: String,
    pub device_name: String,
    pub input_channels: u16,
    pub signal: Signal,
    /// Sleep one period between blocks, like real hardware.
    pub paced: bool,
    /// Stop generating after this many blocks.
    pub max_blocks: Option<u64>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            device_id: "sim:0".to_string(),
            device_name: "Simulated 32-channel interface".to_string(),
            input_channels: 32,
            signal: Signal::Sine { frequency: 440.0 },
            paced: true,
            max_blocks: None,
        }
    }
}

/// Value of `channel` at absolute frame index `frame`.
pub(crate) fn signal_value(
    signal: Signal,
    channel: usize,
    frame: u64,
    sample_rate: u32,
) -> f32 {
    match signal {
        Signal::ChannelLevel => (channel + 1) as f32 / 64.0,
        Signal::Sine { frequency } => {
            let t = frame as f64 / sample_rate.max(1) as f64;
            let phase = channel as f64 * 0.25;
            (0.5 * (2.0 * std::f64::consts::PI * (frequency as f64 * t + phase)).sin()) as f32
        }
    }
}

struct Shared {
    config: SimulatedConfig,
    open_error: Mutex<Option<DeviceError>>,
    open_handles: AtomicUsize,
    claimed: Mutex<Vec<String>>,
    delivered_blocks: AtomicU64,
}

/// Backend producing generated audio.
#[derive(Clone)]
pub struct SimulatedBackend {
    shared: Arc<Shared>,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                open_error: Mutex::new(None),
                open_handles: AtomicUsize::new(0),
                claimed: Mutex::new(Vec::new()),
                delivered_blocks: AtomicU64::new(0),
            }),
        }
    }

    /// Make every following `open` fail with `err` until cleared.
    pub fn fail_open_with(&self, err: Option<DeviceError>) {
        *self
            .shared
            .open_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = err;
    }

    /// Sources opened and not yet stopped.
    pub fn open_handles(&self) -> usize {
        self.shared.open_handles.load(Ordering::SeqCst)
    }

    /// Blocks handed to callbacks across all sources.
    pub fn delivered_blocks(&self) -> u64 {
        self.shared.delivered_blocks.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` blocks were delivered.
    pub fn wait_for_blocks(&self, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.delivered_blocks() < count {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn device(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.shared.config.device_name.clone(),
            id: self.shared.config.device_id.clone(),
            input_channels: self.shared.config.input_channels,
        }
    }
}

impl CaptureBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(vec![self.device()])
    }

    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, DeviceError> {
        if let Some(err) = self
            .shared
            .open_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(err);
        }

        let device = self.device();
        if config.device_id != device.id {
            return Err(DeviceError::NotFound(config.device_id.clone()));
        }
        if config.channels == 0 || config.channels > device.input_channels {
            return Err(DeviceError::UnsupportedFormat(format!(
                "{} channels requested, device has {}",
                config.channels, device.input_channels
            )));
        }
        if config.sample_rate == 0 || config.block_frames == 0 {
            return Err(DeviceError::UnsupportedFormat(format!(
                "{} Hz with {}-frame periods",
                config.sample_rate, config.block_frames
            )));
        }

        {
            let mut claimed = self
                .shared
                .claimed
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if claimed.contains(&config.device_id) {
                return Err(DeviceError::Busy(config.device_id.clone()));
            }
            claimed.push(config.device_id.clone());
        }
        self.shared.open_handles.fetch_add(1, Ordering::SeqCst);

        log::debug!("Simulated device {} opened", config.device_id);
        Ok(Box::new(SimulatedSource {
            config: config.clone(),
            shared: self.shared.clone(),
            gate: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
            released: false,
        }))
    }
}

struct SimulatedSource {
    config: CaptureConfig,
    shared: Arc<Shared>,
    gate: Option<BlockGate>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    released: bool,
}

impl CaptureSource for SimulatedSource {
    fn start(&mut self, on_block: BlockCallback) -> Result<(), DeviceError> {
        if self.released {
            return Err(DeviceError::Backend("source already stopped".to_string()));
        }
        if self.worker.is_some() {
            return Err(DeviceError::Backend("source already started".to_string()));
        }

        let gate = BlockGate::new(on_block);
        let worker_gate = gate.clone();
        let stop_flag = self.stop_flag.clone();
        let shared = self.shared.clone();
        let config = self.config.clone();

        let worker = thread::Builder::new()
            .name("sim-capture".to_string())
            .spawn(move || generate(config, shared, worker_gate, stop_flag))
            .map_err(|e| DeviceError::Backend(format!("spawn capture thread: {}", e)))?;

        self.gate = Some(gate);
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(gate) = self.gate.take() {
            gate.close();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Simulated capture thread panicked");
            }
        }

        self.shared
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id| id != &self.config.device_id);
        self.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Simulated device {} released", self.config.device_id);
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn generate(config: CaptureConfig, shared: Arc<Shared>, gate: BlockGate, stop: Arc<AtomicBool>) {
    let channels = config.channels as usize;
    let frames = config.block_frames as usize;
    let period = Duration::from_secs_f64(frames as f64 / config.sample_rate as f64);
    let signal = shared.config.signal;
    let started = Instant::now();

    let mut sequence = 0u64;
    while !stop.load(Ordering::SeqCst) {
        if shared.config.max_blocks.is_some_and(|max| sequence >= max) {
            log::debug!("Simulated device exhausted after {} blocks", sequence);
            break;
        }

        let first_frame = sequence * frames as u64;
        let mut samples = Vec::with_capacity(frames * channels);
        for f in 0..frames as u64 {
            for c in 0..channels {
                samples.push(signal_value(signal, c, first_frame + f, config.sample_rate));
            }
        }

        let block = AudioBlock::from_f32(sequence, channels, samples);
        if !gate.deliver(&block) {
            break;
        }
        shared.delivered_blocks.fetch_add(1, Ordering::SeqCst);
        sequence += 1;

        if shared.config.paced {
            let due = started + block_offset(period, sequence);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
    }
}

/// Time from the start of capture at which block `sequence` is due.
fn block_offset(period: Duration, sequence: u64) -> Duration {
    let nanos = period.as_nanos().saturating_mul(u128::from(sequence));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
