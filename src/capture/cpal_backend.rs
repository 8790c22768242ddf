//! Capture through the platform's default cpal host
//!
//! cpal streams are not `Send` on every host, so each source builds and owns
//! its stream on a dedicated thread. The thread reports whether the stream
//! came up, then parks until `stop()` tells it to drop the stream.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, BuildStreamError, Device, SampleFormat, SampleRate, Stream, StreamConfig};

use super::{
    AudioBlock, BlockCallback, BlockGate, CaptureBackend, CaptureConfig, CaptureSource,
    DeviceError, DeviceInfo, Samples,
};

/// Backend over `cpal::default_host()`. Device ids are cpal device names.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

fn find_device(device_id: &str) -> Result<Device, DeviceError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| DeviceError::Backend(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == device_id).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(DeviceError::NotFound(device_id.to_string()))
}

fn max_input_channels(device: &Device) -> u16 {
    device
        .supported_input_configs()
        .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
        .unwrap_or(0)
}

/// Pick a sample format the device offers for this channel count and rate.
fn pick_format(device: &Device, config: &CaptureConfig) -> Result<SampleFormat, DeviceError> {
    let ranges: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| DeviceError::Backend(e.to_string()))?
        .filter(|r| {
            r.channels() == config.channels
                && r.min_sample_rate().0 <= config.sample_rate
                && r.max_sample_rate().0 >= config.sample_rate
        })
        .collect();

    for preferred in [SampleFormat::F32, SampleFormat::I32, SampleFormat::I16] {
        if ranges.iter().any(|r| r.sample_format() == preferred) {
            return Ok(preferred);
        }
    }
    Err(DeviceError::UnsupportedFormat(format!(
        "{} channels at {} Hz",
        config.channels, config.sample_rate
    )))
}

fn classify_build_error(device_id: &str, err: BuildStreamError) -> DeviceError {
    match err {
        BuildStreamError::DeviceNotAvailable => DeviceError::Busy(device_id.to_string()),
        BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument => {
            DeviceError::UnsupportedFormat(err.to_string())
        }
        BuildStreamError::BackendSpecific { err } => {
            if err.description.to_lowercase().contains("busy") {
                DeviceError::Busy(device_id.to_string())
            } else {
                DeviceError::Backend(err.description)
            }
        }
        other => DeviceError::Backend(other.to_string()),
    }
}

impl CaptureBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        let mut found = Vec::new();
        for device in devices {
            let Ok(name) = device.name() else {
                continue;
            };
            let input_channels = max_input_channels(&device);
            if input_channels == 0 {
                continue;
            }
            found.push(DeviceInfo {
                id: name.clone(),
                name,
                input_channels,
            });
        }
        log::debug!("cpal host {:?}: {} input devices", host.id(), found.len());
        Ok(found)
    }

    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, DeviceError> {
        let device = find_device(&config.device_id)?;
        let available = max_input_channels(&device);
        if config.channels == 0 || config.channels > available {
            return Err(DeviceError::UnsupportedFormat(format!(
                "{} channels requested, device has {}",
                config.channels, available
            )));
        }
        let format = pick_format(&device, config)?;
        log::info!(
            "Opening {} ({} channels, {} Hz, {:?}, {}-frame periods)",
            config.device_id,
            config.channels,
            config.sample_rate,
            format,
            config.block_frames
        );

        Ok(Box::new(CpalSource {
            config: config.clone(),
            format,
            gate: None,
            stop_tx: None,
            worker: None,
        }))
    }
}

/// Slices arbitrary callback buffers into fixed-size interleaved blocks.
struct BlockAssembler<S> {
    channels: usize,
    block_len: usize,
    pending: Vec<S>,
    sequence: u64,
    gate: BlockGate,
    wrap: fn(Vec<S>) -> Samples,
}

impl<S: Copy> BlockAssembler<S> {
    fn new(
        channels: usize,
        block_frames: usize,
        gate: BlockGate,
        wrap: fn(Vec<S>) -> Samples,
    ) -> Self {
        let block_len = channels.max(1) * block_frames.max(1);
        Self {
            channels,
            block_len,
            pending: Vec::with_capacity(block_len),
            sequence: 0,
            gate,
            wrap,
        }
    }

    fn push(&mut self, data: impl Iterator<Item = S>) {
        for sample in data {
            self.pending.push(sample);
            if self.pending.len() == self.block_len {
                let samples =
                    std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_len));
                let block = AudioBlock::new(self.sequence, self.channels, (self.wrap)(samples));
                self.sequence += 1;
                self.gate.deliver(&block);
            }
        }
    }
}

fn build_stream(
    config: &CaptureConfig,
    format: SampleFormat,
    gate: BlockGate,
) -> Result<Stream, DeviceError> {
    let device = find_device(&config.device_id)?;
    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: BufferSize::Fixed(config.block_frames),
    };
    let channels = config.channels as usize;
    let frames = config.block_frames as usize;
    let err_fn = |err: cpal::StreamError| log::error!("Audio stream error: {}", err);

    let stream = match format {
        SampleFormat::F32 => {
            let mut assembler = BlockAssembler::new(channels, frames, gate, Samples::F32);
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    assembler.push(data.iter().copied())
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let mut assembler = BlockAssembler::new(channels, frames, gate, Samples::F32);
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    assembler.push(data.iter().map(|&s| s as f32 / 32_768.0))
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I32 => {
            let mut assembler = BlockAssembler::new(channels, frames, gate, Samples::I32);
            device.build_input_stream(
                &stream_config,
                move |data: &[i32], _: &cpal::InputCallbackInfo| {
                    assembler.push(data.iter().map(|&s| s >> 8))
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(DeviceError::UnsupportedFormat(format!(
                "sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| classify_build_error(&config.device_id, e))?;

    stream.play().map_err(|e| match e {
        cpal::PlayStreamError::DeviceNotAvailable => {
            DeviceError::Busy(config.device_id.clone())
        }
        other => DeviceError::Backend(other.to_string()),
    })?;
    Ok(stream)
}

struct CpalSource {
    config: CaptureConfig,
    format: SampleFormat,
    gate: Option<BlockGate>,
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureSource for CpalSource {
    fn start(&mut self, on_block: BlockCallback) -> Result<(), DeviceError> {
        if self.worker.is_some() {
            return Err(DeviceError::Backend("source already started".to_string()));
        }

        let gate = BlockGate::new(on_block);
        let stream_gate = gate.clone();
        let config = self.config.clone();
        let format = self.format;
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), DeviceError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let worker = thread::Builder::new()
            .name("cpal-capture".to_string())
            .spawn(move || {
                let stream = match build_stream(&config, format, stream_gate) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns on stop() or when the source is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("cpal stream for {} dropped", config.device_id);
            })
            .map_err(|e| DeviceError::Backend(format!("spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.gate = Some(gate);
                self.stop_tx = Some(stop_tx);
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                gate.close();
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                gate.close();
                let _ = worker.join();
                Err(DeviceError::Backend(
                    "capture thread exited before the stream started".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.close();
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("cpal capture thread panicked");
            }
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}
