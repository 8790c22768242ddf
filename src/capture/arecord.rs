//! Capture by reading raw PCM from a spawned `arecord`
//!
//! Some multichannel USB interfaces only behave with ALSA's own tools, so this
//! backend runs `arecord -t raw -f S32_LE` and blocking-reads whole periods
//! from its stdout. Opening errors only show up once the process exits, so
//! `start()` waits for the first period (or the process's death) before it
//! reports success.

use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{
    AudioBlock, BlockCallback, BlockGate, CaptureBackend, CaptureConfig, CaptureSource,
    DeviceError, DeviceInfo,
};

const BYTES_PER_RAW_SAMPLE: usize = 4;
const START_TIMEOUT: Duration = Duration::from_secs(5);
/// stderr kept for classifying a failed start.
const STDERR_KEEP_BYTES: usize = 4096;

/// One `card N: ..., device M: ...` entry of `arecord -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlsaCard {
    pub card: u32,
    pub device: u32,
    pub name: String,
}

impl AlsaCard {
    pub fn id(&self) -> String {
        format!("hw:{},{}", self.card, self.device)
    }
}

/// Parse the capture device listing printed by `arecord -l`.
pub fn parse_card_list(text: &str) -> Vec<AlsaCard> {
    let mut cards = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("card ") else {
            continue;
        };
        let Some((card, rest)) = rest.split_once(':') else {
            continue;
        };
        let Some((card_name, device_part)) = rest.split_once(", device ") else {
            continue;
        };
        let Some((device, device_name)) = device_part.split_once(':') else {
            continue;
        };
        let (Ok(card), Ok(device)) = (card.trim().parse::<u32>(), device.trim().parse::<u32>())
        else {
            continue;
        };
        cards.push(AlsaCard {
            card,
            device,
            name: format!("{} ({})", card_name.trim(), device_name.trim()),
        });
    }
    cards
}

/// Largest capture channel count in a `/proc/asound/cardN/stream0` dump.
pub fn parse_stream_channels(text: &str) -> Option<u16> {
    let mut in_capture = false;
    let mut best: Option<u16> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if !line.starts_with(' ') && trimmed.ends_with(':') {
            in_capture = trimmed == "Capture:";
            continue;
        }
        if !in_capture {
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("Channels:") {
            if let Ok(n) = value.trim().parse::<u16>() {
                best = Some(best.map_or(n, |b| b.max(n)));
            }
        }
    }
    best
}

/// Map what arecord printed before dying to a device error.
fn classify_stderr(device_id: &str, stderr: &str) -> DeviceError {
    let lower = stderr.to_lowercase();
    if lower.contains("busy") {
        DeviceError::Busy(device_id.to_string())
    } else if lower.contains("no such file")
        || lower.contains("no such device")
        || lower.contains("cannot find card")
    {
        DeviceError::NotFound(device_id.to_string())
    } else if lower.contains("non available") || lower.contains("not available") {
        DeviceError::UnsupportedFormat(stderr.trim().to_string())
    } else if stderr.trim().is_empty() {
        DeviceError::Backend("arecord exited without output".to_string())
    } else {
        DeviceError::Backend(stderr.trim().to_string())
    }
}

/// Splits an S32_LE byte stream into 24-bit-scaled integer blocks.
pub struct RawPcmReader<R> {
    reader: R,
    channels: usize,
    sequence: u64,
    buf: Vec<u8>,
}

impl<R: Read> RawPcmReader<R> {
    pub fn new(reader: R, channels: usize, block_frames: usize) -> Self {
        let channels = channels.max(1);
        Self {
            reader,
            channels,
            sequence: 0,
            buf: vec![0; channels * block_frames.max(1) * BYTES_PER_RAW_SAMPLE],
        }
    }

    /// Read one whole period. `Ok(None)` at end of stream; a trailing
    /// partial period is discarded.
    pub fn next_block(&mut self) -> io::Result<Option<AudioBlock>> {
        match self.reader.read_exact(&mut self.buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let samples = self
            .buf
            .chunks_exact(BYTES_PER_RAW_SAMPLE)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) >> 8)
            .collect();
        let block = AudioBlock::from_i32(self.sequence, self.channels, samples);
        self.sequence += 1;
        Ok(Some(block))
    }
}

/// Backend spawning `arecord`. Device ids are ALSA names such as `hw:1,0`.
#[derive(Debug, Clone)]
pub struct ArecordBackend {
    command: String,
}

impl ArecordBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn card_channels(card: u32) -> Option<u16> {
        let path = format!("/proc/asound/card{}/stream0", card);
        std::fs::read_to_string(path)
            .ok()
            .and_then(|text| parse_stream_channels(&text))
    }
}

impl CaptureBackend for ArecordBackend {
    fn name(&self) -> &'static str {
        "arecord"
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let output = Command::new(&self.command)
            .arg("-l")
            .output()
            .map_err(|e| DeviceError::Backend(format!("failed to run {}: {}", self.command, e)))?;
        if !output.status.success() {
            return Err(DeviceError::Backend(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let devices = parse_card_list(&listing)
            .into_iter()
            .map(|card| {
                // Non-USB cards have no stream file; assume stereo.
                let input_channels = Self::card_channels(card.card).unwrap_or(2);
                DeviceInfo {
                    id: card.id(),
                    name: card.name,
                    input_channels,
                }
            })
            .collect();
        Ok(devices)
    }

    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureSource>, DeviceError> {
        if config.channels == 0 || config.sample_rate == 0 || config.block_frames == 0 {
            return Err(DeviceError::UnsupportedFormat(format!(
                "{} channels at {} Hz with {}-frame periods",
                config.channels, config.sample_rate, config.block_frames
            )));
        }
        Ok(Box::new(ArecordSource {
            command: self.command.clone(),
            config: config.clone(),
            child: None,
            gate: None,
            worker: None,
        }))
    }
}

struct ArecordSource {
    command: String,
    config: CaptureConfig,
    child: Option<Child>,
    gate: Option<BlockGate>,
    worker: Option<JoinHandle<()>>,
}

impl ArecordSource {
    fn spawn(&self) -> Result<Child, DeviceError> {
        Command::new(&self.command)
            .args(["-D", &self.config.device_id])
            .args(["-c", &self.config.channels.to_string()])
            .args(["-r", &self.config.sample_rate.to_string()])
            .args(["-f", "S32_LE", "-t", "raw", "-q"])
            .arg(format!("--period-size={}", self.config.block_frames))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DeviceError::Backend(format!("failed to run {}: {}", self.command, e)))
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Read arecord's stderr until it closes, logging each line, so the pipe
/// never fills up and stalls the recorder. Returns the start of the output.
fn drain_stderr<R: Read + Send + 'static>(
    stderr: R,
    device_id: String,
) -> io::Result<JoinHandle<String>> {
    thread::Builder::new()
        .name("arecord-stderr".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut kept = String::new();
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if text.is_empty() {
                    continue;
                }
                log::warn!("arecord {}: {}", device_id, text);
                if kept.len() < STDERR_KEEP_BYTES {
                    kept.push_str(text);
                    kept.push('\n');
                }
            }
            kept
        })
}

impl CaptureSource for ArecordSource {
    fn start(&mut self, on_block: BlockCallback) -> Result<(), DeviceError> {
        if self.child.is_some() {
            return Err(DeviceError::Backend("source already started".to_string()));
        }

        let mut child = self.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.child = Some(child);
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            self.kill_child();
            return Err(DeviceError::Backend("arecord output not captured".to_string()));
        };
        let stderr_drain = match drain_stderr(stderr, self.config.device_id.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                self.kill_child();
                return Err(DeviceError::Backend(format!("spawn stderr thread: {}", e)));
            }
        };

        let gate = BlockGate::new(on_block);
        let reader_gate = gate.clone();
        let device_id = self.config.device_id.clone();
        let mut reader = RawPcmReader::new(
            stdout,
            self.config.channels as usize,
            self.config.block_frames as usize,
        );
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), DeviceError>>();

        let worker = thread::Builder::new()
            .name("arecord-capture".to_string())
            .spawn(move || {
                let mut ready = Some(ready_tx);
                let mut stderr_drain = Some(stderr_drain);
                loop {
                    match reader.next_block() {
                        Ok(Some(block)) => {
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Ok(()));
                            }
                            if !reader_gate.deliver(&block) {
                                break;
                            }
                        }
                        Ok(None) => {
                            match ready.take() {
                                Some(tx) => {
                                    // arecord has exited, so its stderr is closing too.
                                    let stderr = stderr_drain
                                        .take()
                                        .and_then(|drain| drain.join().ok())
                                        .unwrap_or_default();
                                    let _ = tx.send(Err(classify_stderr(&device_id, &stderr)));
                                }
                                None if reader_gate.is_open() => {
                                    log::error!("arecord for {} exited during capture", device_id)
                                }
                                None => {}
                            }
                            break;
                        }
                        Err(e) => {
                            match ready.take() {
                                Some(tx) => {
                                    let _ = tx.send(Err(DeviceError::Backend(e.to_string())));
                                }
                                None => log::error!("Reading from arecord failed: {}", e),
                            }
                            break;
                        }
                    }
                }
            })
            .map_err(|e| DeviceError::Backend(format!("spawn capture thread: {}", e)));

        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.kill_child();
                return Err(e);
            }
        };

        let outcome = match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(DeviceError::Backend(format!(
                "no audio from {} within {:?}",
                self.config.device_id, START_TIMEOUT
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DeviceError::Backend(
                "capture thread exited before the first period".to_string(),
            )),
        };

        match outcome {
            Ok(()) => {
                log::info!(
                    "arecord capturing {} ({} channels, {} Hz)",
                    self.config.device_id,
                    self.config.channels,
                    self.config.sample_rate
                );
                self.gate = Some(gate);
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                gate.close();
                self.kill_child();
                let _ = worker.join();
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.close();
        }
        // Killing the child ends the reader's blocking read with EOF.
        self.kill_child();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("arecord capture thread panicked");
            }
        }
    }
}

impl Drop for ArecordSource {
    fn drop(&mut self) {
        self.stop();
    }
}
