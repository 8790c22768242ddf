//! Integration tests for recording sessions
//!
//! Every test runs against the simulated capture backend, so no audio
//! hardware is needed:
//!
//! ```bash
//! cargo test --test session_integration
//! ```

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use recorder_lib::audio::{
    ChannelFileSink, RecordingSession, Rounding, SessionConfig, SessionError, SessionPhase,
    SinkError, SinkOpener, SinkWriter,
};
use recorder_lib::capture::{DeviceError, Signal, SimulatedBackend, SimulatedConfig};
use uuid::Uuid;

const BLOCK_FRAMES: u32 = 1024;

fn backend(max_blocks: Option<u64>) -> SimulatedBackend {
    SimulatedBackend::new(SimulatedConfig {
        input_channels: 8,
        signal: Signal::ChannelLevel,
        paced: false,
        max_blocks,
        ..SimulatedConfig::default()
    })
}

fn config(dir: &Path, channels: Vec<usize>) -> SessionConfig {
    SessionConfig {
        recording_id: Uuid::new_v4(),
        device_id: "sim:0".to_string(),
        channels,
        device_channels: 8,
        sample_rate: 48_000,
        block_frames: BLOCK_FRAMES,
        output_dir: dir.to_path_buf(),
        base_name: "session".to_string(),
        rounding: Rounding::Truncate,
    }
}

/// Size of the header written for an empty channel file.
fn header_len(dir: &Path) -> u64 {
    let path = dir.join("header-only.wav");
    ChannelFileSink::open(&path, 48_000).unwrap().close().unwrap();
    let len = std::fs::metadata(&path).unwrap().len();
    std::fs::remove_file(&path).unwrap();
    len
}

fn read_samples(path: &Path) -> (hound::WavSpec, u32, Vec<i32>) {
    let mut reader = hound::WavReader::open(path).unwrap();
    let spec = reader.spec();
    let declared = reader.len();
    let samples = reader.samples::<i32>().map(|s| s.unwrap()).collect();
    (spec, declared, samples)
}

#[test]
fn four_channels_hundred_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let header = header_len(dir.path());
    let backend = backend(Some(100));
    let mut session = RecordingSession::new(config(dir.path(), vec![6, 1, 3, 0]));

    session.start(&backend).unwrap();
    assert_eq!(session.phase(), SessionPhase::Recording);
    assert!(backend.wait_for_blocks(100, Duration::from_secs(10)));
    let outcome = session.stop();

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.stats.blocks, 100);
    assert_eq!(outcome.stats.frames, 102_400);
    assert_eq!(outcome.stats.dropped_blocks, 0);
    assert_eq!(outcome.files.len(), 4);
    assert_eq!(backend.open_handles(), 0);

    let expected_names = [
        "session_ch01.wav",
        "session_ch02.wav",
        "session_ch03.wav",
        "session_ch04.wav",
    ];
    for ((path, name), channel) in outcome.files.iter().zip(expected_names).zip([6, 1, 3, 0]) {
        assert_eq!(path.file_name().unwrap(), name);

        let len = std::fs::metadata(path).unwrap().len();
        assert_eq!(len - header, 307_200);

        let (spec, declared, samples) = read_samples(path);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 24);
        assert_eq!(spec.sample_rate, 48_000);
        assert_eq!(spec.sample_format, hound::SampleFormat::Int);
        assert_eq!(declared, 102_400);

        let level = ((channel + 1) as f32 / 64.0 * 8_388_607.0) as i32;
        assert!(samples.iter().all(|&s| s == level), "channel {}", channel);
    }
}

#[test]
fn busy_device_creates_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(None);

    let mut first = RecordingSession::new(config(dir.path(), vec![0]));
    first.start(&backend).unwrap();

    let second_dir = dir.path().join("second");
    let mut second = RecordingSession::new(config(&second_dir, vec![1, 2]));
    let err = second.start(&backend).unwrap_err();
    assert_eq!(err, SessionError::Device(DeviceError::Busy("sim:0".into())));
    assert_eq!(second.phase(), SessionPhase::Closed);

    let outcome = second.stop();
    assert!(outcome.files.is_empty());
    assert_eq!(outcome.error.as_deref(), Some("Audio device busy: sim:0"));
    assert!(!second_dir.exists());
    assert_eq!(backend.open_handles(), 1);

    first.stop();
    assert_eq!(backend.open_handles(), 0);
}

#[test]
fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(Some(3));
    let mut session = RecordingSession::new(config(dir.path(), vec![0, 1]));
    session.start(&backend).unwrap();
    assert!(backend.wait_for_blocks(3, Duration::from_secs(10)));

    let first = session.stop();
    let second = session.stop();
    assert_eq!(first, second);
    assert_eq!(session.phase(), SessionPhase::Closed);
    assert_eq!(first.stats.frames, 3 * BLOCK_FRAMES as u64);
    assert_eq!(backend.open_handles(), 0);
}

#[test]
fn stopping_before_any_block_leaves_empty_valid_files() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(Some(0));
    let mut session = RecordingSession::new(config(dir.path(), vec![2, 5]));
    session.start(&backend).unwrap();

    let outcome = session.stop();
    assert!(outcome.is_success());
    assert_eq!(outcome.duration, Duration::ZERO);
    for path in &outcome.files {
        let (_, declared, samples) = read_samples(path);
        assert_eq!(declared, 0);
        assert!(samples.is_empty());
    }
}

/// File that rejects one write after `fail_after` bytes were accepted.
struct FailOnceFile {
    file: File,
    accepted: usize,
    fail_after: usize,
    tripped: bool,
}

impl Write for FailOnceFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.tripped && self.accepted + buf.len() > self.fail_after {
            self.tripped = true;
            return Err(io::Error::new(io::ErrorKind::Other, "No space left on device"));
        }
        let n = self.file.write(buf)?;
        self.accepted += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FailOnceFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl SinkWriter for FailOnceFile {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

/// Opens plain files, except `failing` which runs out of space mid-recording.
struct FlakyOpener {
    failing: PathBuf,
    fail_after: usize,
}

impl SinkOpener for FlakyOpener {
    fn open(&self, path: &Path, sample_rate: u32) -> Result<ChannelFileSink, SinkError> {
        if path != self.failing {
            return ChannelFileSink::open(path, sample_rate);
        }
        let file = File::create(path).map_err(|e| SinkError::Create {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let writer = FailOnceFile {
            file,
            accepted: 0,
            fail_after: self.fail_after,
            tripped: false,
        };
        ChannelFileSink::with_writer(path, Box::new(writer), sample_rate)
    }
}

#[test]
fn write_failure_faults_session_and_keeps_files_valid() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(None);
    let config = config(dir.path(), vec![0, 1, 2]);
    let failing = config.file_paths()[1].clone();
    let opener = Arc::new(FlakyOpener {
        failing: failing.clone(),
        // The sink buffers 8 KiB, so the first flush lands in the third block.
        fail_after: 4096,
    });

    let mut session = RecordingSession::with_opener(config, opener);
    session.start(&backend).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while session.fault().is_none() {
        assert!(std::time::Instant::now() < deadline, "no fault reported");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(
        session.fault(),
        Some(SessionError::Sink(SinkError::Write { ref path, .. })) if *path == failing
    ));

    let outcome = session.stop();
    assert!(!outcome.is_success());
    assert_eq!(outcome.files.len(), 3);
    assert_eq!(backend.open_handles(), 0);

    // Writing halts at the faulting block. The failed file keeps what it
    // accepted before the error and every header matches its data.
    let frames = outcome.stats.frames;
    assert_eq!(frames, 3 * BLOCK_FRAMES as u64);
    assert_eq!(outcome.channel_frames.len(), 3);
    assert_eq!(outcome.channel_frames[0], frames);
    assert_eq!(outcome.channel_frames[2], frames);
    let partial = outcome.channel_frames[1];
    assert!(partial > 2 * BLOCK_FRAMES as u64 && partial < frames, "{}", partial);

    for (path, &expected) in outcome.files.iter().zip(&outcome.channel_frames) {
        let (_, declared, samples) = read_samples(path);
        assert_eq!(declared as usize, samples.len());
        assert_eq!(declared as u64, expected, "{}", path.display());
    }
}
