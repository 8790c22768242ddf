//! Integration tests for the recording supervisor
//!
//! Drive the supervisor through the command store the way an external client
//! would, with the simulated backend standing in for the audio interface:
//!
//! ```bash
//! cargo test --test supervisor_integration
//! ```

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use recorder_lib::audio::{ChannelFileSink, SinkError, SinkOpener, SinkWriter};
use recorder_lib::capture::{
    BackendKind, DeviceError, Signal, SimulatedBackend, SimulatedConfig,
};
use recorder_lib::effects::{SessionDefaults, SessionEffectRunner};
use recorder_lib::metrics::MetricsCollector;
use recorder_lib::settings::AppSettings;
use recorder_lib::state_machine::{State, ORPHANED_RECORDING_ERROR};
use recorder_lib::store::{
    CommandState, CommandStore, InMemoryCommandStore, JsonFileCommandStore, RecordingRequest,
    StoreError,
};
use recorder_lib::supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn settings(output_dir: &Path) -> AppSettings {
    AppSettings {
        backend: BackendKind::Simulated,
        block_frames: 256,
        output_dir: Some(output_dir.to_path_buf()),
        poll_interval_ms: 10,
        simulated: SimulatedConfig {
            input_channels: 4,
            signal: Signal::ChannelLevel,
            paced: true,
            ..SimulatedConfig::default()
        },
        ..AppSettings::default()
    }
}

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<InMemoryCommandStore>,
    backend: SimulatedBackend,
    supervisor: Supervisor,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let store = Arc::new(InMemoryCommandStore::new());
    let backend = SimulatedBackend::new(settings.simulated.clone());
    let supervisor = Supervisor::new(store.clone(), Arc::new(backend.clone()), &settings);
    Harness {
        dir,
        store,
        backend,
        supervisor,
    }
}

fn state_of(store: &dyn CommandStore, id: Uuid) -> CommandState {
    store.get(id).unwrap().unwrap().state
}

#[test]
fn new_record_stop_stopped() {
    let mut h = harness();
    let command = h
        .store
        .submit(RecordingRequest::new("sim:0", vec![2, 0]).with_output_name("take.wav"))
        .unwrap();
    assert_eq!(command.state, CommandState::New);

    h.supervisor.poll_once().unwrap();
    assert!(matches!(h.supervisor.state(), State::Recording { .. }));
    assert!(h.supervisor.has_session());
    assert_eq!(state_of(h.store.as_ref(), command.id), CommandState::Record);
    assert_eq!(h.backend.open_handles(), 1);

    assert!(h.backend.wait_for_blocks(5, Duration::from_secs(10)));
    h.store.request_stop(command.id).unwrap();
    h.supervisor.poll_once().unwrap();

    assert!(matches!(h.supervisor.state(), State::Idle));
    assert!(!h.supervisor.has_session());
    assert_eq!(h.backend.open_handles(), 0);

    let done = h.store.get(command.id).unwrap().unwrap();
    assert_eq!(done.state, CommandState::Stopped);
    assert_eq!(done.error, None);
    assert!(done.duration_ms.unwrap() > 0);
    assert_eq!(
        done.files,
        vec![
            h.dir.path().join("take_ch01.wav"),
            h.dir.path().join("take_ch02.wav")
        ]
    );
    for path in &done.files {
        let reader = hound::WavReader::open(path).unwrap();
        assert!(reader.len() >= 5 * 256);
    }

    let summary = h.supervisor.metrics();
    assert_eq!(summary.total_sessions, 1);
    assert_eq!(summary.successful_sessions, 1);
}

#[test]
fn busy_device_goes_straight_to_stopped() {
    let mut h = harness();
    h.backend
        .fail_open_with(Some(DeviceError::Busy("sim:0".to_string())));
    let command = h.store.submit(RecordingRequest::new("sim:0", vec![0])).unwrap();

    h.supervisor.poll_once().unwrap();

    assert!(matches!(h.supervisor.state(), State::Idle));
    let done = h.store.get(command.id).unwrap().unwrap();
    assert_eq!(done.state, CommandState::Stopped);
    assert!(done.files.is_empty());
    assert_eq!(done.error.as_deref(), Some("Audio device busy: sim:0"));
    assert_eq!(h.backend.open_handles(), 0);
    assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);

    // The next request goes through once the device is free again.
    h.backend.fail_open_with(None);
    let next = h.store.submit(RecordingRequest::new("sim:0", vec![0])).unwrap();
    h.supervisor.poll_once().unwrap();
    assert_eq!(state_of(h.store.as_ref(), next.id), CommandState::Record);
    h.supervisor.shutdown();
}

#[test]
fn invalid_request_is_stopped_with_error() {
    let mut h = harness();
    let command = h.store.submit(RecordingRequest::new("sim:0", vec![1, 9])).unwrap();

    h.supervisor.poll_once().unwrap();

    let done = h.store.get(command.id).unwrap().unwrap();
    assert_eq!(done.state, CommandState::Stopped);
    assert!(done.files.is_empty());
    assert!(done.error.unwrap().contains("9"));
    assert_eq!(h.backend.open_handles(), 0);
}

#[test]
fn second_request_rejected_while_recording() {
    let mut h = harness();
    let first = h.store.submit(RecordingRequest::new("sim:0", vec![0])).unwrap();
    h.supervisor.poll_once().unwrap();

    let err = h
        .store
        .submit(RecordingRequest::new("sim:0", vec![1]))
        .unwrap_err();
    assert_eq!(err, StoreError::AlreadyActive(first.id));
    assert_eq!(h.store.list().unwrap().len(), 1);

    h.supervisor.shutdown();
    assert_eq!(state_of(h.store.as_ref(), first.id), CommandState::Stopped);
}

#[test]
fn stop_before_open_never_touches_the_device() {
    let mut h = harness();
    let command = h.store.submit(RecordingRequest::new("sim:0", vec![0])).unwrap();
    h.store.request_stop(command.id).unwrap();

    h.supervisor.poll_once().unwrap();

    let done = h.store.get(command.id).unwrap().unwrap();
    assert_eq!(done.state, CommandState::Stopped);
    assert_eq!(done.error, None);
    assert!(done.files.is_empty());
    assert_eq!(h.backend.delivered_blocks(), 0);
}

#[test]
fn orphaned_record_is_closed_on_startup() {
    let mut h = harness();
    let command = h.store.submit(RecordingRequest::new("sim:0", vec![0])).unwrap();
    assert!(h
        .store
        .compare_and_set(command.id, CommandState::New, CommandState::Record)
        .unwrap());

    h.supervisor.poll_once().unwrap();

    let done = h.store.get(command.id).unwrap().unwrap();
    assert_eq!(done.state, CommandState::Stopped);
    assert_eq!(done.error.as_deref(), Some(ORPHANED_RECORDING_ERROR));
    assert_eq!(h.backend.open_handles(), 0);
}

#[test]
fn cancelling_run_stops_the_active_recording() {
    let h = harness();
    let Harness {
        dir: _dir,
        store,
        backend,
        mut supervisor,
    } = h;
    let token = CancellationToken::new();
    let loop_token = token.clone();
    let worker = std::thread::spawn(move || supervisor.run(&loop_token));

    let command = store.submit(RecordingRequest::new("sim:0", vec![0, 1, 3])).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while state_of(store.as_ref(), command.id) != CommandState::Record {
        assert!(Instant::now() < deadline, "never reached RECORD");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(backend.wait_for_blocks(3, Duration::from_secs(10)));

    token.cancel();
    worker.join().unwrap();

    let done = store.get(command.id).unwrap().unwrap();
    assert_eq!(done.state, CommandState::Stopped);
    assert_eq!(done.files.len(), 3);
    assert!(done.files.iter().all(|p| p.exists()));
    assert_eq!(backend.open_handles(), 0);
}

#[test]
fn json_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("state").join("commands.json");
    let recordings = dir.path().join("recordings");
    let settings = settings(&recordings);
    let backend = SimulatedBackend::new(settings.simulated.clone());
    let mut supervisor = Supervisor::new(
        Arc::new(JsonFileCommandStore::new(&store_path)),
        Arc::new(backend.clone()),
        &settings,
    );

    // A separate handle plays the external client.
    let client = JsonFileCommandStore::new(&store_path);
    let command = client
        .submit(RecordingRequest::new("sim:0", vec![3]).with_output_name("json-take"))
        .unwrap();

    supervisor.poll_once().unwrap();
    assert_eq!(state_of(&client, command.id), CommandState::Record);
    assert!(backend.wait_for_blocks(2, Duration::from_secs(10)));

    client.request_stop(command.id).unwrap();
    supervisor.poll_once().unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&store_path).unwrap()).unwrap();
    let entry = &raw[0];
    assert_eq!(entry["id"], command.id.to_string());
    assert_eq!(entry["state"], "STOPPED");
    assert_eq!(entry["device_id"], "sim:0");
    assert_eq!(
        entry["files"][0],
        &*recordings.join("json-take_ch01.wav").to_string_lossy()
    );
    assert!(recordings.join("json-take_ch01.wav").exists());
}

/// File that cannot grow past `limit` bytes. Rewriting the header still works.
struct FullDisk {
    file: File,
    limit: u64,
}

impl Write for FullDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pos = self.file.stream_position()?;
        let room = self.limit.saturating_sub(pos) as usize;
        if room == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::Other, "No space left on device"));
        }
        self.file.write(&buf[..buf.len().min(room)])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FullDisk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl SinkWriter for FullDisk {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

struct FullDiskOpener;

impl SinkOpener for FullDiskOpener {
    fn open(&self, path: &Path, sample_rate: u32) -> Result<ChannelFileSink, SinkError> {
        let file = File::create(path).map_err(|e| SinkError::Create {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let writer = FullDisk { file, limit: 4096 };
        ChannelFileSink::with_writer(path, Box::new(writer), sample_rate)
    }
}

#[test]
fn sink_fault_stops_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let store = Arc::new(InMemoryCommandStore::new());
    let backend = SimulatedBackend::new(settings.simulated.clone());
    let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
    let runner = SessionEffectRunner::new(
        store.clone(),
        Arc::new(backend.clone()),
        SessionDefaults::from(&settings),
        metrics.clone(),
    )
    .with_sink_opener(Arc::new(FullDiskOpener));
    let mut supervisor = Supervisor::with_runner(
        store.clone(),
        Box::new(runner),
        settings.poll_interval(),
        metrics,
    );

    let command = store.submit(RecordingRequest::new("sim:0", vec![0, 1])).unwrap();
    supervisor.poll_once().unwrap();
    assert!(matches!(supervisor.state(), State::Recording { .. }));

    // The first buffer flush overruns 4096 bytes well before block 24.
    assert!(backend.wait_for_blocks(24, Duration::from_secs(10)));
    supervisor.poll_once().unwrap();

    assert!(matches!(supervisor.state(), State::Idle));
    assert_eq!(backend.open_handles(), 0);
    let done = store.get(command.id).unwrap().unwrap();
    assert_eq!(done.state, CommandState::Stopped);
    assert!(done.error.unwrap().contains("No space left on device"));
    assert_eq!(done.files.len(), 2);
    assert_eq!(done.channel_frames.len(), 2);
    for (path, &frames) in done.files.iter().zip(&done.channel_frames) {
        let mut reader = hound::WavReader::open(path).unwrap();
        assert_eq!(reader.len() as u64, frames);
        assert_eq!(reader.samples::<i32>().count() as u64, frames);
        assert!(frames > 0 && frames < 4096 / 3);
    }

    let summary = supervisor.metrics();
    assert_eq!(summary.failed_sessions, 1);
}
