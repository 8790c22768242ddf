//! Effect runner for the recording supervisor
//!
//! Executes the effects produced by the state machine: opening and stopping
//! recording sessions against the capture backend, and writing command state
//! back to the store. Every effect runs to completion on the supervisor thread
//! and hands its follow-up events back to the caller.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use crate::audio::{
    base_name, ConfigError, FileSinkOpener, RecordingSession, Rounding, SessionConfig,
    SessionError, SessionOutcome, SessionStats, SinkOpener,
};
use crate::capture::{CaptureBackend, DeviceError};
use crate::metrics::MetricsCollector;
use crate::settings::AppSettings;
use crate::state_machine::{Effect, Event};
use crate::store::{CommandCompletion, CommandState, CommandStore, RecordingCommand};

/// Trait for running effects.
/// Follow-up events are returned to the caller, which feeds them to the reducer.
pub trait EffectRunner: Send {
    fn run(&self, effect: Effect, session: &mut Option<RecordingSession>) -> Vec<Event>;
}

/// Daemon-wide defaults applied to every request.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDefaults {
    pub default_device: Option<String>,
    pub sample_rate: u32,
    pub block_frames: u32,
    pub output_dir: PathBuf,
    pub rounding: Rounding,
}

impl From<&AppSettings> for SessionDefaults {
    fn from(settings: &AppSettings) -> Self {
        Self {
            default_device: settings.default_device.clone(),
            sample_rate: settings.sample_rate,
            block_frames: settings.block_frames,
            output_dir: settings.output_dir(),
            rounding: settings.rounding,
        }
    }
}

/// Outcome for a session that never got as far as creating files.
fn failed_outcome(recording_id: Uuid, error: String) -> SessionOutcome {
    SessionOutcome {
        recording_id,
        files: Vec::new(),
        channel_frames: Vec::new(),
        duration: Duration::ZERO,
        stats: SessionStats::default(),
        error: Some(error),
    }
}

/// Real effect runner: capture backend + channel files + command store.
pub struct SessionEffectRunner {
    store: Arc<dyn CommandStore>,
    backend: Arc<dyn CaptureBackend>,
    opener: Arc<dyn SinkOpener>,
    defaults: SessionDefaults,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl SessionEffectRunner {
    pub fn new(
        store: Arc<dyn CommandStore>,
        backend: Arc<dyn CaptureBackend>,
        defaults: SessionDefaults,
        metrics: Arc<Mutex<MetricsCollector>>,
    ) -> Self {
        Self {
            store,
            backend,
            opener: Arc::new(FileSinkOpener),
            defaults,
            metrics,
        }
    }

    /// Replace how channel files are created.
    pub fn with_sink_opener(mut self, opener: Arc<dyn SinkOpener>) -> Self {
        self.opener = opener;
        self
    }

    fn metrics(&self) -> std::sync::MutexGuard<'_, MetricsCollector> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turn a command into a session config, checking it against the
    /// devices the backend currently reports.
    pub fn session_config(
        &self,
        command: &RecordingCommand,
    ) -> Result<SessionConfig, SessionError> {
        let request = &command.request;
        let device_id = if request.device_id.trim().is_empty() {
            self.defaults
                .default_device
                .clone()
                .ok_or_else(|| DeviceError::NotFound("no device requested".to_string()))?
        } else {
            request.device_id.clone()
        };

        let devices = self.backend.list_devices()?;
        let device = devices
            .iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| DeviceError::NotFound(device_id.clone()))?;

        let base = base_name(&request.output_name)
            .ok_or_else(|| ConfigError::InvalidOutputName(request.output_name.clone()))?;

        let config = SessionConfig {
            recording_id: command.id,
            device_id,
            channels: request.channels.clone(),
            device_channels: device.input_channels,
            sample_rate: request.sample_rate.unwrap_or(self.defaults.sample_rate),
            block_frames: self.defaults.block_frames,
            output_dir: self.defaults.output_dir.clone(),
            base_name: base,
            rounding: self.defaults.rounding,
        };
        config.validate()?;
        Ok(config)
    }

    fn open_session(
        &self,
        command: RecordingCommand,
        slot: &mut Option<RecordingSession>,
    ) -> Vec<Event> {
        let id = command.id;
        self.metrics().session_started(id);

        if let Some(existing) = slot.as_ref() {
            log::error!(
                "Refusing to open recording {}: session {} is still running",
                id,
                existing.recording_id()
            );
            let outcome = failed_outcome(id, "Another recording session is running".to_string());
            self.metrics().session_finished(&outcome);
            return vec![Event::SessionOpenFailed {
                id,
                completion: CommandCompletion::from(&outcome),
            }];
        }

        let config = match self.session_config(&command) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Recording {} rejected: {}", id, e);
                let outcome = failed_outcome(id, e.to_string());
                self.metrics().session_finished(&outcome);
                return vec![Event::SessionOpenFailed {
                    id,
                    completion: CommandCompletion::from(&outcome),
                }];
            }
        };

        let mut session = RecordingSession::with_opener(config, self.opener.clone());
        match session.start(self.backend.as_ref()) {
            Ok(()) => {
                self.metrics().session_recording(id);
                *slot = Some(session);
                vec![Event::SessionOpened { id }]
            }
            Err(e) => {
                log::warn!("Recording {} failed to start: {}", id, e);
                let outcome = session.stop();
                self.metrics().session_finished(&outcome);
                vec![Event::SessionOpenFailed {
                    id,
                    completion: CommandCompletion::from(&outcome),
                }]
            }
        }
    }

    fn stop_session(&self, id: Uuid, slot: &mut Option<RecordingSession>) -> Vec<Event> {
        let mut session = match slot.take() {
            Some(session) if session.recording_id() == id => session,
            other => {
                *slot = other;
                log::warn!("Stop requested for recording {} but no such session", id);
                return vec![Event::SessionClosed {
                    id,
                    completion: CommandCompletion::failed("No capture session was running"),
                }];
            }
        };

        let outcome = session.stop();
        self.metrics().session_finished(&outcome);
        vec![Event::SessionClosed {
            id,
            completion: CommandCompletion::from(&outcome),
        }]
    }

    fn mark_recording(&self, id: Uuid) {
        match self
            .store
            .compare_and_set(id, CommandState::New, CommandState::Record)
        {
            Ok(true) => log::info!("Recording {} is RECORD", id),
            // STOP landed first; the next poll sees it.
            Ok(false) => log::info!("Recording {} changed before it could be marked RECORD", id),
            Err(e) => {
                log::warn!("Failed to mark recording {} as RECORD: {}", id, e);
                self.metrics()
                    .record_error("store".to_string(), e.to_string(), Some(id.to_string()));
            }
        }
    }

    fn mark_stopped(&self, id: Uuid, completion: CommandCompletion) {
        let files = completion.files.len();
        let error = completion.error.clone();
        match self.store.finish(id, completion) {
            Ok(()) => match error {
                None => log::info!("Recording {} STOPPED with {} file(s)", id, files),
                Some(e) => log::warn!("Recording {} STOPPED with error: {}", id, e),
            },
            Err(e) => {
                log::warn!("Failed to mark recording {} as STOPPED: {}", id, e);
                self.metrics()
                    .record_error("store".to_string(), e.to_string(), Some(id.to_string()));
            }
        }

        let summary = self.metrics().get_summary();
        log::info!(
            "Sessions: {} total, {} ok, {} failed, {} overruns, {} dropped blocks",
            summary.total_sessions,
            summary.successful_sessions,
            summary.failed_sessions,
            summary.total_overruns,
            summary.total_dropped_blocks
        );
    }
}

impl EffectRunner for SessionEffectRunner {
    fn run(&self, effect: Effect, session: &mut Option<RecordingSession>) -> Vec<Event> {
        match effect {
            Effect::OpenSession { command } => self.open_session(command, session),
            Effect::StopSession { id } => self.stop_session(id, session),
            Effect::MarkRecording { id } => {
                self.mark_recording(id);
                vec![]
            }
            Effect::MarkStopped { id, completion } => {
                self.mark_stopped(id, completion);
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Signal, SimulatedBackend, SimulatedConfig};
    use crate::store::{InMemoryCommandStore, RecordingRequest};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<InMemoryCommandStore>,
        backend: SimulatedBackend,
        runner: SessionEffectRunner,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryCommandStore::new());
        let backend = SimulatedBackend::new(SimulatedConfig {
            input_channels: 4,
            signal: Signal::ChannelLevel,
            paced: false,
            max_blocks: Some(4),
            ..SimulatedConfig::default()
        });
        let defaults = SessionDefaults {
            default_device: Some("sim:0".to_string()),
            sample_rate: 48_000,
            block_frames: 256,
            output_dir: dir.path().to_path_buf(),
            rounding: Rounding::Truncate,
        };
        let runner = SessionEffectRunner::new(
            store.clone(),
            Arc::new(backend.clone()),
            defaults,
            Arc::new(Mutex::new(MetricsCollector::new())),
        );
        Fixture {
            _dir: dir,
            store,
            backend,
            runner,
        }
    }

    #[test]
    fn empty_device_falls_back_to_default() {
        let f = fixture();
        let command = RecordingCommand::new(RecordingRequest::new("", vec![3, 1]));
        let config = f.runner.session_config(&command).unwrap();
        assert_eq!(config.device_id, "sim:0");
        assert_eq!(config.device_channels, 4);
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(
            Some(config.base_name),
            base_name(&command.request.output_name)
        );
    }

    #[test]
    fn unknown_device_is_rejected_before_opening() {
        let f = fixture();
        let command = RecordingCommand::new(RecordingRequest::new("hw:9,0", vec![0]));
        let err = f.runner.session_config(&command).unwrap_err();
        assert_eq!(err, SessionError::Device(DeviceError::NotFound("hw:9,0".into())));
    }

    #[test]
    fn out_of_range_channel_is_a_config_error() {
        let f = fixture();
        let command = RecordingCommand::new(RecordingRequest::new("sim:0", vec![0, 4]));
        assert!(matches!(
            f.runner.session_config(&command),
            Err(SessionError::Config(ConfigError::ChannelOutOfRange { channel: 4, .. }))
        ));
    }

    #[test]
    fn open_then_stop_round_trip() {
        let f = fixture();
        let command = f
            .store
            .submit(RecordingRequest::new("sim:0", vec![0, 1]).with_output_name("t.wav"))
            .unwrap();
        let id = command.id;
        let mut slot = None;

        let events = f.runner.run(Effect::OpenSession { command }, &mut slot);
        assert!(matches!(events.as_slice(), [Event::SessionOpened { id: eid }] if *eid == id));
        assert!(slot.is_some());
        assert_eq!(f.backend.open_handles(), 1);

        f.runner.run(Effect::MarkRecording { id }, &mut slot);
        assert_eq!(f.store.get(id).unwrap().unwrap().state, CommandState::Record);

        let events = f.runner.run(Effect::StopSession { id }, &mut slot);
        assert!(slot.is_none());
        assert_eq!(f.backend.open_handles(), 0);
        let Event::SessionClosed { completion, .. } = &events[0] else {
            panic!("expected SessionClosed, got {:?}", events);
        };
        assert_eq!(completion.files.len(), 2);
        assert!(completion.error.is_none());

        f.runner.run(
            Effect::MarkStopped {
                id,
                completion: completion.clone(),
            },
            &mut slot,
        );
        let stored = f.store.get(id).unwrap().unwrap();
        assert_eq!(stored.state, CommandState::Stopped);
        assert_eq!(stored.files, completion.files);
    }

    #[test]
    fn busy_device_reports_open_failure() {
        let f = fixture();
        f.backend
            .fail_open_with(Some(DeviceError::Busy("sim:0".to_string())));
        let command = RecordingCommand::new(RecordingRequest::new("sim:0", vec![0]));
        let id = command.id;
        let mut slot = None;

        let events = f.runner.run(Effect::OpenSession { command }, &mut slot);
        assert!(slot.is_none());
        assert!(matches!(
            events.as_slice(),
            [Event::SessionOpenFailed { id: eid, completion }]
                if *eid == id && completion.files.is_empty()
                    && completion.error.as_deref() == Some("Audio device busy: sim:0")
        ));
    }

    #[test]
    fn stop_without_session_still_closes() {
        let f = fixture();
        let mut slot = None;
        let id = Uuid::new_v4();
        let events = f.runner.run(Effect::StopSession { id }, &mut slot);
        assert!(matches!(
            events.as_slice(),
            [Event::SessionClosed { completion, .. }] if completion.error.is_some()
        ));
    }
}
