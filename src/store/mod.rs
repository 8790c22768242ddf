//! Recording command store
//!
//! The daemon and the outside world talk through recording commands. The
//! outside creates a command in `NEW` and may later request `STOP`; the daemon
//! moves `NEW -> RECORD` when capture is running and finishes every command in
//! `STOPPED` with its files, duration and error. At most one command is ever
//! active (not `STOPPED`).

mod json_file;
mod memory;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::{timestamped_name, SessionOutcome};

pub use json_file::JsonFileCommandStore;
pub use memory::InMemoryCommandStore;

/// Lifecycle of a recording command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandState {
    /// Created, not yet recording.
    New,
    /// Capture is running.
    Record,
    /// Stop requested.
    Stop,
    /// Finished; terminal.
    Stopped,
}

impl CommandState {
    pub fn is_active(self) -> bool {
        self != CommandState::Stopped
    }
}

/// What to record. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRequest {
    pub device_id: String,
    /// Zero-based device channels, in output file order.
    pub channels: Vec<usize>,
    /// Base file name. Empty means "derive from the creation time".
    #[serde(default)]
    pub output_name: String,
    /// Falls back to the daemon's configured rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

impl RecordingRequest {
    pub fn new(device_id: impl Into<String>, channels: Vec<usize>) -> Self {
        Self {
            device_id: device_id.into(),
            channels,
            output_name: String::new(),
            sample_rate: None,
        }
    }

    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = Some(rate);
        self
    }
}

/// A persisted recording job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingCommand {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub request: RecordingRequest,
    pub state: CommandState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Frames in each of `files`, in the same order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channel_frames: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordingCommand {
    /// A fresh `NEW` command. An empty output name becomes the creation timestamp.
    pub fn new(mut request: RecordingRequest) -> Self {
        let created_at = Utc::now();
        if request.output_name.trim().is_empty() {
            request.output_name = timestamped_name(created_at);
        }
        Self {
            id: Uuid::new_v4(),
            created_at,
            request,
            state: CommandState::New,
            duration_ms: None,
            files: Vec::new(),
            channel_frames: Vec::new(),
            error: None,
        }
    }
}

/// Fields written when a command reaches `STOPPED`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandCompletion {
    pub duration_ms: Option<u64>,
    pub files: Vec<PathBuf>,
    pub channel_frames: Vec<u64>,
    pub error: Option<String>,
}

impl CommandCompletion {
    /// Stopped without ever recording.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            duration_ms: None,
            files: Vec::new(),
            channel_frames: Vec::new(),
            error: Some(error.into()),
        }
    }
}

impl From<&SessionOutcome> for CommandCompletion {
    fn from(outcome: &SessionOutcome) -> Self {
        Self {
            duration_ms: Some(outcome.duration.as_millis() as u64),
            files: outcome.files.clone(),
            channel_frames: outcome.channel_frames.clone(),
            error: outcome.error.clone(),
        }
    }
}

/// Errors that can occur while reading or updating commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another command is still active.
    AlreadyActive(Uuid),
    /// The command exists but is not in a state that allows the operation.
    NotActive(Uuid),
    NotFound(Uuid),
    /// The backing storage could not be read or written.
    Io(String),
    /// The backing storage holds something that is not a command list.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::AlreadyActive(id) => write!(f, "Recording {} is still active", id),
            StoreError::NotActive(id) => write!(f, "Recording {} is not active", id),
            StoreError::NotFound(id) => write!(f, "Recording {} not found", id),
            StoreError::Io(e) => write!(f, "Command store I/O error: {}", e),
            StoreError::Corrupt(e) => write!(f, "Command store is corrupt: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence of recording commands.
pub trait CommandStore: Send + Sync {
    /// The oldest command that is not `STOPPED`.
    fn get_active(&self) -> Result<Option<RecordingCommand>, StoreError>;

    fn get(&self, id: Uuid) -> Result<Option<RecordingCommand>, StoreError>;

    /// All commands, oldest first.
    fn list(&self) -> Result<Vec<RecordingCommand>, StoreError>;

    /// Create a `NEW` command. Fails while another command is active.
    fn submit(&self, request: RecordingRequest) -> Result<RecordingCommand, StoreError>;

    /// Move a `NEW` or `RECORD` command to `STOP`.
    fn request_stop(&self, id: Uuid) -> Result<RecordingCommand, StoreError>;

    /// Set `new` only if the command is currently in `expected`.
    /// Returns whether the swap happened.
    fn compare_and_set(
        &self,
        id: Uuid,
        expected: CommandState,
        new: CommandState,
    ) -> Result<bool, StoreError>;

    /// Move an active command to `STOPPED` and record its completion.
    fn finish(&self, id: Uuid, completion: CommandCompletion) -> Result<(), StoreError>;

    /// Block until something changed or `timeout` passed. Returns true on change.
    fn wait_for_change(&self, timeout: Duration) -> bool;
}

/// Command list semantics shared by all stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct CommandTable {
    commands: Vec<RecordingCommand>,
}

impl CommandTable {
    pub(crate) fn active(&self) -> Option<&RecordingCommand> {
        self.commands.iter().find(|c| c.state.is_active())
    }

    pub(crate) fn get(&self, id: Uuid) -> Option<&RecordingCommand> {
        self.commands.iter().find(|c| c.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut RecordingCommand, StoreError> {
        self.commands
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    pub(crate) fn list(&self) -> Vec<RecordingCommand> {
        self.commands.clone()
    }

    pub(crate) fn submit(
        &mut self,
        request: RecordingRequest,
    ) -> Result<RecordingCommand, StoreError> {
        if let Some(active) = self.active() {
            return Err(StoreError::AlreadyActive(active.id));
        }
        let command = RecordingCommand::new(request);
        self.commands.push(command.clone());
        Ok(command)
    }

    pub(crate) fn request_stop(&mut self, id: Uuid) -> Result<RecordingCommand, StoreError> {
        let command = self.get_mut(id)?;
        match command.state {
            CommandState::New | CommandState::Record => {
                command.state = CommandState::Stop;
                Ok(command.clone())
            }
            CommandState::Stop | CommandState::Stopped => Err(StoreError::NotActive(id)),
        }
    }

    pub(crate) fn compare_and_set(
        &mut self,
        id: Uuid,
        expected: CommandState,
        new: CommandState,
    ) -> Result<bool, StoreError> {
        let command = self.get_mut(id)?;
        if command.state != expected {
            return Ok(false);
        }
        command.state = new;
        Ok(true)
    }

    pub(crate) fn finish(
        &mut self,
        id: Uuid,
        completion: CommandCompletion,
    ) -> Result<(), StoreError> {
        let command = self.get_mut(id)?;
        if !command.state.is_active() {
            return Err(StoreError::NotActive(id));
        }
        command.state = CommandState::Stopped;
        command.duration_ms = completion.duration_ms;
        command.files = completion.files;
        command.channel_frames = completion.channel_frames;
        command.error = completion.error;
        Ok(())
    }
}
