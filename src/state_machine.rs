//! State machine for the recording supervisor
//!
//! This module implements the supervisor's control logic using a single-writer
//! pattern. All state transitions go through the `reduce()` function, which
//! returns a new state and a list of effects to execute.

use std::time::Instant;
use uuid::Uuid;

use crate::store::{CommandCompletion, CommandState, RecordingCommand};

/// Completion written for a command found in RECORD with no session behind it.
pub const ORPHANED_RECORDING_ERROR: &str =
    "Recording interrupted: no capture session was running for it";

/// Internal state of the supervisor.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Idle,
    /// A NEW command was picked up and its session is being opened.
    Opening { recording_id: Uuid },
    Recording {
        recording_id: Uuid,
        started_at: Instant,
    },
    /// The session is being torn down; its command is not STOPPED yet.
    Stopping { recording_id: Uuid },
}

impl State {
    pub fn recording_id(&self) -> Option<Uuid> {
        match self {
            State::Idle => None,
            State::Opening { recording_id }
            | State::Recording { recording_id, .. }
            | State::Stopping { recording_id } => Some(*recording_id),
        }
    }
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone)]
pub enum Event {
    /// Result of one store poll: the active command, if any.
    Observed { command: Option<RecordingCommand> },

    // Session events
    SessionOpened { id: Uuid },
    SessionOpenFailed {
        id: Uuid,
        completion: CommandCompletion,
    },
    /// The running session hit an error and must be stopped.
    SessionFaulted { id: Uuid, err: String },
    SessionClosed {
        id: Uuid,
        completion: CommandCompletion,
    },

    /// Process shutdown requested
    Shutdown,
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Validate the request, open the device and start capturing.
    OpenSession { command: RecordingCommand },
    /// Stop the session and close its files.
    StopSession { id: Uuid },
    /// Compare-and-set NEW -> RECORD.
    MarkRecording { id: Uuid },
    /// Write STOPPED with the completion fields.
    MarkStopped {
        id: Uuid,
        completion: CommandCompletion,
    },
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale recording IDs
/// - Every session that was opened is stopped before its command is finished
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.recording_id();

    // Helper: check if event's ID is stale (doesn't match current workflow)
    let is_stale = |eid: Uuid| Some(eid) != current_id;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, Observed { command: None }) => (Idle, vec![]),
        (Idle, Observed { command: Some(command) }) => match command.state {
            CommandState::New => (
                Opening {
                    recording_id: command.id,
                },
                vec![OpenSession { command }],
            ),
            // Left over from a previous run of the daemon
            CommandState::Record => {
                log::warn!(
                    "Recording {} is marked RECORD but no session is running; stopping it",
                    command.id
                );
                (
                    Idle,
                    vec![MarkStopped {
                        id: command.id,
                        completion: CommandCompletion::failed(ORPHANED_RECORDING_ERROR),
                    }],
                )
            }
            // Stopped before it was ever opened
            CommandState::Stop => (
                Idle,
                vec![MarkStopped {
                    id: command.id,
                    completion: CommandCompletion::default(),
                }],
            ),
            CommandState::Stopped => (Idle, vec![]),
        },
        (Idle, Shutdown) => (Idle, vec![]),

        // -----------------
        // Opening
        // -----------------
        (Opening { recording_id }, SessionOpened { id }) if *recording_id == id => (
            Recording {
                recording_id: *recording_id,
                started_at: Instant::now(),
            },
            vec![MarkRecording { id }],
        ),
        (Opening { recording_id }, SessionOpenFailed { id, completion }) if *recording_id == id => {
            (Idle, vec![MarkStopped { id, completion }])
        }
        (Opening { recording_id }, Shutdown) => (
            Stopping {
                recording_id: *recording_id,
            },
            vec![StopSession { id: *recording_id }],
        ),

        // -----------------
        // Recording
        // -----------------
        (
            Recording {
                recording_id,
                started_at,
            },
            Observed {
                command: Some(command),
            },
        ) if command.id == *recording_id => match command.state {
            CommandState::Stop | CommandState::Stopped => {
                log::info!(
                    "Recording {} stop requested after {:?}",
                    recording_id,
                    started_at.elapsed()
                );
                (
                    Stopping {
                        recording_id: *recording_id,
                    },
                    vec![StopSession { id: *recording_id }],
                )
            }
            // The NEW -> RECORD swap did not land; try again.
            CommandState::New => (state.clone(), vec![MarkRecording { id: *recording_id }]),
            CommandState::Record => (state.clone(), vec![]),
        },
        (Recording { recording_id, .. }, Observed { command: Some(other) }) => {
            log::warn!(
                "Ignoring recording {} while {} is being recorded",
                other.id,
                recording_id
            );
            (state.clone(), vec![])
        }
        (Recording { recording_id, .. }, Observed { command: None }) => {
            log::warn!(
                "Recording {} is no longer active in the store; stopping",
                recording_id
            );
            (
                Stopping {
                    recording_id: *recording_id,
                },
                vec![StopSession { id: *recording_id }],
            )
        }
        (Recording { recording_id, .. }, SessionFaulted { id, err }) if *recording_id == id => {
            log::error!("Recording {} faulted: {}", recording_id, err);
            (
                Stopping {
                    recording_id: *recording_id,
                },
                vec![StopSession { id }],
            )
        }
        (Recording { recording_id, .. }, Shutdown) => (
            Stopping {
                recording_id: *recording_id,
            },
            vec![StopSession { id: *recording_id }],
        ),

        // -----------------
        // Stopping
        // -----------------
        (Stopping { recording_id }, SessionClosed { id, completion }) if *recording_id == id => {
            (Idle, vec![MarkStopped { id, completion }])
        }

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, SessionOpened { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, SessionOpenFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, SessionFaulted { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, SessionClosed { id, .. }) if is_stale(id) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
