//! Metrics collection for recording sessions
//!
//! Tracks timing, capture counters, and error history per session.
//! The supervisor logs the summary after every session for diagnostics.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::audio::SessionOutcome;

/// Maximum number of completed sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for a finished recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Recording command id
    pub session_id: String,
    /// Unix timestamp when the session was picked up (seconds)
    pub started_at: u64,
    /// Time from pickup until capture was running, in milliseconds
    pub open_duration_ms: u64,
    /// Length of the recorded audio in milliseconds
    pub audio_duration_ms: u64,
    /// Wall-clock time from pickup to close in milliseconds
    pub total_session_ms: u64,
    /// Number of channel files written
    pub channel_files: u64,
    pub frames: u64,
    pub blocks: u64,
    /// Blocks that took longer to write than to play
    pub overruns: u64,
    /// Blocks the capture side skipped
    pub dropped_blocks: u64,
    /// Whether the session ended without error
    pub success: bool,
    /// Error message if the session failed
    pub error_message: Option<String>,
}

/// Summary statistics across all sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub failed_sessions: u64,
    /// Average recorded length (ms) across successful sessions
    pub avg_audio_duration_ms: u64,
    /// Average device open time (ms) across successful sessions
    pub avg_open_duration_ms: u64,
    /// Overruns summed over the retained history
    pub total_overruns: u64,
    /// Dropped blocks summed over the retained history
    pub total_dropped_blocks: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "device", "sink", "store")
    pub error_type: String,
    pub message: String,
    /// Associated session id, if applicable
    pub session_id: Option<String>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct SessionInProgress {
    session_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    open_duration: Option<Duration>,
}

impl SessionInProgress {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            open_duration: None,
        }
    }

    fn to_metrics(
        &self,
        outcome: Option<&SessionOutcome>,
        error: Option<String>,
    ) -> SessionMetrics {
        let stats = outcome.map(|o| o.stats).unwrap_or_default();
        SessionMetrics {
            session_id: self.session_id.to_string(),
            started_at: self.started_at_unix,
            open_duration_ms: self
                .open_duration
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            audio_duration_ms: outcome
                .map(|o| o.duration.as_millis() as u64)
                .unwrap_or(0),
            total_session_ms: self.started_at.elapsed().as_millis() as u64,
            channel_files: outcome.map(|o| o.files.len() as u64).unwrap_or(0),
            frames: stats.frames,
            blocks: stats.blocks,
            overruns: stats.overruns,
            dropped_blocks: stats.dropped_blocks,
            success: error.is_none(),
            error_message: error,
        }
    }
}

/// Collects and stores metrics for recording sessions
pub struct MetricsCollector {
    /// History of finished sessions (newest first)
    history: VecDeque<SessionMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
    total_sessions: u64,
    successful_sessions: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            total_sessions: 0,
            successful_sessions: 0,
        }
    }

    /// Start tracking a session when its command is picked up.
    pub fn session_started(&mut self, session_id: Uuid) {
        if let Some(old) = self.current.take() {
            log::warn!(
                "Metrics: discarding in-progress session {} to start {}",
                old.session_id,
                session_id
            );
            let metrics = old.to_metrics(None, Some("Discarded: new session started".to_string()));
            self.add_to_history(metrics);
        }

        log::debug!("Metrics: starting session {}", session_id);
        self.current = Some(SessionInProgress::new(session_id));
        self.total_sessions += 1;
    }

    /// Capture is running for the current session.
    pub fn session_recording(&mut self, session_id: Uuid) {
        if let Some(current) = self.current.as_mut().filter(|c| c.session_id == session_id) {
            current.open_duration = Some(current.started_at.elapsed());
            log::debug!(
                "Metrics: session {} recording after {:?}",
                session_id,
                current.open_duration
            );
        }
    }

    /// The session closed; `outcome.error` decides success.
    pub fn session_finished(&mut self, outcome: &SessionOutcome) {
        if !self.is_active_session(outcome.recording_id) {
            log::debug!("Metrics: no tracked session {}", outcome.recording_id);
            return;
        }
        let Some(current) = self.current.take() else {
            return;
        };

        let metrics = current.to_metrics(Some(outcome), outcome.error.clone());
        match &metrics.error_message {
            None => {
                log::info!(
                    "Metrics: session {} completed - {}ms audio in {} file(s), {} overruns, {} dropped blocks",
                    metrics.session_id,
                    metrics.audio_duration_ms,
                    metrics.channel_files,
                    metrics.overruns,
                    metrics.dropped_blocks
                );
                self.successful_sessions += 1;
            }
            Some(error) => {
                log::warn!(
                    "Metrics: session {} failed after {}ms - {}",
                    metrics.session_id,
                    metrics.total_session_ms,
                    error
                );
                self.record_error(
                    "session".to_string(),
                    error.clone(),
                    Some(metrics.session_id.clone()),
                );
            }
        }
        self.add_to_history(metrics);
    }

    /// Record an error (not necessarily tied to a session)
    pub fn record_error(
        &mut self,
        error_type: String,
        message: String,
        session_id: Option<String>,
    ) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type,
            message,
            session_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let successful: Vec<_> = self.history.iter().filter(|s| s.success).collect();
        let count = successful.len() as u64;

        let (avg_audio, avg_open) = if count > 0 {
            let sum_audio: u64 = successful.iter().map(|s| s.audio_duration_ms).sum();
            let sum_open: u64 = successful.iter().map(|s| s.open_duration_ms).sum();
            (sum_audio / count, sum_open / count)
        } else {
            (0, 0)
        };

        MetricsSummary {
            total_sessions: self.total_sessions,
            successful_sessions: self.successful_sessions,
            failed_sessions: self.total_sessions.saturating_sub(self.successful_sessions),
            avg_audio_duration_ms: avg_audio,
            avg_open_duration_ms: avg_open,
            total_overruns: self.history.iter().map(|s| s.overruns).sum(),
            total_dropped_blocks: self.history.iter().map(|s| s.dropped_blocks).sum(),
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished sessions, newest first
    pub fn get_history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    pub fn is_active_session(&self, session_id: Uuid) -> bool {
        self.current
            .as_ref()
            .map(|c| c.session_id == session_id)
            .unwrap_or(false)
    }

    fn add_to_history(&mut self, metrics: SessionMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
