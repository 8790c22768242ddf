//! Recording supervisor
//!
//! Polls the command store, feeds what it sees through the reducer and runs
//! the resulting effects. Owns at most one live `RecordingSession`.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::RecordingSession;
use crate::capture::CaptureBackend;
use crate::effects::{EffectRunner, SessionDefaults, SessionEffectRunner};
use crate::metrics::{MetricsCollector, MetricsSummary};
use crate::settings::AppSettings;
use crate::state_machine::{reduce, Event, State};
use crate::store::{CommandCompletion, CommandStore, StoreError};

/// Error recorded on a command whose effects panicked.
pub const ABORTED_RECORDING_ERROR: &str = "Recording aborted after an internal error";

pub struct Supervisor {
    store: Arc<dyn CommandStore>,
    runner: Box<dyn EffectRunner>,
    state: State,
    session: Option<RecordingSession>,
    poll_interval: Duration,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn CommandStore>,
        backend: Arc<dyn CaptureBackend>,
        settings: &AppSettings,
    ) -> Self {
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
        let runner = SessionEffectRunner::new(
            store.clone(),
            backend,
            SessionDefaults::from(settings),
            metrics.clone(),
        );
        Self::with_runner(store, Box::new(runner), settings.poll_interval(), metrics)
    }

    pub fn with_runner(
        store: Arc<dyn CommandStore>,
        runner: Box<dyn EffectRunner>,
        poll_interval: Duration,
        metrics: Arc<Mutex<MetricsCollector>>,
    ) -> Self {
        Self {
            store,
            runner,
            state: State::default(),
            session: None,
            poll_interval,
            metrics,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_summary()
    }

    /// Reduce `event` and run effects until no follow-up events remain.
    pub fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            log::debug!("Received event: {:?}", event);

            let (next, effects) = reduce(&self.state, event);
            if std::mem::discriminant(&self.state) != std::mem::discriminant(&next) {
                log::info!("State transition: {:?} -> {:?}", self.state, next);
            }
            self.state = next;

            for effect in effects {
                queue.extend(self.runner.run(effect, &mut self.session));
            }
        }
    }

    /// One supervision step: surface a session fault, then observe the store.
    pub fn poll_once(&mut self) -> Result<(), StoreError> {
        if let State::Recording { recording_id, .. } = &self.state {
            let id = *recording_id;
            if let Some(err) = self.session.as_ref().and_then(|s| s.fault()) {
                self.dispatch(Event::SessionFaulted {
                    id,
                    err: err.to_string(),
                });
            }
        }

        let command = self.store.get_active()?;
        self.dispatch(Event::Observed { command });
        Ok(())
    }

    /// Poll until `token` is cancelled, then shut down.
    pub fn run(&mut self, token: &CancellationToken) {
        log::info!(
            "Supervisor started (poll interval {:?})",
            self.poll_interval
        );

        while !token.is_cancelled() {
            match panic::catch_unwind(AssertUnwindSafe(|| self.poll_once())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Command store poll failed: {}", e),
                Err(_) => {
                    log::error!("Supervisor poll panicked in {:?}; recovering", self.state);
                    self.recover();
                }
            }
            if token.is_cancelled() {
                break;
            }
            self.store.wait_for_change(self.poll_interval);
        }

        self.shutdown();
        log::info!("Supervisor stopped");
    }

    /// Stop any live session and mark its command STOPPED.
    pub fn shutdown(&mut self) {
        self.dispatch(Event::Shutdown);

        // Only reachable if an effect panicked between open and stop.
        if self.session.is_some() {
            log::warn!("Session still open at shutdown; closing it");
            self.close_leftover_session(None);
            self.state = State::Idle;
        }
    }

    /// Bring state back in line after a panic cut a dispatch short.
    ///
    /// A panicking effect can leave the reducer in `Opening` or `Stopping`
    /// with no event coming to move it on. Any session is stopped, the
    /// tracked command goes to STOPPED and the supervisor starts over idle.
    fn recover(&mut self) {
        let tracked = self.state.recording_id();
        let closed = self.close_leftover_session(Some(ABORTED_RECORDING_ERROR));

        if let Some(id) = tracked.filter(|id| closed != Some(*id)) {
            self.finish_command(id, CommandCompletion::failed(ABORTED_RECORDING_ERROR));
        }
        self.state = State::Idle;
    }

    /// Stop a session nothing is tracking any more and finish its command.
    fn close_leftover_session(&mut self, error: Option<&str>) -> Option<Uuid> {
        let mut session = self.session.take()?;
        let id = session.recording_id();
        log::warn!("Closing leftover session {}", id);

        let outcome = session.stop();
        let mut completion = CommandCompletion::from(&outcome);
        if completion.error.is_none() {
            completion.error = error.map(str::to_string);
        }
        self.finish_command(id, completion);
        Some(id)
    }

    fn finish_command(&self, id: Uuid, completion: CommandCompletion) {
        match self.store.finish(id, completion) {
            Ok(()) => {}
            // Finished before the panic.
            Err(StoreError::NotActive(_)) | Err(StoreError::NotFound(_)) => {}
            Err(e) => log::warn!("Failed to mark recording {} as STOPPED: {}", id, e),
        }
    }
}
