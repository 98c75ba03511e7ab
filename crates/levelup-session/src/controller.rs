//! Session controller: the single authority over a call's status.
//!
//! All mutations happen under one async mutex. Engine start and stop calls
//! are awaited without holding it; their outcomes are applied afterwards only
//! if the session is still on the same attempt and in the expected status.
//! The connect watchdog and the duration tracker are armed and torn down in
//! the same locked section as the transition that enters or leaves their
//! status.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::bridge::{EngineEventSink, EventBridge};
use crate::call_state::{CallSession, CallStatus};
use crate::config::SessionConfig;
use crate::duration::DurationTracker;
use crate::engine::{EngineEvent, EngineService, StartParams};
use crate::error::{Result, SessionError};
use crate::events::{SessionEvent, SessionEvents, SessionSnapshot};
use crate::guard::TimeoutGuard;
use crate::redirect::{Navigation, RedirectFlags, Redirector};

/// Handle to a call session. Cheap to clone; all clones share one session.
#[derive(Debug, Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

#[derive(Debug)]
struct ControllerInner {
    me: Weak<ControllerInner>,
    shared: Mutex<Shared>,
    engine: EngineService,
    settings: SessionConfig,
    events: SessionEvents,
    redirector: Option<Redirector>,
}

#[derive(Debug, Default)]
struct Shared {
    session: CallSession,
    guard: TimeoutGuard,
    tracker: DurationTracker,
    bridge: EventBridge,
    redirect: RedirectFlags,
    navigation: Option<Navigation>,
}

impl SessionController {
    /// Creates a controller in `Idle`.
    ///
    /// Pass a redirector to enable the post-call redirect.
    #[must_use]
    pub fn new(
        engine: EngineService,
        settings: SessionConfig,
        redirector: Option<Redirector>,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| ControllerInner {
            me: me.clone(),
            shared: Mutex::new(Shared::default()),
            engine,
            settings,
            events: SessionEvents::default(),
            redirector,
        });
        Self { inner }
    }

    /// Subscribes to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The engine service this controller drives.
    #[must_use]
    pub fn engine(&self) -> &EngineService {
        &self.inner.engine
    }

    /// Returns a copy of the session state.
    pub async fn session(&self) -> CallSession {
        self.inner.shared.lock().await.session.clone()
    }

    /// Returns the observer view of the session.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let shared = self.inner.shared.lock().await;
        SessionSnapshot::new(&shared.session, shared.navigation.clone())
    }

    /// Returns `true` while the connect watchdog is pending.
    pub async fn has_pending_timeout(&self) -> bool {
        self.inner.shared.lock().await.guard.is_pending()
    }

    /// Returns `true` while the duration tracker runs.
    pub async fn is_tracking(&self) -> bool {
        self.inner.shared.lock().await.tracker.is_running()
    }

    /// Attaches the engine listeners. Returns `false` if they were already
    /// attached.
    pub async fn attach_listeners(&self) -> bool {
        let mut shared = self.inner.shared.lock().await;
        if shared.bridge.is_attached() {
            debug!("Listeners already attached, skipping");
            return false;
        }
        let subscription = self.inner.engine.subscribe();
        let attached = shared
            .bridge
            .attach(subscription, Arc::downgrade(&self.inner));
        shared.session.listeners_attached = true;
        attached
    }

    /// Detaches the engine listeners.
    pub async fn detach_listeners(&self) {
        let mut shared = self.inner.shared.lock().await;
        shared.bridge.detach();
        shared.session.listeners_attached = false;
    }

    /// Starts a call with the given assistant.
    ///
    /// Allowed from `Idle` or `Error`. The engine's acknowledgement is raced
    /// against the configured start timeout; on failure the session moves to
    /// `Error` unless something else already moved it on.
    ///
    /// Returns the attempt number.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::SessionBusy` if a call is outstanding, or the
    /// start failure.
    pub async fn start_session(&self, assistant_id: &str, params: StartParams) -> Result<u64> {
        self.attach_listeners().await;

        let attempt = {
            let mut shared = self.inner.shared.lock().await;
            let from = shared.session.status;
            let attempt = shared.session.begin_connecting().map_err(|e| {
                warn!(status = %from, "Start rejected, session busy");
                e
            })?;
            shared.redirect.reset(attempt);
            shared.navigation = None;
            self.inner.apply(&mut shared, from);
            attempt
        };

        info!(attempt, assistant_id, "Starting call");
        let engine = self.inner.engine.engine();
        let timeout = self.inner.settings.start_timeout();
        let outcome = match tokio::time::timeout(timeout, engine.start(assistant_id, &params)).await
        {
            Ok(result) => result,
            Err(_) => Err(SessionError::StartTimeout {
                timeout_secs: timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(()) => {
                debug!(attempt, "Engine accepted start");
                Ok(attempt)
            }
            Err(e) => {
                error!(attempt, error = %e, "Failed to start call");
                self.inner.fail_attempt(attempt, &e).await;
                Err(e)
            }
        }
    }

    /// Ends the call.
    ///
    /// Allowed from `Active`, or from `Connecting` to cancel. The session
    /// moves to `Ending`; the engine's `call-end` completes the transition to
    /// `Idle`. A cancelled connection resolves to `Idle` as soon as the stop
    /// is acknowledged, and any confirmation arriving later is ignored.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidStateTransition` if there is nothing to
    /// end, or the stop failure (the session is then in `Error`).
    pub async fn end_session(&self) -> Result<()> {
        let (attempt, cancelled) = {
            let mut shared = self.inner.shared.lock().await;
            let from = shared.session.status;
            shared.session.begin_ending()?;
            self.inner.apply(&mut shared, from);
            (shared.session.attempt, from == CallStatus::Connecting)
        };

        info!(attempt, cancelled, "Ending call");
        let result = self.inner.engine.engine().stop().await;

        let mut shared = self.inner.shared.lock().await;
        let still_ending =
            shared.session.attempt == attempt && shared.session.status == CallStatus::Ending;

        match result {
            Ok(()) => {
                if cancelled && still_ending && shared.session.mark_ended().is_ok() {
                    info!(attempt, "Connection cancelled");
                    self.inner.apply(&mut shared, CallStatus::Ending);
                }
                Ok(())
            }
            Err(e) => {
                error!(attempt, error = %e, "Failed to stop call");
                if still_ending {
                    shared.session.fail(e.user_message());
                    self.inner.apply(&mut shared, CallStatus::Ending);
                }
                Err(e)
            }
        }
    }

    /// Clears a displayed error.
    pub async fn dismiss_error(&self) {
        let mut shared = self.inner.shared.lock().await;
        let from = shared.session.status;
        shared.session.dismiss_error();
        self.inner.apply(&mut shared, from);
    }

    /// Feeds an engine event to the session as if the bridge delivered it.
    pub async fn handle_engine_event(&self, event: EngineEvent) {
        self.inner.on_engine_event(event).await;
    }

    /// Tears the session down: stops an outstanding call, cancels timers and
    /// detaches listeners.
    pub async fn shutdown(&self) {
        let busy = self.inner.shared.lock().await.session.status.is_busy();
        if busy {
            if let Err(e) = self.inner.engine.engine().stop().await {
                warn!(error = %e, "Failed to stop call during shutdown");
            }
        }

        let mut shared = self.inner.shared.lock().await;
        shared.guard.cancel();
        shared.tracker.stop();
        shared.bridge.detach();
        shared.session.listeners_attached = false;
        info!("Session shut down");
    }
}

impl ControllerInner {
    /// Applies the side effects of a transition from `from` to the current
    /// status. Must be called with the lock held, right after the change.
    fn apply(&self, shared: &mut MutexGuard<'_, Shared>, from: CallStatus) {
        let to = shared.session.status;

        if to != CallStatus::Connecting {
            shared.guard.cancel();
        }
        if to != CallStatus::Active {
            shared.tracker.stop();
        }

        let attempt = shared.session.attempt;
        if to == CallStatus::Connecting && from != CallStatus::Connecting {
            let me = self.me.clone();
            shared
                .guard
                .arm(attempt, self.settings.connect_timeout(), move || async move {
                    if let Some(inner) = me.upgrade() {
                        inner.on_connect_timeout(attempt).await;
                    }
                });
        }
        if to == CallStatus::Active && from != CallStatus::Active {
            let me = self.me.clone();
            shared.tracker.start(move || {
                let me = me.clone();
                async move {
                    match me.upgrade() {
                        Some(inner) => inner.on_tick(attempt).await,
                        None => false,
                    }
                }
            });
        }

        if from == to {
            return;
        }

        info!(from = %from, to = %to, attempt, "Session status changed");
        self.events
            .send(SessionEvent::status_changed(from, &shared.session));
        if to == CallStatus::Error {
            if let Some(message) = &shared.session.last_error {
                self.events.send(SessionEvent::error(message.clone()));
            }
        }
    }

    async fn on_connect_timeout(&self, attempt: u64) {
        let mut shared = self.shared.lock().await;
        shared.guard.disarm(attempt);

        if shared.session.attempt != attempt || shared.session.status != CallStatus::Connecting {
            debug!(attempt, "Stale connect watchdog ignored");
            return;
        }

        let from = shared.session.status;
        if shared.session.time_out().is_ok() {
            warn!(attempt, "Connection attempt timed out");
            self.apply(&mut shared, from);
        }
    }

    async fn on_tick(&self, attempt: u64) -> bool {
        let mut shared = self.shared.lock().await;
        if shared.session.attempt != attempt || !shared.session.tick() {
            return false;
        }
        let seconds = shared.session.duration_seconds;
        self.events.send(SessionEvent::tick(seconds));
        true
    }

    async fn fail_attempt(&self, attempt: u64, error: &SessionError) {
        let mut shared = self.shared.lock().await;
        if shared.session.attempt != attempt || shared.session.status != CallStatus::Connecting {
            debug!(attempt, status = %shared.session.status, "Start failure after session moved on");
            return;
        }
        shared.session.fail(error.user_message());
        self.apply(&mut shared, CallStatus::Connecting);
    }

    fn finish_call(&self, shared: &mut MutexGuard<'_, Shared>, cause: &str) {
        let from = shared.session.status;
        let attempt = shared.session.attempt;

        if shared.session.mark_ended().is_ok() {
            info!(attempt, cause, "Call ended");
            self.apply(shared, from);
        } else {
            debug!(attempt, cause, status = %from, "Call end while not in a call");
        }

        self.maybe_redirect(shared, attempt);
    }

    fn maybe_redirect(&self, shared: &mut MutexGuard<'_, Shared>, attempt: u64) {
        let Some(redirector) = self.redirector.clone() else {
            return;
        };
        if !shared.redirect.take_trigger(attempt) {
            return;
        }

        let me = self.me.clone();
        tokio::spawn(async move {
            let Some(navigation) = redirector.resolve().await else {
                return;
            };
            let Some(inner) = me.upgrade() else {
                return;
            };
            let mut shared = inner.shared.lock().await;
            if shared.session.attempt != attempt {
                debug!(
                    attempt,
                    current = shared.session.attempt,
                    "Redirect for an earlier call dropped"
                );
                return;
            }
            shared.navigation = Some(navigation.clone());
            inner.events.send(SessionEvent::Navigate(navigation));
        });
    }

    fn stop_stray_call(&self) {
        let engine = self.engine.engine();
        tokio::spawn(async move {
            if let Err(e) = engine.stop().await {
                warn!(error = %e, "Failed to stop unexpected call");
            }
        });
    }
}

#[async_trait]
impl EngineEventSink for ControllerInner {
    async fn on_engine_event(&self, event: EngineEvent) {
        let mut shared = self.shared.lock().await;
        let from = shared.session.status;
        let attempt = shared.session.attempt;
        let meeting_over = event.is_expected_termination();

        match event {
            EngineEvent::CallStart => {
                if shared.session.mark_active().is_ok() {
                    info!(attempt, "Call started");
                    self.apply(&mut shared, from);
                } else {
                    warn!(attempt, status = %from, "Ignoring call-start outside connecting");
                    if !from.is_busy() {
                        self.stop_stray_call();
                    }
                }
            }
            EngineEvent::CallEnd => self.finish_call(&mut shared, "call-end"),
            EngineEvent::Error { message } if meeting_over => {
                info!(attempt, message = %message, "Engine reported end of meeting");
                self.finish_call(&mut shared, "meeting-ended");
            }
            EngineEvent::Error { message } => {
                error!(attempt, message = %message, "Engine error");
                if from.is_busy() {
                    shared.session.fail(format!("An error occurred: {message}"));
                    self.apply(&mut shared, from);
                } else {
                    debug!(attempt, status = %from, "Engine error outside a call ignored");
                }
            }
            EngineEvent::Message { message } => {
                let observed = self.redirector.as_ref().is_some_and(|redirector| {
                    shared
                        .redirect
                        .observe(attempt, &message, redirector.signal())
                });
                if observed {
                    info!(attempt, kind = %message.kind, "Redirect signal observed");
                } else {
                    debug!(attempt, kind = %message.kind, "Engine message");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use levelup_client::InterviewRecord;

    use super::*;
    use crate::engine::{LoopbackEngine, StartBehavior, StopBehavior};
    use crate::error::{CONNECT_TIMEOUT_MESSAGE, START_FAILED_MESSAGE, STOP_FAILED_MESSAGE};
    use crate::redirect::InterviewSource;

    fn controller_with(engine: &Arc<LoopbackEngine>) -> SessionController {
        SessionController::new(
            EngineService::from_engine(engine.clone()),
            SessionConfig::default(),
            None,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn status(controller: &SessionController) -> CallStatus {
        controller.session().await.status
    }

    fn alice() -> StartParams {
        StartParams::mock(Some("alice"), "token")
    }

    // ------------------------------------------------------------------------
    // Start / end
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_alice_scenario() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);

        let attempt = controller.start_session("asst", alice()).await.unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(status(&controller).await, CallStatus::Connecting);
        assert!(controller.has_pending_timeout().await);

        engine.emit(EngineEvent::CallStart);
        settle().await;
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Active);
        assert_eq!(session.duration_seconds, 0);
        assert!(!controller.has_pending_timeout().await);

        tokio::time::sleep(Duration::from_millis(65_500)).await;
        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.duration_seconds, 65);
        assert_eq!(snapshot.formatted_duration, "1:05");
        assert_eq!(snapshot.button_label, "End Interview");

        engine.emit(EngineEvent::CallEnd);
        settle().await;
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Idle);
        assert_eq!(session.duration_seconds, 0);
        assert!(!controller.is_tracking().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sends_params_to_engine() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);
        controller.start_session("asst-mock", alice()).await.unwrap();

        let commands = engine.commands();
        assert_eq!(
            commands,
            vec![crate::engine::EngineCommand::Start {
                assistant_id: "asst-mock".to_string(),
                params: alice(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_busy_rejected() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);
        controller.start_session("asst", alice()).await.unwrap();

        let err = controller.start_session("asst", alice()).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionBusy { .. }));
        assert_eq!(controller.session().await.attempt, 1);
        assert_eq!(engine.commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_start_moves_to_error() {
        let engine = Arc::new(LoopbackEngine::new());
        engine.set_start_behavior(StartBehavior::Reject("no microphone".to_string()));
        let controller = controller_with(&engine);

        let err = controller.start_session("asst", alice()).await.unwrap_err();
        assert!(matches!(err, SessionError::StartFailed { .. }));

        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Error);
        assert_eq!(session.last_error.as_deref(), Some(START_FAILED_MESSAGE));
        assert!(!controller.has_pending_timeout().await);

        // Error is not terminal.
        engine.set_start_behavior(StartBehavior::Accept);
        assert_eq!(controller.start_session("asst", alice()).await.unwrap(), 2);
        assert!(controller.session().await.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_times_out() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);
        controller.start_session("asst", alice()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(9_990)).await;
        assert_eq!(status(&controller).await, CallStatus::Connecting);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Error);
        assert!(session.last_error.unwrap().contains("timed out"));
        assert!(!controller.has_pending_timeout().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_start_hits_both_bounds() {
        let engine = Arc::new(LoopbackEngine::new());
        engine.set_start_behavior(StartBehavior::Hang);
        let controller = controller_with(&engine);

        let starter = controller.clone();
        let start = tokio::spawn(async move { starter.start_session("asst", alice()).await });

        tokio::time::sleep(Duration::from_millis(10_010)).await;
        assert_eq!(
            controller.session().await.last_error.as_deref(),
            Some(CONNECT_TIMEOUT_MESSAGE)
        );

        let result = start.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::StartTimeout { timeout_secs: 15 })
        ));
        // The earlier watchdog message stays; the late start failure does not
        // overwrite a session that already left connecting.
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Error);
        assert_eq!(session.last_error.as_deref(), Some(CONNECT_TIMEOUT_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_start_just_before_deadline_wins() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);
        controller.start_session("asst", alice()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        engine.emit(EngineEvent::CallStart);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Active);
        assert!(session.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_start_at_deadline_wins() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);
        controller.start_session("asst", alice()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        engine.emit(EngineEvent::CallStart);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Active);
        assert!(session.last_error.is_none());
        assert_eq!(session.duration_seconds, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_end_resolves_to_idle() {
        let engine = Arc::new(LoopbackEngine::new());
        engine.set_stop_behavior(StopBehavior::Accept);
        let controller = controller_with(&engine);
        let mut events = controller.subscribe();

        controller.start_session("asst", alice()).await.unwrap();
        controller.end_session().await.unwrap();

        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Idle);
        assert!(session.last_error.is_none());

        // A confirmation arriving after the cancel must not revive the call.
        engine.emit(EngineEvent::CallStart);
        tokio::time::sleep(Duration::from_secs(11)).await;
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Idle);
        assert!(session.last_error.is_none());
        assert_eq!(engine.stop_count(), 2);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StatusChanged(change) = event {
                seen.push(change.to);
            }
        }
        assert_eq!(
            seen,
            vec![CallStatus::Connecting, CallStatus::Ending, CallStatus::Idle]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_active_call_waits_for_call_end() {
        let engine = Arc::new(LoopbackEngine::new());
        engine.set_stop_behavior(StopBehavior::Accept);
        let controller = controller_with(&engine);

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        settle().await;

        controller.end_session().await.unwrap();
        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.status, CallStatus::Ending);
        assert_eq!(snapshot.button_label, "Hanging up...");

        engine.emit(EngineEvent::CallEnd);
        settle().await;
        assert_eq!(status(&controller).await, CallStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_with_confirming_engine() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        settle().await;

        controller.end_session().await.unwrap();
        settle().await;
        assert_eq!(status(&controller).await, CallStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_failure_leaves_ending() {
        let engine = Arc::new(LoopbackEngine::new());
        engine.set_stop_behavior(StopBehavior::Reject("socket closed".to_string()));
        let controller = controller_with(&engine);

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        settle().await;

        let err = controller.end_session().await.unwrap_err();
        assert!(matches!(err, SessionError::StopFailed { .. }));
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Error);
        assert_eq!(session.last_error.as_deref(), Some(STOP_FAILED_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_without_call_is_rejected() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);
        let err = controller.end_session().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidStateTransition { .. }));
        assert_eq!(engine.stop_count(), 0);
    }

    // ------------------------------------------------------------------------
    // Engine events
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_engine_error_during_call() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);
        let mut events = controller.subscribe();

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        engine.emit(EngineEvent::error("network lost"));
        settle().await;
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Error);
        assert_eq!(
            session.last_error.as_deref(),
            Some("An error occurred: network lost")
        );
        assert_eq!(session.duration_seconds, 0);
        assert!(!controller.is_tracking().await);

        let mut saw_error_event = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Error(payload) = event {
                saw_error_event = payload.message.contains("network lost");
            }
        }
        assert!(saw_error_event);

        // The engine follows up with call-end, which closes the call.
        engine.emit(EngineEvent::CallEnd);
        settle().await;
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Idle);
        assert!(session.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_meeting_ended_is_clean_end() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        settle().await;

        engine.emit(EngineEvent::error("Meeting has ended"));
        settle().await;
        let session = controller.session().await;
        assert_eq!(session.status, CallStatus::Idle);
        assert!(session.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_call_start_is_stopped() {
        let engine = Arc::new(LoopbackEngine::new());
        engine.set_stop_behavior(StopBehavior::Accept);
        let controller = controller_with(&engine);
        controller.attach_listeners().await;

        engine.emit(EngineEvent::CallStart);
        settle().await;
        assert_eq!(status(&controller).await, CallStatus::Idle);
        assert_eq!(engine.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_attach_ticks_once_per_second() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);

        assert!(controller.attach_listeners().await);
        assert!(!controller.attach_listeners().await);
        assert_eq!(engine.subscriber_count(), 1);
        assert_eq!(controller.engine().active_subscriptions(), 1);

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(controller.session().await.duration_seconds, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentering_active_counts_from_zero() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        engine.emit(EngineEvent::CallEnd);
        settle().await;

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(controller.session().await.duration_seconds, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_and_shutdown() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);
        controller.start_session("asst", alice()).await.unwrap();
        assert!(controller.session().await.listeners_attached);

        controller.shutdown().await;
        settle().await;
        let session = controller.session().await;
        assert!(!session.listeners_attached);
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(engine.subscriber_count(), 0);
        assert!(!controller.has_pending_timeout().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_error() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = controller_with(&engine);
        controller.start_session("asst", alice()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(status(&controller).await, CallStatus::Error);

        controller.dismiss_error().await;
        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.status, CallStatus::Idle);
        assert!(snapshot.last_error.is_none());
    }

    // ------------------------------------------------------------------------
    // Redirect
    // ------------------------------------------------------------------------

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InterviewSource for CountingSource {
        async fn list_interviews(&self) -> levelup_client::Result<Vec<InterviewRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                serde_json::from_value(
                    serde_json::json!({ "id": 3, "created_at": "2025-05-01T09:00:00" }),
                )
                .unwrap(),
                serde_json::from_value(
                    serde_json::json!({ "id": 8, "created_at": "2025-05-02T09:00:00" }),
                )
                .unwrap(),
            ])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_after_signalled_call() {
        let engine = Arc::new(LoopbackEngine::new());
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let controller = SessionController::new(
            EngineService::from_engine(engine.clone()),
            SessionConfig::default(),
            Some(Redirector::new(source.clone(), "api-endpoint-called")),
        );
        let mut events = controller.subscribe();

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        engine.emit(EngineEvent::message("api-endpoint-called"));
        engine.emit(EngineEvent::CallEnd);
        engine.emit(EngineEvent::error("Meeting has ended"));
        settle().await;
        settle().await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        let navigation = controller.snapshot().await.navigation.unwrap();
        assert_eq!(navigation.interview_id, 8);
        assert_eq!(navigation.path, "/interviews/8");

        let mut navigations = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Navigate(_)) {
                navigations += 1;
            }
        }
        assert_eq!(navigations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_redirect_without_signal() {
        let engine = Arc::new(LoopbackEngine::new());
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let controller = SessionController::new(
            EngineService::from_engine(engine.clone()),
            SessionConfig::default(),
            Some(Redirector::new(source.clone(), "api-endpoint-called")),
        );

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        engine.emit(EngineEvent::message("transcript"));
        engine.emit(EngineEvent::CallEnd);
        settle().await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert!(controller.snapshot().await.navigation.is_none());
    }

    struct SlowSource;

    #[async_trait]
    impl InterviewSource for SlowSource {
        async fn list_interviews(&self) -> levelup_client::Result<Vec<InterviewRecord>> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(vec![serde_json::from_value(
                serde_json::json!({ "id": 5, "created_at": "2025-05-03T09:00:00" }),
            )
            .unwrap()])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_redirect_ignored_after_new_call() {
        let engine = Arc::new(LoopbackEngine::new());
        let controller = SessionController::new(
            EngineService::from_engine(engine.clone()),
            SessionConfig::default(),
            Some(Redirector::new(Arc::new(SlowSource), "api-endpoint-called")),
        );
        let mut events = controller.subscribe();

        controller.start_session("asst", alice()).await.unwrap();
        engine.emit(EngineEvent::CallStart);
        engine.emit(EngineEvent::message("api-endpoint-called"));
        engine.emit(EngineEvent::CallEnd);
        settle().await;

        // A new call starts while the lookup for the first one is running.
        assert_eq!(controller.start_session("asst", alice()).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(controller.snapshot().await.navigation.is_none());
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::Navigate(_)));
        }
    }
}
