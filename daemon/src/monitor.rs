/// Shared hub tying the arming window, the classifier, the round tracker and
/// the notifier together.  Both interception adapters hold an
/// `Arc<Monitor>` and drive rounds through [`RoundHandle`]s.
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::time::Duration;

use crate::arming::{ArmingTimer, DEFAULT_ARM_WINDOW};
use crate::audio::{AudioError, AudioSink};
use crate::classifier::Classifier;
use crate::notifier::{Notifier, DEFAULT_COOLDOWN};
use crate::round::{RoundId, RoundOutcome, RoundTracker};

const OUTCOME_CHANNEL_CAPACITY: usize = 32;

/// Runtime-adjustable timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub arm_window: Duration,
    pub cooldown: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { arm_window: DEFAULT_ARM_WINDOW, cooldown: DEFAULT_COOLDOWN }
    }
}

/// The call surface a round was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Single-shot request/response call.
    Request,
    /// Event-driven request object.
    EventCall,
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Surface::Request => f.write_str("request"),
            Surface::EventCall => f.write_str("event"),
        }
    }
}

struct State {
    timer: ArmingTimer,
    rounds: RoundTracker,
    notifier: Notifier,
}

pub struct Monitor {
    classifier: Classifier,
    state: Mutex<State>,
    outcomes: broadcast::Sender<RoundOutcome>,
}

impl Monitor {
    pub fn new(settings: MonitorSettings, classifier: Classifier, sink: Arc<dyn AudioSink>) -> Arc<Self> {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Arc::new(Self {
            classifier,
            state: Mutex::new(State {
                timer: ArmingTimer::new(settings.arm_window),
                rounds: RoundTracker::new(),
                notifier: Notifier::new(sink, settings.cooldown),
            }),
            outcomes,
        })
    }

    /// Bookkeeping sections are short and never panic while holding the lock,
    /// but a poisoned lock must not break the host's calls either.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn apply_settings(&self, settings: MonitorSettings) {
        let mut state = self.state();
        state.timer.set_window(settings.arm_window);
        state.notifier.set_cooldown(settings.cooldown);
    }

    /// Arm hook: opens the arming window and hands the payload back untouched.
    pub fn intercept<T>(&self, payload: T) -> T {
        self.arm();
        payload
    }

    pub fn arm(&self) {
        let mut state = self.state();
        state.timer.arm();
        tracing::debug!(window_ms = state.timer.window().as_millis() as u64, "armed");
    }

    pub fn is_armed(&self) -> bool {
        self.state().timer.is_armed()
    }

    pub fn active_rounds(&self) -> usize {
        self.state().rounds.active_count()
    }

    /// Receives every evaluated round outcome.
    pub fn subscribe(&self) -> broadcast::Receiver<RoundOutcome> {
        self.outcomes.subscribe()
    }

    /// Starts a round when the monitor is armed and the call is a generation
    /// request.  `method` is compared upper-cased.
    pub fn begin(self: &Arc<Self>, surface: Surface, method: &str, url: &str) -> Option<RoundHandle> {
        let method = method.to_ascii_uppercase();
        let mut state = self.state();
        if !state.timer.is_armed() || !self.classifier.is_generation_request(url, &method) {
            return None;
        }
        let label = format!("{surface} {method} {url}");
        let id = state.rounds.start(label.as_str());
        drop(state);

        tracing::debug!(round = %id, %label, "round start");
        Some(RoundHandle { monitor: Arc::clone(self), id, finished: false })
    }

    fn mark_content(&self, id: RoundId) {
        self.state().rounds.mark_content(id);
    }

    fn mark_aborted(&self, id: RoundId) {
        self.state().rounds.mark_aborted(id);
    }

    /// Closes round `id`, fires the notifier for a bad round and publishes the
    /// outcome.  A round that is already closed yields `None`.
    fn end(&self, id: RoundId, succeeded: bool, reason: &str) -> Option<RoundOutcome> {
        let outcome = {
            let mut state = self.state();
            let mut outcome = state.rounds.end(id, succeeded, reason)?;
            if outcome.should_notify() {
                outcome.notified = state.notifier.notify();
            }
            outcome
        };

        tracing::debug!(
            round = %outcome.id,
            label = %outcome.label,
            succeeded = outcome.succeeded,
            got_content = outcome.got_content,
            user_aborted = outcome.user_aborted,
            reason = %outcome.reason,
            notified = outcome.notified,
            "round end"
        );
        // No subscribers is fine.
        let _ = self.outcomes.send(outcome.clone());
        Some(outcome)
    }

    /// Fires the notifier directly, bypassing round evaluation.
    pub fn self_test(&self) -> bool {
        tracing::info!("self-test alert");
        self.state().notifier.notify()
    }

    /// Silent audio initialisation for the first input gesture.  Blocks for
    /// the length of the probe.
    pub fn unlock_audio(&self) -> Result<(), AudioError> {
        let sink = Arc::clone(self.state().notifier.sink());
        sink.unlock()
    }
}

/// One watched call's round.  Dropping an unfinished handle means the caller
/// abandoned the call: the round is marked aborted and closed without an
/// alert.
pub struct RoundHandle {
    monitor: Arc<Monitor>,
    id: RoundId,
    finished: bool,
}

impl RoundHandle {
    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn mark_content(&self) {
        self.monitor.mark_content(self.id);
    }

    pub fn mark_aborted(&self) {
        self.monitor.mark_aborted(self.id);
    }

    pub fn finish(mut self, succeeded: bool, reason: &str) -> Option<RoundOutcome> {
        self.finished = true;
        self.monitor.end(self.id, succeeded, reason)
    }

    /// Marks the round aborted and closes it as a benign outcome.
    pub fn abort(self, reason: &str) -> Option<RoundOutcome> {
        self.mark_aborted();
        self.finish(true, reason)
    }
}

impl Drop for RoundHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.monitor.mark_aborted(self.id);
            self.monitor.end(self.id, true, "dropped before completion");
        }
    }
}

impl fmt::Debug for RoundHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::tests::CountingSink;

    const CHAT: &str = "/api/openai/chat/completions";

    fn monitor() -> (Arc<Monitor>, Arc<CountingSink>) {
        let sink = Arc::new(CountingSink::default());
        let monitor = Monitor::new(MonitorSettings::default(), Classifier::builtin(), sink.clone());
        (monitor, sink)
    }

    // ── arming ────────────────────────────────────────────────────────────────

    #[test]
    fn intercept_returns_payload_and_arms() {
        let (m, _) = monitor();
        assert!(!m.is_armed());
        let payload = vec!["system".to_string(), "user".to_string()];
        let returned = m.intercept(payload.clone());
        assert_eq!(returned, payload);
        assert!(m.is_armed());
    }

    #[test]
    fn unarmed_monitor_never_begins() {
        let (m, _) = monitor();
        assert!(m.begin(Surface::Request, "POST", CHAT).is_none());
        assert_eq!(m.active_rounds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_window_stops_watching() {
        let (m, _) = monitor();
        m.arm();
        tokio::time::advance(DEFAULT_ARM_WINDOW + Duration::from_millis(1)).await;
        assert!(m.begin(Surface::Request, "POST", CHAT).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn apply_settings_changes_next_window() {
        let (m, _) = monitor();
        m.apply_settings(MonitorSettings {
            arm_window: Duration::from_millis(500),
            cooldown: DEFAULT_COOLDOWN,
        });
        m.arm();
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!m.is_armed());
    }

    // ── classification ────────────────────────────────────────────────────────

    #[test]
    fn begin_upper_cases_method() {
        let (m, _) = monitor();
        m.arm();
        let handle = m.begin(Surface::Request, "post", CHAT).unwrap();
        handle.finish(true, "test");
    }

    #[test]
    fn denied_url_never_starts_a_round() {
        let (m, sink) = monitor();
        m.arm();
        assert!(m.begin(Surface::Request, "POST", "/api/characters/123").is_none());
        assert_eq!(m.active_rounds(), 0);
        assert_eq!(sink.plays(), 0);
    }

    // ── outcomes ──────────────────────────────────────────────────────────────

    #[test]
    fn content_and_success_is_quiet() {
        let (m, sink) = monitor();
        m.arm();
        let handle = m.begin(Surface::Request, "POST", CHAT).unwrap();
        handle.mark_content();
        let out = handle.finish(true, "done").unwrap();
        assert!(!out.notified);
        assert_eq!(sink.plays(), 0);
    }

    #[test]
    fn empty_success_alerts() {
        let (m, sink) = monitor();
        m.arm();
        let out = m.begin(Surface::Request, "POST", CHAT).unwrap().finish(true, "empty").unwrap();
        assert!(out.notified);
        assert_eq!(sink.plays(), 1);
    }

    #[test]
    fn failure_with_content_alerts() {
        let (m, sink) = monitor();
        m.arm();
        let handle = m.begin(Surface::Request, "POST", CHAT).unwrap();
        handle.mark_content();
        assert!(handle.finish(false, "500").unwrap().notified);
        assert_eq!(sink.plays(), 1);
    }

    #[test]
    fn abort_is_quiet() {
        let (m, sink) = monitor();
        m.arm();
        let out = m.begin(Surface::Request, "POST", CHAT).unwrap().abort("cancel").unwrap();
        assert!(out.user_aborted);
        assert!(out.succeeded);
        assert_eq!(sink.plays(), 0);
    }

    #[test]
    fn dropped_handle_counts_as_abort() {
        let (m, sink) = monitor();
        let mut rx = m.subscribe();
        m.arm();
        drop(m.begin(Surface::Request, "POST", CHAT).unwrap());

        let out = rx.try_recv().unwrap();
        assert!(out.user_aborted);
        assert_eq!(out.reason, "dropped before completion");
        assert_eq!(m.active_rounds(), 0);
        assert_eq!(sink.plays(), 0);
    }

    #[test]
    fn outcomes_are_broadcast_with_label() {
        let (m, _) = monitor();
        let mut rx = m.subscribe();
        m.arm();
        m.begin(Surface::EventCall, "POST", CHAT).unwrap().finish(false, "error");
        let out = rx.try_recv().unwrap();
        assert_eq!(out.label, format!("event POST {CHAT}"));
        assert!(!out.succeeded);
    }

    #[test]
    fn overlapping_failures_are_debounced() {
        let (m, sink) = monitor();
        m.arm();
        let a = m.begin(Surface::Request, "POST", CHAT).unwrap();
        let b = m.begin(Surface::EventCall, "POST", CHAT).unwrap();
        assert_eq!(m.active_rounds(), 2);
        assert!(a.finish(false, "a").unwrap().notified);
        assert!(!b.finish(false, "b").unwrap().notified);
        assert_eq!(sink.plays(), 1);
    }

    // ── self-test / unlock ────────────────────────────────────────────────────

    #[test]
    fn self_test_bypasses_rounds() {
        let (m, sink) = monitor();
        assert!(m.self_test());
        assert_eq!(sink.plays(), 1);
        assert_eq!(m.active_rounds(), 0);
    }

    #[test]
    fn unlock_reaches_sink() {
        let (m, sink) = monitor();
        m.unlock_audio().unwrap();
        assert_eq!(sink.unlocks.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
