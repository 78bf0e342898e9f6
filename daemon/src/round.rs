/// Round tracking: one entry per watched call, from start to its first
/// terminal event.
///
/// Each watched call owns its own flags, keyed by a [`RoundId`], so
/// overlapping calls never clobber one another.  An id that is present in the
/// tracker is Active; an id that has been ended (or never existed) is Idle and
/// every further signal for it is a no-op.
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundId(u64);

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Round {
    label: String,
    got_content: bool,
    user_aborted: bool,
}

/// How a round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    pub id: RoundId,
    pub label: String,
    pub succeeded: bool,
    pub got_content: bool,
    pub user_aborted: bool,
    pub reason: String,
    /// Set by the monitor once the notifier has been consulted.
    pub notified: bool,
}

impl RoundOutcome {
    /// A round is bad unless the user cancelled it: either the call failed or
    /// it succeeded without delivering anything.
    pub fn should_notify(&self) -> bool {
        !self.user_aborted && (!self.succeeded || !self.got_content)
    }
}

#[derive(Debug, Default)]
pub struct RoundTracker {
    rounds: HashMap<RoundId, Round>,
    next_id: u64,
}

impl RoundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fresh round with both flags cleared.
    pub fn start(&mut self, label: impl Into<String>) -> RoundId {
        let id = RoundId(self.next_id);
        self.next_id += 1;
        self.rounds.insert(
            id,
            Round { label: label.into(), got_content: false, user_aborted: false },
        );
        id
    }

    pub fn is_active(&self, id: RoundId) -> bool {
        self.rounds.contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.rounds.len()
    }

    pub fn mark_content(&mut self, id: RoundId) {
        if let Some(round) = self.rounds.get_mut(&id) {
            round.got_content = true;
        }
    }

    pub fn mark_aborted(&mut self, id: RoundId) {
        if let Some(round) = self.rounds.get_mut(&id) {
            round.user_aborted = true;
        }
    }

    /// Closes the round and returns its outcome.  Returns `None` when the
    /// round is already closed, so duplicate terminal events are evaluated
    /// at most once.
    pub fn end(&mut self, id: RoundId, succeeded: bool, reason: impl Into<String>) -> Option<RoundOutcome> {
        let round = self.rounds.remove(&id)?;
        Some(RoundOutcome {
            id,
            label: round.label,
            succeeded,
            got_content: round.got_content,
            user_aborted: round.user_aborted,
            reason: reason.into(),
            notified: false,
        })
    }
}
