/// Debounced front for the audio sink.
use std::sync::Arc;

use tokio::time::{Duration, Instant};

use crate::audio::AudioSink;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(400);

pub struct Notifier {
    sink: Arc<dyn AudioSink>,
    cooldown: Duration,
    last_fire: Option<Instant>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn AudioSink>, cooldown: Duration) -> Self {
        Self { sink, cooldown, last_fire: None }
    }

    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    pub fn sink(&self) -> &Arc<dyn AudioSink> {
        &self.sink
    }

    pub fn notify(&mut self) -> bool {
        self.notify_at(Instant::now())
    }

    /// Triggers the sink unless the previous firing was less than the
    /// cooldown ago.  Returns whether the sink was triggered.  Playback
    /// errors are swallowed.
    pub fn notify_at(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_fire {
            if now.saturating_duration_since(last) < self.cooldown {
                tracing::debug!("alert suppressed by cooldown");
                return false;
            }
        }
        self.last_fire = Some(now);

        if let Err(e) = self.sink.play_alert() {
            tracing::debug!(error = %e, "alert playback failed");
        }
        true
    }
}
