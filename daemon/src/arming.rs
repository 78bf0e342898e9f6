/// Arming window: the host calls the arm hook right before it sends a
/// generation request, and only calls observed while the window is open are
/// watched.  The window expires on its own so that unrelated later requests are
/// never picked up.
use tokio::time::{Duration, Instant};

pub const DEFAULT_ARM_WINDOW: Duration = Duration::from_millis(20_000);

#[derive(Debug)]
pub struct ArmingTimer {
    window: Duration,
    /// `None` until the first arm.
    armed_until: Option<Instant>,
}

impl ArmingTimer {
    pub fn new(window: Duration) -> Self {
        Self { window, armed_until: None }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Changes the window used by subsequent arms.  An expiry that is already
    /// set is left alone.
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn arm(&mut self) {
        self.arm_at(Instant::now());
    }

    /// Sets the expiry to `now + window`, overwriting any previous expiry even
    /// if the new one is earlier.
    pub fn arm_at(&mut self, now: Instant) {
        self.armed_until = Some(now + self.window);
    }

    pub fn is_armed(&self) -> bool {
        self.is_armed_at(Instant::now())
    }

    pub fn is_armed_at(&self, now: Instant) -> bool {
        self.armed_until.is_some_and(|until| now <= until)
    }

    pub fn armed_until(&self) -> Option<Instant> {
        self.armed_until
    }
}

impl Default for ArmingTimer {
    fn default() -> Self {
        Self::new(DEFAULT_ARM_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: Duration = Duration::from_millis(1);

    #[test]
    fn never_armed_is_not_armed() {
        let timer = ArmingTimer::default();
        assert!(!timer.is_armed_at(Instant::now()));
        assert!(timer.armed_until().is_none());
    }

    #[test]
    fn default_window_is_twenty_seconds() {
        assert_eq!(ArmingTimer::default().window(), Duration::from_secs(20));
    }

    #[test]
    fn armed_just_before_expiry_and_not_after() {
        let mut timer = ArmingTimer::default();
        let t0 = Instant::now();
        timer.arm_at(t0);

        assert!(timer.is_armed_at(t0));
        assert!(timer.is_armed_at(t0 + DEFAULT_ARM_WINDOW - EPS));
        assert!(timer.is_armed_at(t0 + DEFAULT_ARM_WINDOW));
        assert!(!timer.is_armed_at(t0 + DEFAULT_ARM_WINDOW + EPS));
    }

    #[test]
    fn rearm_extends_the_window() {
        let mut timer = ArmingTimer::new(Duration::from_secs(5));
        let t0 = Instant::now();
        timer.arm_at(t0);
        timer.arm_at(t0 + Duration::from_secs(4));
        assert!(timer.is_armed_at(t0 + Duration::from_secs(8)));
    }

    #[test]
    fn rearm_with_shorter_window_overwrites_later_expiry() {
        let mut timer = ArmingTimer::new(Duration::from_secs(60));
        let t0 = Instant::now();
        timer.arm_at(t0);

        timer.set_window(Duration::from_secs(1));
        timer.arm_at(t0);
        assert_eq!(timer.armed_until(), Some(t0 + Duration::from_secs(1)));
        assert!(!timer.is_armed_at(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn set_window_keeps_existing_expiry() {
        let mut timer = ArmingTimer::new(Duration::from_secs(10));
        let t0 = Instant::now();
        timer.arm_at(t0);
        timer.set_window(Duration::from_secs(1));
        assert!(timer.is_armed_at(t0 + Duration::from_secs(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_on_the_runtime_clock() {
        let mut timer = ArmingTimer::new(Duration::from_millis(200));
        timer.arm();
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(timer.is_armed());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!timer.is_armed());
    }
}
