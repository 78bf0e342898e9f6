use crate::config::Config;

pub enum DaemonEvent {
    /// The self-test key combination was pressed; play the alert directly.
    SelfTestRequested,
    /// First key or pointer input since start; initialise audio silently.
    UnlockGesture,
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// Ctrl+C received; the daemon should exit.
    Shutdown,
}
