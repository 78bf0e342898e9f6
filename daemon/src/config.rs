use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::DEFAULT_VOLUME;
use crate::classifier::Classifier;
use crate::event::DaemonEvent;
use crate::monitor::MonitorSettings;

pub const DEFAULT_ARM_MS: u64 = 20_000;
pub const DEFAULT_COOLDOWN_MS: u64 = 400;
pub const DEFAULT_HOTKEY: &str = "Alt+Shift+B";

/// Root configuration structure.  Deserialized from
/// `<config dir>/fail-ding/config.toml`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// How long one arm keeps the monitor watching, in milliseconds.
    #[serde(default = "default_arm_ms", alias = "armMs")]
    pub arm_ms: u64,
    /// Enables diagnostic logging.
    #[serde(default)]
    pub debug: bool,
    /// Minimum gap between two alerts, in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Key combination that plays the alert for a manual check.
    #[serde(default = "default_hotkey")]
    pub hotkey: String,
    /// Alert volume in [0.0, 1.0].
    #[serde(default = "default_volume")]
    pub volume: f32,
    /// Extra URL patterns treated as generation endpoints.
    #[serde(default)]
    pub extra_allow: Vec<String>,
    /// Extra URL patterns never treated as generation endpoints.
    #[serde(default)]
    pub extra_deny: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arm_ms: DEFAULT_ARM_MS,
            debug: false,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            hotkey: DEFAULT_HOTKEY.to_string(),
            volume: DEFAULT_VOLUME,
            extra_allow: Vec::new(),
            extra_deny: Vec::new(),
        }
    }
}

impl Config {
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            arm_window: Duration::from_millis(self.arm_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    pub fn effective_volume(&self) -> f32 {
        if self.volume.is_nan() {
            return DEFAULT_VOLUME;
        }
        self.volume.clamp(0.0, 1.0)
    }

    /// Built-in patterns plus the configured extras.
    pub fn classifier(&self) -> Result<Classifier> {
        Classifier::with_extra(&self.extra_allow, &self.extra_deny)
            .context("Invalid extra_allow/extra_deny pattern")
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create config watcher");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            tracing::warn!(path = %path.display(), "config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, dir = %watch_dir.display(), "failed to watch config directory");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "failed to reload config"),
            }
        }
    }
}

fn default_arm_ms() -> u64 {
    DEFAULT_ARM_MS
}

fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}

fn default_hotkey() -> String {
    DEFAULT_HOTKEY.to_string()
}

fn default_volume() -> f32 {
    DEFAULT_VOLUME
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn config_default_values() {
        let c = Config::default();
        assert_eq!(c.arm_ms, 20_000);
        assert!(!c.debug);
        assert_eq!(c.cooldown_ms, 400);
        assert_eq!(c.hotkey, "Alt+Shift+B");
        assert_eq!(c.volume, DEFAULT_VOLUME);
        assert!(c.extra_allow.is_empty());
        assert!(c.extra_deny.is_empty());
    }

    #[test]
    fn monitor_settings_convert_milliseconds() {
        let c = Config { arm_ms: 1_500, cooldown_ms: 250, ..Config::default() };
        let s = c.monitor_settings();
        assert_eq!(s.arm_window, Duration::from_millis(1_500));
        assert_eq!(s.cooldown, Duration::from_millis(250));
    }

    // ── effective_volume ──────────────────────────────────────────────────────

    #[test]
    fn effective_volume_clamps() {
        assert_eq!(Config { volume: 2.0, ..Config::default() }.effective_volume(), 1.0);
        assert_eq!(Config { volume: -1.0, ..Config::default() }.effective_volume(), 0.0);
        assert_eq!(Config { volume: 0.3, ..Config::default() }.effective_volume(), 0.3);
    }

    #[test]
    fn effective_volume_nan_falls_back_to_default() {
        assert_eq!(Config { volume: f32::NAN, ..Config::default() }.effective_volume(), DEFAULT_VOLUME);
    }

    // ── classifier ────────────────────────────────────────────────────────────

    #[test]
    fn classifier_includes_extra_patterns() {
        let c = Config { extra_allow: vec!["/v1/messages".into()], ..Config::default() };
        let classifier = c.classifier().unwrap();
        assert!(classifier.is_generation_request("https://host/v1/messages", "POST"));
    }

    #[test]
    fn classifier_rejects_bad_pattern() {
        let c = Config { extra_deny: vec!["[".into()], ..Config::default() };
        assert!(c.classifier().is_err());
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_or_default(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
arm_ms = 5000
debug = true
cooldown_ms = 1000
hotkey = "Ctrl+Alt+F9"
volume = 0.5
extra_allow = ["/v1/messages"]
extra_deny = ["/v1/messages/count_tokens"]
"#,
        )
        .unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.arm_ms, 5000);
        assert!(config.debug);
        assert_eq!(config.cooldown_ms, 1000);
        assert_eq!(config.hotkey, "Ctrl+Alt+F9");
        assert_eq!(config.volume, 0.5);
        assert_eq!(config.extra_allow, vec!["/v1/messages".to_string()]);
        assert_eq!(config.extra_deny, vec!["/v1/messages/count_tokens".to_string()]);
    }

    #[test]
    fn load_or_default_accepts_camel_case_arm_ms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "armMs = 12000\n").unwrap();
        assert_eq!(load_or_default(&path).unwrap().arm_ms, 12_000);
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        // Only override one field; the rest should get their defaults.
        std::fs::write(&path, "debug = true\n").unwrap();

        let config = load_or_default(&path).unwrap();
        assert!(config.debug);
        assert_eq!(config.arm_ms, DEFAULT_ARM_MS);
        assert_eq!(config.cooldown_ms, DEFAULT_COOLDOWN_MS);
        assert_eq!(config.hotkey, DEFAULT_HOTKEY);
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml ][[[").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn load_or_default_wrong_type_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "arm_ms = \"soon\"\n").unwrap();
        assert!(load_or_default(&path).is_err());
    }
}
