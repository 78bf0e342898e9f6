/// Canonical file paths for fail-ding.
///
/// The only file is the user-edited `config.toml` under the platform config
/// directory (`~/.config/fail-ding/` on Linux, `%APPDATA%\fail-ding\` on
/// Windows).  Nothing is written by the daemon.
use std::path::PathBuf;

const APP_DIR_NAME: &str = "fail-ding";
pub const CONFIG_FILE_NAME: &str = "config.toml";
/// Overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "FAIL_DING_CONFIG";

/// Returns the fail-ding config directory, falling back to the working
/// directory when the platform has none.
pub fn app_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Returns the config file path: `$FAIL_DING_CONFIG` if set, otherwise
/// `<config dir>/fail-ding/config.toml`.
pub fn config_file_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => app_config_dir().join(CONFIG_FILE_NAME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_config_dir_ends_with_app_name() {
        let dir = app_config_dir();
        assert_eq!(dir.file_name().unwrap(), APP_DIR_NAME);
    }

    #[test]
    fn config_file_path_has_correct_name() {
        if std::env::var_os(CONFIG_ENV_VAR).is_some() {
            return;
        }
        let path = config_file_path();
        assert_eq!(path.file_name().unwrap(), CONFIG_FILE_NAME);
        assert_eq!(path.parent(), Some(app_config_dir().as_path()));
    }
}
