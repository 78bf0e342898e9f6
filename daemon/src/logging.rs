/// Diagnostic logging to stderr.
///
/// Quiet by default (warnings only).  The `debug` config flag raises the
/// crate's own level to `debug`; `RUST_LOG`, when set, always wins.
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

const QUIET_FILTER: &str = "warn";
const DEBUG_FILTER: &str = "warn,fail_ding=debug";

/// Lets a config reload switch the debug flag at runtime.
pub struct LogHandle {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogHandle {
    pub fn set_debug(&self, debug: bool) {
        let Some(handle) = &self.handle else {
            return;
        };
        if let Err(e) = handle.modify(|filter| *filter = filter_for(debug)) {
            tracing::warn!(error = %e, "failed to update log filter");
        }
    }
}

/// Installs the global subscriber.  A second call (or an already-installed
/// subscriber) leaves the existing one in place.
pub fn init(debug: bool) -> LogHandle {
    let (filter, handle) = reload::Layer::new(filter_for(debug));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .is_ok();

    LogHandle { handle: installed.then_some(handle) }
}

fn filter_for(debug: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(if debug { DEBUG_FILTER } else { QUIET_FILTER })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_strings_parse() {
        assert!(EnvFilter::try_new(QUIET_FILTER).is_ok());
        assert!(EnvFilter::try_new(DEBUG_FILTER).is_ok());
    }

    #[test]
    fn init_twice_does_not_panic() {
        let first = init(false);
        let second = init(true);
        first.set_debug(true);
        second.set_debug(false);
    }
}
