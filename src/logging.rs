//! Tracing subscriber setup with a runtime debug toggle

use std::sync::OnceLock;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

const CRATE_TARGET: &str = "c64u_receiver";

struct FilterControl {
    base: String,
    handle: reload::Handle<EnvFilter, Registry>,
}

static FILTER: OnceLock<FilterControl> = OnceLock::new();

/// Install the global subscriber
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. Calling this
/// more than once, or after another subscriber was installed, is a no-op.
pub fn init() {
    let base = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let (filter, handle) = reload::Layer::new(EnvFilter::new(&base));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .is_ok();

    if installed {
        let _ = FILTER.set(FilterControl { base, handle });
    }
}

/// Switch this crate's logging to `debug`, or back to the startup filter
///
/// Without a subscriber from [`init`] this does nothing.
pub fn set_debug(enabled: bool) {
    let Some(control) = FILTER.get() else {
        return;
    };

    let directives = filter_directives(&control.base, enabled);
    if let Err(e) = control.handle.reload(EnvFilter::new(&directives)) {
        tracing::warn!("Failed to update log filter: {}", e);
        return;
    }
    tracing::debug!("Log filter set to {:?}", directives);
}

fn filter_directives(base: &str, debug: bool) -> String {
    if debug {
        format!("{},{}=debug", base, CRATE_TARGET)
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        assert_eq!(filter_directives("info", false), "info");
        assert_eq!(filter_directives("warn", true), "warn,c64u_receiver=debug");
    }

    #[test]
    fn test_set_debug_without_subscriber_is_noop() {
        set_debug(true);
        set_debug(false);
    }
}
