//! Diagnostic logging for the `vessel` binary.
//!
//! Logs go to stderr so command output on stdout stays clean. `RUST_LOG`
//! overrides the default filter.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter used without `--verbose`.
pub const DEFAULT_FILTER: &str = "warn";

/// Filter used with `--verbose`.
pub const VERBOSE_FILTER: &str = "warn,vessel=debug";

/// Returns the filter directive for the requested verbosity.
#[must_use]
pub const fn default_directive(verbose: bool) -> &'static str {
    if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER }
}

/// Installs the global subscriber. Calling it twice keeps the first one.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false, "warn")]
    #[case(true, "warn,vessel=debug")]
    fn directive_follows_verbosity(#[case] verbose: bool, #[case] expected: &str) {
        assert_eq!(default_directive(verbose), expected);
        assert!(EnvFilter::try_new(expected).is_ok());
    }

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_tracing(false);
        init_tracing(true);
    }
}
