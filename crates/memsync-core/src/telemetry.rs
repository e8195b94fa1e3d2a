//! Log output for the `memsync` binary.
//!
//! Lines go to stderr, as text or JSON; stdout carries only the command
//! summaries. `RUST_LOG` replaces the level picked on the command line.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// memsync targets at `level`, dependencies at `warn`.
fn default_filter(level: Level) -> EnvFilter {
    let level = level.as_str().to_ascii_lowercase();
    EnvFilter::new(format!("warn,memsync_core={level},memsync={level}"))
}

/// Install the global subscriber. Only the first call in a process has an
/// effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let text = (!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));
    let lines = json.then(|| {
        fmt::layer()
            .with_target(false)
            .json()
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(lines)
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_scopes_level_to_memsync() {
        let directives = default_filter(Level::DEBUG).to_string();
        assert!(directives.contains("memsync_core=debug"), "{directives}");
        assert!(directives.contains("memsync=debug"), "{directives}");
        assert!(directives.contains("warn"), "{directives}");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
        tracing::info!("still logging");
    }
}
