//! Tracing setup for the `foreman` binary and for embedders that want the
//! same log shape.
//!
//! Logs always go to stderr, leaving stdout to the result envelope printed by
//! `foreman run`. In JSON mode each lifecycle event from [`crate::obs`] is one
//! record whose `event` field names the transition, and the enclosing
//! `foreman.run` span contributes `task_id` and `skill_id`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Install the global subscriber. Only the first call in a process has any
/// effect.
///
/// `RUST_LOG` takes precedence. Without it, foreman crates log at `level` and
/// everything else at `warn`.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let layer = if json {
        layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    } else {
        layer.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .ok();
}

fn default_filter(level: Level) -> EnvFilter {
    let level = level.as_str().to_ascii_lowercase();
    EnvFilter::new(format!("warn,foreman_core={level},foreman={level}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::Registry;

    #[test]
    fn test_default_filter_scopes_level_to_foreman_crates() {
        let filter = default_filter(Level::DEBUG);
        assert_eq!(
            Layer::<Registry>::max_level_hint(&filter),
            Some(LevelFilter::DEBUG)
        );
        let filter = default_filter(Level::ERROR);
        assert_eq!(Layer::<Registry>::max_level_hint(&filter), Some(LevelFilter::WARN));
    }
}
