//! Logger installation

use crate::config::LogConfig;
use env_logger::{Builder, Env};

/// Install the process logger.
///
/// `RUST_LOG` wins over the configured level. Returns `false` when a logger
/// was already installed.
pub fn init(config: &LogConfig) -> bool {
    Builder::from_env(Env::default().default_filter_or(config.level.as_str()))
        .format_timestamp_millis()
        .format_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        let config = LogConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }
}
