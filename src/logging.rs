//! Subscriber setup for binaries embedding the bus.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Environment variable consulted when no explicit filter is given.
pub const LOG_ENV: &str = "COLOMBO_LOG";

/// Pick the filter: explicit value first, then `COLOMBO_LOG`, then config.
pub fn resolve_filter(explicit: Option<&str>, config: &LoggingConfig) -> String {
    if let Some(filter) = explicit {
        return filter.to_string();
    }
    match std::env::var(LOG_ENV) {
        Ok(filter) if !filter.trim().is_empty() => filter,
        _ => config.filter.clone(),
    }
}

/// Install a stderr `fmt` subscriber with the given filter directives.
pub fn init(filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(filter)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to install tracing subscriber: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_wins() {
        let config = LoggingConfig {
            filter: "warn".to_string(),
        };
        assert_eq!(resolve_filter(Some("colombo=trace"), &config), "colombo=trace");
    }
}
