//! Tracing subscriber setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TelemetryConfig;
use crate::error::{ListenerError, ListenerResult};

/// Install the global subscriber. Call once, before any logging.
pub fn init_tracing(config: &TelemetryConfig) -> ListenerResult<()> {
    let filter = EnvFilter::try_new(&config.filter).map_err(|e| {
        ListenerError::Telemetry(format!("invalid filter {:?}: {}", config.filter, e))
    })?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.map_err(|e| ListenerError::Telemetry(e.to_string()))?;

    tracing::debug!(filter = %config.filter, json = config.json, "Logging initialised");
    Ok(())
}
