//! Tracing setup shared by both binaries.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "turnstream=debug,actix_web=info";

/// Install the global subscriber.
///
/// ## Environment Variables:
/// - `RUST_LOG`: overrides the filter, e.g. `turnstream=info`
/// - If not set, defaults to [`DEFAULT_FILTER`]
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
