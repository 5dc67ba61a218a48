use time::macros::format_description;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::settings::{LogFormat, LogSettings};

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(settings: &LogSettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))?;
    let timer = UtcTime::new(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    ));

    let registry = tracing_subscriber::registry().with(filter);
    match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_timer(timer).with_current_span(false))
            .try_init()?,
        LogFormat::Pretty => registry
            .with(fmt::layer().with_timer(timer).with_target(true))
            .try_init()?,
    }
    Ok(())
}
