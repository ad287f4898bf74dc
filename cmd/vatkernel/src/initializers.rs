//! Minimized from the teacher's `cmd/ethrex/initializers.rs::init_tracing`:
//! same `EnvFilter` + `fmt` layer shape, without the file-logging/profiling
//! layers the teacher carries, since this binary has no vergen/tracing-
//! appender dependency to back them.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Options;

pub fn init_tracing(opts: &Options) {
    let filter = EnvFilter::builder()
        .with_default_directive(opts.log_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(matches!(opts.log_level, tracing::Level::DEBUG | tracing::Level::TRACE)))
        .with(filter)
        .init();
}
