use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber: JSON-formatted logs with file and
/// line locations, filtered by `RUST_LOG` when set and the configured level
/// otherwise. The service crate gets its own debug-level directive so local
/// runs stay readable without drowning in dependency output.
pub fn init_tracing(service_name: &str, log_level: &str) {
    let crate_target = service_name.replace('-', "_");
    let default_directives = format!("{},{}=debug", log_level, crate_target);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directives));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true),
        )
        .init();
}
