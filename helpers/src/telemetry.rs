use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::{self, format},
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Sets up tracing for a bus service binary.
///
/// Output defaults to a human-readable format; set `json_output` for the
/// JSON event format used in deployed environments. `RUST_LOG` overrides the
/// default `info` level.
pub fn setup_tracing(json_output: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if json_output {
        let fmt_layer = fmt::layer()
            .event_format(format().json().with_span_list(true))
            // Since we're using the JSON event formatter, we must also
            // use the JSON field formatter.
            .fmt_fields(format::JsonFields::default())
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    } else {
        let fmt_layer = fmt::layer().with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    }
}
