use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber; `format` is `json` or `text`.
pub fn init_tracing(format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,actix_server=warn"));

    let result = if format.eq_ignore_ascii_case("json") {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_current_span(false)
            .try_init()
    } else {
        fmt().with_env_filter(env_filter).with_target(false).try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {e}");
    }
}
