use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Pretty,
    /// One JSON object per line, with the current span attached.
    Json,
}

impl Format {
    fn label(self) -> &'static str {
        match self {
            Format::Pretty => "pretty",
            Format::Json => "json",
        }
    }
}

/// `RUST_LOG` if set, else `default_level`, else `info` when `default_level`
/// does not parse as a filter directive.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global `tracing` subscriber for `service_name`.
///
/// Returns `false` when a subscriber was already installed (another test, or
/// an earlier call); that case is a silent no-op.
pub fn init(service_name: &str, default_level: &str, format: Format) -> bool {
    let builder = fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match format {
        Format::Pretty => builder.with_thread_ids(false).try_init().is_ok(),
        Format::Json => builder.json().with_current_span(true).try_init().is_ok(),
    };
    if installed {
        tracing::info!(service = service_name, format = format.label(), "logging initialised");
    }
    installed
}

/// Human-readable output. See [`init`].
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, Format::Pretty);
}

/// JSON output. See [`init`].
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, Format::Json);
}
