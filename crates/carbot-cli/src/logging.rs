//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use carbot_core::config::LoggingConfig;

/// Filter directives: `RUST_LOG` wins, else the configured level (or
/// `debug` with `--verbose`) plus per-crate filters.
pub fn build_filter(logging: &LoggingConfig, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };

    let mut filter = EnvFilter::new(level);
    for directive in &logging.filters {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring invalid log filter '{directive}': {e}"),
        }
    }
    filter
}

pub fn init(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let writer = match logging.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(build_filter(logging, verbose))
        .with_writer(writer);

    let result = match logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}
