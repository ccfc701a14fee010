//! Logger setup for hosts that run converge programs

/// Map a `-v` count to a level filter
pub fn level_for(verbosity: u8, quiet: bool) -> log::LevelFilter {
    if quiet {
        return log::LevelFilter::Error;
    }
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Initialize `env_logger`
///
/// `RUST_LOG` directives are applied on top of the verbosity level. Calling
/// this more than once is harmless; only the first call installs a logger.
pub fn init(verbosity: u8, quiet: bool) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level_for(verbosity, quiet))
        .format_timestamp(None)
        .format_target(false);
    if let Ok(directives) = std::env::var("RUST_LOG") {
        builder.parse_filters(&directives);
    }
    if builder.try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}
