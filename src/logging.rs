//! # Logging module
//!
//! Structured log output for the integration runtime. The verbosity comes
//! from repeated `-v` flags on the command line; the subscriber is installed
//! once at startup and stays for the lifetime of the process.

use tracing::Level;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("a global tracing subscriber is already installed, {0}")]
    AlreadyInstalled(tracing::subscriber::SetGlobalDefaultError),
}

// -----------------------------------------------------------------------------
// helpers

/// maps `-v` occurrences to a log level. A quiet run stays at INFO so the
/// resync summaries remain visible
pub const fn level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

pub fn initialize(verbosity: u8) -> Result<(), Error> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level(verbosity))
        .with_target(true)
        .with_thread_names(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(Error::AlreadyInstalled)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::level;

    #[test]
    fn verbosity_should_saturate_at_trace() {
        assert_eq!(level(0), Level::INFO);
        assert_eq!(level(1), Level::DEBUG);
        assert_eq!(level(2), Level::TRACE);
        assert_eq!(level(9), Level::TRACE);
    }
}
