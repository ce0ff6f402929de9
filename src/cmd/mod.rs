//! # Command module
//!
//! This module provides the command line surface integration binaries embed:
//! argument parsing, configuration loading and the hand-off to the runtime.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;

use crate::{
    logging,
    svc::{
        cfg::{self, Configuration, EventListenerKind},
        runtime::{self, Runtime},
    },
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Configuration(cfg::Error),
    #[error("failed to initialize logging system, {0}")]
    Logging(logging::Error),
    #[error("failed to run integration runtime, {0}")]
    Runtime(runtime::Error),
}

impl From<cfg::Error> for Error {
    fn from(err: cfg::Error) -> Self {
        Self::Configuration(err)
    }
}

impl From<logging::Error> for Error {
    fn from(err: logging::Error) -> Self {
        Self::Logging(err)
    }
}

impl From<runtime::Error> for Error {
    fn from(err: runtime::Error) -> Self {
        Self::Runtime(err)
    }
}

// -----------------------------------------------------------------------------
// Command enumeration

#[derive(clap::Subcommand, PartialEq, Eq, Clone, Copy, Debug)]
pub enum Command {
    /// Run a single resync and exit
    #[command(name = "resync")]
    Resync,
}

// -----------------------------------------------------------------------------
// Args structure

#[derive(Parser, Clone, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version)]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// run

/// loads the configuration, initializes logging and hands control to the
/// runtime built by `setup`. This is the entry point integration binaries
/// call from their `main`
pub async fn run<F>(args: Args, setup: F) -> Result<(), Error>
where
    F: FnOnce(Arc<Configuration>) -> Result<Runtime, runtime::Error>,
{
    let mut config = match &args.config {
        Some(path) => Configuration::try_from(path.to_owned())?,
        None => Configuration::try_default()?,
    };

    logging::initialize(args.verbosity)?;
    config.help();

    if args.check {
        println!("{} configuration is healthy!", env!("CARGO_PKG_NAME"));
        return Ok(());
    }

    // the one-shot subcommand overrides the configured listener mode
    if args.command == Some(Command::Resync) {
        config.event_listener.kind = EventListenerKind::Once;
    }

    let runtime = setup(Arc::new(config))?;

    runtime.run().await.map_err(Error::Runtime)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::{run, Args, Command};
    use crate::svc::runtime::Runtime;

    #[test]
    fn args_should_parse_flags_and_subcommand() {
        let args = Args::parse_from(["ocean", "-v", "-v", "-c", "/etc/ocean/config", "resync"]);

        assert_eq!(args.verbosity, 2);
        assert_eq!(
            args.config.as_deref(),
            Some(std::path::Path::new("/etc/ocean/config"))
        );
        assert_eq!(args.command, Some(Command::Resync));
        assert!(!args.check);
    }

    #[tokio::test]
    async fn check_should_validate_the_configuration_and_exit() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("temporary file to be created");

        file.write_all(
            br#"
port:
  client_id: "id"
  client_secret: "secret"
integration:
  identifier: "jira-prod"
  type: "jira"
"#,
        )
        .expect("configuration to be written");

        let args = Args::parse_from([
            "ocean",
            "--check",
            "-c",
            file.path().to_str().expect("path to be valid utf-8"),
        ]);

        let result = run(args, |config| Runtime::builder(config).build()).await;

        assert!(result.is_ok());
    }
}
