use std::str::FromStr;

use anyhow::Context as _;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// The daemon's historical level names, from most to least verbose:
/// debug, trace, access, info, error, fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Trace,
    Access,
    Info,
    Error,
    Fatal,
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            "access" => Ok(Self::Access),
            "info" => Ok(Self::Info),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            other => anyhow::bail!("incorrect loglevel flag '{other}', use debug, trace, access, info, error or fatal"),
        }
    }
}

impl LogLevel {
    /// Note the inversion: the daemon's `debug` outranks its `trace` in
    /// verbosity, while tracing's `TRACE` outranks `DEBUG`.
    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::TRACE,
            LogLevel::Trace => LevelFilter::DEBUG,
            LogLevel::Access | LogLevel::Info => LevelFilter::INFO,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
        }
    }
}

/// Install the global subscriber. The `--loglevel` default can be
/// overridden per target with the `WEBSOCKETD_LOG` environment variable,
/// e.g. `WEBSOCKETD_LOG=access=info,websocketd=debug`.
pub fn init(level: LogLevel) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.filter().into())
        .with_env_var("WEBSOCKETD_LOG")
        .from_env()
        .context("invalid filtering directive from env")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    std::panic::set_hook(Box::new(move |panic_info| {
        error!(%panic_info);
    }));

    Ok(())
}
