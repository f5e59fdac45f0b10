use std::io::IsTerminal;

use eyre::{self, WrapErr};
use tracing::{Subscriber, warn};
use tracing_subscriber::{
    self, Layer,
    filter::{EnvFilter, LevelFilter},
    prelude::*,
    registry::LookupSpan,
};

use crate::console::SerialConsole;

const SYSLOG_IDENTIFIER: &str = "update-ctrl";

fn filter(debug: bool) -> EnvFilter {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Errors only, everything with `debug`.
fn console_layer<S>(
    debug: bool,
    console: Option<SerialConsole>,
) -> Option<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::ERROR
    };
    console.map(|console| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(console)
            .with_filter(level)
    })
}

fn try_init_journal(debug: bool, console: Option<SerialConsole>) -> eyre::Result<()> {
    let journal = tracing_journald::layer()
        .wrap_err("Failed to initialize journald logger")?
        .with_syslog_identifier(SYSLOG_IDENTIFIER.to_owned())
        .with_filter(filter(debug));
    tracing_subscriber::registry()
        .with(journal)
        .with(console_layer(debug, console))
        .try_init()?;
    Ok(())
}

fn try_init_stdout_logger(
    debug: bool,
    console: Option<SerialConsole>,
) -> eyre::Result<()> {
    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stdout)
        .with_filter(filter(debug));
    let stderr_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(
            stderr_log
                .with_filter(LevelFilter::WARN)
                .and_then(stdout_log),
        )
        .with(console_layer(debug, console))
        .try_init()?;

    Ok(())
}

/// Initialize the logger, at debug level if `debug` is set. Errors are copied to
/// `console` when there is one.
pub fn init(debug: bool, console: Option<SerialConsole>) {
    let mut err: Option<eyre::Error> = None;
    let istty = std::io::stdin().is_terminal();
    if !istty {
        err = try_init_journal(debug, console.clone()).err();
    }

    if istty || err.is_some() {
        err = try_init_stdout_logger(debug, console).err();
    }

    if let Some(e) = err {
        warn!("failed to initialize journald logger: {}", e);
    }
}
