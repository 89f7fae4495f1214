// Console and optional file logging on top of `tracing-subscriber`.

use crate::args::RunArgs;
use anyhow::{Context, Result, bail};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub console: LevelFilter,
    /// `--log [LEVEL] PATH`
    pub file: Option<(LevelFilter, PathBuf)>,
}

pub fn parse_level(name: &str) -> Result<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "fatal" => Ok(LevelFilter::ERROR),
        "warning" => Ok(LevelFilter::WARN),
        other => other
            .parse()
            .with_context(|| format!("Invalid log level: {name}")),
    }
}

impl LogSettings {
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        let file = match args.log.as_slice() {
            [] => None,
            [path] => Some((LevelFilter::DEBUG, PathBuf::from(path))),
            [level, path] => Some((parse_level(level)?, PathBuf::from(path))),
            _ => bail!("Argument --log takes [LEVEL] PATH"),
        };
        let console = if args.trace {
            LevelFilter::TRACE
        } else if args.debug {
            LevelFilter::DEBUG
        } else if args.quiet {
            if file.is_some() { LevelFilter::ERROR } else { LevelFilter::WARN }
        } else {
            LevelFilter::INFO
        };
        Ok(Self { console, file })
    }
}

pub fn init(settings: &LogSettings) -> Result<()> {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(settings.console);

    let file = match &settings.file {
        Some((level, path)) => {
            let file = File::create(path)
                .with_context(|| format!("Error opening log file {} for writing", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(*level),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install the log subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_level_follows_flags() {
        let settings = LogSettings::from_args(&RunArgs::default()).unwrap();
        assert_eq!(settings.console, LevelFilter::INFO);
        assert_eq!(settings.file, None);

        let args = RunArgs {
            quiet: true,
            debug: true,
            ..RunArgs::default()
        };
        assert_eq!(LogSettings::from_args(&args).unwrap().console, LevelFilter::DEBUG);

        let args = RunArgs {
            trace: true,
            debug: true,
            ..RunArgs::default()
        };
        assert_eq!(LogSettings::from_args(&args).unwrap().console, LevelFilter::TRACE);
    }

    #[test]
    fn quiet_keeps_warnings_without_a_log_file() {
        let args = RunArgs {
            quiet: true,
            ..RunArgs::default()
        };
        assert_eq!(LogSettings::from_args(&args).unwrap().console, LevelFilter::WARN);

        let args = RunArgs {
            quiet: true,
            log: vec!["run.log".to_string()],
            ..RunArgs::default()
        };
        let settings = LogSettings::from_args(&args).unwrap();
        assert_eq!(settings.console, LevelFilter::ERROR);
        assert_eq!(settings.file, Some((LevelFilter::DEBUG, PathBuf::from("run.log"))));
    }

    #[test]
    fn log_level_is_parsed() {
        let args = RunArgs {
            log: vec!["warning".to_string(), "run.log".to_string()],
            ..RunArgs::default()
        };
        let settings = LogSettings::from_args(&args).unwrap();
        assert_eq!(settings.file, Some((LevelFilter::WARN, PathBuf::from("run.log"))));
        assert_eq!(parse_level("Fatal").unwrap(), LevelFilter::ERROR);
        assert!(parse_level("loud").is_err());
    }
}
