//! Logger initialization for the server

use std::{io::IsTerminal, str::FromStr, sync::Once};

use jiff::Timestamp;
use logforth::{append::Stderr, filter::EnvFilter, layout::Layout};

static INIT: Once = Once::new();

/// Stderr layout: RFC 3339 UTC instant, right-padded level, message.
#[derive(Debug)]
struct StderrLayout {
    color: bool,
}

impl StderrLayout {
    fn level_style(&self, level: log::Level) -> (&'static str, &'static str) {
        if !self.color {
            return ("", "");
        }

        let code = match level {
            log::Level::Error => "\x1b[31m",
            log::Level::Warn => "\x1b[33m",
            log::Level::Info => "\x1b[32m",
            log::Level::Debug => "\x1b[34m",
            log::Level::Trace => "\x1b[35m",
        };

        (code, "\x1b[0m")
    }
}

impl Layout for StderrLayout {
    fn format(
        &self,
        record: &log::Record<'_>,
        _diagnostics: &[Box<dyn logforth::diagnostic::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let (color, reset) = self.level_style(record.level());

        let line = format!(
            "{timestamp} {color}{level:>5}{reset}  {message}",
            timestamp = Timestamp::now(),
            level = record.level(),
            message = record.args(),
        );

        Ok(line.into_bytes())
    }
}

/// Initialize the logger.
/// The log_filter should be a string like "info" or "gateway=debug,server=debug"
pub fn init(log_filter: &str) {
    let log_filter = log_filter.to_owned();

    INIT.call_once(move || {
        logforth::builder()
            .dispatch(move |dispatch| {
                let filter = EnvFilter::from_str(&log_filter)
                    .unwrap_or_else(|_| EnvFilter::from_str("info").expect("default filter should be valid"));

                let layout = StderrLayout {
                    color: std::io::stderr().is_terminal(),
                };

                dispatch.filter(filter).append(Stderr::default().with_layout(layout))
            })
            .apply();
    });
}
