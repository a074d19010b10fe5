//! Logging facade for host frontends.
//!
//! The engine stays silent on the edge path; foreground entry points emit
//! through [`emit`], which is a no-op until a host installs a sink. The
//! `log-sink` feature supplies a ready-made bridge into the `log` crate.

use std::fmt;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Trace,
    Info,
    Warn,
}

/// Destination for engine diagnostics.
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, level: Level, target: &'static str, args: fmt::Arguments);
}

static SINK: OnceLock<Box<dyn LogSink>> = OnceLock::new();

/// Install the process-wide sink. Returns the sink back if one is already
/// installed.
pub fn install_sink(sink: Box<dyn LogSink>) -> Result<(), Box<dyn LogSink>> {
    SINK.set(sink)
}

/// Hand one record to the installed sink, if any.
pub(crate) fn emit(level: Level, target: &'static str, args: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        sink.log(level, target, args);
    }
}

/// Sink that forwards engine diagnostics to the `log` crate.
#[cfg(feature = "log-sink")]
pub struct LogCrateSink;

#[cfg(feature = "log-sink")]
impl LogSink for LogCrateSink {
    fn log(&self, level: Level, target: &'static str, args: fmt::Arguments) {
        let level = match level {
            Level::Trace => log::Level::Trace,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
        };
        log::log!(target: target, level, "{args}");
    }
}

/// Route engine diagnostics into the `log` crate. Returns false if another
/// sink was installed first.
#[cfg(feature = "log-sink")]
pub fn install_log_crate_sink() -> bool {
    install_sink(Box::new(LogCrateSink)).is_ok()
}
