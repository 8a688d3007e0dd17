//! Process-wide tracing setup.
//!
//! `VOICELINK_LOG_FILTER` replaces the computed filter wholesale. At debug
//! and trace the media and socket crates stay at warn unless
//! `VOICELINK_TRACE_DEPS` is set.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, ParseError};

const FILTER_VAR: &str = "VOICELINK_LOG_FILTER";
const TRACE_DEPS_VAR: &str = "VOICELINK_TRACE_DEPS";

/// Targets that follow the chosen verbosity.
const AGENT_TARGETS: &[&str] = &["voicelink", "voicelink_core", "signal_proto"];

const CHATTY_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "tokio_tungstenite",
    "tungstenite",
    "mio",
];

const PREVIEW_BYTES: usize = 24;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    fn is_verbose(self) -> bool {
        matches!(self, LogLevel::Debug | LogLevel::Trace)
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("cannot open log file {}: {source}", path.display())]
    OpenFile { path: PathBuf, source: io::Error },
    #[error("bad log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

// Holding the guard keeps the background writer flushing until exit.
static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Once it succeeds, later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if WRITER_GUARD.get().is_some() {
        return Ok(());
    }

    let custom = std::env::var(FILTER_VAR).ok();
    let dependency_traces = super::env_truthy(TRACE_DEPS_VAR).unwrap_or(false);
    let throttled = custom.is_none() && config.level.is_verbose() && !dependency_traces;
    let filter = match custom {
        Some(custom) => EnvFilter::try_new(custom)?,
        None => EnvFilter::try_new(directives(config.level, dependency_traces).join(","))?,
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::OpenFile {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level.is_verbose())
        .with_thread_names(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|_| InitError::AlreadyInstalled)?;
    let _ = WRITER_GUARD.set(guard);

    if throttled {
        tracing::debug!(
            "webrtc and websocket crates held at warn; set {TRACE_DEPS_VAR}=1 or {FILTER_VAR} to see them"
        );
    }
    Ok(())
}

fn directives(level: LogLevel, dependency_traces: bool) -> Vec<String> {
    if !level.is_verbose() {
        return vec![level.directive().to_string()];
    }
    let mut directives = vec![LogLevel::Info.directive().to_string()];
    directives.extend(
        AGENT_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.directive())),
    );
    if !dependency_traces {
        directives.extend(CHATTY_TARGETS.iter().map(|target| format!("{target}=warn")));
    }
    directives
}

/// Space-separated hex of the first bytes of an opaque frame.
pub fn frame_preview(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(PREVIEW_BYTES)];
    let mut out = String::with_capacity(shown.len() * 3 + 16);
    for (i, byte) in shown.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    if bytes.len() > PREVIEW_BYTES {
        let _ = write!(out, " .. (+{} bytes)", bytes.len() - PREVIEW_BYTES);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::deadline]
    fn verbose_levels_hold_dependencies_at_warn() {
        let directives = directives(LogLevel::Debug, false);
        assert_eq!(directives[0], "info");
        assert!(directives.contains(&"voicelink_core=debug".to_string()));
        assert!(directives.contains(&"signal_proto=debug".to_string()));
        assert!(directives.contains(&"webrtc_ice=warn".to_string()));
        assert!(directives.contains(&"tungstenite=warn".to_string()));
        assert!(EnvFilter::try_new(directives.join(",")).is_ok());
    }

    #[test_deadline::deadline]
    fn dependency_traces_lift_the_hold() {
        let directives = directives(LogLevel::Trace, true);
        assert!(directives.contains(&"voicelink=trace".to_string()));
        assert!(!directives.iter().any(|d| d.starts_with("webrtc")));
    }

    #[test_deadline::deadline]
    fn quiet_levels_are_a_single_directive() {
        assert_eq!(directives(LogLevel::Warn, false), vec!["warn".to_string()]);
        assert_eq!(directives(LogLevel::default(), false), vec!["info".to_string()]);
    }

    #[test_deadline::deadline]
    fn preview_caps_long_frames() {
        assert_eq!(frame_preview(&[0xde, 0xad, 0xbe, 0xef]), "de ad be ef");
        assert_eq!(frame_preview(&[]), "");

        let long = frame_preview(&[0u8; 30]);
        assert!(long.starts_with("00 00 00"));
        assert!(long.ends_with(" .. (+6 bytes)"), "{long}");
        assert_eq!(long.matches("00").count(), PREVIEW_BYTES);
    }
}
