#![allow(clippy::module_name_repetitions)]
//! Color mode configuration, ANSI painting and the stderr logging sink.
//!
//! Logging helpers policy (stderr one-liners):
//! - Use log_info_stderr for info, log_warn_stderr for warnings/notes,
//!   and log_error_stderr for errors/refusals.
//! - Library code logs through `log(level, msg)`; it never fails and never panics.
//! - Debug lines are printed only with CLIENTFORGE_VERBOSE=1 (or --verbose).
//! - With the `otel` feature every line is also emitted as a tracing event.

use clap::ValueEnum;
use once_cell::sync::OnceCell;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

static COLOR_MODE: OnceCell<ColorMode> = OnceCell::new();

pub fn set_color_mode(mode: ColorMode) {
    let _ = COLOR_MODE.set(mode);
}

fn parse_color_mode(s: &str) -> Option<ColorMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(ColorMode::Auto),
        "always" | "on" | "true" | "yes" => Some(ColorMode::Always),
        "never" | "off" | "false" | "no" => Some(ColorMode::Never),
        _ => None,
    }
}

fn env_color_mode_pref() -> Option<ColorMode> {
    std::env::var("CLIENTFORGE_COLOR")
        .ok()
        .and_then(|v| parse_color_mode(&v))
}

fn no_color_env() -> bool {
    // Per https://no-color.org/
    std::env::var("NO_COLOR").is_ok()
}

fn color_enabled_for(is_tty: bool) -> bool {
    // 1) NO_COLOR disables color unconditionally
    if no_color_env() {
        return false;
    }
    // 2) Programmatic override via set_color_mode (CLI flags)
    if let Some(mode) = COLOR_MODE.get().copied() {
        return match mode {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => is_tty,
        };
    }
    // 3) Environment preference when CLI didn't override
    if let Some(env_mode) = env_color_mode_pref() {
        return match env_mode {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => is_tty,
        };
    }
    is_tty
}

pub fn color_enabled_stdout() -> bool {
    color_enabled_for(atty::is(atty::Stream::Stdout))
}

pub fn color_enabled_stderr() -> bool {
    color_enabled_for(atty::is(atty::Stream::Stderr))
}

/// Wrap string with ANSI color code when enabled; otherwise return unchanged.
pub fn paint(enabled: bool, code: &str, s: &str) -> String {
    if enabled {
        format!("{code}{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

pub fn log_info_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[36;1m", msg));
}

pub fn log_warn_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[33m", msg));
}

pub fn log_error_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[31;1m", msg));
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// True when debug lines should be printed.
pub fn verbose_enabled() -> bool {
    std::env::var("CLIENTFORGE_VERBOSE").ok().as_deref() == Some("1")
}

/// False when an active tracing subscriber already writes every line to stderr.
pub(crate) fn direct_print_enabled() -> bool {
    #[cfg(feature = "otel")]
    {
        !crate::telemetry::tracing_active()
    }
    #[cfg(not(feature = "otel"))]
    {
        true
    }
}

/// Diagnostics sink used across the crate. Prefixes every line with `clientforge:`.
pub fn log(level: LogLevel, msg: &str) {
    #[cfg(feature = "otel")]
    match level {
        LogLevel::Debug => tracing::debug!("{}", msg),
        LogLevel::Info => tracing::info!("{}", msg),
        LogLevel::Warn => tracing::warn!("{}", msg),
        LogLevel::Error => tracing::error!("{}", msg),
    }
    if !direct_print_enabled() {
        return;
    }

    let line = format!("clientforge: {msg}");
    let use_err = color_enabled_stderr();
    match level {
        LogLevel::Debug => {
            if verbose_enabled() {
                eprintln!("{line}");
            }
        }
        LogLevel::Info => log_info_stderr(use_err, &line),
        LogLevel::Warn => log_warn_stderr(use_err, &line),
        LogLevel::Error => log_error_stderr(use_err, &line),
    }
}
