//! Structured logging utilities for gitveil components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use veil_config::logging::*;
//!
//! log_runner_info!("Draining started", backlog = 12);
//! log_virt_debug!("Placeholder deferred", command = "checkout");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const RUNNER: &'static str = "RUNNER";
    pub const VIRT: &'static str = "VIRT";
    pub const JOURNAL: &'static str = "JOURNAL";
    pub const LEDGER: &'static str = "LEDGER";
    pub const HYDRATE: &'static str = "HYDRATE";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// === RUNNER logging macros ===

#[macro_export]
macro_rules! log_runner_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "RUNNER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_runner_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "RUNNER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_runner_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "RUNNER", $($key = $value,)* $msg)
    };
}

// === VIRT logging macros ===

#[macro_export]
macro_rules! log_virt_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "VIRT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_virt_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "VIRT", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_virt_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "VIRT", $($key = $value,)* $msg)
    };
}

// === HYDRATE logging macros ===

#[macro_export]
macro_rules! log_hydrate_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "HYDRATE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_hydrate_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "HYDRATE", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
