//! Logging and output control
//!
//! This module provides the [`Logger`] used by every registry component. It keeps a small
//! message-oriented API (`info`, `detail`, `warning`, ...) and emits each message as a
//! `tracing` event tagged with the component that produced it. Installing a subscriber is left
//! to the application; [`init`] is a convenience for binaries and tests.

use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber. `RUST_LOG` takes precedence over `verbose`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(verbose: bool) -> bool {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init()
        .is_ok()
}

/// Component-scoped logger
#[derive(Debug, Clone)]
pub struct Logger {
    pub component: &'static str,
    pub verbose: bool,
}

impl Logger {
    pub fn new(component: &'static str, verbose: bool) -> Self {
        Self { component, verbose }
    }

    /// Derive a logger for another component with the same verbosity
    pub fn for_component(&self, component: &'static str) -> Self {
        Self {
            component,
            verbose: self.verbose,
        }
    }

    pub fn trace(&self, message: &str) {
        tracing::trace!(component = self.component, "{}", message);
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(component = self.component, "{}", message);
    }

    /// Promoted to info when the logger is verbose
    pub fn verbose(&self, message: &str) {
        if self.verbose {
            tracing::info!(component = self.component, "{}", message);
        } else {
            tracing::debug!(component = self.component, "{}", message);
        }
    }

    /// Detailed information
    pub fn detail(&self, message: &str) {
        tracing::debug!(component = self.component, "{}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(component = self.component, "{}", message);
    }

    pub fn success(&self, message: &str) {
        tracing::info!(component = self.component, outcome = "success", "{}", message);
    }

    pub fn warning(&self, message: &str) {
        tracing::warn!(component = self.component, "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(component = self.component, "{}", message);
    }

    /// Format file size in human-readable units
    pub fn format_size(&self, bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }

    /// Format duration in human-readable format
    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("registry", false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        let logger = Logger::default();
        assert_eq!(logger.format_size(512), "512 B");
        assert_eq!(logger.format_size(1536), "1.5 KB");
        assert_eq!(logger.format_size(52_428_800), "50.0 MB");
    }

    #[test]
    fn test_format_duration() {
        let logger = Logger::default();
        assert_eq!(logger.format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(logger.format_duration(Duration::from_secs(125)), "2m5s");
        assert_eq!(logger.format_duration(Duration::from_secs(3725)), "1h2m5s");
    }

    #[test]
    fn test_for_component_keeps_verbosity() {
        let logger = Logger::new("dispatcher", true).for_component("auth");
        assert_eq!(logger.component, "auth");
        assert!(logger.verbose);
    }
}
