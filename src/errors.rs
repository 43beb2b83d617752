//! Severity-tagged error handling for the controller.
//!
//! Every component reports failures through a [`ControllerError`] carrying a
//! kind, a severity, the originating component and an optional cause. The
//! [`ErrorHandler`] counts them over a rolling window and decides whether the
//! process is degraded, and whether a Critical error terminates it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How bad an error is, and what the handler does about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Classification of failures, orthogonal to severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// The referenced object no longer exists; dropped silently by callers
    #[error("not found")]
    NotFound,
    /// Retriable failure (network, IO, busy daemon)
    #[error("transient failure")]
    Transient,
    /// Malformed input; skips the offending item, never a whole batch
    #[error("invalid value")]
    InvalidValue,
    /// Sustained failure pressure; opens the circuit breaker
    #[error("resource exhausted")]
    ResourceExhausted,
    /// Unrecoverable; terminates the process in strict mode
    #[error("fatal")]
    Fatal,
}

/// A structured error with enough context to log and to route.
pub struct ControllerError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub component: &'static str,
    pub message: String,
    pub cause: Option<anyhow::Error>,
    pub timestamp: DateTime<Utc>,
    /// Captured only for Critical errors
    pub backtrace: Option<Backtrace>,
}

impl ControllerError {
    pub fn new(
        kind: ErrorKind,
        severity: Severity,
        component: &'static str,
        message: impl Into<String>,
    ) -> Self {
        let backtrace = if severity == Severity::Critical {
            Some(Backtrace::force_capture())
        } else {
            None
        };
        Self {
            kind,
            severity,
            component,
            message: message.into(),
            cause: None,
            timestamp: Utc::now(),
            backtrace,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Debug for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerError")
            .field("kind", &self.kind)
            .field("severity", &self.severity)
            .field("component", &self.component)
            .field("message", &self.message)
            .field("cause", &self.cause)
            .finish()
    }
}

impl std::error::Error for ControllerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// How long error counts accumulate before resetting.
const COUNTER_WINDOW: Duration = Duration::from_secs(300);

struct Counter {
    errors: u32,
    window_start: Instant,
}

/// Counts errors, detects degraded mode, and applies the Critical policy.
///
/// One handler instance is shared per process in production; tests construct
/// their own so the policy and counters stay isolated.
pub struct ErrorHandler {
    exit_on_critical: bool,
    error_threshold: u32,
    counter: Mutex<Counter>,
}

impl ErrorHandler {
    pub fn new(exit_on_critical: bool) -> Self {
        Self {
            exit_on_critical,
            error_threshold: 10,
            counter: Mutex::new(Counter {
                errors: 0,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Current error count inside the rolling window.
    pub fn error_count(&self) -> u32 {
        let mut counter = self.counter.lock();
        Self::roll(&mut counter);
        counter.errors
    }

    /// Degraded once more than half the threshold has accumulated.
    pub fn is_degraded(&self) -> bool {
        self.error_count() > self.error_threshold / 2
    }

    fn roll(counter: &mut Counter) {
        if counter.window_start.elapsed() > COUNTER_WINDOW {
            counter.errors = 0;
            counter.window_start = Instant::now();
        }
    }

    /// Log and count an error according to its severity.
    pub fn handle(&self, err: &ControllerError) {
        match err.severity {
            Severity::Info => {
                info!(component = err.component, kind = %err.kind, "{}", err);
            }
            Severity::Warning => {
                warn!(component = err.component, kind = %err.kind, "{}", err);
            }
            Severity::Error => {
                error!(component = err.component, kind = %err.kind, "{}", err);
            }
            Severity::Critical => {
                if let Some(backtrace) = &err.backtrace {
                    error!(
                        component = err.component,
                        kind = %err.kind,
                        backtrace = %backtrace,
                        "critical: {}",
                        err
                    );
                } else {
                    error!(component = err.component, kind = %err.kind, "critical: {}", err);
                }
            }
        }

        if err.severity >= Severity::Warning {
            let mut counter = self.counter.lock();
            Self::roll(&mut counter);
            counter.errors += 1;
            if counter.errors > self.error_threshold {
                warn!(
                    count = counter.errors,
                    "high error count, system may be degraded"
                );
            }
        }

        if err.severity == Severity::Critical && self.exit_on_critical {
            error!(component = err.component, "critical error in strict mode, exiting");
            std::process::exit(1);
        }
    }

    pub fn info(&self, component: &'static str, message: impl Into<String>) {
        self.handle(&ControllerError::new(
            ErrorKind::Transient,
            Severity::Info,
            component,
            message,
        ));
    }

    pub fn warning(&self, component: &'static str, message: impl Into<String>, cause: anyhow::Error) {
        self.handle(
            &ControllerError::new(ErrorKind::Transient, Severity::Warning, component, message)
                .with_cause(cause),
        );
    }

    pub fn error(&self, component: &'static str, message: impl Into<String>, cause: anyhow::Error) {
        self.handle(
            &ControllerError::new(ErrorKind::Transient, Severity::Error, component, message)
                .with_cause(cause),
        );
    }

    pub fn critical(&self, component: &'static str, message: impl Into<String>, cause: anyhow::Error) {
        self.handle(
            &ControllerError::new(ErrorKind::Fatal, Severity::Critical, component, message)
                .with_cause(cause),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_display_with_and_without_cause() {
        let plain = ControllerError::new(ErrorKind::InvalidValue, Severity::Warning, "labels", "bad port");
        assert_eq!(plain.to_string(), "bad port");

        let caused = plain.with_cause(anyhow::anyhow!("99999 out of range"));
        assert_eq!(caused.to_string(), "bad port: 99999 out of range");
    }

    #[test]
    fn test_info_does_not_count() {
        let handler = ErrorHandler::new(false);
        handler.info("test", "just noting");
        assert_eq!(handler.error_count(), 0);
    }

    #[test]
    fn test_warnings_accumulate_into_degraded() {
        let handler = ErrorHandler::new(false).with_threshold(4);
        assert!(!handler.is_degraded());

        for _ in 0..3 {
            handler.warning("test", "boom", anyhow::anyhow!("cause"));
        }
        assert_eq!(handler.error_count(), 3);
        assert!(handler.is_degraded());
    }

    #[test]
    fn test_critical_captures_backtrace() {
        let err = ControllerError::new(ErrorKind::Fatal, Severity::Critical, "test", "down");
        assert!(err.backtrace.is_some());

        let err = ControllerError::new(ErrorKind::Transient, Severity::Error, "test", "down");
        assert!(err.backtrace.is_none());
    }

    #[test]
    fn test_graceful_mode_survives_critical() {
        let handler = ErrorHandler::new(false);
        handler.critical("test", "bad but recoverable", anyhow::anyhow!("cause"));
        assert_eq!(handler.error_count(), 1);
    }
}
