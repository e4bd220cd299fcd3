use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::fmt;
use tokio::sync::mpsc;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// Human-readable event for the UI collaborator
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub level: StatusLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Sending side of the bounded status channel.
///
/// Every event is mirrored into the log. When the consumer lags and the
/// queue is full the event survives only in the log.
#[derive(Clone)]
pub struct StatusNotifier {
    tx: mpsc::Sender<StatusEvent>,
}

impl StatusNotifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Forward every event to a single-argument callback on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_callback<F>(capacity: usize, callback: F) -> Self
    where
        F: Fn(StatusEvent) + Send + 'static,
    {
        let (notifier, mut rx) = Self::channel(capacity);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(event);
            }
        });
        notifier
    }

    /// A notifier whose events only reach the log
    pub fn log_only() -> Self {
        let (notifier, _rx) = Self::channel(1);
        notifier
    }

    pub fn info(&self, message: impl Into<String>) {
        self.notify(StatusLevel::Info, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.notify(StatusLevel::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.notify(StatusLevel::Error, message.into());
    }

    fn notify(&self, level: StatusLevel, message: String) {
        match level {
            StatusLevel::Info => info!("{}", message),
            StatusLevel::Warning => warn!("{}", message),
            StatusLevel::Error => error!("{}", message),
        }

        let event = StatusEvent {
            level,
            message,
            timestamp: Utc::now(),
        };
        // Closed or full: the log line above is the record
        let _ = self.tx.try_send(event);
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::channel(DEFAULT_CAPACITY).0
    }
}
