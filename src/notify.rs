//! Human-facing notifications.
//!
//! The factory reports exhaustion summaries and judge verdicts through a
//! [`NotificationSink`]. Messages arrive already formatted and capped.

use std::sync::Mutex;

use tracing::info;

pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str);
}

/// Prints to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl NotificationSink for ConsoleSink {
    fn notify(&self, message: &str) {
        println!("{}", message);
    }
}

/// Writes to the log file only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, message: &str) {
        info!(target: "foreman::notify", "{}", message);
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl NotificationSink for MemorySink {
    fn notify(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}
