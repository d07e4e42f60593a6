use std::sync::OnceLock;

use chrono::Local;
use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::bluetooth::EVENT_CHANNEL_CAPACITY;

static LOGGER: OnceLock<SessionLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Logs to stderr and forwards every record to in-process listeners
pub struct SessionLogger {
    sender: broadcast::Sender<LogMessage>,
    level: Level,
}

impl SessionLogger {
    pub fn new(level: Level) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender, level }
    }

    /// Installs the logger process-wide
    pub fn init(level: Level) -> Result<(), SetLoggerError> {
        let logger = LOGGER.get_or_init(|| SessionLogger::new(level));
        log::set_logger(logger).map(|()| log::set_max_level(level.to_level_filter()))
    }

    /// Installs the logger, or falls back to env_logger if that fails
    pub fn init_or_fallback(level: Level) {
        if Self::init(level).is_err() {
            let _ = env_logger::builder()
                .filter_level(level.to_level_filter())
                .try_init();
        }
    }

    /// Receives log records; `None` until the logger is installed
    pub fn subscribe() -> Option<broadcast::Receiver<LogMessage>> {
        LOGGER.get().map(|logger| logger.sender.subscribe())
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        // No listener is fine
        let _ = self.sender.send(log_message);
    }
}

impl log::Log for SessionLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn records_reach_listeners() {
        let logger = SessionLogger::new(Level::Info);
        let mut rx = logger.sender.subscribe();

        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .args(format_args!("link lost"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .args(format_args!("too chatty"))
                .build(),
        );

        let message = rx.try_recv().unwrap();
        assert_eq!(message.level, "WARN");
        assert_eq!(message.message, "link lost");
        assert!(rx.try_recv().is_err());
    }
}
