use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Minimum level shown when the configuration's debug flag is set or cleared.
    pub fn from_debug_flag(debug: bool) -> Self {
        if debug {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, record: LogRecord);
}

pub type SharedLogSink = Arc<dyn LogSink>;

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn log(&self, record: LogRecord) {
        (**self).log(record);
    }
}

#[derive(Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn log(&self, _record: LogRecord) {}
}

#[derive(Default)]
pub struct VecLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl VecLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|record| record.level == level)
            .map(|record| record.message)
            .collect()
    }
}

impl LogSink for VecLogSink {
    fn log(&self, record: LogRecord) {
        if let Ok(mut guard) = self.records.lock() {
            guard.push(record);
        }
    }
}

/// Prints records at or above `min_level` to stdout.
#[derive(Clone)]
pub struct StdoutLogSink {
    min_level: LogLevel,
}

impl StdoutLogSink {
    pub fn new() -> Self {
        Self {
            min_level: LogLevel::Info,
        }
    }

    pub fn with_min_level(min_level: LogLevel) -> Self {
        Self { min_level }
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }
}

impl Default for StdoutLogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for StdoutLogSink {
    fn log(&self, record: LogRecord) {
        if record.level >= self.min_level {
            println!("[{}] {}", record.level, record.message);
        }
    }
}
