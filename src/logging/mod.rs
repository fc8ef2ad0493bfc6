use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

impl LogLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }

    fn colored_label(self) -> &'static str {
        match self {
            Self::Error => "\x1b[31mERROR\x1b[0m",
            Self::Warn => "\x1b[33mWARN\x1b[0m",
            Self::Info => "\x1b[32mINFO\x1b[0m",
            Self::Debug => "\x1b[36mDEBUG\x1b[0m",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            human_friendly: false,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn log(&self, level: LogLevel, context: Option<&str>, message: &str, payload: Option<Value>) {
        if level > self.config.min_level {
            return;
        }

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let label = if self.config.human_friendly {
            level.colored_label()
        } else {
            level.label()
        };

        let mut line = format!("{timestamp} [{label}]");
        if let Some(ctx) = context.filter(|ctx| !ctx.is_empty()) {
            line.push_str(&format!(" [{ctx}]"));
        }
        line.push(' ');
        line.push_str(message);
        if let Some(value) = payload {
            line.push_str(&format!(" payload={value}"));
        }

        self.sink.write_line(&line);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}

#[cfg(test)]
pub mod test_support {
    use std::sync::Mutex;

    use super::LogSink;

    #[derive(Default)]
    pub struct MemorySink {
        pub lines: Mutex<Vec<String>>,
    }

    impl LogSink for MemorySink {
        fn write_line(&self, line: &str) {
            self.lines
                .lock()
                .expect("memory sink mutex poisoned")
                .push(line.to_owned());
        }
    }
}
