// Structured log sink
//
// Every record carries a component tag (the log target), an optional
// correlation id, and a bag of key=value fields. The process-wide sink is
// env_logger, configured from LOG_LEVEL / DEBUG_MODE with RUST_LOG on top.

use std::fmt::Display;

use log::Level;
use rand::Rng;

use crate::constants::CORRELATION_ID_LEN;

/// A single structured field value.
pub type Field<'a> = (&'a str, &'a dyn Display);

#[derive(Debug, Clone)]
pub struct Logger {
    component: &'static str,
    correlation_id: Option<String>,
}

impl Logger {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            correlation_id: None,
        }
    }

    /// Child logger that stamps every record with `id`.
    pub fn with_correlation(&self, id: impl Into<String>) -> Self {
        Self {
            component: self.component,
            correlation_id: Some(id.into()),
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn error(&self, msg: &str, fields: &[Field]) {
        self.emit(Level::Error, msg, fields);
    }

    pub fn warn(&self, msg: &str, fields: &[Field]) {
        self.emit(Level::Warn, msg, fields);
    }

    pub fn info(&self, msg: &str, fields: &[Field]) {
        self.emit(Level::Info, msg, fields);
    }

    pub fn debug(&self, msg: &str, fields: &[Field]) {
        self.emit(Level::Debug, msg, fields);
    }

    fn emit(&self, level: Level, msg: &str, fields: &[Field]) {
        if !log::log_enabled!(target: self.component, level) {
            return;
        }
        log::log!(target: self.component, level, "{}", self.format(msg, fields));
    }

    fn format(&self, msg: &str, fields: &[Field]) -> String {
        let mut line = String::with_capacity(msg.len() + 16 * fields.len());
        if let Some(cid) = &self.correlation_id {
            line.push('[');
            line.push_str(cid);
            line.push_str("] ");
        }
        line.push_str(msg);
        for (key, value) in fields {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&value.to_string());
        }
        line
    }
}

/// Short random token attached to one operation or encode job.
pub fn new_correlation_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..CORRELATION_ID_LEN)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Install env_logger as the process sink.
///
/// `level` is the configured LOG_LEVEL; `debug_mode` forces debug.
/// RUST_LOG, when set, takes precedence over both.
pub fn init(level: &str, debug_mode: bool) {
    let default_level = if debug_mode { "debug" } else { level };
    let env = env_logger::Env::default().default_filter_or(default_level);
    // A second init (tests, CLI re-entry) is harmless.
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_with_correlation_and_fields() {
        let logger = Logger::new("encoder").with_correlation("abcd1234");
        let count = 5;
        let line = logger.format("scan complete", &[("frames", &count), ("method", &"scan")]);
        assert_eq!(line, "[abcd1234] scan complete frames=5 method=scan");
    }

    #[test]
    fn test_format_without_correlation() {
        let logger = Logger::new("stream");
        assert_eq!(logger.format("stopped", &[]), "stopped");
    }

    #[test]
    fn test_correlation_id_shape() {
        let id = new_correlation_id();
        assert_eq!(id.len(), CORRELATION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_correlation_id());
    }
}
