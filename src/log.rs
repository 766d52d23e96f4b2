//! Leveled logging in the classic one-char-per-level style.

use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::process::id;
use std::sync::RwLock;

use chrono::Local;
use once_cell::sync::Lazy;

#[derive(Clone, Copy, PartialEq, PartialOrd)]
pub enum LogLevel {
    Debug,
    Verbose,
    Notice,
    Warning,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ch = match self {
            Self::Debug => '.',
            Self::Verbose => '-',
            Self::Notice => '*',
            Self::Warning => '#',
        };
        write!(f, "{ch}")
    }
}

struct LogConfig {
    verbosity: LogLevel,
    log_file: String,       // "" = log on standard output
}

static CONFIG: Lazy<RwLock<LogConfig>> = Lazy::new(|| {
    RwLock::new(LogConfig { verbosity: LogLevel::Verbose, log_file: String::new() })
});

pub fn set_verbosity(level: LogLevel) {
    CONFIG.write().unwrap().verbosity = level;
}

pub fn set_log_file(path: &str) {
    CONFIG.write().unwrap().log_file = path.to_string();
}

/// Low level logging of a pre-formatted line. To use only for very big
/// messages, otherwise `log()` is to prefer.
pub fn log_raw(level: LogLevel, msg: &str) {
    let log_file = {
        let config = CONFIG.read().unwrap();
        if level < config.verbosity {
            return;
        }
        config.log_file.clone()
    };

    let mut writer: Box<dyn Write> = if log_file.is_empty() {
        Box::new(io::stdout())
    } else {
        match OpenOptions::new().append(true).create(true).open(&log_file) {
            Ok(f) => Box::new(f),
            Err(_) => {
                eprintln!("Can't open log file: {}", log_file);
                return;
            }
        }
    };

    if let Err(e) = writer.write_all(msg.as_bytes()) {
        eprintln!("Can't write log: {}", e);
    }
}

/// The logging call used across the code: a timestamped, level-tagged line.
pub fn log(level: LogLevel, body: &str) {
    let now = Local::now().format("%d %b %H:%M:%S%.3f");
    log_raw(level, &format!("[{}] {} {} {}\n", id(), now, level, body));
}

/// An async-signal-safe version of `log()`: a single raw write(2), no
/// allocation, no locks. For use inside signal handlers only.
pub fn log_from_handler(level: LogLevel, msg: &str) {
    let ch: u8 = match level {
        LogLevel::Debug => b'.',
        LogLevel::Verbose => b'-',
        LogLevel::Notice => b'*',
        LogLevel::Warning => b'#',
    };
    let prefix = [b'(', ch, b')', b' '];
    unsafe {
        libc::write(libc::STDOUT_FILENO, prefix.as_ptr() as *const libc::c_void, prefix.len());
        libc::write(libc::STDOUT_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::write(libc::STDOUT_FILENO, b"\n".as_ptr() as *const libc::c_void, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_chars() {
        assert_eq!(format!("{}", LogLevel::Debug), ".");
        assert_eq!(format!("{}", LogLevel::Warning), "#");
        assert!(LogLevel::Debug < LogLevel::Notice);
    }

    #[test]
    fn log_print() {
        log(LogLevel::Notice, &format!("hello {}", "rpusher"));
        log(LogLevel::Debug, "filtered out by the default verbosity");
    }
}
