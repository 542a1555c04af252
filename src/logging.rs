//! Error and access log filtering.
//!
//! The server produces two kinds of records: error log messages with a
//! severity level and access log messages with a category. Which records
//! are emitted is controlled here; the actual sink is whatever logger the
//! application installs behind the [`log`] facade.
//!
//! The error log uses threshold semantics: a message is written if its
//! level is at or above the configured level. The access log uses bitmask
//! semantics: a message is written if its category bit is set.

use std::sync::atomic::{AtomicU16, Ordering};

/// Error log levels.
pub const LOG_ALL: u16 = 0;
pub const LOG_DEBUG: u16 = 1;
pub const LOG_INFO: u16 = 2;
pub const LOG_WARN: u16 = 3;
pub const LOG_ERROR: u16 = 4;
pub const LOG_FATAL: u16 = 5;
pub const LOG_OFF: u16 = 6;

/// Access log categories, one bit each.
pub const ALOG_CONNECT: u16 = 0x1;
pub const ALOG_DISCONNECT: u16 = 0x2;
pub const ALOG_MISC_CONTROL: u16 = 0x4;
pub const ALOG_FRAME: u16 = 0x8;
pub const ALOG_MESSAGE: u16 = 0x10;
pub const ALOG_INFO: u16 = 0x20;
pub const ALOG_HANDSHAKE: u16 = 0x40;

/// Useful category groups.
pub const ALOG_OFF: u16 = 0x0;
pub const ALOG_CONTROL: u16 = ALOG_CONNECT | ALOG_DISCONNECT | ALOG_MISC_CONTROL;
pub const ALOG_ALL: u16 = 0xFFFF;

/// Log target of connection lifecycle records.
const ACCESS_TARGET: &str = "wspp::access";

/// Shared log filter configuration.
///
/// One instance is held by the server and shared with every session it
/// mints. Levels may be adjusted while sessions are live.
#[derive(Debug)]
pub struct Logging {
    elog: AtomicU16,
    alog: AtomicU16
}

impl Default for Logging {
    fn default() -> Self {
        Logging::new()
    }
}

impl Logging {
    /// Create a new filter configuration logging errors and nothing else.
    pub fn new() -> Self {
        Logging {
            elog: AtomicU16::new(LOG_ERROR),
            alog: AtomicU16::new(ALOG_OFF)
        }
    }

    /// Should a message of the given level be written to the error log?
    pub fn test_elog_level(&self, level: u16) -> bool {
        level >= self.elog.load(Ordering::Relaxed)
    }

    /// Set the error log threshold.
    pub fn set_elog_level(&self, level: u16) {
        self.elog.store(level, Ordering::Relaxed)
    }

    /// Should a message of the given category be written to the access log?
    pub fn test_alog_level(&self, category: u16) -> bool {
        category & self.alog.load(Ordering::Relaxed) != 0
    }

    /// Enable the given access log categories.
    pub fn set_alog_level(&self, category: u16) {
        self.alog.fetch_or(category, Ordering::Relaxed);
    }

    /// Disable the given access log categories.
    pub fn unset_alog_level(&self, category: u16) {
        self.alog.fetch_and(!category, Ordering::Relaxed);
    }

    /// Write a message to the error log if its level passes the threshold.
    pub fn log(&self, msg: &str, level: u16) {
        if !self.test_elog_level(level) {
            return
        }
        let lvl = match level {
            LOG_ALL => log::Level::Trace,
            LOG_DEBUG => log::Level::Debug,
            LOG_INFO => log::Level::Info,
            LOG_WARN => log::Level::Warn,
            _ => log::Level::Error
        };
        log::log!(target: "wspp", lvl, "{}", msg)
    }

    /// Write a message to the access log if its category is enabled.
    pub fn access_log(&self, msg: &str, category: u16) {
        if self.test_alog_level(category) {
            log::info!(target: ACCESS_TARGET, "{}", msg)
        }
    }
}
