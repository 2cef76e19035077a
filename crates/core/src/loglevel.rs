//! Feed log levels.
//!
//! Feeds carry their log level as an atomic scalar so download workers can
//! read it without going through the manager. The numeric representation
//! is therefore part of the contract: `as_u8`/`from_u8` round-trip.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a feed log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedLogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl FeedLogLevel {
    /// Numeric form used for the per-feed atomic.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`FeedLogLevel::as_u8`]. Unknown values clamp to `Error`
    /// so a torn value can never silence error entries.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            _ => Self::Error,
        }
    }

    /// Database representation (the `feed_logs_level` enum).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FeedLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown feed log level: {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_u8() {
        for lvl in [
            FeedLogLevel::Debug,
            FeedLogLevel::Info,
            FeedLogLevel::Warn,
            FeedLogLevel::Error,
        ] {
            assert_eq!(FeedLogLevel::from_u8(lvl.as_u8()), lvl);
        }
    }

    #[test]
    fn unknown_clamps_to_error() {
        assert_eq!(FeedLogLevel::from_u8(17), FeedLogLevel::Error);
    }

    #[test]
    fn parse_and_display() {
        assert_eq!("warn".parse::<FeedLogLevel>().unwrap(), FeedLogLevel::Warn);
        assert_eq!(FeedLogLevel::Info.to_string(), "info");
        assert!("fatal".parse::<FeedLogLevel>().is_err());
    }

    #[test]
    fn ordering_matches_severity() {
        assert!(FeedLogLevel::Debug < FeedLogLevel::Info);
        assert!(FeedLogLevel::Info < FeedLogLevel::Warn);
        assert!(FeedLogLevel::Warn < FeedLogLevel::Error);
    }
}
