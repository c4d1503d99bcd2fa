use std::time::Duration;

use crate::error::{Error, Result};

/// Parses a number of seconds, integer or fractional, as found in variables like
/// `FLAGSYNC_SYNC_INTERVAL=2.5`. Negative, non-finite and absurdly large values are refused.
pub(crate) fn parse_seconds(name: &str, value: &str) -> Result<Duration> {
    let invalid = || {
        Error::Configuration(format!(
            "{} must be a non-negative number of seconds, got {:?}",
            name, value
        ))
    };
    let seconds: f64 = value.trim().parse().map_err(|_| invalid())?;
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}
