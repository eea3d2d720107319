use std::{
    fs,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::common::error::TradewindError;

pub fn persist(json: String, path: impl AsRef<Path>) -> Result<(), TradewindError> {
    fs::write(path.as_ref(), json)?;
    Ok(())
}

pub fn restore(path: impl AsRef<Path>) -> Result<String, TradewindError> {
    let json = fs::read_to_string(path.as_ref())?;
    Ok(json)
}

/// Wall-clock milliseconds since the Unix epoch. Wall clock on purpose — the
/// heartbeat compares it across ticks to detect process suspension.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
