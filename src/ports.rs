//! Port spreading: path `i` in sorted order uses `port + i` on both endpoints.
//!
//! This is the only thing pairing a path on the connecting side with the same
//! path on the accepting side, so both must enumerate their paths in the same
//! sorted order. It collides with anything else the application runs on the
//! spread ports.

use crate::{Error, Result};

/// Offsets `base` by the path ordinal. Port 0 (ephemeral) is never spread.
pub fn spread_port(base: u16, ordinal: usize) -> Result<u16> {
    if base == 0 {
        return Ok(0);
    }
    u16::try_from(ordinal)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| Error::AddressBinding(format!("port {base} + path offset {ordinal} overflows")))
}

/// Undoes `spread_port` on a port observed at `ordinal`, so callers see the logical port.
pub fn logical_port(observed: u16, ordinal: usize) -> u16 {
    u16::try_from(ordinal)
        .ok()
        .and_then(|offset| observed.checked_sub(offset))
        .unwrap_or(observed)
}
