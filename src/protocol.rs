//! ═══════════════════════════════════════════════════════════════════════════════
//! PROTOCOL — QST Thermode Wire Commands
//! ═══════════════════════════════════════════════════════════════════════════════
//!
//! Fixed-width ASCII command encoding for the thermode's serial protocol.
//! Temperatures travel as zero-padded tenths of a degree:
//!
//! | Command     | Frame            | Example                      |
//! |-------------|------------------|------------------------------|
//! | base temp   | `N` + 3d tenths  | `N320` = 32.0 °C             |
//! | target temp | `C` + surf + 3d  | `C2460` = 46.0 °C, surface 2 |
//! | duration    | `D` + surf + 5d  | `D002000` = 2000 ms, all     |
//! | trigger     | `L`              |                              |
//! | quiet mode  | `F`              | sent once after open         |
//!
//! Validation is a pure function of the numeric inputs. Out-of-range values
//! are rejected, never clamped; no partial command is ever produced.
//! ═══════════════════════════════════════════════════════════════════════════════

use crate::error::ProtocolError;

/// Trigger stimulation with the previously set target/duration
pub const TRIGGER: &[u8] = b"L";

/// Suppress unsolicited device chatter. Sent once, immediately after open.
pub const QUIET_MODE: &[u8] = b"F";

/// Valid base temperature range in tenths (20.0 – 45.0 °C)
const BASE_TENTHS: std::ops::RangeInclusive<i32> = 200..=450;

/// Valid target temperature range in tenths (0.0 – 60.0 °C)
const TARGET_TENTHS: std::ops::RangeInclusive<i32> = 0..=600;

/// Valid stimulation duration range in milliseconds
const DURATION_MS: std::ops::RangeInclusive<u32> = 10..=99_999;

/// Highest single-surface selector (0 = all surfaces)
const MAX_SURFACE: u8 = 5;

/// Convert degrees Celsius to protocol tenths, rounding half away from zero.
/// The device resolves one decimal; validation operates on the rounded value.
fn tenths(temp_c: f32) -> i32 {
    (temp_c * 10.0).round() as i32
}

fn check_surface(surface: u8) -> Result<(), ProtocolError> {
    if surface > MAX_SURFACE {
        return Err(ProtocolError::SurfaceRange(surface));
    }
    Ok(())
}

/// Encode a set-base-temperature command (`N` + 3-digit tenths).
pub fn encode_base_temperature(temp_c: f32) -> Result<Vec<u8>, ProtocolError> {
    let t = tenths(temp_c);
    if !BASE_TENTHS.contains(&t) {
        return Err(ProtocolError::BaseTemperatureRange(temp_c));
    }
    Ok(format!("N{:03}", t).into_bytes())
}

/// Encode a set-target-temperature command (`C` + surface + 3-digit tenths).
pub fn encode_target_temperature(temp_c: f32, surface: u8) -> Result<Vec<u8>, ProtocolError> {
    let t = tenths(temp_c);
    if !TARGET_TENTHS.contains(&t) {
        return Err(ProtocolError::TargetTemperatureRange(temp_c));
    }
    check_surface(surface)?;
    Ok(format!("C{}{:03}", surface, t).into_bytes())
}

/// Encode a set-duration command (`D` + surface + 5-digit milliseconds).
pub fn encode_duration(duration_ms: u32, surface: u8) -> Result<Vec<u8>, ProtocolError> {
    if !DURATION_MS.contains(&duration_ms) {
        return Err(ProtocolError::DurationRange(duration_ms));
    }
    check_surface(surface)?;
    Ok(format!("D{}{:05}", surface, duration_ms).into_bytes())
}
