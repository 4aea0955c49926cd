//! Distance estimation from beacon signal strength
//!
//! Uses the empirical beacon path-loss curve:
//! ratio = rssi / reference_power
//! distance = ratio ^ 10                          (ratio < 1)
//! distance = 0.89976 * ratio ^ 7.7095 + 0.111    (otherwise)
//!
//! Where:
//! - reference_power: Calibrated signal strength at 1 meter (dBm)
//! - rssi: Measured signal strength (dBm)

use crate::model::Distance;
use serde::{Deserialize, Serialize};

/// Calibrated strength at 1 meter used when the beacon does not advertise one
pub const DEFAULT_REFERENCE_POWER_DBM: f64 = -59.0;

const CURVE_COEFFICIENT: f64 = 0.89976;
const CURVE_EXPONENT: f64 = 7.7095;
const CURVE_INTERCEPT: f64 = 0.111;

/// Estimate distance in meters from RSSI
///
/// # Arguments
/// * `signal_strength_dbm` - Received signal strength in dBm (typically negative)
/// * `reference_power_dbm` - Signal strength at 1 meter (typically -59 dBm)
///
/// # Returns
/// `Distance::Unknown` for a zero reading. Non-finite input propagates into a
/// non-finite `Distance::Meters`, callers are expected to check with `is_usable`.
pub fn estimate(signal_strength_dbm: f64, reference_power_dbm: f64) -> Distance {
    // Zero means the radio had no reading
    if signal_strength_dbm == 0.0 {
        return Distance::Unknown;
    }

    let ratio = signal_strength_dbm / reference_power_dbm;
    if ratio < 1.0 {
        Distance::Meters(ratio.powi(10))
    } else {
        Distance::Meters(CURVE_COEFFICIENT * ratio.powf(CURVE_EXPONENT) + CURVE_INTERCEPT)
    }
}

/// Estimate with the default -59 dBm reference
pub fn estimate_default(signal_strength_dbm: f64) -> Distance {
    estimate(signal_strength_dbm, DEFAULT_REFERENCE_POWER_DBM)
}

/// Coarse proximity zone, in the usual beacon vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proximity {
    Immediate,
    Near,
    Far,
    Unknown,
}

impl Proximity {
    pub fn from_distance(distance: Distance) -> Self {
        match distance {
            Distance::Meters(d) if !d.is_finite() || d < 0.0 => Proximity::Unknown,
            Distance::Meters(d) if d < 0.5 => Proximity::Immediate,
            Distance::Meters(d) if d < 4.0 => Proximity::Near,
            Distance::Meters(_) => Proximity::Far,
            Distance::Unknown => Proximity::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Proximity::Immediate => "immediate (<0.5m)",
            Proximity::Near => "near (0.5-4m)",
            Proximity::Far => "far (>4m)",
            Proximity::Unknown => "unknown",
        }
    }
}

/// Format distance for display
pub fn format_distance(distance: Distance) -> String {
    match distance {
        Distance::Meters(d) if !d.is_finite() => "?".to_string(),
        Distance::Meters(d) if d < 10.0 => format!("{:.1}m", d),
        Distance::Meters(d) => format!("{:.0}m", d),
        Distance::Unknown => "unknown".to_string(),
    }
}

/// Exponential moving average over RSSI, used when table smoothing is enabled.
///
/// `alpha` is the weight of the newest reading: 1.0 degenerates to latest-wins.
#[derive(Debug, Clone, Copy)]
pub struct RssiSmoother {
    alpha: f64,
}

impl RssiSmoother {
    pub fn new(alpha: f64) -> Self {
        RssiSmoother {
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn apply(&self, previous: Option<f64>, reading: f64) -> f64 {
        match previous {
            // A zero reading carries no signal, it must not drag the average
            _ if reading == 0.0 => reading,
            Some(prev) if prev != 0.0 && prev.is_finite() => {
                self.alpha * reading + (1.0 - self.alpha) * prev
            }
            _ => reading,
        }
    }
}
