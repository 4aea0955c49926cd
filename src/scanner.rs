//! Collaborator interfaces the engine is wired to.
//!
//! The engine never touches a radio or a permission dialog itself. A host
//! application supplies a [`Scanner`] that starts and stops the platform scan
//! and forwards each sighting to `PositioningEngine::ingest` as a
//! [`RawEvent`], plus a [`PermissionProvider`] that answers whether scanning
//! is allowed.

use crate::error::EngineError;
use crate::model::{normalize_namespace, BeaconIdentity, SignalSample};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Platform capabilities needed before scanning can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Location,
    BluetoothScan,
    BluetoothConnect,
}

pub const REQUIRED_CAPABILITIES: [Capability; 3] = [
    Capability::Location,
    Capability::BluetoothScan,
    Capability::BluetoothConnect,
];

pub trait PermissionProvider: Send + Sync {
    /// Ask for `required`. Must return true only when every capability was
    /// granted; an error is treated as a denial.
    fn request_capabilities(&self, required: &[Capability]) -> Result<bool>;
}

pub trait Scanner: Send + Sync {
    fn start_scan(&self) -> Result<()>;
    fn stop_scan(&self) -> Result<()>;
}

/// Fixed answer, switchable at runtime. Useful for headless hosts and tests.
#[derive(Debug, Default)]
pub struct StaticPermissions {
    granted: AtomicBool,
}

impl StaticPermissions {
    pub fn new(granted: bool) -> Self {
        StaticPermissions {
            granted: AtomicBool::new(granted),
        }
    }

    pub fn granted() -> Self {
        StaticPermissions::new(true)
    }

    pub fn denied() -> Self {
        StaticPermissions::new(false)
    }

    pub fn set(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }
}

impl PermissionProvider for StaticPermissions {
    fn request_capabilities(&self, _required: &[Capability]) -> Result<bool> {
        Ok(self.granted.load(Ordering::SeqCst))
    }
}

/// A sighting as handed over by the scanner, before validation.
///
/// Fields are optional and loosely typed because scanners fill them from
/// advertisement payloads that may be truncated or malformed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub major: Option<i64>,
    #[serde(default)]
    pub minor: Option<i64>,
    #[serde(default)]
    pub rssi: Option<f64>,
    /// Advertised calibrated power at 1 meter
    #[serde(default)]
    pub measured_power: Option<f64>,
    /// Unix epoch millis; the engine clock is used when absent
    #[serde(default)]
    pub observed_at: Option<i64>,
}

impl RawEvent {
    pub fn new(identity: &BeaconIdentity, rssi: f64) -> Self {
        RawEvent {
            namespace: Some(identity.namespace.clone()),
            major: Some(identity.major as i64),
            minor: Some(identity.minor as i64),
            rssi: Some(rssi),
            ..Default::default()
        }
    }

    pub fn at(mut self, observed_at: i64) -> Self {
        self.observed_at = Some(observed_at);
        self
    }

    pub fn with_measured_power(mut self, measured_power: f64) -> Self {
        self.measured_power = Some(measured_power);
        self
    }
}

fn id_component(name: &str, value: Option<i64>) -> Result<u16, EngineError> {
    let value = value.ok_or_else(|| EngineError::decode(format!("missing {}", name)))?;
    u16::try_from(value)
        .map_err(|_| EngineError::decode(format!("{} {} out of range 0-65535", name, value)))
}

/// Validate a raw event into a sample. `now` stamps events without a time.
pub fn decode(event: &RawEvent, now: i64) -> Result<SignalSample, EngineError> {
    let namespace = event
        .namespace
        .as_deref()
        .map(normalize_namespace)
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| EngineError::decode("missing namespace"))?;

    let major = id_component("major", event.major)?;
    let minor = id_component("minor", event.minor)?;

    let rssi = event
        .rssi
        .ok_or_else(|| EngineError::decode("missing signal strength"))?;
    if !rssi.is_finite() {
        return Err(EngineError::decode(format!("non-finite signal strength {}", rssi)));
    }

    let reference_power_dbm = match event.measured_power {
        Some(p) if !p.is_finite() || p == 0.0 => {
            return Err(EngineError::decode(format!("invalid measured power {}", p)));
        }
        other => other,
    };

    Ok(SignalSample {
        identity: BeaconIdentity {
            namespace,
            major,
            minor,
        },
        signal_strength_dbm: rssi,
        reference_power_dbm,
        observed_at: event.observed_at.unwrap_or(now),
    })
}
