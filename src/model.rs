use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a physical beacon: namespace UUID plus major/minor.
///
/// Ordering is lexicographic over (namespace, major, minor) and is used as the
/// final anchor tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BeaconIdentity {
    pub namespace: String,
    pub major: u16,
    pub minor: u16,
}

impl BeaconIdentity {
    pub fn new(namespace: impl Into<String>, major: u16, minor: u16) -> Self {
        BeaconIdentity {
            namespace: normalize_namespace(&namespace.into()),
            major,
            minor,
        }
    }
}

pub(crate) fn normalize_namespace(namespace: &str) -> String {
    namespace.trim().to_lowercase()
}

impl fmt::Display for BeaconIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.namespace, self.major, self.minor)
    }
}

impl FromStr for BeaconIdentity {
    type Err = String;

    /// Parse the `namespace_major_minor` key form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, '_');
        let minor = parts.next().ok_or_else(|| format!("missing minor in {:?}", s))?;
        let major = parts.next().ok_or_else(|| format!("missing major in {:?}", s))?;
        let namespace = parts
            .next()
            .filter(|ns| !ns.trim().is_empty())
            .ok_or_else(|| format!("missing namespace in {:?}", s))?;

        let major: u16 = major
            .parse()
            .map_err(|e| format!("invalid major {:?}: {}", major, e))?;
        let minor: u16 = minor
            .parse()
            .map_err(|e| format!("invalid minor {:?}: {}", minor, e))?;

        Ok(BeaconIdentity::new(namespace, major, minor))
    }
}

/// A single decoded observation of a beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    pub identity: BeaconIdentity,
    pub signal_strength_dbm: f64,
    /// Advertised measured power at 1 meter, overrides the configured reference when present
    #[serde(default)]
    pub reference_power_dbm: Option<f64>,
    /// Unix epoch milliseconds
    pub observed_at: i64,
}

impl SignalSample {
    pub fn new(identity: BeaconIdentity, signal_strength_dbm: f64, observed_at: i64) -> Self {
        SignalSample {
            identity,
            signal_strength_dbm,
            reference_power_dbm: None,
            observed_at,
        }
    }
}

/// Result of the path-loss estimate. `Unknown` is never a zero distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    Meters(f64),
    Unknown,
}

impl Distance {
    pub fn meters(&self) -> Option<f64> {
        match self {
            Distance::Meters(m) => Some(*m),
            Distance::Unknown => None,
        }
    }

    /// Known and finite, i.e. usable for anchor election.
    pub fn is_usable(&self) -> bool {
        matches!(self, Distance::Meters(m) if m.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceEstimate {
    pub identity: BeaconIdentity,
    pub distance: Distance,
    pub observed_at: i64,
}

/// The table's unit of storage, one per identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconRecord {
    pub identity: BeaconIdentity,
    pub latest_sample: SignalSample,
    pub latest_distance: Distance,
    pub last_seen_at: i64,
}

impl BeaconRecord {
    pub fn estimate(&self) -> DistanceEstimate {
        DistanceEstimate {
            identity: self.identity.clone(),
            distance: self.latest_distance,
            observed_at: self.last_seen_at,
        }
    }
}

/// Anchor election result. Candidates are ordered by ascending distance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnchorState {
    pub current_anchor: Option<BeaconIdentity>,
    pub candidates: Vec<BeaconRecord>,
}

impl AnchorState {
    pub fn none() -> Self {
        AnchorState::default()
    }

    /// Record of the current anchor, if any.
    pub fn anchor_record(&self) -> Option<&BeaconRecord> {
        let anchor = self.current_anchor.as_ref()?;
        self.candidates.iter().find(|r| &r.identity == anchor)
    }

    pub fn anchor_meters(&self) -> Option<f64> {
        self.anchor_record().and_then(|r| r.latest_distance.meters())
    }
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub anchor: AnchorState,
    pub beacons: Vec<BeaconRecord>,
    pub published_at: i64,
    /// Election order within one engine. A later election always carries a
    /// larger value, so consumers can tell a late delivery from a newer one.
    pub sequence: u64,
}
