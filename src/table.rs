use crate::config::TableConfig;
use crate::distance::{estimate, RssiSmoother, DEFAULT_REFERENCE_POWER_DBM};
use crate::model::{BeaconIdentity, BeaconRecord, SignalSample};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct Entry {
    /// Insertion sequence, fixed at first sighting
    seq: u64,
    record: BeaconRecord,
    smoothed_rssi: Option<f64>,
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<BeaconIdentity, Entry>,
    next_seq: u64,
}

/// Freshest-known state per beacon.
///
/// Every record is replaced whole under the write lock, so readers never see
/// a half-updated record.
pub struct BeaconTable {
    inner: RwLock<TableInner>,
    reference_power_dbm: f64,
    smoother: Option<RssiSmoother>,
}

impl Default for BeaconTable {
    fn default() -> Self {
        BeaconTable::new(DEFAULT_REFERENCE_POWER_DBM)
    }
}

impl BeaconTable {
    /// Latest-sample-wins table.
    pub fn new(reference_power_dbm: f64) -> Self {
        BeaconTable {
            inner: RwLock::new(TableInner::default()),
            reference_power_dbm,
            smoother: None,
        }
    }

    pub fn from_config(reference_power_dbm: f64, config: &TableConfig) -> Self {
        let mut table = BeaconTable::new(reference_power_dbm);
        if config.smoothing.enabled {
            table.smoother = Some(RssiSmoother::new(config.smoothing.alpha));
        }
        table
    }

    pub fn with_smoothing(mut self, alpha: f64) -> Self {
        self.smoother = Some(RssiSmoother::new(alpha));
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, TableInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `sample` as the freshest state for its identity and return the
    /// resulting record.
    pub fn upsert(&self, sample: SignalSample) -> BeaconRecord {
        let reference = sample
            .reference_power_dbm
            .unwrap_or(self.reference_power_dbm);

        let mut inner = self.write();
        let previous = inner
            .entries
            .get(&sample.identity)
            .map(|e| (e.seq, e.smoothed_rssi));

        let (seq, smoothed_rssi) = match previous {
            Some((seq, prev_rssi)) => (
                seq,
                self.smoother
                    .map(|s| s.apply(prev_rssi, sample.signal_strength_dbm)),
            ),
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                (seq, self.smoother.map(|_| sample.signal_strength_dbm))
            }
        };

        let rssi = smoothed_rssi.unwrap_or(sample.signal_strength_dbm);
        let record = BeaconRecord {
            identity: sample.identity.clone(),
            latest_distance: estimate(rssi, reference),
            last_seen_at: sample.observed_at,
            latest_sample: sample,
        };

        inner.entries.insert(
            record.identity.clone(),
            Entry {
                seq,
                record: record.clone(),
                smoothed_rssi,
            },
        );
        record
    }

    /// Remove every record with `now - last_seen_at > max_age_ms`.
    pub fn evict_stale(&self, now: i64, max_age_ms: u64) -> HashSet<BeaconIdentity> {
        let max_age = i64::try_from(max_age_ms).unwrap_or(i64::MAX);
        let is_stale = |record: &BeaconRecord| now.saturating_sub(record.last_seen_at) > max_age;

        // Cheap read-side check first so the sweep does not contend with ingest
        if !self.read().entries.values().any(|e| is_stale(&e.record)) {
            return HashSet::new();
        }

        let mut inner = self.write();
        let stale: HashSet<BeaconIdentity> = inner
            .entries
            .values()
            .filter(|e| is_stale(&e.record))
            .map(|e| e.record.identity.clone())
            .collect();

        for identity in &stale {
            inner.entries.remove(identity);
            debug!("Evicted stale beacon {}", identity);
        }
        stale
    }

    /// All records in first-seen order.
    pub fn snapshot(&self) -> Vec<BeaconRecord> {
        let inner = self.read();
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    pub fn get(&self, identity: &BeaconIdentity) -> Option<BeaconRecord> {
        self.read().entries.get(identity).map(|e| e.record.clone())
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.entries.clear();
        inner.next_seq = 0;
    }
}
