use crate::anchor;
use crate::bus::{PublishGate, PublishReport, SubscriptionBus, SubscriptionHandle};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::distance::format_distance;
use crate::error::{EngineError, EngineResult};
use crate::model::{AnchorState, BeaconIdentity, BeaconRecord, Distance, PositionUpdate};
use crate::scanner::{decode, PermissionProvider, RawEvent, Scanner, REQUIRED_CAPABILITIES};
use crate::table::BeaconTable;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Scan lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    RequestingPermission,
    Scanning,
    Stopped,
    Failed,
    Destroyed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::RequestingPermission => "requesting permission",
            EngineState::Scanning => "scanning",
            EngineState::Stopped => "stopped",
            EngineState::Failed => "failed",
            EngineState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// What a UI should show, with "no beacons" and "not allowed" kept apart.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionStatus {
    Located {
        anchor: BeaconIdentity,
        distance: Distance,
    },
    NoBeaconsInRange,
    PermissionDenied,
    NotScanning,
    Failed {
        reason: String,
    },
    Destroyed,
}

/// Result of a single `ingest` call.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Sample stored. `published` is true if consumers were notified.
    Applied { published: bool },
    /// The event could not be decoded and was dropped.
    Rejected(EngineError),
    /// The engine was not scanning; nothing changed.
    Discarded,
}

struct EngineInner {
    config: Config,
    lifecycle: RwLock<EngineState>,
    table: BeaconTable,
    bus: SubscriptionBus,
    anchor: RwLock<AnchorState>,
    gate: Mutex<PublishGate>,
    last_error: Mutex<Option<EngineError>>,
    scanner: Arc<dyn Scanner>,
    permissions: Arc<dyn PermissionProvider>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Positioning engine: ingests beacon sightings, keeps the freshest state per
/// beacon, elects the nearest one as anchor and notifies subscribers.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct PositioningEngine {
    inner: Arc<EngineInner>,
}

impl PositioningEngine {
    pub fn new(
        config: Config,
        scanner: Arc<dyn Scanner>,
        permissions: Arc<dyn PermissionProvider>,
    ) -> Self {
        Self::with_clock(config, scanner, permissions, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: Config,
        scanner: Arc<dyn Scanner>,
        permissions: Arc<dyn PermissionProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let table = BeaconTable::from_config(config.estimator.reference_power_dbm, &config.table);
        let bus = SubscriptionBus::new(config.bus.feed_capacity);
        let gate = PublishGate::new(config.publish.clone());

        PositioningEngine {
            inner: Arc::new(EngineInner {
                config,
                lifecycle: RwLock::new(EngineState::Idle),
                table,
                bus,
                anchor: RwLock::new(AnchorState::none()),
                gate: Mutex::new(gate),
                last_error: Mutex::new(None),
                scanner,
                permissions,
                clock,
                running: Arc::new(AtomicBool::new(false)),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    pub fn last_error(&self) -> Option<EngineError> {
        lock(&self.inner.last_error).clone()
    }

    /// Request permissions and start the scanner.
    ///
    /// Valid from `Idle` or `Stopped`; a no-op while already scanning. A fresh
    /// session starts with an empty table.
    pub fn start(&self) -> EngineResult<()> {
        let inner = &self.inner;
        {
            let mut state = inner.write_state();
            match *state {
                EngineState::Scanning => return Ok(()),
                EngineState::Idle | EngineState::Stopped => {}
                EngineState::Destroyed => return Err(EngineError::Destroyed),
                other => {
                    return Err(EngineError::InvalidState {
                        operation: "start",
                        state: other,
                    })
                }
            }
            *state = EngineState::RequestingPermission;
        }

        info!("Requesting beacon scanning capabilities");
        let granted = match inner.permissions.request_capabilities(&REQUIRED_CAPABILITIES) {
            Ok(granted) => granted,
            Err(e) => {
                warn!("Permission request failed, treating as denied: {:#}", e);
                false
            }
        };

        if !granted {
            let mut state = inner.write_state();
            if *state == EngineState::Destroyed {
                return Err(EngineError::Destroyed);
            }
            *state = EngineState::Idle;
            drop(state);
            warn!("Beacon scanning requires location and bluetooth permissions");
            return Err(inner.record_error(EngineError::PermissionDenied));
        }

        // Scanner may deliver events synchronously, so no lock is held here;
        // anything delivered before the state flips is discarded.
        if let Err(e) = inner.scanner.start_scan() {
            let err = EngineError::scanner(e.context("Failed to start beacon scan"));
            error!("{}", err);
            let mut state = inner.write_state();
            if *state == EngineState::Destroyed {
                return Err(EngineError::Destroyed);
            }
            *state = EngineState::Failed;
            drop(state);
            return Err(inner.record_error(err));
        }

        let mut state = inner.write_state();
        if *state == EngineState::Destroyed {
            drop(state);
            let _ = inner.scanner.stop_scan();
            return Err(EngineError::Destroyed);
        }
        inner.table.clear();
        *inner.write_anchor() = AnchorState::none();
        lock(&inner.gate).reset();
        *lock(&inner.last_error) = None;
        inner.running.store(true, Ordering::SeqCst);
        *state = EngineState::Scanning;
        drop(state);

        self.spawn_sweeper();
        info!(
            "Beacon scanning started (max age {}ms, publish {:?})",
            inner.config.table.max_age_ms, inner.config.publish.policy
        );
        Ok(())
    }

    /// Halt the scanner. The table is kept so the last known position stays
    /// queryable until the next `start()`.
    pub fn stop(&self) -> EngineResult<()> {
        let inner = &self.inner;
        {
            // Waits for in-flight upserts to finish
            let mut state = inner.write_state();
            match *state {
                EngineState::Scanning => {}
                EngineState::Destroyed => return Err(EngineError::Destroyed),
                _ => return Ok(()),
            }
            *state = EngineState::Stopped;
        }
        inner.halt_sweeper();

        if let Err(e) = inner.scanner.stop_scan() {
            let err = EngineError::scanner(e.context("Failed to stop beacon scan"));
            error!("{}", err);
            let mut state = inner.write_state();
            if *state == EngineState::Stopped {
                *state = EngineState::Failed;
            }
            drop(state);
            return Err(inner.record_error(err));
        }

        info!("Beacon scanning stopped, {} beacons retained", inner.table.len());
        Ok(())
    }

    /// Leave `Failed` for `Idle` so `start()` can be retried.
    pub fn reset(&self) -> EngineResult<()> {
        let mut state = self.inner.write_state();
        match *state {
            EngineState::Failed => {
                *state = EngineState::Idle;
                drop(state);
                *lock(&self.inner.last_error) = None;
                info!("Engine reset to idle");
                Ok(())
            }
            EngineState::Idle => Ok(()),
            EngineState::Destroyed => Err(EngineError::Destroyed),
            other => Err(EngineError::InvalidState {
                operation: "reset",
                state: other,
            }),
        }
    }

    /// Tear down: stop scanning, drop all subscribers and beacons. Idempotent.
    pub fn destroy(&self) {
        let inner = &self.inner;
        let was_scanning = {
            let mut state = inner.write_state();
            if *state == EngineState::Destroyed {
                return;
            }
            let was_scanning = *state == EngineState::Scanning;
            *state = EngineState::Destroyed;
            was_scanning
        };
        inner.halt_sweeper();

        if was_scanning {
            if let Err(e) = inner.scanner.stop_scan() {
                warn!("Failed to stop beacon scan during destroy: {:#}", e);
            }
        }

        inner.bus.clear();
        inner.table.clear();
        *inner.write_anchor() = AnchorState::none();
        lock(&inner.gate).reset();
        info!("Positioning engine destroyed");
    }

    /// Run one scanner event through decode, estimate, upsert, eviction,
    /// anchor election and (change-gated) publication.
    pub fn ingest(&self, event: RawEvent) -> IngestOutcome {
        let inner = &self.inner;
        let now = inner.clock.now_ms();

        let update = {
            let state = inner.read_state();
            if *state != EngineState::Scanning {
                debug!("Discarding beacon event, engine is {}", *state);
                return IngestOutcome::Discarded;
            }

            let sample = match decode(&event, now) {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("Dropping beacon event: {}", e);
                    return IngestOutcome::Rejected(e);
                }
            };

            let record = inner.table.upsert(sample);
            debug!(
                "Beacon {} rssi={}dBm ~{}",
                record.identity,
                record.latest_sample.signal_strength_dbm,
                format_distance(record.latest_distance)
            );

            let evicted = inner.table.evict_stale(now, inner.config.table.max_age_ms);
            if !evicted.is_empty() {
                info!("Evicted {} stale beacons", evicted.len());
            }
            inner.reelect(now)
        };

        let published = match update {
            Some(update) => inner.publish(&update).is_some(),
            None => false,
        };
        IngestOutcome::Applied { published }
    }

    /// Evict stale beacons now; publishes if the anchor changed as a result.
    pub fn sweep(&self) -> Option<PublishReport> {
        self.inner.sweep()
    }

    /// Record of the elected anchor, if any.
    ///
    /// Stale beacons are evicted first. If that changes the anchor, the
    /// resulting update is published on the calling thread before this
    /// returns, so subscriber callbacks may run here.
    pub fn current_anchor(&self) -> Option<BeaconRecord> {
        self.inner.sweep();
        self.inner.read_anchor().anchor_record().cloned()
    }

    /// Same as [`current_anchor`](Self::current_anchor).
    pub fn nearest(&self) -> Option<BeaconRecord> {
        self.current_anchor()
    }

    /// Elected anchor and ranked candidates. Evicts and publishes like
    /// [`current_anchor`](Self::current_anchor).
    pub fn anchor_state(&self) -> AnchorState {
        self.inner.sweep();
        self.inner.read_anchor().clone()
    }

    /// All tracked beacons, in first-seen order. Evicts and publishes like
    /// [`current_anchor`](Self::current_anchor).
    pub fn beacons(&self) -> Vec<BeaconRecord> {
        self.inner.sweep();
        self.inner.table.snapshot()
    }

    pub fn status(&self) -> PositionStatus {
        let state = self.state();
        match state {
            EngineState::Destroyed => PositionStatus::Destroyed,
            EngineState::Failed => PositionStatus::Failed {
                reason: self
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown failure".to_string()),
            },
            EngineState::Scanning => match self.current_anchor() {
                Some(record) => PositionStatus::Located {
                    anchor: record.identity,
                    distance: record.latest_distance,
                },
                None => PositionStatus::NoBeaconsInRange,
            },
            EngineState::Idle if self.last_error() == Some(EngineError::PermissionDenied) => {
                PositionStatus::PermissionDenied
            }
            EngineState::Idle | EngineState::RequestingPermission | EngineState::Stopped => {
                PositionStatus::NotScanning
            }
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&PositionUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(callback)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.inner.bus.unsubscribe(handle)
    }

    /// Async stream of published updates.
    pub fn feed(&self) -> broadcast::Receiver<PositionUpdate> {
        self.inner.bus.feed()
    }

    fn spawn_sweeper(&self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("No tokio runtime, stale beacons are evicted on ingest and on read only");
                return;
            }
        };

        let period = self.inner.config.table.sweep_interval();
        let running = self.inner.running.clone();
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);

        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                inner.sweep();
            }
            debug!("Staleness sweeper stopped");
        });

        if let Some(previous) = lock(&self.inner.sweeper).replace(task) {
            previous.abort();
        }
        debug!("Staleness sweeper running every {:?}", period);
    }
}

impl EngineInner {
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, EngineState> {
        self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, EngineState> {
        self.lifecycle.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_anchor(&self) -> std::sync::RwLockReadGuard<'_, AnchorState> {
        self.anchor.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_anchor(&self) -> std::sync::RwLockWriteGuard<'_, AnchorState> {
        self.anchor.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> EngineState {
        *self.read_state()
    }

    fn record_error(&self, err: EngineError) -> EngineError {
        *lock(&self.last_error) = Some(err.clone());
        err
    }

    fn halt_sweeper(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = lock(&self.sweeper).take() {
            task.abort();
        }
    }

    /// Recompute the anchor from the table and decide whether to publish.
    /// The gate lock orders concurrent elections; admitted updates are
    /// numbered under it so the bus can deliver them in election order.
    fn reelect(&self, now: i64) -> Option<PositionUpdate> {
        let mut gate = lock(&self.gate);
        let beacons = self.table.snapshot();
        let next = anchor::recompute(&beacons);

        let previous = self.read_anchor().current_anchor.clone();
        if previous != next.current_anchor {
            match &next.current_anchor {
                Some(id) => info!(
                    "Anchor is now {} (~{})",
                    id,
                    next.anchor_record()
                        .map(|r| format_distance(r.latest_distance))
                        .unwrap_or_default()
                ),
                None => info!("No beacon in range, anchor cleared"),
            }
        }
        *self.write_anchor() = next.clone();

        if gate.admit(&next) {
            Some(PositionUpdate {
                anchor: next,
                beacons,
                published_at: now,
                sequence: gate.next_sequence(),
            })
        } else {
            None
        }
    }

    /// Publish unless the engine left `Scanning` meanwhile. Called with no
    /// engine lock held.
    fn publish(&self, update: &PositionUpdate) -> Option<PublishReport> {
        if self.state() != EngineState::Scanning {
            debug!("Engine no longer scanning, update discarded");
            return None;
        }
        let report = self.bus.publish(update);
        if !report.faults.is_empty() {
            warn!(
                "{} of {} subscribers failed",
                report.faults.len(),
                report.faults.len() + report.delivered
            );
        }
        Some(report)
    }

    /// Evictions only happen while scanning; a stopped engine keeps its last
    /// known position.
    fn sweep(&self) -> Option<PublishReport> {
        let now = self.clock.now_ms();
        let update = {
            let state = self.read_state();
            if *state != EngineState::Scanning {
                return None;
            }
            let evicted = self.table.evict_stale(now, self.config.table.max_age_ms);
            if evicted.is_empty() {
                return None;
            }
            info!("Evicted {} stale beacons", evicted.len());
            self.reelect(now)
        };
        update.and_then(|u| self.publish(&u))
    }
}
