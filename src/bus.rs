//! Fan-out of position updates to consumers.
//!
//! Two delivery paths share every publication:
//!
//! - Callbacks registered with [`SubscriptionBus::subscribe`], invoked
//!   synchronously in registration order. A callback that errors or panics is
//!   reported as a [`EngineError::SubscriberFault`] and delivery continues.
//! - An async [`broadcast`] feed for consumers living on a tokio runtime.
//!   Slow feed receivers lag and skip; they never block publication.
//!
//! Both paths deliver in [`PositionUpdate::sequence`] order. Concurrent
//! publishers may reach a subscriber out of order; an update older than one
//! the subscriber already got is dropped. While a callback runs, newer updates
//! for it are parked in its mailbox (latest wins) and handed over by the
//! thread already delivering, so a callback never runs twice at once and no
//! lock is held while it runs.

use crate::config::{PublishConfig, PublishPolicy};
use crate::error::EngineError;
use crate::model::{AnchorState, BeaconIdentity, PositionUpdate};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Opaque token returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Callback = Arc<dyn Fn(&PositionUpdate) -> anyhow::Result<()> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of one publication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReport {
    pub delivered: usize,
    pub faults: Vec<EngineError>,
    /// Subscribers that already had a newer update.
    pub superseded: usize,
    /// Subscribers busy with an earlier update; the thread delivering to
    /// them picks this one up.
    pub queued: usize,
}

#[derive(Default)]
struct Mailbox {
    last_sequence: Option<u64>,
    pending: Option<PositionUpdate>,
    delivering: bool,
}

#[derive(Clone)]
struct Subscriber {
    handle: SubscriptionHandle,
    callback: Callback,
    mailbox: Arc<Mutex<Mailbox>>,
}

impl Subscriber {
    fn deliver(&self, update: &PositionUpdate, report: &mut PublishReport) {
        let mut mailbox = lock(&self.mailbox);
        if mailbox
            .last_sequence
            .is_some_and(|last| update.sequence <= last)
        {
            debug!(
                "Subscriber {} already has a newer update than {}",
                self.handle, update.sequence
            );
            report.superseded += 1;
            return;
        }
        mailbox.last_sequence = Some(update.sequence);
        mailbox.pending = Some(update.clone());
        if mailbox.delivering {
            report.queued += 1;
            return;
        }

        mailbox.delivering = true;
        loop {
            let Some(next) = mailbox.pending.take() else {
                break;
            };
            drop(mailbox);
            self.invoke(&next, report);
            mailbox = lock(&self.mailbox);
        }
        mailbox.delivering = false;
    }

    fn invoke(&self, update: &PositionUpdate, report: &mut PublishReport) {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.callback)(update)));
        let reason = match outcome {
            Ok(Ok(())) => {
                report.delivered += 1;
                return;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };

        warn!("Subscriber {} failed: {}", self.handle, reason);
        report.faults.push(EngineError::SubscriberFault {
            subscription: self.handle,
            reason,
        });
    }
}

pub struct SubscriptionBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_handle: AtomicU64,
    feed: broadcast::Sender<PositionUpdate>,
    feed_sequence: Mutex<Option<u64>>,
}

impl Default for SubscriptionBus {
    fn default() -> Self {
        SubscriptionBus::new(64)
    }
}

impl SubscriptionBus {
    pub fn new(feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        SubscriptionBus {
            subscribers: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            feed,
            feed_sequence: Mutex::new(None),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&PositionUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                handle,
                callback: Arc::new(callback),
                mailbox: Arc::new(Mutex::new(Mailbox::default())),
            });
        debug!("Subscriber {} registered", handle);
        handle
    }

    /// Returns false if the handle was unknown (already removed or cleared).
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.handle != handle);
        before != subscribers.len()
    }

    /// Async receiver of every published update.
    pub fn feed(&self) -> broadcast::Receiver<PositionUpdate> {
        self.feed.subscribe()
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Deliver `update` to every subscriber. The subscriber list is copied
    /// before delivery, so callbacks may subscribe or unsubscribe freely.
    pub fn publish(&self, update: &PositionUpdate) -> PublishReport {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut report = PublishReport::default();
        for subscriber in &subscribers {
            subscriber.deliver(update, &mut report);
        }

        let mut last = lock(&self.feed_sequence);
        if last.map_or(true, |seq| update.sequence > seq) {
            *last = Some(update.sequence);
            // No receivers is not an error
            let _ = self.feed.send(update.clone());
        }
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Decides whether a freshly elected [`AnchorState`] is worth publishing.
#[derive(Debug, Clone)]
pub struct PublishGate {
    config: PublishConfig,
    last: Option<(Option<BeaconIdentity>, Option<f64>)>,
    next_sequence: u64,
}

impl PublishGate {
    pub fn new(config: PublishConfig) -> Self {
        PublishGate {
            config,
            last: None,
            next_sequence: 1,
        }
    }

    /// Returns true (and remembers `next`) when consumers should hear about it.
    pub fn admit(&mut self, next: &AnchorState) -> bool {
        let anchor = next.current_anchor.clone();
        let meters = next.anchor_meters();

        let publish = match (self.config.policy, &self.last) {
            (PublishPolicy::Always, _) => true,
            // Nothing published yet: only a real anchor is news
            (PublishPolicy::OnChange, None) => anchor.is_some(),
            (PublishPolicy::OnChange, Some((last_anchor, last_meters))) => {
                if *last_anchor != anchor {
                    true
                } else {
                    match (last_meters, meters) {
                        (Some(a), Some(b)) => (a - b).abs() > self.config.min_distance_delta_m,
                        _ => false,
                    }
                }
            }
        };

        if publish {
            self.last = Some((anchor, meters));
        }
        publish
    }

    /// Sequence number for the next admitted update. Survives `reset`, so
    /// subscribers that outlive a restart keep accepting updates.
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BeaconRecord, Distance, SignalSample};
    use std::sync::mpsc;
    use std::thread;

    static SEQUENCE: AtomicU64 = AtomicU64::new(1);

    fn update(anchor_minor: Option<u16>, meters: f64) -> PositionUpdate {
        sequenced(anchor_minor, meters, SEQUENCE.fetch_add(1, Ordering::SeqCst))
    }

    fn sequenced(anchor_minor: Option<u16>, meters: f64, sequence: u64) -> PositionUpdate {
        let candidates: Vec<BeaconRecord> = anchor_minor
            .map(|minor| {
                let identity = BeaconIdentity::new("ns", 1, minor);
                vec![BeaconRecord {
                    identity: identity.clone(),
                    latest_sample: SignalSample::new(identity, -60.0, 0),
                    latest_distance: Distance::Meters(meters),
                    last_seen_at: 0,
                }]
            })
            .unwrap_or_default();
        PositionUpdate {
            anchor: AnchorState {
                current_anchor: candidates.first().map(|r| r.identity.clone()),
                candidates: candidates.clone(),
            },
            beacons: candidates,
            published_at: 0,
            sequence,
        }
    }

    #[test]
    fn test_subscribe_publish_unsubscribe() {
        let bus = SubscriptionBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let handle = bus.subscribe(move |u| {
            s.lock().unwrap().push(u.anchor.current_anchor.clone());
            Ok(())
        });
        assert_eq!(bus.len(), 1);

        let report = bus.publish(&update(Some(1), 1.0));
        assert_eq!(report.delivered, 1);
        assert!(report.faults.is_empty());

        assert!(bus.unsubscribe(handle));
        assert!(!bus.unsubscribe(handle));
        bus.publish(&update(Some(2), 1.0));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_faulty_subscribers_are_isolated() {
        let bus = SubscriptionBus::default();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let failing = bus.subscribe(|_| anyhow::bail!("map view not ready"));
        let panicking = bus.subscribe(|_| panic!("compass exploded"));
        let c = count.clone();
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = bus.publish(&update(Some(1), 1.0));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.faults.len(), 2);
        assert!(matches!(
            &report.faults[0],
            EngineError::SubscriberFault { subscription, reason }
                if *subscription == failing && reason == "map view not ready"
        ));
        assert!(matches!(
            &report.faults[1],
            EngineError::SubscriberFault { subscription, reason }
                if *subscription == panicking && reason.contains("compass exploded")
        ));
    }

    #[test]
    fn test_unsubscribe_during_publish() {
        let bus = Arc::new(SubscriptionBus::default());
        let count = Arc::new(AtomicU64::new(0));

        let handle_slot = Arc::new(Mutex::new(None));
        let (b, slot) = (bus.clone(), handle_slot.clone());
        let first = bus.subscribe(move |_| {
            if let Some(h) = slot.lock().unwrap().take() {
                b.unsubscribe(h);
            }
            Ok(())
        });
        *handle_slot.lock().unwrap() = Some(first);

        let c = count.clone();
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(&update(Some(1), 1.0));
        bus.publish(&update(Some(1), 1.0));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bus.len(), 1);
    }

    fn minors(seen: &Mutex<Vec<PositionUpdate>>) -> Vec<Option<u16>> {
        seen.lock()
            .unwrap()
            .iter()
            .map(|u| u.anchor.current_anchor.as_ref().map(|id| id.minor))
            .collect()
    }

    #[test]
    fn test_older_update_is_dropped() {
        let bus = SubscriptionBus::new(4);
        let mut rx = bus.feed();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(move |u| {
            s.lock().unwrap().push(u.clone());
            Ok(())
        });

        bus.publish(&sequenced(Some(2), 1.0, 20));
        let report = bus.publish(&sequenced(Some(1), 1.0, 10));
        assert_eq!(report.delivered, 0);
        assert_eq!(report.superseded, 1);
        assert_eq!(minors(&seen), vec![Some(2)]);

        assert_eq!(rx.try_recv().unwrap().sequence, 20);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_busy_subscriber_gets_latest_after_current_callback() {
        let bus = Arc::new(SubscriptionBus::default());
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);

        let slow_seen = Arc::new(Mutex::new(Vec::new()));
        let s = slow_seen.clone();
        bus.subscribe(move |u| {
            s.lock().unwrap().push(u.clone());
            if u.sequence == 1 {
                entered_tx.lock().unwrap().send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
            Ok(())
        });
        let fast_seen = Arc::new(Mutex::new(Vec::new()));
        let s = fast_seen.clone();
        bus.subscribe(move |u| {
            s.lock().unwrap().push(u.clone());
            Ok(())
        });

        let b = bus.clone();
        let first = thread::spawn(move || b.publish(&sequenced(Some(1), 3.0, 1)));
        entered_rx.recv().unwrap();

        let report = bus.publish(&sequenced(Some(2), 1.0, 2));
        assert_eq!(report.queued, 1);
        assert_eq!(report.delivered, 1);

        release_tx.send(()).unwrap();
        let report = first.join().unwrap();
        assert_eq!(report.superseded, 1);

        assert_eq!(minors(&slow_seen), vec![Some(1), Some(2)]);
        assert_eq!(minors(&fast_seen), vec![Some(2)]);
    }

    #[test]
    fn test_reentrant_publish_is_delivered_after_callback() {
        let bus = Arc::new(SubscriptionBus::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (b, s) = (bus.clone(), seen.clone());
        bus.subscribe(move |u| {
            s.lock().unwrap().push(u.clone());
            if u.sequence == 1 {
                b.publish(&sequenced(Some(2), 1.0, 2));
            }
            Ok(())
        });

        let report = bus.publish(&sequenced(Some(1), 1.0, 1));
        assert_eq!(report.delivered, 2);
        assert_eq!(minors(&seen), vec![Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_feed_receives_updates() {
        let bus = SubscriptionBus::new(4);
        let mut rx = bus.feed();
        bus.publish(&update(Some(3), 2.0));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.anchor.current_anchor.unwrap().minor, 3);
    }

    #[test]
    fn test_gate_on_change() {
        let mut gate = PublishGate::new(PublishConfig::default());

        assert!(!gate.admit(&update(None, 0.0).anchor));
        assert!(gate.admit(&update(Some(1), 2.0).anchor));
        // Same anchor, small jitter
        assert!(!gate.admit(&update(Some(1), 2.3).anchor));
        assert!(!gate.admit(&update(Some(1), 2.45).anchor));
        // Drift measured from the last published distance
        assert!(gate.admit(&update(Some(1), 2.6).anchor));
        assert!(gate.admit(&update(Some(2), 2.6).anchor));
        assert!(gate.admit(&update(None, 0.0).anchor));
        assert!(!gate.admit(&update(None, 0.0).anchor));
    }

    #[test]
    fn test_gate_always() {
        let mut gate = PublishGate::new(PublishConfig {
            policy: PublishPolicy::Always,
            ..Default::default()
        });
        assert!(gate.admit(&update(None, 0.0).anchor));
        assert!(gate.admit(&update(Some(1), 2.0).anchor));
        assert!(gate.admit(&update(Some(1), 2.0).anchor));
    }

    #[test]
    fn test_gate_sequence_survives_reset() {
        let mut gate = PublishGate::new(PublishConfig::default());
        assert_eq!(gate.next_sequence(), 1);
        assert_eq!(gate.next_sequence(), 2);
        gate.reset();
        assert_eq!(gate.next_sequence(), 3);
    }
}
