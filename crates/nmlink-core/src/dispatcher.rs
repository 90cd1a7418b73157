//! Push dispatcher
//!
//! Fans inbound frames that answer no pending request out to every matching
//! subscription. Each view registers its own subscriptions and removes them
//! with [`PushDispatcher::unsubscribe`] on teardown; registering never
//! disturbs other subscribers.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use hashbrown::HashMap;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::PushFrame;

type PushCallback = Arc<dyn Fn(&PushFrame) + Send + Sync>;

// ----------------------------------------------------------------------------
// Filters and Handles
// ----------------------------------------------------------------------------

/// Which push frames a subscription receives
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriptionFilter {
    /// Required frame kind (None = every kind)
    pub kind: Option<String>,
    /// Required device serial (None = every device)
    pub device_serial: Option<String>,
}

impl SubscriptionFilter {
    /// Match every push frame
    pub fn any() -> Self {
        Self::default()
    }

    /// Match frames of one kind from any device
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            device_serial: None,
        }
    }

    /// Narrow the filter to one device
    pub fn for_device(mut self, serial: impl Into<String>) -> Self {
        self.device_serial = Some(serial.into());
        self
    }

    /// Whether `frame` passes this filter
    pub fn matches(&self, frame: &PushFrame) -> bool {
        let kind_ok = self.kind.as_deref().map_or(true, |kind| kind == frame.kind);
        let device_ok = match &self.device_serial {
            None => true,
            Some(serial) => frame.device_serial.as_deref() == Some(serial.as_str()),
        };
        kind_ok && device_ok
    }
}

/// Token returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

struct Subscription {
    filter: SubscriptionFilter,
    callback: PushCallback,
}

// ----------------------------------------------------------------------------
// Push Dispatcher
// ----------------------------------------------------------------------------

/// Multi-subscriber registry for unsolicited frames
pub struct PushDispatcher {
    next_handle: AtomicU64,
    subscriptions: RwLock<HashMap<SubscriptionHandle, Subscription>>,
    stats: DispatchStats,
}

/// Counters kept by the dispatcher
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Frames handed to at least one subscriber
    pub delivered: AtomicU64,
    /// Frames nobody was subscribed to
    pub dropped: AtomicU64,
}

impl PushDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            subscriptions: RwLock::new(HashMap::new()),
            stats: DispatchStats::default(),
        }
    }

    /// Register a callback for frames matching `filter`
    pub fn subscribe<F>(&self, filter: SubscriptionFilter, callback: F) -> SubscriptionHandle
    where
        F: Fn(&PushFrame) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(
            "Subscription {} registered for kind={:?} device={:?}",
            handle.0, filter.kind, filter.device_serial
        );
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                handle,
                Subscription {
                    filter,
                    callback: Arc::new(callback),
                },
            );
        handle
    }

    /// Register a subscription that delivers into a channel
    ///
    /// Frames are dropped once the receiver goes away; callers should still
    /// unsubscribe the handle.
    pub fn subscribe_channel(
        &self,
        filter: SubscriptionFilter,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<PushFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(filter, move |frame| {
            let _ = tx.send(frame.clone());
        });
        (handle, rx)
    }

    /// Remove a subscription; returns false if it was already gone
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .is_some();
        if removed {
            debug!("Subscription {} removed", handle.0);
        }
        removed
    }

    /// Deliver `frame` to every matching subscription exactly once
    ///
    /// Returns the number of subscriptions invoked. Callbacks run after the
    /// registry lock is released, so they may subscribe or unsubscribe.
    pub fn dispatch(&self, frame: &PushFrame) -> usize {
        let targets: SmallVec<[PushCallback; 4]> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|subscription| subscription.filter.matches(frame))
            .map(|subscription| Arc::clone(&subscription.callback))
            .collect();

        if targets.is_empty() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "No subscriber for push frame kind={} device={:?}",
                frame.kind, frame.device_serial
            );
            return 0;
        }

        for callback in &targets {
            callback(frame);
        }
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        targets.len()
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Dispatch counters
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

impl Default for PushDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InboundFrame;
    use std::sync::atomic::AtomicUsize;

    fn push(text: &str) -> PushFrame {
        PushFrame::from(InboundFrame::parse(text).unwrap())
    }

    fn counter(dispatcher: &PushDispatcher, filter: SubscriptionFilter) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        dispatcher.subscribe(filter, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_subscribers_do_not_replace_each_other() {
        let dispatcher = PushDispatcher::new();
        let first = counter(&dispatcher, SubscriptionFilter::kind("gis_update_data"));
        let second = counter(&dispatcher, SubscriptionFilter::kind("gis_update_data"));

        let delivered = dispatcher.dispatch(&push(r#"{"type":"gis_update_data","data":[]}"#));
        assert_eq!(delivered, 2);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = PushDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        let handle = dispatcher.subscribe(SubscriptionFilter::any(), move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&push(r#"{"type":"ship_update"}"#));
        assert!(dispatcher.unsubscribe(handle));
        assert!(!dispatcher.unsubscribe(handle));
        dispatcher.dispatch(&push(r#"{"type":"ship_update"}"#));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.subscription_count(), 0);
    }

    #[test]
    fn test_frames_without_subscribers_are_dropped() {
        let dispatcher = PushDispatcher::new();
        assert_eq!(dispatcher.dispatch(&push(r#"{"type":"ship_delete"}"#)), 0);
        assert_eq!(dispatcher.stats().dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let dispatcher = Arc::new(PushDispatcher::new());
        let slot: Arc<std::sync::Mutex<Option<SubscriptionHandle>>> = Default::default();

        let registry = Arc::clone(&dispatcher);
        let own = Arc::clone(&slot);
        let handle = dispatcher.subscribe(SubscriptionFilter::any(), move |_| {
            if let Some(handle) = own.lock().unwrap().take() {
                registry.unsubscribe(handle);
            }
        });
        *slot.lock().unwrap() = Some(handle);

        assert_eq!(dispatcher.dispatch(&push(r#"{"type":"terminal_update"}"#)), 1);
        assert_eq!(dispatcher.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let dispatcher = PushDispatcher::new();
        let (_handle, mut rx) =
            dispatcher.subscribe_channel(SubscriptionFilter::kind("latest_report_data"));

        dispatcher.dispatch(&push(r#"{"type":"latest_report_data","sn":"A"}"#));
        dispatcher.dispatch(&push(r#"{"type":"ship_update"}"#));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.device_serial.as_deref(), Some("A"));
        assert!(rx.try_recv().is_err());
    }
}
