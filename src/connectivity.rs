//! Process-wide connectivity state and event fan-out.
//!
//! The monitor owns a single boolean and a listener set. Host integration
//! feeds transitions in through [`ConnectivityMonitor::set_online`] and
//! [`ConnectivityMonitor::set_offline`]; the sync engine and the client
//! façade publish their events through [`ConnectivityMonitor::emit`] so the
//! UI needs exactly one subscription.
//!
//! Event delivery is synchronous and in registration order. A listener that
//! panics is caught and logged; it never takes the emitter down. Listeners
//! must not subscribe or unsubscribe from inside a callback.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::{info, warn};

use crate::events::OfflineEvent;

type Listener = Box<dyn Fn(&OfflineEvent) + Send + Sync + 'static>;

pub struct ConnectivityMonitor {
    online: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

/// Handle returned by [`ConnectivityMonitor::subscribe`]. Dropping it (or
/// calling [`Subscription::unsubscribe`]) removes the listener.
pub struct Subscription {
    id: u64,
    monitor: Weak<ConnectivityMonitor>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl ConnectivityMonitor {
    /// The initial state comes from the host environment's view of the
    /// network at construction time.
    pub fn new(initially_online: bool) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(initially_online),
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_offline(&self) -> bool {
        !self.is_online()
    }

    /// Records a transition to online. Emits exactly one `online` event per
    /// transition; repeated calls while already online are no-ops.
    pub fn set_online(&self) {
        if !self.online.swap(true, Ordering::SeqCst) {
            info!("connectivity restored");
            self.emit(&OfflineEvent::Online);
        }
    }

    /// Records a transition to offline. No automatic action beyond the event.
    pub fn set_offline(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            warn!("connectivity lost");
            self.emit(&OfflineEvent::Offline);
        }
    }

    /// Registers a listener for all events flowing through the monitor.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&OfflineEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Box::new(listener)));
        Subscription { id, monitor: Arc::downgrade(self) }
    }

    /// Delivers an event to every listener, in registration order.
    pub fn emit(&self, event: &OfflineEvent) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, listener) in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("listener {id} panicked while handling '{}' event", event.kind());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(monitor: &Arc<ConnectivityMonitor>) -> (Subscription, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = monitor.subscribe(move |event| {
            sink.lock().unwrap().push(event.kind().to_string());
        });
        (sub, seen)
    }

    #[test]
    fn initial_state_comes_from_host() {
        assert!(ConnectivityMonitor::new(true).is_online());
        assert!(ConnectivityMonitor::new(false).is_offline());
    }

    #[test]
    fn transitions_emit_once() {
        let monitor = ConnectivityMonitor::new(true);
        let (_sub, seen) = collector(&monitor);

        monitor.set_online(); // already online, no event
        monitor.set_offline();
        monitor.set_offline(); // already offline, no event
        monitor.set_online();

        assert_eq!(*seen.lock().unwrap(), vec!["offline", "online"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let monitor = ConnectivityMonitor::new(true);
        let (sub, seen) = collector(&monitor);

        monitor.set_offline();
        sub.unsubscribe();
        monitor.set_online();

        assert_eq!(*seen.lock().unwrap(), vec!["offline"]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let monitor = ConnectivityMonitor::new(true);
        let (sub, seen) = collector(&monitor);
        drop(sub);
        monitor.set_offline();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_listener_does_not_poison_delivery() {
        let monitor = ConnectivityMonitor::new(true);
        let _bad = monitor.subscribe(|_| panic!("listener bug"));
        let (_sub, seen) = collector(&monitor);

        monitor.set_offline();

        assert_eq!(*seen.lock().unwrap(), vec!["offline"]);
        assert!(monitor.is_offline());
    }

    #[test]
    fn listeners_receive_forwarded_events() {
        let monitor = ConnectivityMonitor::new(true);
        let (_sub, seen) = collector(&monitor);
        monitor.emit(&OfflineEvent::SyncStart);
        monitor.emit(&OfflineEvent::SyncComplete {
            success: true,
            success_count: 2,
            failure_count: 0,
            error: None,
        });
        assert_eq!(*seen.lock().unwrap(), vec!["syncStart", "syncComplete"]);
    }
}
