use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_DEAD_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle events pushed to observers. Errors never travel this way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Step {
        pc: usize,
    },
    Breakpoint {
        pc: usize,
    },
    Exit {
        status: String,
        return_value: Vec<u8>,
        gas_used: u64,
        error: Option<String>,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Step { .. } => "step",
            Notification::Breakpoint { .. } => "breakpoint",
            Notification::Exit { .. } => "exit",
        }
    }
}

pub type ObserverId = u64;

struct Observer {
    tx: Sender<Notification>,
    last_seen: Instant,
}

#[derive(Default)]
struct Inner {
    next_id: ObserverId,
    observers: HashMap<ObserverId, Observer>,
}

/// Process-wide set of notification subscribers.
///
/// Observers register on connect and are dropped on unregister, when their
/// receiving end goes away, or when `reap` finds they have not answered a
/// liveness probe within the dead interval.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self) -> (ObserverId, Receiver<Notification>) {
        let (tx, rx) = channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.observers.insert(
            id,
            Observer {
                tx,
                last_seen: Instant::now(),
            },
        );
        info!(observer = id, "observer registered");
        (id, rx)
    }

    pub fn unregister(&self, id: ObserverId) {
        if self.lock().observers.remove(&id).is_some() {
            info!(observer = id, "observer unregistered");
        }
    }

    /// Liveness echo. Returns false for unknown observers.
    pub fn probe(&self, id: ObserverId) -> bool {
        match self.lock().observers.get_mut(&id) {
            Some(observer) => {
                observer.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Deliver to every observer once; observers whose receiver is gone are dropped.
    pub fn broadcast(&self, notification: &Notification) {
        let mut inner = self.lock();
        inner.observers.retain(|id, observer| {
            let delivered = observer.tx.send(notification.clone()).is_ok();
            if !delivered {
                debug!(observer = id, "observer channel closed");
            }
            delivered
        });
    }

    /// Drop observers silent for longer than `dead_interval`.
    pub fn reap(&self, dead_interval: Duration) -> Vec<ObserverId> {
        let now = Instant::now();
        let mut dropped = Vec::new();
        self.lock().observers.retain(|&id, observer| {
            let alive = now.duration_since(observer.last_seen) <= dead_interval;
            if !alive {
                dropped.push(id);
            }
            alive
        });
        for id in &dropped {
            info!(observer = id, "observer timed out");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
