use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Breakpoint addresses shared between the request side and the engine thread.
///
/// Every mutation swaps in a whole new set, so a membership check on the
/// engine thread never sees a half-applied update.
#[derive(Clone, Default)]
pub struct Breakpoints {
    points: Arc<RwLock<Arc<HashSet<usize>>>>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Arc<HashSet<usize>> {
        match self.points.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn replace(&self, f: impl FnOnce(&mut HashSet<usize>)) {
        let mut guard = match self.points.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = HashSet::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    pub fn add(&self, addr: usize) {
        self.replace(|set| {
            set.insert(addr);
        });
        debug!(addr, "breakpoint set");
    }

    pub fn remove(&self, addr: usize) {
        self.replace(|set| {
            set.remove(&addr);
        });
        debug!(addr, "breakpoint removed");
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.current().contains(&addr)
    }

    /// Sorted copy of the current set.
    pub fn addresses(&self) -> Vec<usize> {
        let mut out: Vec<usize> = self.current().iter().copied().collect();
        out.sort_unstable();
        out
    }
}
