use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

/// Armed by the waiting side, fired once by the engine side.
pub struct GateSender<T> {
    tx: SyncSender<T>,
}

pub struct GateReceiver<T> {
    rx: Receiver<T>,
}

pub fn gate<T>() -> (GateSender<T>, GateReceiver<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (GateSender { tx }, GateReceiver { rx })
}

impl<T> GateSender<T> {
    /// Consumes the sender; a gate fires at most once.
    pub fn fire(self, value: T) {
        let _ = self.tx.send(value);
    }
}

impl<T> GateReceiver<T> {
    /// `None` if the sender was dropped without firing.
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// `Err(self)` on timeout so the caller can keep waiting later.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Option<T>, GateReceiver<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fires_across_threads() {
        let (tx, rx) = gate();
        let handle = thread::spawn(move || tx.fire(7u32));
        assert_eq!(rx.wait(), Some(7));
        handle.join().expect("firing thread panicked");
    }

    #[test]
    fn test_dropped_sender_releases_waiter() {
        let (tx, rx) = gate::<u32>();
        drop(tx);
        assert_eq!(rx.wait(), None);
    }

    #[test]
    fn test_timeout_hands_back_receiver() {
        let (tx, rx) = gate::<u32>();
        let rx = match rx.wait_timeout(Duration::from_millis(10)) {
            Err(rx) => rx,
            Ok(_) => panic!("gate should not have fired"),
        };
        tx.fire(1);
        assert_eq!(rx.wait(), Some(1));
    }
}
