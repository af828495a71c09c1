//! Peer readiness signal used by the startup checkpoint.
//!
//! One producer (the link event handler) publishes attach/detach events; the
//! boot sequencer polls the shared flag at a fixed interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::error::OtaError;

/// Something the checkpoint can poll.
pub trait Readiness {
    fn is_ready(&self) -> bool;
}

/// Link event from the network side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Attached { peer: String, aid: u16 },
    Detached { peer: String, aid: u16 },
}

/// Consumer side of the readiness flag.
#[derive(Debug, Clone, Default)]
pub struct PeerSignal {
    ready: Arc<AtomicBool>,
}

/// Producer side of the readiness flag.
#[derive(Debug, Clone)]
pub struct PeerNotifier {
    ready: Arc<AtomicBool>,
}

impl PeerSignal {
    /// A fresh, unset signal and the notifier that drives it.
    pub fn pair() -> (PeerSignal, PeerNotifier) {
        let ready = Arc::new(AtomicBool::new(false));
        (
            PeerSignal {
                ready: ready.clone(),
            },
            PeerNotifier { ready },
        )
    }
}

impl Readiness for PeerSignal {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl PeerNotifier {
    pub fn notify(&self, event: &PeerEvent) {
        match event {
            PeerEvent::Attached { peer, aid } => {
                info!(peer = %peer, aid, "Peer attached");
                self.ready.store(true, Ordering::Release);
            }
            PeerEvent::Detached { peer, aid } => {
                info!(peer = %peer, aid, "Peer detached");
                self.ready.store(false, Ordering::Release);
            }
        }
    }
}

/// Poll `readiness` up to `max_polls` times, `interval` apart.
///
/// Returns the number of polls taken.
pub fn wait_for_peer<R: Readiness + ?Sized>(
    readiness: &R,
    max_polls: u32,
    interval: Duration,
) -> Result<u32, OtaError> {
    for attempt in 1..=max_polls {
        if readiness.is_ready() {
            info!(polls = attempt, "Peer connected");
            return Ok(attempt);
        }
        info!("Waiting for peer to connect... ({}/{})", attempt, max_polls);
        thread::sleep(interval);
    }
    Err(OtaError::ConnectivityTimeout { polls: max_polls })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct ReadyAfter {
        polls: Cell<u32>,
        after: u32,
    }

    impl Readiness for ReadyAfter {
        fn is_ready(&self) -> bool {
            self.polls.set(self.polls.get() + 1);
            self.polls.get() > self.after
        }
    }

    #[test]
    fn test_ready_within_budget() {
        let r = ReadyAfter {
            polls: Cell::new(0),
            after: 3,
        };
        assert_eq!(wait_for_peer(&r, 30, Duration::ZERO).unwrap(), 4);
    }

    #[test]
    fn test_timeout() {
        let (signal, _notifier) = PeerSignal::pair();
        assert_eq!(
            wait_for_peer(&signal, 5, Duration::ZERO),
            Err(OtaError::ConnectivityTimeout { polls: 5 })
        );
    }

    #[test]
    fn test_detach_clears_signal() {
        let (signal, notifier) = PeerSignal::pair();
        let peer = "aa:bb:cc:dd:ee:ff".to_string();

        notifier.notify(&PeerEvent::Attached {
            peer: peer.clone(),
            aid: 1,
        });
        assert!(signal.is_ready());

        notifier.notify(&PeerEvent::Detached { peer, aid: 1 });
        assert!(!signal.is_ready());
    }
}
