//! Change coalescing.
//!
//! Many region mutations inside one logical update cycle must collapse
//! into exactly one rasterization and one ready signal. The scheduler
//! keeps a pending flag (the dedupe key is the composite identity; one
//! scheduler per composite) plus a count of outstanding asynchronous
//! resolutions. The cycle fires when the flag is set and the count
//! drops to zero. A rejected resolution still settles and unblocks the
//! cycle; it just means that region's contribution did not advance.

use tokio::sync::watch;

/// The coalesced "all pending updates for this composite have settled
/// and the artifact is current" notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadySignal {
    pub composite_id: String,
    pub version: u64,
}

#[derive(Debug)]
pub struct ChangeScheduler {
    composite_id: String,
    pending: bool,
    outstanding: usize,
    tx: watch::Sender<ReadySignal>,
    rx: watch::Receiver<ReadySignal>,
}

impl ChangeScheduler {
    pub fn new(composite_id: impl Into<String>) -> Self {
        let composite_id = composite_id.into();
        let (tx, rx) = watch::channel(ReadySignal {
            composite_id: composite_id.clone(),
            version: 0,
        });
        Self {
            composite_id,
            pending: false,
            outstanding: 0,
            tx,
            rx,
        }
    }

    /// Register one effective mutation: marks the cycle pending and
    /// adds an outstanding resolution. Repeated calls while pending
    /// extend the same cycle.
    pub fn begin(&mut self) {
        self.pending = true;
        self.outstanding += 1;
        tracing::debug!(
            composite = %self.composite_id,
            outstanding = self.outstanding,
            "update scheduled"
        );
    }

    /// Settle one resolution (success or failure). Returns true when
    /// the coalesced cycle should fire now; the pending flag is cleared
    /// so the fire happens exactly once.
    pub fn settle(&mut self) -> bool {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 && self.pending {
            self.pending = false;
            return true;
        }
        false
    }

    /// Publish the ready signal for a freshly rendered version.
    pub fn fire(&mut self, version: u64) {
        tracing::debug!(composite = %self.composite_id, version, "ready");
        self.tx.send_replace(ReadySignal {
            composite_id: self.composite_id.clone(),
            version,
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadySignal> {
        self.rx.clone()
    }

    pub fn composite_id(&self) -> &str {
        &self.composite_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_of_updates_fires_once() {
        let mut sched = ChangeScheduler::new("t");
        sched.begin();
        sched.begin();
        sched.begin();

        assert!(!sched.settle());
        assert!(!sched.settle());
        assert!(sched.settle());
        // The cycle already fired; a stray settle never re-fires it.
        assert!(!sched.settle());
    }

    #[test]
    fn mutation_during_pending_cycle_extends_it() {
        let mut sched = ChangeScheduler::new("t");
        sched.begin();
        sched.begin();
        assert!(!sched.settle());
        sched.begin();
        assert!(!sched.settle());
        assert!(sched.settle());
    }

    #[test]
    fn next_cycle_fires_independently() {
        let mut sched = ChangeScheduler::new("t");
        sched.begin();
        assert!(sched.settle());
        sched.begin();
        assert!(sched.settle());
    }

    #[test]
    fn fire_publishes_to_subscribers() {
        let mut sched = ChangeScheduler::new("t");
        let rx = sched.subscribe();
        sched.begin();
        assert!(sched.settle());
        sched.fire(1);
        let got = rx.borrow().clone();
        assert_eq!(
            got,
            ReadySignal {
                composite_id: "t".to_string(),
                version: 1
            }
        );
    }
}
