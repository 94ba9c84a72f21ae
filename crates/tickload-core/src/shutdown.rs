use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Capacity of the control channel; extra signals beyond it are dropped.
pub const CONTROL_CAPACITY: usize = 3;

/// Run lifecycle: `Running -> Draining -> Exited`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Exited,
}

/// Stop flag read by every worker once per tick, set once by the aggregator.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<RwLock<bool>>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        *self.0.read()
    }

    /// Set the flag. Returns true only for the call that flipped it.
    pub fn trigger(&self) -> bool {
        let mut set = self.0.write();
        let first = !*set;
        *set = true;
        first
    }
}

/// Countdown of live workers.
#[derive(Debug, Clone)]
pub struct Latch {
    remaining: Arc<watch::Sender<usize>>,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        let (remaining, _) = watch::channel(count);
        Self {
            remaining: Arc::new(remaining),
        }
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    pub fn count_down(&self) {
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Counts down when dropped, so a worker is released on every exit path.
    pub fn guard(&self) -> LatchGuard {
        LatchGuard(self.clone())
    }

    /// Resolve once every worker has counted down.
    pub async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

pub struct LatchGuard(Latch);

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

/// Why the event loop should start draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Operator interrupt
    Interrupt,
    /// Internal stop: iteration or request cap reached
    Cleanup,
}

/// Cloneable handle that asks the aggregator to shut down.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger(mpsc::Sender<Control>);

impl ShutdownTrigger {
    pub fn interrupt(&self) {
        self.send(Control::Interrupt);
    }

    pub fn cleanup(&self) {
        self.send(Control::Cleanup);
    }

    fn send(&self, control: Control) {
        // Full means a shutdown request is already queued.
        let _ = self.0.try_send(control);
    }
}

pub fn control_channel() -> (ShutdownTrigger, mpsc::Receiver<Control>) {
    let (tx, rx) = mpsc::channel(CONTROL_CAPACITY);
    (ShutdownTrigger(tx), rx)
}

/// Wait for the workers off the event loop and report when they are gone.
///
/// The event loop must keep consuming results meanwhile: a worker blocked on a
/// full result channel would never observe the flag otherwise.
pub fn spawn_drain_waiter(latch: Latch) -> oneshot::Receiver<()> {
    let (done, drained) = oneshot::channel();
    tokio::spawn(async move {
        latch.wait().await;
        let _ = done.send(());
    });
    drained
}

/// Forward Ctrl-C presses to `trigger` for the life of the process.
pub fn forward_interrupts(trigger: ShutdownTrigger) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Unable to listen for interrupts: {}", e);
                return;
            }
            info!("Interrupt received");
            trigger.interrupt();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_flag_flips_once() {
        let flag = ShutdownFlag::new();
        let reader = flag.clone();
        assert!(!reader.is_set());
        assert!(flag.trigger());
        assert!(reader.is_set());
        assert!(!flag.trigger());
        assert!(reader.is_set());
    }

    #[tokio::test]
    async fn test_latch_releases_at_zero() {
        let latch = Latch::new(2);
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };

        latch.count_down();
        assert_eq!(latch.remaining(), 1);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(latch.guard());
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("latch should release")
            .unwrap();
        assert_eq!(latch.remaining(), 0);
    }

    #[tokio::test]
    async fn test_latch_zero_is_immediately_open() {
        timeout(Duration::from_millis(100), Latch::new(0).wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_waiter_fires() {
        let latch = Latch::new(1);
        let drained = spawn_drain_waiter(latch.clone());
        latch.count_down();
        timeout(Duration::from_secs(1), drained)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_extra_controls_are_dropped() {
        let (trigger, mut rx) = control_channel();
        for _ in 0..10 {
            trigger.interrupt();
        }
        trigger.cleanup();
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CONTROL_CAPACITY);
    }
}
