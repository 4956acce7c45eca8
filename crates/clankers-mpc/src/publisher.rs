//! Policy publishing thread.
//!
//! The solver hands each finished [`PolicyPacket`] to [`PolicyPublisher::submit`],
//! which only swaps it into a pending slot and signals a condition variable. A
//! dedicated thread moves the pending packet to "current" and calls the transport
//! outside the lock, so solving never waits on I/O. The slot holds one packet:
//! a packet arriving while the transport is busy replaces the pending one, and only
//! the most recent completed solve is ever published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::solution::{PolicyPacket, SharedPacket};

/// Receives published policies.
///
/// `updated == false` means "no new policy, keep using the last one" and carries the
/// packet that is still current.
pub trait PolicyTransport: Send + 'static {
    fn publish(&mut self, packet: &PolicyPacket, updated: bool);
}

/// Shared shutdown flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<SharedPacket>,
    current: Option<SharedPacket>,
    last_published_id: Option<u64>,
    min_epoch: u64,
}

#[derive(Debug)]
struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
    token: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retire(&self, epoch: u64) {
        let mut slot = self.lock();
        slot.pending = None;
        slot.current = None;
        slot.min_epoch = slot.min_epoch.max(epoch);
    }
}

/// Cloneable handle retiring everything older than an epoch.
///
/// A packet the publishing thread has already handed to the transport is not recalled;
/// anything still pending is dropped and the heartbeat stops repeating the old policy.
#[derive(Clone, Debug)]
pub struct PublisherGate(Arc<Shared>);

impl PublisherGate {
    pub fn retire(&self, epoch: u64) {
        debug!(epoch, "retiring policies of older epochs");
        self.0.retire(epoch);
    }
}

/// Outcome of [`PolicyPublisher::submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// Stored as the pending packet.
    Queued,
    /// Stored, replacing a pending packet that was never published.
    Superseded { dropped: u64 },
    /// Older than what is pending or already published, or from a cleared epoch.
    Stale,
}

/// Owner of the publishing thread. Dropping it cancels and joins the thread.
#[derive(Debug)]
pub struct PolicyPublisher {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl PolicyPublisher {
    /// Spawn the publishing thread. With a `heartbeat`, the current packet is
    /// re-published with `updated == false` whenever no new packet arrives in time.
    pub fn spawn<T: PolicyTransport>(
        transport: T,
        heartbeat: Option<Duration>,
        token: CancellationToken,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::default()),
            ready: Condvar::new(),
            token,
        });
        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("policy-publisher".into())
            .spawn(move || publish_loop(&worker, transport, heartbeat))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Offer a finished solve for publication. Never blocks on the transport.
    pub fn submit(&self, packet: SharedPacket) -> Submission {
        let mut slot = self.shared.lock();
        let newest = slot
            .pending
            .as_ref()
            .map(|p| p.solve_id)
            .max(slot.last_published_id);
        if packet.epoch < slot.min_epoch || newest.is_some_and(|id| packet.solve_id <= id) {
            debug!(solve_id = packet.solve_id, epoch = packet.epoch, "dropping stale policy");
            return Submission::Stale;
        }
        let replaced = slot.pending.replace(packet);
        drop(slot);
        self.shared.ready.notify_one();
        match replaced {
            Some(old) => {
                warn!(solve_id = old.solve_id, "unpublished policy superseded");
                Submission::Superseded { dropped: old.solve_id }
            }
            None => Submission::Queued,
        }
    }

    /// Forget pending and current packets and refuse packets older than `epoch`.
    pub fn clear(&self, epoch: u64) {
        self.shared.retire(epoch);
    }

    /// Handle that can [`clear`](Self::clear) from another thread without owning the publisher.
    pub fn gate(&self) -> PublisherGate {
        PublisherGate(Arc::clone(&self.shared))
    }

    /// Packet most recently handed to the transport.
    pub fn current(&self) -> Option<SharedPacket> {
        self.shared.lock().current.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    /// Cancel the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.token.cancel();
        {
            // Taking the lock orders the flag before the waiter's next check.
            let _slot = self.shared.lock();
            self.shared.ready.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("policy publisher thread panicked");
            }
        }
    }
}

impl Drop for PolicyPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish_loop<T: PolicyTransport>(shared: &Shared, mut transport: T, heartbeat: Option<Duration>) {
    loop {
        let (packet, updated) = {
            let mut slot = shared.lock();
            loop {
                if shared.token.is_cancelled() {
                    debug!("policy publisher stopping");
                    return;
                }
                let min_epoch = slot.min_epoch;
                if let Some(packet) = slot.pending.take().filter(|p| p.epoch >= min_epoch) {
                    slot.last_published_id = Some(packet.solve_id);
                    slot.current = Some(Arc::clone(&packet));
                    break (packet, true);
                }
                match heartbeat {
                    Some(period) => {
                        let (guard, timeout) = shared
                            .ready
                            .wait_timeout(slot, period)
                            .unwrap_or_else(PoisonError::into_inner);
                        slot = guard;
                        if timeout.timed_out() && slot.pending.is_none() && !shared.token.is_cancelled() {
                            if let Some(current) = slot.current.clone() {
                                break (current, false);
                            }
                        }
                    }
                    None => {
                        slot = shared.ready.wait(slot).unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        };
        trace!(solve_id = packet.solve_id, updated, "publishing policy");
        transport.publish(&packet, updated);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use clankers_core::types::{Observation, TargetTrajectory};
    use clankers_core::Mode;
    use nalgebra::dvector;

    use super::*;
    use crate::solution::{CommandData, LinearController, PrimalSolution};
    use crate::timeline::ModeTimeline;

    fn packet(solve_id: u64, epoch: u64) -> SharedPacket {
        let x = dvector![0.0];
        let u = dvector![0.0];
        Arc::new(PolicyPacket {
            solve_id,
            epoch,
            primal: PrimalSolution {
                times: vec![0.0],
                states: vec![x.clone()],
                inputs: vec![u.clone()],
                controller: LinearController::default(),
                timeline: ModeTimeline::default(),
            },
            command: CommandData {
                observation: Observation::new(0.0, x.clone(), u.clone(), Mode::STANCE),
                target: TargetTrajectory::constant(0.0, x, u),
                timeline: ModeTimeline::default(),
            },
        })
    }

    struct Channel(mpsc::Sender<(u64, bool)>);

    impl PolicyTransport for Channel {
        fn publish(&mut self, packet: &PolicyPacket, updated: bool) {
            let _ = self.0.send((packet.solve_id, updated));
        }
    }

    #[test]
    fn submitted_packet_is_published() {
        let (tx, rx) = mpsc::channel();
        let publisher = PolicyPublisher::spawn(Channel(tx), None, CancellationToken::new()).unwrap();
        assert_eq!(publisher.submit(packet(1, 0)), Submission::Queued);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (1, true));
        assert_eq!(publisher.current().unwrap().solve_id, 1);
    }

    #[test]
    fn stale_packets_are_rejected() {
        let (tx, rx) = mpsc::channel();
        let publisher = PolicyPublisher::spawn(Channel(tx), None, CancellationToken::new()).unwrap();
        publisher.submit(packet(5, 0));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(publisher.submit(packet(4, 0)), Submission::Stale);
        assert_eq!(publisher.submit(packet(5, 0)), Submission::Stale);
    }

    #[test]
    fn cleared_epoch_is_rejected() {
        let (tx, _rx) = mpsc::channel();
        let publisher = PolicyPublisher::spawn(Channel(tx), None, CancellationToken::new()).unwrap();
        publisher.clear(2);
        assert_eq!(publisher.submit(packet(1, 1)), Submission::Stale);
        assert_ne!(publisher.submit(packet(2, 2)), Submission::Stale);
    }

    #[test]
    fn heartbeat_republishes_current() {
        let (tx, rx) = mpsc::channel();
        let publisher =
            PolicyPublisher::spawn(Channel(tx), Some(Duration::from_millis(5)), CancellationToken::new()).unwrap();
        publisher.submit(packet(3, 0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (3, true));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (3, false));
    }

    #[test]
    fn gate_stops_heartbeat_of_retired_policy() {
        let (tx, rx) = mpsc::channel();
        let publisher =
            PolicyPublisher::spawn(Channel(tx), Some(Duration::from_millis(5)), CancellationToken::new()).unwrap();
        publisher.submit(packet(3, 0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (3, true));
        publisher.gate().retire(1);
        assert!(publisher.current().is_none());
        // At most one heartbeat can already be in flight.
        let _ = rx.recv_timeout(Duration::from_millis(20));
        while rx.try_recv().is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn drop_joins_the_thread_promptly() {
        let (tx, _rx) = mpsc::channel();
        let token = CancellationToken::new();
        let publisher = PolicyPublisher::spawn(Channel(tx), None, token.clone()).unwrap();
        let start = Instant::now();
        drop(publisher);
        assert!(token.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
