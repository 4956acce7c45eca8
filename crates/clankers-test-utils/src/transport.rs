//! Policy transports that record what the publisher hands them.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use clankers_mpc::publisher::PolicyTransport;
use clankers_mpc::solution::PolicyPacket;

/// One `publish` call.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishRecord {
    pub solve_id: u64,
    pub epoch: u64,
    pub updated: bool,
    pub init_time: f64,
    pub num_events: usize,
}

/// Shared view of the records of a [`RecordingTransport`].
#[derive(Clone, Debug, Default)]
pub struct PublishLog(Arc<Mutex<Vec<PublishRecord>>>);

impl PublishLog {
    pub fn records(&self) -> Vec<PublishRecord> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Records with `updated == true`, in publication order.
    pub fn updates(&self) -> Vec<PublishRecord> {
        self.records().into_iter().filter(|r| r.updated).collect()
    }

    /// Poll until `predicate` holds for the records or `timeout` elapses.
    pub fn wait_until(&self, timeout: Duration, predicate: impl Fn(&[PublishRecord]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.records()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Transport that records every publication, optionally sleeping to emulate a slow consumer.
#[derive(Debug)]
pub struct RecordingTransport {
    log: PublishLog,
    delay: Duration,
}

impl RecordingTransport {
    pub fn new() -> (Self, PublishLog) {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> (Self, PublishLog) {
        let log = PublishLog::default();
        (
            Self {
                log: log.clone(),
                delay,
            },
            log,
        )
    }
}

impl PolicyTransport for RecordingTransport {
    fn publish(&mut self, packet: &PolicyPacket, updated: bool) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let record = PublishRecord {
            solve_id: packet.solve_id,
            epoch: packet.epoch,
            updated,
            init_time: packet.primal.init_time(),
            num_events: packet.command.timeline.event_times().len(),
        };
        self.log.0.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }
}
