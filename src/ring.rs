//! Named lock-free rings of mbufs.
//!
//! Rings are the patch cords of the dataplane: the primary process (or a
//! test harness) creates them under conventional names like `eth_ring0`, and
//! workers attach them as ethdev ports or use them directly, as the pcap
//! pipeline does with its `cap_ring_<client_id>`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crossbeam::queue::ArrayQueue;

use crate::mbuf::Mbuf;

struct RingInner {
    name: String,
    queue: ArrayQueue<Mbuf>,
}

lazy_static! {
    static ref RINGS: RwLock<HashMap<String, Arc<RingInner>>> = RwLock::new(HashMap::new());
}

/// Conventional name of the ring backing `ring:<id>` ports.
pub fn rx_queue_name(ring_id: u16) -> String {
    format!("eth_ring{}", ring_id)
}

/// A handle to a named ring.
#[derive(Clone)]
pub struct Ring {
    inner: Arc<RingInner>,
}

impl Ring {
    /// Create a ring registered under `name`. Returns the existing ring if
    /// the name is already taken, matching lookup-or-create usage at startup.
    pub fn create(name: &str, capacity: usize) -> Ring {
        let mut rings = RINGS.write().unwrap();
        let inner = rings
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(RingInner {
                    name: name.to_string(),
                    queue: ArrayQueue::new(capacity.next_power_of_two()),
                })
            })
            .clone();
        Ring { inner }
    }

    /// Look up a ring by name.
    pub fn lookup(name: &str) -> Option<Ring> {
        RINGS
            .read()
            .unwrap()
            .get(name)
            .map(|inner| Ring { inner: inner.clone() })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    pub fn count(&self) -> usize {
        self.inner.queue.len()
    }

    /// Enqueue as many packets as fit. Returns the number enqueued plus the
    /// overflow, which the caller frees by dropping.
    pub fn enqueue_burst(&self, pkts: Vec<Mbuf>) -> (usize, Vec<Mbuf>) {
        let mut sent = 0;
        let mut rest = Vec::new();
        let mut full = false;
        for pkt in pkts {
            if full {
                rest.push(pkt);
                continue;
            }
            match self.inner.queue.push(pkt) {
                Ok(()) => sent += 1,
                Err(pkt) => {
                    full = true;
                    rest.push(pkt);
                }
            }
        }
        (sent, rest)
    }

    /// Dequeue up to `max` packets.
    pub fn dequeue_burst(&self, max: usize) -> Vec<Mbuf> {
        let mut out = Vec::with_capacity(max);
        while out.len() < max {
            match self.inner.queue.pop() {
                Some(pkt) => out.push(pkt),
                None => break,
            }
        }
        out
    }
}
