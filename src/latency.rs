//! Latency sampling of packets crossing ring ports.
//!
//! At most once per sampling interval a packet transmitted into a ring is
//! stamped with the current clock; when a stamped packet is received out of
//! a ring, the elapsed nanoseconds are bucketed into a per-ring histogram
//! with one slot per nanosecond and a saturating last slot.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::mbuf::Mbuf;
use crate::MAX_ETHPORTS;

/// Histogram slots per ring; the last slot collects everything slower.
pub const STATS_SLOT_COUNT: usize = 101;

/// Interval between two stamped packets, in nanoseconds.
pub const SAMPLING_INTERVAL_NS: u64 = 1_000_000;

struct RingStats {
    timer_ns: AtomicU64,
    prev_ns: AtomicU64,
    slots: Vec<AtomicU64>,
}

impl RingStats {
    fn new() -> RingStats {
        RingStats {
            timer_ns: AtomicU64::new(0),
            prev_ns: AtomicU64::new(0),
            slots: (0..STATS_SLOT_COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

lazy_static! {
    static ref STATS: Vec<RingStats> = (0..MAX_ETHPORTS).map(|_| RingStats::new()).collect();
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Stamp packets headed into ring `iface_no`, at most one per interval.
pub fn add_time_stamp(iface_no: u16, mut pkts: Vec<Mbuf>) -> Vec<Mbuf> {
    let stats = &STATS[iface_no as usize];

    for pkt in pkts.iter_mut() {
        let now = monotonic_ns();
        let diff = now.saturating_sub(stats.prev_ns.load(Ordering::Relaxed));
        let timer = stats.timer_ns.load(Ordering::Relaxed) + diff;

        if timer >= SAMPLING_INTERVAL_NS {
            pkt.timestamp = now;
            stats.timer_ns.store(0, Ordering::Relaxed);
        } else {
            stats.timer_ns.store(timer, Ordering::Relaxed);
        }
        stats.prev_ns.store(now, Ordering::Relaxed);
    }
    pkts
}

/// Bucket the latency of stamped packets received out of ring `iface_no`.
pub fn calculate_latency(iface_no: u16, pkts: &[Mbuf]) {
    let stats = &STATS[iface_no as usize];
    let now = monotonic_ns();

    for pkt in pkts {
        if pkt.timestamp == 0 {
            continue;
        }
        let latency = now.saturating_sub(pkt.timestamp) as usize;
        let slot = latency.min(STATS_SLOT_COUNT - 1);
        stats.slots[slot].fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot the histogram of one ring.
pub fn get_stats(iface_no: u16) -> Vec<u64> {
    STATS[iface_no as usize]
        .slots
        .iter()
        .map(|slot| slot.load(Ordering::Relaxed))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_and_bucket() {
        let pkts = vec![Mbuf::from_bytes(&[0u8; 60])];
        // first packet after process start always exceeds the interval
        let pkts = add_time_stamp(30, pkts);
        assert!(pkts[0].timestamp != 0);

        calculate_latency(30, &pkts);
        let stats = get_stats(30);
        assert_eq!(stats.iter().sum::<u64>(), 1);

        // unstamped packets are ignored
        calculate_latency(30, &[Mbuf::from_bytes(&[0u8; 60])]);
        assert_eq!(get_stats(30).iter().sum::<u64>(), 1);
    }
}
