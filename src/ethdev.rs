//! The ethdev-like port abstraction the workers forward through.
//!
//! A device is an integer `PortId` handle over a packet queue backend:
//! ring-backed devices push and pop one shared named ring (so two workers
//! can be patched together through it), while phy/vhost/pcap/null devices
//! own a pair of queues standing in for the wire. The table is append-only
//! and devices are only created from the control path; fast-path loops hold
//! resolved `EthDev` handles inside their published plans.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam::queue::ArrayQueue;

use crate::errors::{Error, Result};
use crate::mbuf::Mbuf;
use crate::ring::Ring;

/// Ethdev port handle.
pub type PortId = u16;

/// Descriptors per synthetic device queue.
const DEF_NB_DESC: usize = 1024;

/// Descriptors of a vhost queue (1 rxq / 1 txq).
const VHOST_NR_DESCS: usize = 128;

enum Backend {
    /// rx and tx share the one underlying ring.
    Ring(Ring),
    /// Separate in/out queues standing in for the wire.
    Queued {
        rxq: ArrayQueue<Mbuf>,
        txq: ArrayQueue<Mbuf>,
    },
    /// Always-empty rx, tx discards.
    Null,
}

struct DevInner {
    name: String,
    port_id: PortId,
    backend: Backend,
    started: AtomicBool,
    sock_path: Option<PathBuf>,
    rx_pkts: AtomicU64,
    tx_pkts: AtomicU64,
    tx_drops: AtomicU64,
}

lazy_static! {
    static ref DEVICES: RwLock<Vec<Arc<DevInner>>> = RwLock::new(Vec::new());
}

/// A cloneable handle to one device, resolved once at plan-publish time so
/// the forwarding loops never touch the device table lock.
#[derive(Clone)]
pub struct EthDev {
    inner: Arc<DevInner>,
}

/// Get the total number of devices created so far.
pub fn count() -> usize {
    DEVICES.read().unwrap().len()
}

/// Find a device id from its name.
pub fn get_port_by_name(name: &str) -> Option<PortId> {
    DEVICES
        .read()
        .unwrap()
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.port_id)
}

/// Resolve a device handle.
pub fn dev(port_id: PortId) -> Result<EthDev> {
    DEVICES
        .read()
        .unwrap()
        .get(port_id as usize)
        .map(|inner| EthDev { inner: inner.clone() })
        .ok_or_else(|| Error::PortNotFound(format!("ethdev {}", port_id)))
}

fn register(name: String, backend: Backend, sock_path: Option<PathBuf>) -> PortId {
    let mut devices = DEVICES.write().unwrap();
    let port_id = devices.len() as PortId;
    devices.push(Arc::new(DevInner {
        name,
        port_id,
        backend,
        started: AtomicBool::new(true),
        sock_path,
        rx_pkts: AtomicU64::new(0),
        tx_pkts: AtomicU64::new(0),
        tx_drops: AtomicU64::new(0),
    }));
    port_id
}

/// Probe `n` physical devices, as the EAL would at startup.
pub fn probe_phys(n: u16) -> Vec<PortId> {
    (0..n)
        .map(|i| {
            let name = format!("net_phy{}", i);
            get_port_by_name(&name).unwrap_or_else(|| {
                register(
                    name,
                    Backend::Queued {
                        rxq: ArrayQueue::new(DEF_NB_DESC),
                        txq: ArrayQueue::new(DEF_NB_DESC),
                    },
                    None,
                )
            })
        })
        .collect()
}

/// Attach an existing named ring as an ethdev, the `rte_eth_from_ring` path.
/// If the device already exists it is reused and restarted.
pub fn from_ring(ring: &Ring) -> PortId {
    let name = format!("net_ring_{}", ring.name());
    if let Some(port_id) = get_port_by_name(&name) {
        let dev = dev(port_id).unwrap();
        dev.start();
        return port_id;
    }
    register(name, Backend::Ring(ring.clone()), None)
}

/// Hotplug a device from a devargs string such as
/// `eth_vhost0,iface=/tmp/sock0,queues=1,client=0`.
pub fn attach_by_devargs(devargs: &str) -> Result<PortId> {
    let mut parts = devargs.split(',');
    let name = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::PmdCreateFailed(devargs.to_string()))?;

    if let Some(port_id) = get_port_by_name(name) {
        return Ok(port_id);
    }

    let mut iface = None;
    let mut client = false;
    for kv in parts {
        let mut it = kv.splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("iface"), Some(path)) => iface = Some(PathBuf::from(path)),
            (Some("client"), Some(v)) => client = v == "1",
            (Some("queues"), Some(_)) => {}
            _ => return Err(Error::PmdCreateFailed(devargs.to_string())),
        }
    }

    let sock_path = if name.starts_with("eth_vhost") {
        let path = iface.ok_or_else(|| Error::PmdCreateFailed(devargs.to_string()))?;
        if !client {
            // Server mode owns the sock file for its lifetime.
            File::create(&path).map_err(|_| Error::PmdCreateFailed(devargs.to_string()))?;
        }
        Some(path)
    } else {
        None
    };

    let backend = if name.starts_with("net_null") {
        Backend::Null
    } else {
        let nb_desc = if name.starts_with("eth_vhost") {
            VHOST_NR_DESCS
        } else {
            DEF_NB_DESC
        };
        Backend::Queued {
            rxq: ArrayQueue::new(nb_desc),
            txq: ArrayQueue::new(nb_desc),
        }
    };

    Ok(register(name.to_string(), backend, sock_path))
}

impl EthDev {
    pub fn portid(&self) -> PortId {
        self.inner.port_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn start(&self) {
        self.inner.started.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Path of the vhost-user socket, if this is a vhost device.
    pub fn sock_path(&self) -> Option<&PathBuf> {
        self.inner.sock_path.as_ref()
    }

    /// Receive a burst of up to `max` packets. Received mbufs carry this
    /// device's port id.
    pub fn rx_burst(&self, max: usize) -> Vec<Mbuf> {
        let mut pkts = match &self.inner.backend {
            Backend::Ring(ring) => ring.dequeue_burst(max),
            Backend::Queued { rxq, .. } => drain_queue(rxq, max),
            Backend::Null => Vec::new(),
        };
        for pkt in &mut pkts {
            pkt.port = self.inner.port_id;
        }
        self.inner
            .rx_pkts
            .fetch_add(pkts.len() as u64, Ordering::Relaxed);
        pkts
    }

    /// Transmit a burst. Returns the number sent plus the packets the
    /// device had no room for; the caller frees those by dropping them.
    pub fn tx_burst(&self, pkts: Vec<Mbuf>) -> (usize, Vec<Mbuf>) {
        let (sent, rest) = match &self.inner.backend {
            Backend::Ring(ring) => ring.enqueue_burst(pkts),
            Backend::Queued { txq, .. } => fill_queue(txq, pkts),
            Backend::Null => (pkts.len(), Vec::new()),
        };
        self.inner.tx_pkts.fetch_add(sent as u64, Ordering::Relaxed);
        self.inner
            .tx_drops
            .fetch_add(rest.len() as u64, Ordering::Relaxed);
        (sent, rest)
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.inner.rx_pkts.load(Ordering::Relaxed),
            self.inner.tx_pkts.load(Ordering::Relaxed),
            self.inner.tx_drops.load(Ordering::Relaxed),
        )
    }

    /// Feed packets into the device's receive side, standing in for the
    /// wire. Returns the number accepted.
    pub fn inject(&self, pkts: Vec<Mbuf>) -> usize {
        match &self.inner.backend {
            Backend::Ring(ring) => ring.enqueue_burst(pkts).0,
            Backend::Queued { rxq, .. } => fill_queue(rxq, pkts).0,
            Backend::Null => 0,
        }
    }

    /// Drain packets the workers transmitted out of this device.
    pub fn drain(&self, max: usize) -> Vec<Mbuf> {
        match &self.inner.backend {
            Backend::Ring(ring) => ring.dequeue_burst(max),
            Backend::Queued { txq, .. } => drain_queue(txq, max),
            Backend::Null => Vec::new(),
        }
    }
}

fn drain_queue(q: &ArrayQueue<Mbuf>, max: usize) -> Vec<Mbuf> {
    let mut out = Vec::with_capacity(max);
    while out.len() < max {
        match q.pop() {
            Some(pkt) => out.push(pkt),
            None => break,
        }
    }
    out
}

fn fill_queue(q: &ArrayQueue<Mbuf>, pkts: Vec<Mbuf>) -> (usize, Vec<Mbuf>) {
    let mut sent = 0;
    let mut rest = Vec::new();
    let mut full = false;
    for pkt in pkts {
        if full {
            rest.push(pkt);
            continue;
        }
        match q.push(pkt) {
            Ok(()) => sent += 1,
            Err(pkt) => {
                full = true;
                rest.push(pkt);
            }
        }
    }
    (sent, rest)
}
