//! Packet buffers and their pools.
//!
//! An `Mbuf` is a chain of segments carrying packet bytes plus the metadata
//! the workers touch (port, VLAN TCI, offload flags, timestamp). Buffers are
//! accounted against a named `Mempool` so exhaustion behaves like the real
//! thing: `alloc` fails, nothing blocks, and dropping an mbuf returns its
//! credits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::errors::{Error, Result};

/// Bytes reserved in front of the data in each segment buffer.
pub const PKTMBUF_HEADROOM: usize = 128;

/// Default payload room of a segment.
pub const MBUF_DEFAULT_DATAROOM: usize = 2048;

/// Default whole-buffer size (headroom + dataroom).
pub const MBUF_DEFAULT_BUF_SIZE: usize = MBUF_DEFAULT_DATAROOM + PKTMBUF_HEADROOM;

// Packet offload feature flags. Only the bits the workers read or set are
// modeled; the values keep the RX-low / TX-high split of the original layout.
bitflags! {
    pub struct OffloadFlags: u64 {
        /// RX packet is a 802.1q VLAN packet.
        const PKT_RX_VLAN          = 1;
        /// A vlan has been stripped and its tci saved in `vlan_tci`.
        const PKT_RX_VLAN_STRIPPED = 1 << 1;
        /// The timestamp field is valid.
        const PKT_RX_TIMESTAMP     = 1 << 17;
        /// TX packet is a 802.1q VLAN packet.
        const PKT_TX_VLAN          = 1 << 57;
        /// Indirect attached mbuf (shallow clone sharing its data).
        const IND_ATTACHED_MBUF    = 1 << 62;
    }
}

impl Default for OffloadFlags {
    fn default() -> Self {
        OffloadFlags::empty()
    }
}

/// One segment: a shared buffer plus the window of valid data in it.
#[derive(Clone, Debug)]
struct Seg {
    buf: Arc<Vec<u8>>,
    data_off: usize,
    data_len: usize,
}

impl Seg {
    fn with_room(room: usize) -> Self {
        Seg {
            buf: Arc::new(vec![0u8; PKTMBUF_HEADROOM + room]),
            data_off: PKTMBUF_HEADROOM,
            data_len: 0,
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = vec![0u8; PKTMBUF_HEADROOM];
        buf.extend_from_slice(bytes);
        Seg {
            buf: Arc::new(buf),
            data_off: PKTMBUF_HEADROOM,
            data_len: bytes.len(),
        }
    }

    #[inline]
    fn data(&self) -> &[u8] {
        &self.buf[self.data_off..self.data_off + self.data_len]
    }
}

#[derive(Debug)]
struct PoolInner {
    name: String,
    capacity: usize,
    available: AtomicUsize,
    cache_size: u32,
    data_room: usize,
}

lazy_static! {
    static ref POOLS: RwLock<HashMap<String, Arc<PoolInner>>> = RwLock::new(HashMap::new());
}

/// A named, counted source of mbufs.
#[derive(Clone)]
pub struct Mempool {
    inner: Arc<PoolInner>,
}

impl Mempool {
    /// Create a pool and register it under `name`. Returns the existing pool
    /// if one with the same name was created before.
    pub fn create(name: &str, n: usize, cache_size: u32, data_room: usize) -> Mempool {
        let mut pools = POOLS.write().unwrap();
        let inner = pools
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(PoolInner {
                    name: name.to_string(),
                    capacity: n,
                    available: AtomicUsize::new(n),
                    cache_size,
                    data_room,
                })
            })
            .clone();
        Mempool { inner }
    }

    /// Find a pool by name.
    pub fn lookup(name: &str) -> Option<Mempool> {
        POOLS
            .read()
            .unwrap()
            .get(name)
            .map(|inner| Mempool { inner: inner.clone() })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn cache_size(&self) -> u32 {
        self.inner.cache_size
    }

    /// Get the data room size of mbufs stored in this pool.
    pub fn data_room_size(&self) -> usize {
        self.inner.data_room
    }

    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    fn take(&self, n: usize) -> Result<()> {
        let mut cur = self.inner.available.load(Ordering::Relaxed);
        loop {
            if cur < n {
                return Err(Error::MempoolAllocFailed(self.inner.name.clone()));
            }
            match self.inner.available.compare_exchange_weak(
                cur,
                cur - n,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(now) => cur = now,
            }
        }
    }

    /// Allocate a fresh single-segment mbuf.
    pub fn alloc(&self) -> Result<Mbuf> {
        self.take(1)?;
        let mut m = Mbuf::empty();
        m.segs = vec![Seg::with_room(self.inner.data_room)];
        m.pool = Some(self.inner.clone());
        m.credits = 1;
        Ok(m)
    }

    /// Create a shallow clone of `m`: the new mbuf shares the data buffers
    /// of the original and takes one credit per segment.
    pub fn clone_of(&self, m: &Mbuf) -> Result<Mbuf> {
        self.take(m.nb_segs())?;
        let mut c = Mbuf::empty();
        c.segs = m.segs.clone();
        c.pool = Some(self.inner.clone());
        c.credits = m.nb_segs();
        c.ol_flags = m.ol_flags | OffloadFlags::IND_ATTACHED_MBUF;
        c.port = m.port;
        c.vlan_tci = m.vlan_tci;
        c.packet_type = m.packet_type;
        c.hash = m.hash;
        c.timestamp = m.timestamp;
        c.tx_offload = m.tx_offload;
        Ok(c)
    }
}

/// A packet buffer.
#[derive(Debug)]
pub struct Mbuf {
    pub port: u16,
    pub vlan_tci: u16,
    pub ol_flags: OffloadFlags,
    pub packet_type: u32,
    pub hash: u32,
    pub timestamp: u64,
    pub tx_offload: u64,
    segs: Vec<Seg>,
    pool: Option<Arc<PoolInner>>,
    credits: usize,
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.available.fetch_add(self.credits, Ordering::AcqRel);
        }
    }
}

impl Mbuf {
    fn empty() -> Mbuf {
        Mbuf {
            port: 0,
            vlan_tci: 0,
            ol_flags: OffloadFlags::empty(),
            packet_type: 0,
            hash: 0,
            timestamp: 0,
            tx_offload: 0,
            segs: Vec::new(),
            pool: None,
            credits: 0,
        }
    }

    /// Build a pool-less single-segment mbuf from raw frame bytes.
    pub fn from_bytes(bytes: &[u8]) -> Mbuf {
        let mut m = Mbuf::empty();
        m.segs = vec![Seg::from_bytes(bytes)];
        m
    }

    /// Returns the length of the packet.
    #[inline]
    pub fn pkt_len(&self) -> usize {
        self.segs.iter().map(|s| s.data_len).sum()
    }

    /// Returns the length of the first segment.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.segs.first().map_or(0, |s| s.data_len)
    }

    #[inline]
    pub fn nb_segs(&self) -> usize {
        self.segs.len()
    }

    /// Data bytes of the first segment.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.segs.first().map_or(&[], |s| s.data())
    }

    /// Iterate data bytes segment by segment.
    pub fn seg_bytes(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(|s| s.data())
    }

    /// Headroom left in front of the first segment's data.
    pub fn headroom(&self) -> usize {
        self.segs.first().map_or(0, |s| s.data_off)
    }

    /// Tailroom left behind the last segment's data.
    pub fn tailroom(&self) -> usize {
        self.segs
            .last()
            .map_or(0, |s| s.buf.len() - s.data_off - s.data_len)
    }

    /// Prepend `len` bytes to the data area and return it for writing.
    /// Copies the underlying buffer first if it is shared with a clone.
    pub fn prepend(&mut self, len: usize) -> Result<&mut [u8]> {
        let seg = self
            .segs
            .first_mut()
            .filter(|s| s.data_off >= len)
            .ok_or_else(|| Error::Io(no_room("no headroom left")))?;

        seg.data_off -= len;
        seg.data_len += len;
        let off = seg.data_off;
        let buf = Arc::make_mut(&mut seg.buf);
        Ok(&mut buf[off..off + len])
    }

    /// Remove `len` bytes at the beginning of the packet.
    pub fn adj(&mut self, len: usize) -> Result<()> {
        let seg = self
            .segs
            .first_mut()
            .filter(|s| s.data_len >= len)
            .ok_or_else(|| Error::Io(no_room("segment shorter than trim")))?;

        seg.data_off += len;
        seg.data_len -= len;
        Ok(())
    }

    /// Append bytes to the last segment, limited by its tailroom.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.tailroom() < bytes.len() {
            return Err(Error::Io(no_room("no tailroom left")));
        }
        let seg = self.segs.last_mut().unwrap();
        let start = seg.data_off + seg.data_len;
        let buf = Arc::make_mut(&mut seg.buf);
        buf[start..start + bytes.len()].copy_from_slice(bytes);
        seg.data_len += bytes.len();
        Ok(())
    }

    /// Write bytes into the tailroom right behind the data of the last
    /// segment without extending it, as frame check sequences are.
    pub fn write_tailroom(&mut self, bytes: &[u8]) -> Result<()> {
        if self.tailroom() < bytes.len() {
            return Err(Error::Io(no_room("no tailroom left")));
        }
        let seg = self.segs.last_mut().unwrap();
        let start = seg.data_off + seg.data_len;
        let buf = Arc::make_mut(&mut seg.buf);
        buf[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Writable view of the first segment's data, copying on write if the
    /// buffer is shared.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let seg = &mut self.segs[0];
        let (off, len) = (seg.data_off, seg.data_len);
        let buf = Arc::make_mut(&mut seg.buf);
        &mut buf[off..off + len]
    }

    /// Chain another mbuf behind this one. Its segments and pool credits are
    /// taken over; both must come from the same pool.
    pub fn chain(&mut self, mut tail: Mbuf) {
        self.segs.append(&mut tail.segs);
        self.credits += tail.credits;
        tail.credits = 0;
        if self.pool.is_none() {
            self.pool = tail.pool.take();
        } else {
            // Credits already merged; stop the tail from returning them.
            tail.pool = None;
        }
    }

    /// The mbuf is a shallow clone sharing buffers with its origin.
    #[inline]
    pub fn is_indirect(&self) -> bool {
        self.ol_flags.contains(OffloadFlags::IND_ATTACHED_MBUF)
    }

    /// Copy the whole packet into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pkt_len());
        for seg in &self.segs {
            out.extend_from_slice(seg.data());
        }
        out
    }
}

fn no_room(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, what.to_string())
}

/// Create a packet mbuf pool, the counterpart of `rte_pktmbuf_pool_create`.
pub fn pktmbuf_pool_create(name: &str, n: usize, cache_size: u32, data_room: usize) -> Mempool {
    Mempool::create(name, n, cache_size, data_room)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_accounting() {
        let pool = Mempool::create("test_pool_acct", 4, 0, MBUF_DEFAULT_DATAROOM);
        assert_eq!(pool.available(), 4);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.available(), 2);

        drop(a);
        assert_eq!(pool.available(), 3);

        let _c = pool.alloc().unwrap();
        let _d = pool.alloc().unwrap();
        let _e = pool.alloc().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.alloc().is_err());

        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_lookup_returns_same_pool() {
        let pool = Mempool::create("test_pool_lookup", 8, 0, MBUF_DEFAULT_DATAROOM);
        let _m = pool.alloc().unwrap();
        let again = Mempool::lookup("test_pool_lookup").unwrap();
        assert_eq!(again.available(), 7);
        assert!(Mempool::lookup("no_such_pool").is_none());
    }

    #[test]
    fn test_prepend_and_adj() {
        let mut m = Mbuf::from_bytes(&[1, 2, 3, 4]);
        assert_eq!(m.pkt_len(), 4);
        assert_eq!(m.headroom(), PKTMBUF_HEADROOM);

        m.prepend(2).unwrap().copy_from_slice(&[9, 8]);
        assert_eq!(m.to_vec(), vec![9, 8, 1, 2, 3, 4]);

        m.adj(3).unwrap();
        assert_eq!(m.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn test_shallow_clone_shares_then_copies() {
        let pool = Mempool::create("test_pool_clone", 8, 0, 0);
        let orig = Mbuf::from_bytes(&[1, 2, 3, 4]);
        let mut cloned = pool.clone_of(&orig).unwrap();

        assert!(cloned.is_indirect());
        assert_eq!(cloned.to_vec(), orig.to_vec());
        assert_eq!(pool.available(), 7);

        // Writes to the clone must not leak into the original.
        cloned.data_mut()[0] = 0xff;
        assert_eq!(orig.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(cloned.to_vec(), vec![0xff, 2, 3, 4]);

        drop(cloned);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_chain_merges_credits() {
        let pool = Mempool::create("test_pool_chain", 4, 0, 64);
        let mut head = pool.alloc().unwrap();
        head.append(&[1, 2]).unwrap();
        let mut tail = pool.alloc().unwrap();
        tail.append(&[3, 4]).unwrap();

        head.chain(tail);
        assert_eq!(head.nb_segs(), 2);
        assert_eq!(head.pkt_len(), 4);
        assert_eq!(head.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(pool.available(), 2);

        drop(head);
        assert_eq!(pool.available(), 4);
    }
}
