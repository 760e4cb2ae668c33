//! Soft Patch Panel secondary worker dataplane.
//!
//! A reconfigurable run-to-completion pipeline cooperating with a DPDK-style
//! primary process. Worker components (classifier, forwarder, merger, mirror
//! and the pcap capture stages) are pinned to lcores and re-wired at runtime
//! by a controller over a line-oriented command channel, while the per-lcore
//! forwarding loops keep running without locks on the fast path.

extern crate anyhow;
#[macro_use]
extern crate thiserror;
#[macro_use]
extern crate log;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
extern crate crossbeam;
extern crate itertools;
extern crate libc;
extern crate lz4;
extern crate rand;
extern crate serde_json;
extern crate time;
#[macro_use]
extern crate num_derive;
extern crate num_traits;

pub mod errors;

pub mod ether;
pub mod mbuf;
pub mod ring;

pub mod dblbuf;
pub mod ethdev;

pub mod ability;
pub mod comp;
pub mod lcore;
pub mod port;

pub mod classifier;
pub mod forwarder;
pub mod mirror;
pub mod pcap;

#[cfg(feature = "latency-stats")]
pub mod latency;

pub mod cmd_format;
pub mod cmd_parser;
pub mod cmd_runner;
pub mod conn;
pub mod context;

pub use self::errors::{Error, Result};
pub use self::port::{PortId, PortKind};

/// The max number of ethdev ports the process manages.
pub const MAX_ETHPORTS: usize = 32;

/// The max number of lcores, which also caps the component table.
pub const MAX_LCORE: usize = 128;

/// A burst is at most this many mbufs per RX or TX call.
pub const MAX_PKT_BURST: usize = 32;

/// Slots of every ref/upd double buffer.
pub const INFO_AREA_MAX: usize = 2;

/// Delay between polls while waiting for a reader to apply an update.
pub const CHANGE_UPDATE_INTERVAL_US: u64 = 10;

/// Component names must fit in this many bytes.
pub const NAME_STR_LEN: usize = 128;
