//! Port identity and the interface registry.
//!
//! A port is addressed by its stable `(kind, no)` UID such as `phy:0` or
//! `ring:3`. The registry keeps one fixed arena of `PortInfo` per kind;
//! entries stage classification attributes and VLAN abilities, and gain an
//! `ethdev_port_id` only when a flush materializes the backing PMD.

use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, ParseErr, Result};
use crate::ethdev;
use crate::ether::{EtherAddr, NO_VLAN};
use crate::ring::{self, Ring};
use crate::MAX_ETHPORTS;

/// Max abilities a port carries per direction.
pub const ABILITY_MAX: usize = 4;

/// Classifier sentinel for the `default` entry.
pub const DEFAULT_CLS_DMY_ADDR: u64 = 0x010000000000;
pub const DEFAULT_CLS_DMY_ADDR_STR: &str = "00:00:00:00:00:01";
pub const DEFAULT_CLS_SPEC_STR: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortKind {
    Phy,
    Ring,
    Vhost,
    Pcap,
    Null,
}

impl PortKind {
    pub const ALL: [PortKind; 5] = [
        PortKind::Phy,
        PortKind::Ring,
        PortKind::Vhost,
        PortKind::Pcap,
        PortKind::Null,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PortKind::Phy => "phy",
            PortKind::Ring => "ring",
            PortKind::Vhost => "vhost",
            PortKind::Pcap => "pcap",
            PortKind::Null => "null",
        }
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortKind {
    type Err = ParseErr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "phy" => Ok(PortKind::Phy),
            "ring" => Ok(PortKind::Ring),
            "vhost" => Ok(PortKind::Vhost),
            "pcap" => Ok(PortKind::Pcap),
            "null" => Ok(PortKind::Null),
            _ => Err(ParseErr::invalid_value("port", s)),
        }
    }
}

/// The stable port UID seen by the controller, e.g. `ring:0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortId {
    pub kind: PortKind,
    pub no: u16,
}

impl PortId {
    pub fn new(kind: PortKind, no: u16) -> Self {
        PortId { kind, no }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.no)
    }
}

impl FromStr for PortId {
    type Err = ParseErr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut it = s.splitn(2, ':');
        let kind = it
            .next()
            .ok_or_else(|| ParseErr::invalid_value("port", s))?
            .parse::<PortKind>()
            .map_err(|_| ParseErr::invalid_value("port", s))?;
        let no = it
            .next()
            .and_then(|n| n.parse::<u16>().ok())
            .filter(|n| (*n as usize) < MAX_ETHPORTS)
            .ok_or_else(|| ParseErr::invalid_value("port", s))?;
        Ok(PortId { kind, no })
    }
}

/// Direction a port is attached in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortDir {
    Rx,
    Tx,
}

impl FromStr for PortDir {
    type Err = ParseErr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rx" => Ok(PortDir::Rx),
            "tx" => Ok(PortDir::Tx),
            _ => Err(ParseErr::invalid_value("port rxtx", s)),
        }
    }
}

impl fmt::Display for PortDir {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            PortDir::Rx => "rx",
            PortDir::Tx => "tx",
        })
    }
}

/// VLAN tag parameters of an ability; the TCI is precomputed at publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VlanTag {
    pub vid: u16,
    pub pcp: i8,
    pub tci: u16,
}

/// One VLAN push/pop ability staged on a port direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortAbility {
    None,
    AddVlanTag { dir: PortDir, vlantag: VlanTag },
    DelVlanTag { dir: PortDir },
}

impl Default for PortAbility {
    fn default() -> Self {
        PortAbility::None
    }
}

impl PortAbility {
    pub fn is_none(&self) -> bool {
        matches!(self, PortAbility::None)
    }

    pub fn dir(&self) -> Option<PortDir> {
        match self {
            PortAbility::None => None,
            PortAbility::AddVlanTag { dir, .. } | PortAbility::DelVlanTag { dir } => Some(*dir),
        }
    }
}

/// Attributes a classifier entry pins on a tx port.
#[derive(Clone, Debug, PartialEq)]
pub struct ClsAttrs {
    pub mac_addr: u64,
    pub mac_addr_str: String,
    pub vid: u16,
}

impl Default for ClsAttrs {
    fn default() -> Self {
        ClsAttrs {
            mac_addr: 0,
            mac_addr_str: String::new(),
            vid: NO_VLAN,
        }
    }
}

/// Registry entry of one port UID.
#[derive(Clone, Debug)]
pub struct PortInfo {
    pub kind: PortKind,
    pub no: u16,
    /// Set once a port command referenced this UID.
    pub defined: bool,
    /// Consistent ethdev ID; -1 until the PMD was created by a flush.
    pub ethdev_port_id: i32,
    pub cls_attrs: ClsAttrs,
    pub ability: [PortAbility; ABILITY_MAX],
}

impl PortInfo {
    fn unset(kind: PortKind, no: u16) -> Self {
        PortInfo {
            kind,
            no,
            defined: false,
            ethdev_port_id: -1,
            cls_attrs: ClsAttrs::default(),
            ability: [PortAbility::None; ABILITY_MAX],
        }
    }

    pub fn uid(&self) -> PortId {
        PortId::new(self.kind, self.no)
    }

    pub fn is_flushed(&self) -> bool {
        self.ethdev_port_id >= 0
    }

    /// Stage an ability, filling the first free slot of the direction.
    pub fn add_ability(&mut self, ability: PortAbility) -> Result<()> {
        // A new vlantag overwrites an existing add_vlantag slot of the
        // same direction instead of stacking a second one.
        if let PortAbility::AddVlanTag { dir, .. } = ability {
            if let Some(slot) = self.ability.iter_mut().find(
                |a| matches!(a, PortAbility::AddVlanTag { dir: d, .. } if *d == dir),
            ) {
                *slot = ability;
                return Ok(());
            }
        }

        match self.ability.iter_mut().find(|a| a.is_none()) {
            Some(slot) => {
                *slot = ability;
                Ok(())
            }
            None => Err(Error::PortAbilityFull(self.uid().to_string())),
        }
    }

    /// Drop all abilities of one direction.
    pub fn clear_abilities(&mut self, dir: PortDir) {
        for slot in self.ability.iter_mut() {
            if slot.dir() == Some(dir) {
                *slot = PortAbility::None;
            }
        }
    }
}

/// The per-kind arenas of port info.
#[derive(Clone)]
pub struct IfaceInfo {
    phy: Vec<PortInfo>,
    ring: Vec<PortInfo>,
    vhost: Vec<PortInfo>,
    pcap: Vec<PortInfo>,
    null: Vec<PortInfo>,
}

impl IfaceInfo {
    /// Initialize the arenas; physical devices already probed by the
    /// runtime are pre-defined with their ethdev IDs.
    pub fn new(phy_ports: &[ethdev::PortId]) -> Self {
        let arena = |kind| {
            (0..MAX_ETHPORTS as u16)
                .map(|no| PortInfo::unset(kind, no))
                .collect::<Vec<_>>()
        };

        let mut iface = IfaceInfo {
            phy: arena(PortKind::Phy),
            ring: arena(PortKind::Ring),
            vhost: arena(PortKind::Vhost),
            pcap: arena(PortKind::Pcap),
            null: arena(PortKind::Null),
        };

        for (no, port_id) in phy_ports.iter().enumerate().take(MAX_ETHPORTS) {
            iface.phy[no].defined = true;
            iface.phy[no].ethdev_port_id = *port_id as i32;
        }
        iface
    }

    fn arena(&self, kind: PortKind) -> &Vec<PortInfo> {
        match kind {
            PortKind::Phy => &self.phy,
            PortKind::Ring => &self.ring,
            PortKind::Vhost => &self.vhost,
            PortKind::Pcap => &self.pcap,
            PortKind::Null => &self.null,
        }
    }

    fn arena_mut(&mut self, kind: PortKind) -> &mut Vec<PortInfo> {
        match kind {
            PortKind::Phy => &mut self.phy,
            PortKind::Ring => &mut self.ring,
            PortKind::Vhost => &mut self.vhost,
            PortKind::Pcap => &mut self.pcap,
            PortKind::Null => &mut self.null,
        }
    }

    pub fn port(&self, id: PortId) -> &PortInfo {
        &self.arena(id.kind)[id.no as usize]
    }

    pub fn port_mut(&mut self, id: PortId) -> &mut PortInfo {
        &mut self.arena_mut(id.kind)[id.no as usize]
    }

    /// Ethdev ID of a port UID, or None before its flush.
    pub fn ethdev_port_id(&self, id: PortId) -> Option<ethdev::PortId> {
        let port = self.port(id);
        if port.is_flushed() {
            Some(port.ethdev_port_id as ethdev::PortId)
        } else {
            None
        }
    }

    /// Ordered index numbers of flushed ports of one kind, as listed in
    /// status responses.
    pub fn list_flushed(&self, kind: PortKind) -> Vec<u16> {
        self.arena(kind)
            .iter()
            .filter(|p| p.defined && p.is_flushed())
            .map(|p| p.no)
            .collect()
    }

    /// Iterate defined ports of one kind.
    pub fn defined_ports(&self, kind: PortKind) -> impl Iterator<Item = &PortInfo> {
        self.arena(kind).iter().filter(|p| p.defined)
    }

    /// Create the missing PMDs for every defined but unflushed port. A
    /// single failure aborts the whole flush so the caller can restore the
    /// backup snapshot.
    pub fn update_port_info(&mut self, vhost_client: bool) -> Result<()> {
        for no in 0..MAX_ETHPORTS as u16 {
            let uid = PortId::new(PortKind::Vhost, no);
            if self.port(uid).defined && !self.port(uid).is_flushed() {
                let port_id = add_vhost_pmd(no, vhost_client)?;
                self.port_mut(uid).ethdev_port_id = port_id as i32;
                info!("vhost port add. (no = {} / port = {})", no, port_id);
            }
        }

        for no in 0..MAX_ETHPORTS as u16 {
            let uid = PortId::new(PortKind::Ring, no);
            if self.port(uid).defined && !self.port(uid).is_flushed() {
                let port_id = add_ring_pmd(no)?;
                self.port_mut(uid).ethdev_port_id = port_id as i32;
                info!("ring port add. (no = {} / port = {})", no, port_id);
            }
        }

        for kind in [PortKind::Pcap, PortKind::Null].iter() {
            for no in 0..MAX_ETHPORTS as u16 {
                let uid = PortId::new(*kind, no);
                if self.port(uid).defined && !self.port(uid).is_flushed() {
                    let port_id = add_synthetic_pmd(*kind, no)?;
                    self.port_mut(uid).ethdev_port_id = port_id as i32;
                    info!("{} port add. (no = {} / port = {})", kind, no, port_id);
                }
            }
        }

        Ok(())
    }
}

/// A flushed port resolved into its device handle for a published plan.
#[derive(Clone)]
pub struct PortRef {
    pub uid: PortId,
    pub dev: ethdev::EthDev,
}

impl PortRef {
    /// Resolve a UID against the registry; fails before the port's flush.
    pub fn resolve(iface: &IfaceInfo, uid: PortId) -> Result<PortRef> {
        let ethdev_port = iface
            .ethdev_port_id(uid)
            .ok_or_else(|| Error::PortNotFound(uid.to_string()))?;
        Ok(PortRef {
            uid,
            dev: ethdev::dev(ethdev_port)?,
        })
    }
}

impl fmt::Debug for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PortRef({})", self.uid)
    }
}

/// Attach the ring of conventional name `eth_ring<N>` as an ethdev.
pub fn add_ring_pmd(ring_id: u16) -> Result<ethdev::PortId> {
    let ring = Ring::lookup(&ring::rx_queue_name(ring_id)).ok_or_else(|| {
        error!("Cannot get RX ring - is server process running?");
        Error::PmdCreateFailed(format!("ring:{}", ring_id))
    })?;
    Ok(ethdev::from_ring(&ring))
}

/// Hotplug a vhost-user device for `vhost:<N>`.
pub fn add_vhost_pmd(index: u16, client: bool) -> Result<ethdev::PortId> {
    let devargs = format!(
        "eth_vhost{},iface={},queues=1,client={}",
        index,
        vhost_iface_name(index),
        client as u8
    );
    ethdev::attach_by_devargs(&devargs)
}

/// Sock file path of a vhost interface.
pub fn vhost_iface_name(index: u16) -> String {
    format!("/tmp/sock{}", index)
}

fn add_synthetic_pmd(kind: PortKind, index: u16) -> Result<ethdev::PortId> {
    let devargs = match kind {
        PortKind::Pcap => format!("net_pcap{}", index),
        PortKind::Null => format!("net_null{}", index),
        _ => return Err(Error::PmdCreateFailed(format!("{}:{}", kind, index))),
    };
    ethdev::attach_by_devargs(&devargs)
}

/// Convert a classifier MAC argument, mapping `default` to the sentinel.
pub fn cls_mac_from_str(s: &str) -> Result<EtherAddr> {
    let spec = if s == DEFAULT_CLS_SPEC_STR {
        DEFAULT_CLS_DMY_ADDR_STR
    } else {
        s
    };
    spec.parse::<EtherAddr>()
        .map_err(|_| Error::BadMacAddr(s.to_string()))
}
