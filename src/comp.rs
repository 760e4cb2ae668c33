//! The table of named worker components.

use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, ParseErr, Result};
use crate::port::{PortDir, PortId};
use crate::MAX_ETHPORTS;
use crate::MAX_LCORE;

/// What a component does. The pcap stages are fixed by thread number and
/// never started through the command channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentKind {
    ClassifierMac,
    Forwarder,
    Merger,
    Mirror,
    PcapReceiver,
    PcapWriter,
}

impl ComponentKind {
    /// The identifier used in commands and status responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::ClassifierMac => "classifier_mac",
            ComponentKind::Forwarder => "forward",
            ComponentKind::Merger => "merge",
            ComponentKind::Mirror => "mirror",
            ComponentKind::PcapReceiver => "receive",
            ComponentKind::PcapWriter => "write",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = ParseErr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "classifier_mac" => Ok(ComponentKind::ClassifierMac),
            "forward" => Ok(ComponentKind::Forwarder),
            "merge" => Ok(ComponentKind::Merger),
            "mirror" => Ok(ComponentKind::Mirror),
            _ => Err(ParseErr::invalid_value("component type", s)),
        }
    }
}

/// One slot of the component table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentInfo {
    pub name: String,
    pub kind: Option<ComponentKind>,
    pub lcore_id: u32,
    pub comp_id: usize,
    pub rx_ports: Vec<PortId>,
    pub tx_ports: Vec<PortId>,
}

impl ComponentInfo {
    pub fn in_use(&self) -> bool {
        self.kind.is_some()
    }

    /// Reset the slot, keeping only its identity index.
    pub fn clear(&mut self) {
        let comp_id = self.comp_id;
        *self = ComponentInfo::default();
        self.comp_id = comp_id;
    }

    /// Check the per-kind rx/tx port limits before attaching another port.
    pub fn check_port_count(&self, dir: PortDir) -> Result<()> {
        let mut nof_rx = self.rx_ports.len();
        let mut nof_tx = self.tx_ports.len();
        match dir {
            PortDir::Rx => nof_rx += 1,
            PortDir::Tx => nof_tx += 1,
        }

        let ok = match self.kind {
            Some(ComponentKind::Forwarder) => nof_rx <= 1 && nof_tx <= 1,
            Some(ComponentKind::Merger) => nof_tx <= 1,
            Some(ComponentKind::ClassifierMac) => nof_rx <= 1,
            Some(ComponentKind::Mirror) => nof_rx <= 1 && nof_tx <= 2,
            _ => false,
        };

        if ok && nof_rx <= MAX_ETHPORTS && nof_tx <= MAX_ETHPORTS {
            Ok(())
        } else {
            Err(Error::PortCountOverflow)
        }
    }

    pub fn ports(&self, dir: PortDir) -> &Vec<PortId> {
        match dir {
            PortDir::Rx => &self.rx_ports,
            PortDir::Tx => &self.tx_ports,
        }
    }

    pub fn ports_mut(&mut self, dir: PortDir) -> &mut Vec<PortId> {
        match dir {
            PortDir::Rx => &mut self.rx_ports,
            PortDir::Tx => &mut self.tx_ports,
        }
    }
}

/// Fixed arena of components indexed by `comp_id`.
#[derive(Clone)]
pub struct CompTable {
    comps: Vec<ComponentInfo>,
}

impl Default for CompTable {
    fn default() -> Self {
        let mut comps = vec![ComponentInfo::default(); MAX_LCORE];
        for (i, comp) in comps.iter_mut().enumerate() {
            comp.comp_id = i;
        }
        CompTable { comps }
    }
}

impl CompTable {
    pub fn get(&self, comp_id: usize) -> &ComponentInfo {
        &self.comps[comp_id]
    }

    pub fn get_mut(&mut self, comp_id: usize) -> &mut ComponentInfo {
        &mut self.comps[comp_id]
    }

    /// Resolve a component id from its unique name.
    pub fn id_by_name(&self, name: &str) -> Option<usize> {
        if name.is_empty() {
            return None;
        }
        self.comps
            .iter()
            .position(|c| c.in_use() && c.name == name)
    }

    /// Lowest free slot, or the table is full.
    pub fn free_id(&self) -> Result<usize> {
        self.comps
            .iter()
            .position(|c| !c.in_use())
            .ok_or(Error::CompCountOverflow)
    }

    /// Which component, if any, uses the port in the given direction.
    pub fn used_port(&self, port: PortId, dir: PortDir) -> Option<usize> {
        self.comps
            .iter()
            .filter(|c| c.in_use())
            .find(|c| c.ports(dir).contains(&port))
            .map(|c| c.comp_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.comps.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortKind;

    #[test]
    fn test_kind_strings() {
        assert_eq!(
            "classifier_mac".parse::<ComponentKind>().unwrap(),
            ComponentKind::ClassifierMac
        );
        assert_eq!("merge".parse::<ComponentKind>().unwrap(), ComponentKind::Merger);
        assert!("merger".parse::<ComponentKind>().is_err());
        assert_eq!(ComponentKind::Forwarder.to_string(), "forward");
    }

    #[test]
    fn test_port_count_limits() {
        let mut comp = ComponentInfo::default();
        comp.kind = Some(ComponentKind::Forwarder);
        comp.check_port_count(PortDir::Rx).unwrap();
        comp.rx_ports.push(PortId::new(PortKind::Phy, 0));
        assert!(comp.check_port_count(PortDir::Rx).is_err());
        comp.check_port_count(PortDir::Tx).unwrap();

        comp.kind = Some(ComponentKind::Mirror);
        comp.tx_ports.push(PortId::new(PortKind::Phy, 1));
        comp.check_port_count(PortDir::Tx).unwrap();
        comp.tx_ports.push(PortId::new(PortKind::Phy, 2));
        assert!(comp.check_port_count(PortDir::Tx).is_err());
    }

    #[test]
    fn test_table_name_lookup_and_overflow() {
        let mut table = CompTable::default();
        assert_eq!(table.free_id().unwrap(), 0);

        table.get_mut(0).kind = Some(ComponentKind::Forwarder);
        table.get_mut(0).name = "fwd0".into();
        assert_eq!(table.id_by_name("fwd0"), Some(0));
        assert_eq!(table.id_by_name(""), None);
        assert_eq!(table.free_id().unwrap(), 1);

        let port = PortId::new(PortKind::Ring, 0);
        table.get_mut(0).rx_ports.push(port);
        assert_eq!(table.used_port(port, PortDir::Rx), Some(0));
        assert_eq!(table.used_port(port, PortDir::Tx), None);

        table.get_mut(0).clear();
        assert_eq!(table.id_by_name("fwd0"), None);
    }
}
