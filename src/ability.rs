//! Per-port, per-direction VLAN abilities.
//!
//! Every ethdev port carries up to `ABILITY_MAX` VLAN push/pop records per
//! direction, double-buffered so the master can swap them while the owning
//! lcore keeps bursting. The rx/tx wrappers here are what the forwarding
//! loops call instead of the raw device burst functions.

use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::time::Duration;

use crate::dblbuf::DoubleBuffered;
use crate::errors::Result;
use crate::ethdev::EthDev;
use crate::ether::{vlan_calc_tci, ETHER_TYPE_VLAN, VLAN_HDR_LEN};
use crate::mbuf::Mbuf;
use crate::port::{PortAbility, PortDir, PortInfo, PortKind, ABILITY_MAX};
use crate::MAX_ETHPORTS;
use crate::MAX_PKT_BURST;

#[cfg(feature = "latency-stats")]
use crate::latency;

type AbilitySet = [PortAbility; ABILITY_MAX];

#[derive(Default)]
struct PortMng {
    /// Port kind index + 1; 0 while the port is unknown. Written from the
    /// control path before the first burst ever touches the port.
    kind: AtomicU8,
    iface_no: AtomicU16,
    rx: DoubleBuffered<AbilitySet>,
    tx: DoubleBuffered<AbilitySet>,
}

impl PortMng {
    fn set_iface(&self, kind: PortKind, no: u16) {
        let idx = PortKind::ALL.iter().position(|k| *k == kind).unwrap() as u8;
        self.kind.store(idx + 1, Ordering::Release);
        self.iface_no.store(no, Ordering::Release);
    }

    #[cfg_attr(not(feature = "latency-stats"), allow(dead_code))]
    fn iface(&self) -> Option<(PortKind, u16)> {
        match self.kind.load(Ordering::Acquire) {
            0 => None,
            idx => Some((
                PortKind::ALL[(idx - 1) as usize],
                self.iface_no.load(Ordering::Acquire),
            )),
        }
    }
}

/// Ability management of every ethdev port.
pub struct PortAbilityTable {
    ports: Vec<PortMng>,
}

impl Default for PortAbilityTable {
    fn default() -> Self {
        PortAbilityTable {
            ports: (0..MAX_ETHPORTS).map(|_| PortMng::default()).collect(),
        }
    }
}

lazy_static! {
    /// Fallback for device ids beyond the managed range: always empty.
    static ref NO_ABILITIES: DoubleBuffered<AbilitySet> = DoubleBuffered::default();
}

impl PortAbilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, port_id: u16, dir: PortDir) -> &DoubleBuffered<AbilitySet> {
        let mng = match self.ports.get(port_id as usize) {
            Some(mng) => mng,
            None => return &NO_ABILITIES,
        };
        match dir {
            PortDir::Rx => &mng.rx,
            PortDir::Tx => &mng.tx,
        }
    }

    /// Publish the abilities of one direction of a flushed port, taking
    /// them from its registry entry. TCIs are precomputed here so the fast
    /// path only copies them into frames.
    pub fn update(&self, port: &PortInfo, dir: PortDir) -> Result<()> {
        let ethdev_port = match port.ethdev_port_id {
            id if id >= 0 => id as usize,
            _ => return Ok(()),
        };

        let mng = match self.ports.get(ethdev_port) {
            Some(mng) => mng,
            None => {
                warn!(
                    "ethdev {} beyond ability table, abilities not applied",
                    ethdev_port
                );
                return Ok(());
            }
        };
        mng.set_iface(port.kind, port.no);

        let cell = match dir {
            PortDir::Rx => &mng.rx,
            PortDir::Tx => &mng.tx,
        };

        // An unapplied previous publish would make staging alias the
        // reader's slot; wait it out first.
        if cell.changed() {
            cell.wait_applied(Duration::from_secs(1))?;
        }

        let staged = cell.staging_mut();
        *staged = [PortAbility::None; ABILITY_MAX];
        let mut out = 0;
        for ability in port.ability.iter() {
            if ability.dir() != Some(dir) {
                continue;
            }
            staged[out] = match *ability {
                PortAbility::AddVlanTag { dir, mut vlantag } => {
                    vlantag.tci = vlan_calc_tci(vlantag.vid, vlantag.pcp.max(0) as u8);
                    PortAbility::AddVlanTag { dir, vlantag }
                }
                other => other,
            };
            out += 1;
        }

        cell.publish();
        Ok(())
    }

    /// The published abilities of a port direction, for the status-response
    /// builder. Ability sets are plain data the reader never mutates, so a
    /// snapshot of the reference slot is safe from the master.
    pub fn applied(&self, port_id: u16, dir: PortDir) -> AbilitySet {
        *self.cell(port_id, dir).active()
    }

    /// Wrapper for the device RX burst applying rx-side abilities.
    pub fn rx_burst(&self, dev: &EthDev, max: usize) -> Vec<Mbuf> {
        let pkts = dev.rx_burst(max.min(MAX_PKT_BURST));
        if pkts.is_empty() {
            return pkts;
        }

        #[cfg(feature = "latency-stats")]
        {
            let iface = self.ports.get(dev.portid() as usize).and_then(|mng| mng.iface());
            if let Some((PortKind::Ring, iface_no)) = iface {
                latency::calculate_latency(iface_no, &pkts);
            }
        }

        let cell = self.cell(dev.portid(), PortDir::Rx);
        cell.check_swap();
        apply_abilities(cell.active(), pkts)
    }

    /// Wrapper for the device TX burst applying tx-side abilities first.
    /// Packets the abilities or the device reject are freed; returns the
    /// number actually sent.
    pub fn tx_burst(&self, dev: &EthDev, pkts: Vec<Mbuf>) -> usize {
        let cell = self.cell(dev.portid(), PortDir::Tx);
        cell.check_swap();
        let pkts = apply_abilities(cell.active(), pkts);
        if pkts.is_empty() {
            return 0;
        }

        #[cfg(feature = "latency-stats")]
        let pkts = match self.ports.get(dev.portid() as usize).and_then(|mng| mng.iface()) {
            Some((PortKind::Ring, iface_no)) => latency::add_time_stamp(iface_no, pkts),
            _ => pkts,
        };

        let (sent, rest) = dev.tx_burst(pkts);
        drop(rest);
        sent
    }
}

/// Run every configured ability over the burst. A packet the operation
/// fails on is dropped together with the rest of the burst, keeping the
/// all-or-prefix behavior of the original loop.
fn apply_abilities(abilities: &AbilitySet, mut pkts: Vec<Mbuf>) -> Vec<Mbuf> {
    if abilities[0].is_none() {
        return pkts;
    }

    for ability in abilities.iter() {
        match ability {
            PortAbility::AddVlanTag { vlantag, .. } => {
                let mut ok = pkts.len();
                for (i, pkt) in pkts.iter_mut().enumerate() {
                    if add_vlantag_packet(pkt, vlantag.tci).is_err() {
                        error!("Failed to add VLAN tag. (pkts {}/{})", i, ok);
                        ok = i;
                        break;
                    }
                }
                pkts.truncate(ok);
            }
            PortAbility::DelVlanTag { .. } => {
                let mut ok = pkts.len();
                for (i, pkt) in pkts.iter_mut().enumerate() {
                    if del_vlantag_packet(pkt).is_err() {
                        error!("Failed to del VLAN tag. (pkts {}/{})", i, ok);
                        ok = i;
                        break;
                    }
                }
                pkts.truncate(ok);
            }
            PortAbility::None => break,
        }
    }
    pkts
}

/// Push a VLAN tag, or overwrite the TCI when one is already there.
fn add_vlantag_packet(pkt: &mut Mbuf, tci: u16) -> Result<()> {
    let data = pkt.data();
    if data.len() >= 14 && u16::from_be_bytes([data[12], data[13]]) == ETHER_TYPE_VLAN {
        pkt.data_mut()[14..16].copy_from_slice(&tci.to_be_bytes());
    } else {
        pkt.prepend(VLAN_HDR_LEN)?;
        let data = pkt.data_mut();
        // Move both addresses to the front, then splice TPID + TCI in
        // between them and the original Ethertype.
        data.copy_within(VLAN_HDR_LEN..VLAN_HDR_LEN + 12, 0);
        data[12..14].copy_from_slice(&ETHER_TYPE_VLAN.to_be_bytes());
        data[14..16].copy_from_slice(&tci.to_be_bytes());
    }
    set_fcs_packet(pkt);
    Ok(())
}

/// Strip the VLAN tag if the frame carries one.
fn del_vlantag_packet(pkt: &mut Mbuf) -> Result<()> {
    let data = pkt.data();
    if data.len() >= 14 && u16::from_be_bytes([data[12], data[13]]) == ETHER_TYPE_VLAN {
        let data = pkt.data_mut();
        data.copy_within(0..12, VLAN_HDR_LEN);
        pkt.adj(VLAN_HDR_LEN)?;
        set_fcs_packet(pkt);
    }
    Ok(())
}

/// Recompute the frame check sequence into the tailroom.
fn set_fcs_packet(pkt: &mut Mbuf) {
    let fcs = crc32_ethernet(pkt.data());
    let _ = pkt.write_tailroom(&fcs.to_le_bytes());
}

/// CRC-32 as used for the Ethernet FCS (reflected, poly 0xEDB88320).
fn crc32_ethernet(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ether::frame_dst_and_vid;
    use crate::ether::NO_VLAN;
    use crate::port::VlanTag;

    fn frame(dst: [u8; 6]) -> Vec<u8> {
        let mut f = vec![0u8; 60];
        f[..6].copy_from_slice(&dst);
        f[12] = 0x08;
        f[13] = 0x00;
        f[20] = 0x5a;
        f
    }

    #[test]
    fn test_add_vlantag_untagged() {
        let raw = frame([1, 2, 3, 4, 5, 6]);
        let mut pkt = Mbuf::from_bytes(&raw);

        add_vlantag_packet(&mut pkt, vlan_calc_tci(100, 3)).unwrap();
        assert_eq!(pkt.pkt_len(), raw.len() + VLAN_HDR_LEN);

        let out = pkt.to_vec();
        assert_eq!(&out[..12], &raw[..12]);
        assert_eq!(u16::from_be_bytes([out[12], out[13]]), ETHER_TYPE_VLAN);
        assert_eq!(
            u16::from_be_bytes([out[14], out[15]]),
            vlan_calc_tci(100, 3)
        );
        // original ethertype and payload follow the tag
        assert_eq!(&out[16..18], &raw[12..14]);
        assert_eq!(&out[18..], &raw[14..]);

        let (_, vid) = frame_dst_and_vid(&out).unwrap();
        assert_eq!(vid, 100);
    }

    #[test]
    fn test_add_vlantag_overwrites_tci() {
        let raw = frame([1, 2, 3, 4, 5, 6]);
        let mut pkt = Mbuf::from_bytes(&raw);
        add_vlantag_packet(&mut pkt, vlan_calc_tci(100, 0)).unwrap();
        add_vlantag_packet(&mut pkt, vlan_calc_tci(200, 0)).unwrap();

        // no second header was inserted
        assert_eq!(pkt.pkt_len(), raw.len() + VLAN_HDR_LEN);
        let (_, vid) = frame_dst_and_vid(&pkt.to_vec()).unwrap();
        assert_eq!(vid, 200);
    }

    #[test]
    fn test_del_vlantag_roundtrip() {
        let raw = frame([9, 9, 9, 9, 9, 9]);
        let mut pkt = Mbuf::from_bytes(&raw);
        add_vlantag_packet(&mut pkt, vlan_calc_tci(42, 0)).unwrap();
        del_vlantag_packet(&mut pkt).unwrap();
        assert_eq!(pkt.to_vec(), raw);

        // stripping an untagged frame is a no-op
        del_vlantag_packet(&mut pkt).unwrap();
        assert_eq!(pkt.to_vec(), raw);
    }

    #[test]
    fn test_table_applies_tx_ability() {
        use crate::ethdev;
        use crate::port::{PortAbility, PortInfo};

        let port_id = ethdev::probe_phys(8)[5];
        let dev = ethdev::dev(port_id).unwrap();

        let mut info = PortInfo {
            kind: PortKind::Phy,
            no: 5,
            defined: true,
            ethdev_port_id: port_id as i32,
            cls_attrs: Default::default(),
            ability: [PortAbility::None; ABILITY_MAX],
        };
        info.add_ability(PortAbility::AddVlanTag {
            dir: PortDir::Tx,
            vlantag: VlanTag {
                vid: 77,
                pcp: 0,
                tci: 0,
            },
        })
        .unwrap();

        let table = PortAbilityTable::new();
        table.update(&info, PortDir::Tx).unwrap();

        let raw = frame([1, 1, 1, 1, 1, 1]);
        let sent = table.tx_burst(&dev, vec![Mbuf::from_bytes(&raw)]);
        assert_eq!(sent, 1);

        let out = dev.drain(1).pop().unwrap();
        let (_, vid) = frame_dst_and_vid(&out.to_vec()).unwrap();
        assert_eq!(vid, 77);

        // rx side has no abilities configured
        dev.inject(vec![Mbuf::from_bytes(&raw)]);
        let pkts = table.rx_burst(&dev, MAX_PKT_BURST);
        assert_eq!(pkts.len(), 1);
        let (_, vid) = frame_dst_and_vid(&pkts[0].to_vec()).unwrap();
        assert_eq!(vid, NO_VLAN);
    }
}
