//! Classification of received packets by destination MAC and VLAN ID.
//!
//! Each classifier owns per-VLAN hash tables mapping MAC keys to attached
//! tx ports, with one optional default target per table. A burst from the
//! single rx port is demuxed into per-target batches which are flushed
//! either when full or at the end of the burst.

use std::collections::HashMap;

use itertools::Itertools;

use crate::comp::{ComponentInfo, ComponentKind};
use crate::context::{Context, PLAN_APPLY_TIMEOUT};
use crate::dblbuf::DoubleBuffered;
use crate::errors::{Error, Result};
use crate::ether::{frame_dst_and_vid, EtherAddr, NO_VLAN};
use crate::mbuf::Mbuf;
use crate::port::{IfaceInfo, PortRef, DEFAULT_CLS_DMY_ADDR};
use crate::MAX_PKT_BURST;

/// MAC keys of one VLAN, pointing into the plan's tx port list.
#[derive(Clone, Debug, Default)]
pub struct MacTable {
    pub classified: HashMap<u64, usize>,
    pub default_classified: Option<usize>,
}

/// Published plan of one classifier.
#[derive(Clone, Debug, Default)]
pub struct ClsPlan {
    pub name: String,
    pub in_use: bool,
    /// Per-VLAN tables; untagged traffic is keyed under `NO_VLAN`.
    pub tables: HashMap<u16, MacTable>,
    pub rx: Option<PortRef>,
    pub tx: Vec<PortRef>,
}

#[derive(Default)]
pub struct ClassifierInfo {
    pub dbl: DoubleBuffered<ClsPlan>,
}

/// Rebuild the hash tables and default mapping of a classifier from its
/// staged ports and publish the plan.
pub fn update(ctx: &Context, comp: &ComponentInfo, iface: &IfaceInfo) -> Result<()> {
    let info = &ctx.cls_infos[comp.comp_id];
    if info.dbl.changed() {
        info.dbl.wait_applied(PLAN_APPLY_TIMEOUT)?;
    }

    let plan = info.dbl.staging_mut();
    *plan = ClsPlan::default();
    plan.name = comp.name.clone();
    plan.in_use = comp.kind == Some(ComponentKind::ClassifierMac);

    if let Some(uid) = comp.rx_ports.first() {
        plan.rx = Some(PortRef::resolve(iface, *uid)?);
    }

    for (idx, uid) in comp.tx_ports.iter().enumerate() {
        let port = iface.port(*uid);
        plan.tx.push(PortRef::resolve(iface, *uid)?);

        let attrs = &port.cls_attrs;
        if attrs.mac_addr == 0 {
            continue;
        }

        let table = plan.tables.entry(attrs.vid).or_insert_with(MacTable::default);
        if attrs.mac_addr == DEFAULT_CLS_DMY_ADDR {
            if table.default_classified.is_some() {
                return Err(Error::ClsTableConflict(format!("default/{}", attrs.vid)));
            }
            table.default_classified = Some(idx);
        } else if table.classified.insert(attrs.mac_addr, idx).is_some() {
            return Err(Error::ClsTableConflict(format!(
                "{}/{}",
                attrs.vid, attrs.mac_addr_str
            )));
        }
    }

    info.dbl.publish();
    info.dbl.wait_applied(PLAN_APPLY_TIMEOUT)?;
    Ok(())
}

/// Pick the target tx index for a destination MAC under a VLAN ID:
/// exact `(vid, mac)`, then the MAC-only table, then the VLAN's default,
/// then the MAC-only default.
fn lookup(plan: &ClsPlan, vid: u16, mac: u64) -> Option<usize> {
    if let Some(table) = plan.tables.get(&vid) {
        if let Some(idx) = table.classified.get(&mac) {
            return Some(*idx);
        }
    }
    if vid != NO_VLAN {
        if let Some(table) = plan.tables.get(&NO_VLAN) {
            if let Some(idx) = table.classified.get(&mac) {
                return Some(*idx);
            }
        }
    }
    if let Some(idx) = plan.tables.get(&vid).and_then(|t| t.default_classified) {
        return Some(idx);
    }
    if vid != NO_VLAN {
        if let Some(idx) = plan
            .tables
            .get(&NO_VLAN)
            .and_then(|t| t.default_classified)
        {
            return Some(idx);
        }
    }
    None
}

/// One iteration of the classifier loop for component `id`.
pub fn classify(ctx: &Context, id: usize) {
    let info = &ctx.cls_infos[id];
    info.dbl.check_swap();
    let plan = info.dbl.active();

    let rx = match &plan.rx {
        Some(rx) => rx,
        None => return,
    };

    let pkts = ctx.abilities.rx_burst(&rx.dev, MAX_PKT_BURST);
    if pkts.is_empty() {
        return;
    }

    let mut batches: Vec<Vec<Mbuf>> = plan.tx.iter().map(|_| Vec::new()).collect();
    for pkt in pkts {
        let key = match frame_dst_and_vid(pkt.data()) {
            Some((dst, vid)) => (dst.as_u64(), vid),
            // Runt frame without a full Ethernet header.
            None => continue,
        };

        match lookup(plan, key.1, key.0) {
            Some(target) => {
                batches[target].push(pkt);
                if batches[target].len() >= MAX_PKT_BURST {
                    let batch = std::mem::replace(&mut batches[target], Vec::new());
                    ctx.abilities.tx_burst(&plan.tx[target].dev, batch);
                }
            }
            // No match anywhere: the packet is dropped.
            None => drop(pkt),
        }
    }

    for (target, batch) in batches.into_iter().enumerate() {
        if !batch.is_empty() {
            ctx.abilities.tx_burst(&plan.tx[target].dev, batch);
        }
    }
}

/// An entry of the classifier table as listed by the status command.
#[derive(Clone, Debug, PartialEq)]
pub struct ClsTableEntry {
    pub cls_type: &'static str,
    pub vid: u16,
    pub mac: String,
    pub port: String,
}

/// Emit every populated `(vid, mac)` pair of the classifier, VLAN tables
/// first in ascending order, for the status-response builder.
pub fn iterate_table(ctx: &Context, id: usize) -> Vec<ClsTableEntry> {
    let plan = ctx.cls_infos[id].dbl.active();
    let mut entries = Vec::new();

    for vid in plan.tables.keys().sorted() {
        let table = &plan.tables[vid];
        let cls_type = if *vid == NO_VLAN { "mac" } else { "vlan" };

        for (mac, target) in table
            .classified
            .iter()
            .sorted_by_key(|(mac, _)| **mac)
        {
            entries.push(ClsTableEntry {
                cls_type,
                vid: *vid,
                mac: EtherAddr::from_u64(*mac).to_string(),
                port: plan.tx[*target].uid.to_string(),
            });
        }

        if let Some(target) = table.default_classified {
            entries.push(ClsTableEntry {
                cls_type,
                vid: *vid,
                mac: EtherAddr::from_u64(DEFAULT_CLS_DMY_ADDR).to_string(),
                port: plan.tx[target].uid.to_string(),
            });
        }
    }

    entries
}

/// Status element of a classifier, or None while the slot is unused.
pub fn component_status(ctx: &Context, id: usize) -> Option<(String, ComponentKind, Vec<PortRef>, Vec<PortRef>)> {
    let plan = ctx.cls_infos[id].dbl.active();
    if !plan.in_use {
        return None;
    }
    let rx = plan.rx.iter().cloned().collect();
    Some((
        plan.name.clone(),
        ComponentKind::ClassifierMac,
        rx,
        plan.tx.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ProcType, StartupParam};
    use crate::ethdev;
    use crate::ether::vlan_calc_tci;
    use crate::ether::ETHER_TYPE_VLAN;
    use crate::port::{PortId, PortKind};
    use crate::ring::{self, Ring};

    fn test_ctx() -> Context {
        let phys = ethdev::probe_phys(16);
        Context::new(
            StartupParam {
                client_id: 2,
                server_ip: "127.0.0.1".into(),
                server_port: 6666,
                vhost_client: false,
                proc_type: ProcType::Vf,
            },
            2,
            &phys,
        )
    }

    fn frame(dst: &str, vid: Option<u16>) -> Mbuf {
        let dst: EtherAddr = dst.parse().unwrap();
        let mut f = Vec::new();
        f.extend_from_slice(dst.octets());
        f.extend_from_slice(&[0u8; 6]);
        if let Some(vid) = vid {
            f.extend_from_slice(&ETHER_TYPE_VLAN.to_be_bytes());
            f.extend_from_slice(&vlan_calc_tci(vid, 0).to_be_bytes());
        }
        f.extend_from_slice(&0x0800u16.to_be_bytes());
        f.resize(60, 0);
        Mbuf::from_bytes(&f)
    }

    fn build_classifier(
        ctx: &Context,
        comp_id: usize,
        rx_phy: u16,
        ring_a: u16,
        ring_b: u16,
    ) -> ComponentInfo {
        // back the two tx ports with rings so the test can drain them
        Ring::create(&ring::rx_queue_name(ring_a), 64);
        Ring::create(&ring::rx_queue_name(ring_b), 64);

        let mut comp = ComponentInfo::default();
        comp.comp_id = comp_id;
        comp.name = format!("cls{}", comp_id);
        comp.kind = Some(ComponentKind::ClassifierMac);
        comp.rx_ports.push(PortId::new(PortKind::Phy, rx_phy));
        comp.tx_ports.push(PortId::new(PortKind::Ring, ring_a));
        comp.tx_ports.push(PortId::new(PortKind::Ring, ring_b));

        let mut mng = ctx.mng.lock().unwrap();
        for uid in comp.tx_ports.iter().chain(comp.rx_ports.iter()) {
            mng.iface.port_mut(*uid).defined = true;
        }
        mng.iface.update_port_info(false).unwrap();
        drop(mng);
        comp
    }

    fn phy_dev(no: u16) -> ethdev::EthDev {
        let id = ethdev::get_port_by_name(&format!("net_phy{}", no)).unwrap();
        ethdev::dev(id).unwrap()
    }

    fn publish_and_take(ctx: &Context, comp: &ComponentInfo) {
        let iface = ctx.mng.lock().unwrap().iface.clone();
        crossbeam::thread::scope(|s| {
            let handle = s.spawn(|_| {
                while !ctx.cls_infos[comp.comp_id].dbl.check_swap() {
                    std::thread::yield_now();
                }
            });
            update(ctx, comp, &iface).unwrap();
            handle.join().unwrap();
        })
        .unwrap();
    }

    #[test]
    fn test_classify_by_mac_with_default() {
        let ctx = test_ctx();
        let comp = build_classifier(&ctx, 0, 10, 20, 21);

        {
            let mut mng = ctx.mng.lock().unwrap();
            let port = mng.iface.port_mut(PortId::new(PortKind::Ring, 20));
            port.cls_attrs.mac_addr = "aa:bb:cc:dd:ee:00".parse::<EtherAddr>().unwrap().as_u64();
            port.cls_attrs.mac_addr_str = "aa:bb:cc:dd:ee:00".into();
            port.cls_attrs.vid = NO_VLAN;

            let port = mng.iface.port_mut(PortId::new(PortKind::Ring, 21));
            port.cls_attrs.mac_addr = DEFAULT_CLS_DMY_ADDR;
            port.cls_attrs.mac_addr_str = "00:00:00:00:00:01".into();
            port.cls_attrs.vid = NO_VLAN;
        }
        publish_and_take(&ctx, &comp);

        let rx = phy_dev(10);
        rx.inject(vec![
            frame("aa:bb:cc:dd:ee:00", None),
            frame("ff:ff:ff:ff:ff:ff", None),
        ]);

        classify(&ctx, 0);

        let hit = Ring::lookup(&ring::rx_queue_name(20)).unwrap().dequeue_burst(8);
        let dfl = Ring::lookup(&ring::rx_queue_name(21)).unwrap().dequeue_burst(8);
        assert_eq!(hit.len(), 1);
        assert_eq!(dfl.len(), 1);
        assert_eq!(&hit[0].to_vec()[..6], "aa:bb:cc:dd:ee:00".parse::<EtherAddr>().unwrap().octets());
        assert!(dfl[0].to_vec()[..6].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn test_vlan_entry_wins_over_mac_default() {
        let ctx = test_ctx();
        let comp = build_classifier(&ctx, 1, 11, 22, 23);

        {
            let mut mng = ctx.mng.lock().unwrap();
            let port = mng.iface.port_mut(PortId::new(PortKind::Ring, 22));
            port.cls_attrs.mac_addr = "aa:bb:cc:dd:ee:00".parse::<EtherAddr>().unwrap().as_u64();
            port.cls_attrs.mac_addr_str = "aa:bb:cc:dd:ee:00".into();
            port.cls_attrs.vid = 100;

            let port = mng.iface.port_mut(PortId::new(PortKind::Ring, 23));
            port.cls_attrs.mac_addr = DEFAULT_CLS_DMY_ADDR;
            port.cls_attrs.mac_addr_str = "00:00:00:00:00:01".into();
            port.cls_attrs.vid = NO_VLAN;
        }
        publish_and_take(&ctx, &comp);

        let rx = phy_dev(11);
        rx.inject(vec![frame("aa:bb:cc:dd:ee:00", Some(100))]);

        classify(&ctx, 1);

        let vlan_hits = Ring::lookup(&ring::rx_queue_name(22)).unwrap().dequeue_burst(8);
        let defaults = Ring::lookup(&ring::rx_queue_name(23)).unwrap().dequeue_burst(8);
        assert_eq!(vlan_hits.len(), 1);
        assert!(defaults.is_empty());

        // an untagged frame to the same MAC falls through to the default
        rx.inject(vec![frame("aa:bb:cc:dd:ee:00", None)]);
        classify(&ctx, 1);
        assert_eq!(
            Ring::lookup(&ring::rx_queue_name(23)).unwrap().dequeue_burst(8).len(),
            1
        );
    }

    #[test]
    fn test_iterate_table_lists_entries() {
        let ctx = test_ctx();
        let comp = build_classifier(&ctx, 2, 12, 24, 25);
        {
            let mut mng = ctx.mng.lock().unwrap();
            let port = mng.iface.port_mut(PortId::new(PortKind::Ring, 24));
            port.cls_attrs.mac_addr = "aa:bb:cc:dd:ee:00".parse::<EtherAddr>().unwrap().as_u64();
            port.cls_attrs.mac_addr_str = "aa:bb:cc:dd:ee:00".into();
            port.cls_attrs.vid = 100;
        }
        publish_and_take(&ctx, &comp);

        let entries = iterate_table(&ctx, 2);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cls_type, "vlan");
        assert_eq!(entries[0].vid, 100);
        assert_eq!(entries[0].mac, "aa:bb:cc:dd:ee:00");
        assert_eq!(entries[0].port, "ring:24");
    }

    #[test]
    fn test_conflicting_entries_rejected() {
        let ctx = test_ctx();
        let mut comp = build_classifier(&ctx, 3, 13, 26, 27);
        comp.tx_ports.push(PortId::new(PortKind::Ring, 26));

        let mut mng = ctx.mng.lock().unwrap();
        let port = mng.iface.port_mut(PortId::new(PortKind::Ring, 26));
        port.cls_attrs.mac_addr = 42;
        port.cls_attrs.mac_addr_str = "2a:00:00:00:00:00".into();
        port.cls_attrs.vid = NO_VLAN;

        // the duplicated tx port maps the same (vid, mac) twice
        let iface = mng.iface.clone();
        drop(mng);
        assert!(matches!(
            update(&ctx, &comp, &iface),
            Err(Error::ClsTableConflict(_))
        ));
    }
}
