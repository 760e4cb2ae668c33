//! The traffic mirror: one rx port duplicated onto two tx ports.
//!
//! The original burst goes out on the first tx port while a copy of every
//! packet, shallow or deep depending on the build, goes out on the second.
//! Copies come from a dedicated process-local mempool; a failed allocation
//! drops that one packet and never stalls the loop.

use crate::comp::{ComponentInfo, ComponentKind};
use crate::context::{Context, PLAN_APPLY_TIMEOUT};
use crate::dblbuf::DoubleBuffered;
use crate::errors::{Error, Result};
use crate::mbuf::{Mbuf, Mempool, MBUF_DEFAULT_BUF_SIZE, PKTMBUF_HEADROOM};
use crate::port::{IfaceInfo, PortRef};
use crate::MAX_PKT_BURST;

const MIRROR_POOL_NAME: &str = "spp_mirror_pool";
const MEMPOOL_CACHE_SIZE: u32 = 256;
const NB_RXD: usize = 1024;
const NB_TXD: usize = 1024;

/// Published plan of one mirror.
#[derive(Clone, Debug, Default)]
pub struct MirrorPath {
    pub name: String,
    pub in_use: bool,
    pub rx: Vec<PortRef>,
    pub tx: Vec<PortRef>,
}

#[derive(Default)]
pub struct MirrorInfo {
    pub dbl: DoubleBuffered<MirrorPath>,
}

/// Create (or look up) the copy pool of this worker process.
pub fn mirror_pool_create(client_id: i32) -> Mempool {
    let nb_mbufs = (NB_RXD + NB_TXD + MAX_PKT_BURST + MEMPOOL_CACHE_SIZE as usize).max(8192);
    let name = format!("{}_{}", MIRROR_POOL_NAME, client_id);

    let data_room = if cfg!(feature = "shallowcopy") {
        // Clones only reference the original data; headroom is enough.
        PKTMBUF_HEADROOM
    } else {
        MBUF_DEFAULT_BUF_SIZE
    };

    Mempool::create(&name, nb_mbufs, MEMPOOL_CACHE_SIZE, data_room)
}

/// Rebuild and publish the plan of a mirror component.
pub fn update(ctx: &Context, comp: &ComponentInfo, iface: &IfaceInfo) -> Result<()> {
    let num_rx = comp.rx_ports.len();
    let num_tx = comp.tx_ports.len();

    if num_rx > 1 {
        error!(
            "Component[{}] Setting error. (type = mirror, rx = {})",
            comp.comp_id, num_rx
        );
        return Err(Error::PortCountOverflow);
    }
    if num_tx > 2 {
        error!(
            "Component[{}] Setting error. (type = mirror, tx = {})",
            comp.comp_id, num_tx
        );
        return Err(Error::PortCountOverflow);
    }

    let info = &ctx.mir_infos[comp.comp_id];
    if info.dbl.changed() {
        info.dbl.wait_applied(PLAN_APPLY_TIMEOUT)?;
    }

    info!(
        "Component[{}] Start update component. (name = {}, type = mirror)",
        comp.comp_id, comp.name
    );

    let path = info.dbl.staging_mut();
    *path = MirrorPath::default();
    path.name = comp.name.clone();
    path.in_use = comp.kind == Some(ComponentKind::Mirror);
    for uid in comp.rx_ports.iter() {
        path.rx.push(PortRef::resolve(iface, *uid)?);
    }
    for uid in comp.tx_ports.iter() {
        path.tx.push(PortRef::resolve(iface, *uid)?);
    }

    info.dbl.publish();
    info.dbl.wait_applied(PLAN_APPLY_TIMEOUT)?;

    info!(
        "Component[{}] Complete update component. (name = {}, type = mirror)",
        comp.comp_id, comp.name
    );
    Ok(())
}

/// Duplicate one packet out of the copy pool.
#[cfg(feature = "shallowcopy")]
fn copy_packet(pool: &Mempool, org: &Mbuf) -> Option<Mbuf> {
    pool.clone_of(org).ok()
}

/// Deep copy: a fresh buffer chain with per-segment payload and the
/// metadata the tx path reads. Dropping the partial chain on a failed
/// allocation frees it back into the pool.
#[cfg(not(feature = "shallowcopy"))]
fn copy_packet(pool: &Mempool, org: &Mbuf) -> Option<Mbuf> {
    let mut head: Option<Mbuf> = None;

    for seg in org.seg_bytes() {
        let mut copy = match pool.alloc() {
            Ok(copy) => copy,
            Err(_) => {
                info!("copy mbuf alloc NG!");
                return None;
            }
        };
        if copy.append(seg).is_err() {
            info!("copy mbuf alloc NG!");
            return None;
        }

        match head.as_mut() {
            None => head = Some(copy),
            Some(head) => head.chain(copy),
        }
    }

    head.map(|mut copy| {
        copy.port = org.port;
        copy.vlan_tci = org.vlan_tci;
        copy.tx_offload = org.tx_offload;
        copy.hash = org.hash;
        copy.ol_flags = org.ol_flags;
        copy.packet_type = org.packet_type;
        copy.timestamp = org.timestamp;
        copy
    })
}

/// One iteration of the mirror loop: originals on tx[0], copies on tx[1].
pub fn mirror_proc(ctx: &Context, id: usize) {
    let info = &ctx.mir_infos[id];
    info.dbl.check_swap();
    let path = info.dbl.active();

    // The mirror runs only once fully patched: 1 rx and 2 tx ports.
    if !(path.tx.len() == 2 && path.rx.len() == 1) {
        return;
    }

    let pool = match &ctx.mirror_pool {
        Some(pool) => pool,
        None => return,
    };

    let pkts = ctx.abilities.rx_burst(&path.rx[0].dev, MAX_PKT_BURST);
    if pkts.is_empty() {
        return;
    }
    let nb_rx = pkts.len();

    let copies: Vec<Mbuf> = pkts.iter().filter_map(|pkt| copy_packet(pool, pkt)).collect();

    let nb_tx2 = ctx.abilities.tx_burst(&path.tx[1].dev, copies);
    let nb_tx1 = ctx.abilities.tx_burst(&path.tx[0].dev, pkts);

    if nb_tx1 != nb_tx2 {
        info!(
            "mirror paket drop nb_rx={} nb_tx1={} nb_tx2={}",
            nb_rx, nb_tx1, nb_tx2
        );
    }
}

/// Status element of a mirror, or None while the slot is unused.
pub fn component_status(ctx: &Context, id: usize) -> Option<(String, ComponentKind, Vec<PortRef>, Vec<PortRef>)> {
    let path = ctx.mir_infos[id].dbl.active();
    if !path.in_use {
        return None;
    }
    Some((
        path.name.clone(),
        ComponentKind::Mirror,
        path.rx.clone(),
        path.tx.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ProcType, StartupParam};
    use crate::ethdev;
    use crate::port::{PortId, PortKind};

    fn test_ctx() -> Context {
        let phys = ethdev::probe_phys(16);
        let mut ctx = Context::new(
            StartupParam {
                client_id: 3,
                server_ip: "127.0.0.1".into(),
                server_port: 6666,
                vhost_client: false,
                proc_type: ProcType::Mirror,
            },
            2,
            &phys,
        );
        ctx.mirror_pool = Some(mirror_pool_create(3));
        ctx
    }

    fn phy_dev(no: u16) -> ethdev::EthDev {
        let id = ethdev::get_port_by_name(&format!("net_phy{}", no)).unwrap();
        ethdev::dev(id).unwrap()
    }

    fn publish_and_take(ctx: &Context, comp: &ComponentInfo) {
        let iface = ctx.mng.lock().unwrap().iface.clone();
        crossbeam::thread::scope(|s| {
            let handle = s.spawn(|_| {
                while !ctx.mir_infos[comp.comp_id].dbl.check_swap() {
                    std::thread::yield_now();
                }
            });
            update(ctx, comp, &iface).unwrap();
            handle.join().unwrap();
        })
        .unwrap();
    }

    #[test]
    fn test_mirror_duplicates_bit_identical() {
        let ctx = test_ctx();
        let mut comp = ComponentInfo::default();
        comp.comp_id = 0;
        comp.name = "mi0".into();
        comp.kind = Some(ComponentKind::Mirror);
        comp.rx_ports.push(PortId::new(PortKind::Phy, 7));
        comp.tx_ports.push(PortId::new(PortKind::Phy, 8));
        comp.tx_ports.push(PortId::new(PortKind::Phy, 9));

        publish_and_take(&ctx, &comp);

        let rx = phy_dev(7);
        let frames: Vec<Vec<u8>> = (0..8u8)
            .map(|i| {
                let mut f = vec![i; 64];
                f[0] = 0xaa;
                f
            })
            .collect();
        rx.inject(frames.iter().map(|f| Mbuf::from_bytes(f)).collect());

        mirror_proc(&ctx, 0);

        let orig: Vec<Vec<u8>> = phy_dev(8).drain(32).iter().map(|m| m.to_vec()).collect();
        let mirrored: Vec<Vec<u8>> = phy_dev(9).drain(32).iter().map(|m| m.to_vec()).collect();

        assert_eq!(orig, frames);
        assert_eq!(mirrored, frames);
    }

    #[test]
    fn test_mirror_skips_until_fully_patched() {
        let ctx = test_ctx();
        let mut comp = ComponentInfo::default();
        comp.comp_id = 1;
        comp.name = "mi1".into();
        comp.kind = Some(ComponentKind::Mirror);
        comp.rx_ports.push(PortId::new(PortKind::Phy, 14));
        comp.tx_ports.push(PortId::new(PortKind::Phy, 15));

        publish_and_take(&ctx, &comp);

        let rx = phy_dev(14);
        rx.inject(vec![Mbuf::from_bytes(&[1, 2, 3])]);
        mirror_proc(&ctx, 1);

        // not consumed: the plan has a single tx port
        assert_eq!(rx.rx_burst(8).len(), 1);
    }

    #[test]
    fn test_update_rejects_three_tx() {
        let ctx = test_ctx();
        let mut comp = ComponentInfo::default();
        comp.comp_id = 2;
        comp.kind = Some(ComponentKind::Mirror);
        comp.tx_ports.push(PortId::new(PortKind::Phy, 0));
        comp.tx_ports.push(PortId::new(PortKind::Phy, 1));
        comp.tx_ports.push(PortId::new(PortKind::Phy, 2));

        let mng = ctx.mng.lock().unwrap();
        assert!(update(&ctx, &comp, &mng.iface).is_err());
    }
}
