//! The forwarder (1:1) and merger (N:1) burst pipelines.
//!
//! Both share one plan shape and one loop: each rx port is paired with the
//! single tx port, a burst is received, optionally relabeled by port
//! abilities, and transmitted. Packets with no room on the tx side are
//! freed; the loop never blocks and never retries.

use crate::comp::{ComponentInfo, ComponentKind};
use crate::context::{Context, PLAN_APPLY_TIMEOUT};
use crate::dblbuf::DoubleBuffered;
use crate::errors::{Error, Result};
use crate::port::{IfaceInfo, PortRef};
use crate::MAX_PKT_BURST;

/// Published plan of one forwarder or merger.
#[derive(Clone, Debug, Default)]
pub struct ForwardPath {
    pub name: String,
    pub kind: Option<ComponentKind>,
    pub rx: Vec<PortRef>,
    pub tx: Vec<PortRef>,
}

/// Double-buffered plan slot of one component id.
#[derive(Default)]
pub struct ForwardInfo {
    pub dbl: DoubleBuffered<ForwardPath>,
}

/// Rebuild the plan of a forwarder or merger from its staged component
/// entry and publish it towards the owning lcore.
pub fn update(ctx: &Context, comp: &ComponentInfo, iface: &IfaceInfo) -> Result<()> {
    let num_rx = comp.rx_ports.len();
    let num_tx = comp.tx_ports.len();

    if comp.kind == Some(ComponentKind::Forwarder) && num_rx > 1 {
        error!(
            "Component[{}] Setting error. (type = forward, rx = {})",
            comp.comp_id, num_rx
        );
        return Err(Error::PortCountOverflow);
    }
    if num_tx > 1 {
        error!(
            "Component[{}] Setting error. (type = {:?}, tx = {})",
            comp.comp_id, comp.kind, num_tx
        );
        return Err(Error::PortCountOverflow);
    }

    let info = &ctx.fwd_infos[comp.comp_id];
    if info.dbl.changed() {
        info.dbl.wait_applied(PLAN_APPLY_TIMEOUT)?;
    }

    info!(
        "Component[{}] Start update component. (name = {}, type = {:?})",
        comp.comp_id, comp.name, comp.kind
    );

    let path = info.dbl.staging_mut();
    *path = ForwardPath::default();
    path.name = comp.name.clone();
    path.kind = comp.kind;
    for uid in comp.rx_ports.iter() {
        path.rx.push(PortRef::resolve(iface, *uid)?);
    }
    for uid in comp.tx_ports.iter() {
        path.tx.push(PortRef::resolve(iface, *uid)?);
    }

    info.dbl.publish();
    info.dbl.wait_applied(PLAN_APPLY_TIMEOUT)?;

    info!(
        "Component[{}] Complete update component. (name = {}, type = {:?})",
        comp.comp_id, comp.name, comp.kind
    );
    Ok(())
}

/// One iteration of the forwarding loop for component `id`: burst every rx
/// path into the single tx port.
pub fn forward(ctx: &Context, id: usize) {
    let info = &ctx.fwd_infos[id];
    info.dbl.check_swap();
    let path = info.dbl.active();

    for rx in path.rx.iter() {
        let pkts = ctx.abilities.rx_burst(&rx.dev, MAX_PKT_BURST);
        if pkts.is_empty() {
            continue;
        }

        match path.tx.first() {
            Some(tx) => {
                ctx.abilities.tx_burst(&tx.dev, pkts);
            }
            // No tx side configured: the burst is dropped to free the mbufs.
            None => drop(pkts),
        }
    }
}

/// The component element reported in status responses, or None while the
/// plan slot is unused.
pub fn component_status(ctx: &Context, id: usize) -> Option<(String, ComponentKind, Vec<PortRef>, Vec<PortRef>)> {
    let info = &ctx.fwd_infos[id];
    let path = info.dbl.active();
    let kind = path.kind?;
    Some((path.name.clone(), kind, path.rx.clone(), path.tx.clone()))
}
