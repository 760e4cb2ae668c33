//! Process-wide management data.
//!
//! Everything the master thread owns is gathered in one `Context` built in
//! main and shared with the slave lcores through an `Arc`. Staged
//! configuration (interface registry, component table, change flags and the
//! cancel backup) lives behind a mutex that only the control path locks;
//! the fast path sees published plans through the double buffers and plain
//! atomic words.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::ability::PortAbilityTable;
use crate::classifier::{self, ClassifierInfo};
use crate::comp::{CompTable, ComponentKind};
use crate::errors::Result;
use crate::ethdev;
use crate::forwarder::{self, ForwardInfo};
use crate::lcore::{self, CoreInfo, LcoreMng, LcoreStatus};
use crate::mbuf::Mempool;
use crate::mirror::{self, MirrorInfo};
use crate::pcap::{CaptureCtl, PcapCtx};
use crate::port::{self, IfaceInfo, PortDir};
use crate::MAX_LCORE;

/// How long a flush waits for one lcore to take a published plan.
pub const PLAN_APPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// The kind of secondary process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcType {
    Vf,
    Mirror,
    Pcap,
}

impl ProcType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcType::Vf => "vf",
            ProcType::Mirror => "mirror",
            ProcType::Pcap => "pcap",
        }
    }
}

/// Options given at process invocation.
#[derive(Clone, Debug)]
pub struct StartupParam {
    pub client_id: i32,
    pub server_ip: String,
    pub server_port: u16,
    pub vhost_client: bool,
    pub proc_type: ProcType,
}

/// Snapshot for the cancel command path.
#[derive(Clone)]
pub struct BackupInfo {
    pub iface: IfaceInfo,
    pub comps: CompTable,
    pub cores: Vec<CoreInfo>,
}

/// Master-staged state: mutated by commands, committed by flush.
pub struct MngData {
    pub iface: IfaceInfo,
    pub comps: CompTable,
    pub change_core: Vec<bool>,
    pub change_component: Vec<bool>,
    pub backup: BackupInfo,
}

pub struct Context {
    pub startup: StartupParam,
    pub lcores: LcoreMng,
    pub abilities: PortAbilityTable,
    /// Dispatch table read by the slave loops: `ComponentKind` index + 1,
    /// or 0 for an empty slot. Commands never touch it; it is published by
    /// the flush in lockstep with the typed plans (`update_comp_info`),
    /// and by the cancel path when it resyncs from the backup.
    comp_kinds: Vec<AtomicU8>,
    pub cls_infos: Vec<ClassifierInfo>,
    pub fwd_infos: Vec<ForwardInfo>,
    pub mir_infos: Vec<MirrorInfo>,
    /// Copy pool of the mirror process.
    pub mirror_pool: Option<Mempool>,
    /// Capture request/status words of the pcap process.
    pub capture: CaptureCtl,
    /// Capture configuration and writer states of the pcap process.
    pub pcap: Option<PcapCtx>,
    pub mng: Mutex<MngData>,
}

const DISPATCH_KINDS: [ComponentKind; 4] = [
    ComponentKind::ClassifierMac,
    ComponentKind::Forwarder,
    ComponentKind::Merger,
    ComponentKind::Mirror,
];

impl Context {
    /// Build the management data for a process with `nof_slaves` worker
    /// lcores. `phy_ports` are the ethdev IDs probed at startup.
    pub fn new(startup: StartupParam, nof_slaves: u32, phy_ports: &[ethdev::PortId]) -> Context {
        let iface = IfaceInfo::new(phy_ports);
        let comps = CompTable::default();
        let backup = BackupInfo {
            iface: iface.clone(),
            comps: comps.clone(),
            cores: vec![CoreInfo::default(); MAX_LCORE],
        };

        Context {
            startup,
            lcores: LcoreMng::new(nof_slaves),
            abilities: PortAbilityTable::new(),
            comp_kinds: (0..MAX_LCORE).map(|_| AtomicU8::new(0)).collect(),
            cls_infos: (0..MAX_LCORE).map(|_| ClassifierInfo::default()).collect(),
            fwd_infos: (0..MAX_LCORE).map(|_| ForwardInfo::default()).collect(),
            mir_infos: (0..MAX_LCORE).map(|_| MirrorInfo::default()).collect(),
            mirror_pool: None,
            capture: CaptureCtl::default(),
            pcap: None,
            mng: Mutex::new(MngData {
                iface,
                comps,
                change_core: vec![false; MAX_LCORE],
                change_component: vec![false; MAX_LCORE],
                backup,
            }),
        }
    }

    pub fn client_id(&self) -> i32 {
        self.startup.client_id
    }

    pub fn proc_type(&self) -> ProcType {
        self.startup.proc_type
    }

    /// Component kind as seen by the dispatch loops.
    pub fn comp_kind(&self, comp_id: usize) -> Option<ComponentKind> {
        match self.comp_kinds[comp_id].load(Ordering::Acquire) {
            0 => None,
            n => Some(DISPATCH_KINDS[(n - 1) as usize]),
        }
    }

    /// Publish the kind of a component slot for the dispatch loops; `None`
    /// empties the slot so the lcore skips it until re-start.
    pub fn set_comp_kind(&self, comp_id: usize, kind: Option<ComponentKind>) {
        let val = kind
            .and_then(|k| DISPATCH_KINDS.iter().position(|d| *d == k))
            .map_or(0, |i| (i + 1) as u8);
        self.comp_kinds[comp_id].store(val, Ordering::Release);
    }

    /// Snapshot the staged configuration as the new rollback point and
    /// clear the change flags.
    pub fn backup_mng_info(&self, mng: &mut MngData) {
        log_all_mng_info(self, mng);
        mng.backup.iface = mng.iface.clone();
        mng.backup.comps = mng.comps.clone();
        for lcore_id in 0..MAX_LCORE as u32 {
            mng.backup.cores[lcore_id as usize] =
                self.lcores.core(lcore_id).core.staging().clone();
        }
        for flag in mng.change_core.iter_mut() {
            *flag = false;
        }
        for flag in mng.change_component.iter_mut() {
            *flag = false;
        }
    }

    /// Reinstate the backup snapshot wholesale: staged views are restored
    /// and every plan that drifted from it is republished.
    pub fn cancel_mng_info(&self, mng: &mut MngData) -> Result<()> {
        let prev_comps = mng.comps.clone();
        mng.iface = mng.backup.iface.clone();
        mng.comps = mng.backup.comps.clone();

        for lcore_id in self.lcores.slave_ids().to_vec() {
            let cell = &self.lcores.core(lcore_id).core;
            let target = &mng.backup.cores[lcore_id as usize];
            if cell.staging() != target {
                *cell.staging_mut() = target.clone();
                mng.change_core[lcore_id as usize] = true;
            } else {
                mng.change_core[lcore_id as usize] = false;
            }
        }

        for comp_id in 0..MAX_LCORE {
            let comp = mng.comps.get(comp_id);
            self.set_comp_kind(comp_id, comp.kind);
            // A slot must be republished if the batch touched it, whether
            // through the component entry itself or its ports' attributes.
            mng.change_component[comp_id] = comp.in_use()
                && (mng.change_component[comp_id] || *prev_comps.get(comp_id) != *comp);
        }

        self.update_lcore_info(mng)?;
        self.update_comp_info(mng)?;
        self.backup_mng_info(mng);
        Ok(())
    }

    /// Flush step 2: publish the edited per-lcore component lists and wait
    /// for each changed lcore to run with them.
    pub fn update_lcore_info(&self, mng: &MngData) -> Result<()> {
        for lcore_id in self.lcores.slave_ids() {
            if !mng.change_core[*lcore_id as usize] {
                continue;
            }
            let cell = &self.lcores.core(*lcore_id).core;
            cell.publish();
        }

        for lcore_id in self.lcores.slave_ids() {
            if !mng.change_core[*lcore_id as usize] {
                continue;
            }
            let cell = &self.lcores.core(*lcore_id).core;
            cell.wait_applied(PLAN_APPLY_TIMEOUT)?;
            cell.sync();
        }
        Ok(())
    }

    /// Flush step 3: rebuild and publish the typed plan of every changed
    /// component, abilities first.
    pub fn update_comp_info(&self, mng: &MngData) -> Result<()> {
        for comp_id in 0..MAX_LCORE {
            if !mng.change_component[comp_id] {
                continue;
            }
            let comp = mng.comps.get(comp_id);

            for uid in comp.rx_ports.iter() {
                self.abilities.update(mng.iface.port(*uid), PortDir::Rx)?;
            }
            for uid in comp.tx_ports.iter() {
                self.abilities.update(mng.iface.port(*uid), PortDir::Tx)?;
            }

            let ret = match comp.kind {
                Some(ComponentKind::ClassifierMac) => classifier::update(self, comp, &mng.iface),
                Some(ComponentKind::Mirror) => mirror::update(self, comp, &mng.iface),
                Some(_) => forwarder::update(self, comp, &mng.iface),
                None => Ok(()),
            };
            if let Err(err) = ret {
                error!(
                    "Flush error. (component = {}, type = {:?})",
                    comp.name, comp.kind
                );
                return Err(err);
            }

            // Only now that the typed plan is applied does the dispatch
            // kind change; until here the lcore kept running the slot as
            // its previous kind against the previous plan. A cleared slot
            // retires its kind the same way.
            self.set_comp_kind(comp_id, comp.kind);
        }
        Ok(())
    }

    /// The commit step: create missing PMDs, publish lcore lists, publish
    /// component plans, then snapshot for cancel. Any failure restores the
    /// snapshot and reports the original error.
    pub fn flush(&self) -> Result<()> {
        let mut mng = self.mng.lock().unwrap();

        let ret = self
            .do_flush(&mut mng);
        if let Err(err) = ret {
            if let Err(cancel_err) = self.cancel_mng_info(&mut mng) {
                error!("Rollback after failed flush also failed: {}", cancel_err);
            }
            return Err(err);
        }

        self.backup_mng_info(&mut mng);
        Ok(())
    }

    fn do_flush(&self, mng: &mut MngData) -> Result<()> {
        mng.iface.update_port_info(self.startup.vhost_client)?;
        self.update_lcore_info(mng)?;
        self.update_comp_info(mng)
    }

    /// Remove vhost sock files at exit, unless running as vhost client.
    pub fn del_vhost_sockfile(&self) {
        if self.startup.vhost_client {
            return;
        }
        let mng = self.mng.lock().unwrap();
        for info in mng.iface.defined_ports(port::PortKind::Vhost) {
            let path = port::vhost_iface_name(info.no);
            if std::fs::remove_file(&path).is_ok() {
                debug!("removed vhost sock file {}", path);
            }
        }
    }
}

/// Dump the staged management data at debug level.
fn log_all_mng_info(ctx: &Context, mng: &MngData) {
    if !log_enabled!(log::Level::Debug) {
        return;
    }

    for lcore_id in ctx.lcores.slave_ids() {
        let core = ctx.lcores.core(*lcore_id);
        debug!(
            "core[{}] status={:?}, ids={:?}",
            lcore_id,
            core.status(),
            core.core.staging().ids
        );
    }

    for comp in mng.comps.iter().filter(|c| c.in_use()) {
        debug!(
            "component[{}] name={}, type={:?}, core={}, rx={:?}, tx={:?}",
            comp.comp_id, comp.name, comp.kind, comp.lcore_id, comp.rx_ports, comp.tx_ports
        );
    }

    for kind in port::PortKind::ALL.iter() {
        for info in mng.iface.defined_ports(*kind) {
            debug!(
                "{}[{}] port={}, vid={}, mac={}",
                kind,
                info.no,
                info.ethdev_port_id,
                info.cls_attrs.vid,
                info.cls_attrs.mac_addr_str
            );
        }
    }
}

/// Main loop of one slave lcore: spin on the status word, take plan swaps,
/// then run every component bound to this lcore once per iteration.
pub fn slave_main(ctx: &Context, lcore_id: u32) {
    info!("Core[{}] Start.", lcore_id);
    let mng = ctx.lcores.core(lcore_id);
    ctx.lcores.set_status(lcore_id, LcoreStatus::Idle);

    loop {
        let status = mng.status();
        if status == LcoreStatus::StopRequest {
            break;
        }
        if status != LcoreStatus::Forward {
            thread::yield_now();
            continue;
        }

        mng.core.check_swap();
        let ids = &mng.core.active().ids;
        if ids.is_empty() {
            thread::yield_now();
            continue;
        }
        for id in ids.iter() {
            match ctx.comp_kind(*id) {
                Some(ComponentKind::ClassifierMac) => classifier::classify(ctx, *id),
                Some(ComponentKind::Mirror) => mirror::mirror_proc(ctx, *id),
                Some(_) => forwarder::forward(ctx, *id),
                None => {}
            }
        }
    }

    ctx.lcores.set_status(lcore_id, LcoreStatus::Stop);
    info!("Core[{}] End.", lcore_id);
}

/// Launch the forwarding loop on every slave lcore.
pub fn launch_slaves(ctx: &Arc<Context>) -> Vec<JoinHandle<()>> {
    ctx.lcores
        .slave_ids()
        .iter()
        .map(|lcore_id| {
            let ctx = ctx.clone();
            let lcore_id = *lcore_id;
            thread::Builder::new()
                .name(format!("lcore{}", lcore_id))
                .spawn(move || slave_main(&ctx, lcore_id))
                .expect("spawn slave lcore")
        })
        .collect()
}

/// Propagate a pending signal into the status FSM. Returns true when a
/// stop was requested.
pub fn handle_stop_signal(ctx: &Context) -> bool {
    if lcore::stop_requested() {
        ctx.lcores
            .set_status(ctx.lcores.main_lcore(), LcoreStatus::StopRequest);
        ctx.lcores.set_all_status(LcoreStatus::StopRequest);
        true
    } else {
        false
    }
}
