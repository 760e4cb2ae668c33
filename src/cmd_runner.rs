//! Running commands sent from spp-ctl.
//!
//! Commands mutate the staged configuration under the management mutex;
//! the explicit `flush` command commits them. A request is a batch: the
//! first failing command aborts the rest, marks them `invalid` in the
//! response, and rolls the staged state back to the last good snapshot.

use std::thread;
use std::time::Duration;

use crate::cmd_format::{self, CmdResult};
use crate::cmd_parser::{self, CmdAction, CmdRequest, CmdSet, Command};
use crate::comp::ComponentKind;
use crate::conn::CtlConnection;
use crate::context::{Context, MngData, ProcType};
use crate::errors::{Error, Result};
use crate::ether::NO_VLAN;
use crate::lcore::LcoreStatus;
use crate::pcap::CaptureStatus;
use crate::port::{cls_mac_from_str, PortAbility, PortDir, PortId};

/// Pause of the runner loop between polls, to avoid saturating the CPU.
const RUNNER_IDLE_DELAY: Duration = Duration::from_micros(100);

/// Stage a classifier table edit on the target tx port.
fn update_cls_table(
    mng: &mut MngData,
    action: CmdAction,
    vid: u16,
    mac_str: &str,
    port: PortId,
) -> Result<()> {
    debug!(
        "Update cls table with mac_addr `{}`, and port `{}`.",
        mac_str, port
    );

    let mac = cls_mac_from_str(mac_str)?.as_u64();

    let info = mng.iface.port_mut(port);
    if !info.defined {
        error!("Port {} doesn't exist.", port);
        return Err(Error::PortNotFound(port.to_string()));
    }

    match action {
        CmdAction::Del => {
            if info.cls_attrs.mac_addr != 0 {
                if info.cls_attrs.vid != vid {
                    error!("Unexpected VLAN ID `{}`.", vid);
                    return Err(Error::ClsTableConflict(port.to_string()));
                }
                if info.cls_attrs.mac_addr != mac {
                    error!("Unexpected MAC {}.", mac_str);
                    return Err(Error::ClsTableConflict(port.to_string()));
                }
            }
            info.cls_attrs = Default::default();
        }
        CmdAction::Add => {
            if info.cls_attrs.vid != NO_VLAN || info.cls_attrs.mac_addr != 0 {
                error!(
                    "Used port {}, mac {} != {}.",
                    port, info.cls_attrs.mac_addr_str, mac_str
                );
                return Err(Error::ClsTableConflict(port.to_string()));
            }
            info.cls_attrs.vid = vid;
            info.cls_attrs.mac_addr = mac;
            info.cls_attrs.mac_addr_str = mac_str.to_string();
        }
        _ => return Err(Error::ClsTableConflict(port.to_string())),
    }

    // Mark the component transmitting through this port as changed.
    if let Some(comp_id) = mng.comps.used_port(port, PortDir::Tx) {
        mng.change_component[comp_id] = true;
    }
    Ok(())
}

/// Assign a worker to an lcore, or remove it.
fn update_comp(
    ctx: &Context,
    mng: &mut MngData,
    action: CmdAction,
    name: &str,
    lcore_id: u32,
    kind: Option<ComponentKind>,
) -> Result<()> {
    match action {
        CmdAction::Start => {
            if ctx.lcores.get_status(lcore_id) == LcoreStatus::Unuse {
                error!(
                    "Core {} is not available because it is in Unuse state.",
                    lcore_id
                );
                return Err(Error::LcoreUnavailable(lcore_id));
            }
            if mng.comps.id_by_name(name).is_some() {
                error!("Component name '{}' is already used.", name);
                return Err(Error::DuplicateName(name.to_string()));
            }

            let comp_id = mng.comps.free_id()?;
            let comp = mng.comps.get_mut(comp_id);
            comp.clear();
            comp.name = name.to_string();
            comp.kind = kind;
            comp.lcore_id = lcore_id;

            ctx.lcores
                .core(lcore_id)
                .core
                .staging_mut()
                .ids
                .push(comp_id);

            mng.change_component[comp_id] = true;
            mng.change_core[lcore_id as usize] = true;
        }

        CmdAction::Stop => {
            let comp_id = match mng.comps.id_by_name(name) {
                Some(comp_id) => comp_id,
                // Stopping what is already absent is not an error.
                None => return Ok(()),
            };

            let comp = mng.comps.get(comp_id);
            let comp_lcore = comp.lcore_id;

            // A classifier owns its table entries; they go with it.
            if comp.kind == Some(ComponentKind::ClassifierMac) {
                for uid in comp.tx_ports.clone() {
                    mng.iface.port_mut(uid).cls_attrs = Default::default();
                }
            }

            mng.comps.get_mut(comp_id).clear();
            ctx.lcores
                .core(comp_lcore)
                .core
                .staging_mut()
                .ids
                .retain(|id| *id != comp_id);

            // The cleared slot stays marked so the flush retires its
            // dispatch kind after the lcore list swap.
            mng.change_component[comp_id] = true;
            mng.change_core[comp_lcore as usize] = true;
        }

        _ => return Err(Error::NameNotFound(name.to_string())),
    }

    Ok(())
}

/// Attach a port to a component, or detach it.
fn update_port(
    mng: &mut MngData,
    action: CmdAction,
    port: PortId,
    dir: PortDir,
    name: &str,
    ability: Option<PortAbility>,
) -> Result<()> {
    let comp_id = mng
        .comps
        .id_by_name(name)
        .ok_or_else(|| Error::NameNotFound(name.to_string()))?;

    match action {
        CmdAction::Add => {
            if let Some(owner) = mng.comps.used_port(port, dir) {
                if owner != comp_id {
                    error!("Port in used. (port command) val={}", port);
                    return Err(Error::PortBusy(port.to_string()));
                }
            }

            let already = mng.comps.get(comp_id).ports(dir).contains(&port);
            if !already {
                mng.comps.get(comp_id).check_port_count(dir)?;
            }

            let info = mng.iface.port_mut(port);
            info.defined = true;
            if let Some(ability) = ability {
                info.add_ability(ability)?;
            }

            if !already {
                mng.comps.get_mut(comp_id).ports_mut(dir).push(port);
            }
            mng.change_component[comp_id] = true;
        }

        CmdAction::Del => {
            let is_classifier =
                mng.comps.get(comp_id).kind == Some(ComponentKind::ClassifierMac);

            let info = mng.iface.port_mut(port);
            info.clear_abilities(dir);
            // Detaching a classifier tx port drops its table entry too.
            if is_classifier && dir == PortDir::Tx {
                info.cls_attrs = Default::default();
            }

            mng.comps.get_mut(comp_id).ports_mut(dir).retain(|p| *p != port);
            mng.change_component[comp_id] = true;
        }

        _ => return Err(Error::PortBusy(port.to_string())),
    }

    Ok(())
}

/// Execute one command against the staged views.
fn exec_one_cmd(ctx: &Context, cmd: &Command) -> Result<()> {
    match cmd {
        Command::ClsTable {
            action,
            vid,
            mac,
            port,
        } => {
            info!("Exec `classifier_table` cmd.");
            let mut mng = ctx.mng.lock().unwrap();
            update_cls_table(&mut mng, *action, vid.unwrap_or(NO_VLAN), mac, *port)
        }
        Command::Component {
            action,
            name,
            lcore,
            kind,
        } => {
            info!("Exec `component` cmd.");
            let mut mng = ctx.mng.lock().unwrap();
            update_comp(ctx, &mut mng, *action, name, *lcore, *kind)
        }
        Command::Port {
            action,
            port,
            dir,
            name,
            ability,
        } => {
            info!("Exec `port` cmd with action `{:?}`.", action);
            let mut mng = ctx.mng.lock().unwrap();
            update_port(&mut mng, *action, *port, *dir, name, *ability)
        }
        Command::Flush => {
            info!("Exec flush.");
            ctx.flush()
        }
        // Getters and capture toggles act while building the response.
        _ => Ok(()),
    }
}

/// Parse and execute one request string, returning the JSON reply.
pub fn exec_request(ctx: &Context, set: CmdSet, request_str: &str) -> (String, bool) {
    debug!("Parse cmds, {}", request_str);

    let req = match cmd_parser::parse_request(set, request_str) {
        Ok(req) => req,
        Err(err) => {
            let results = cmd_format::parse_error_results(&err);
            let response = cmd_format::build_response(ctx, &CmdRequest::default(), &results);
            debug!("Failed to parse cmds.");
            return (response, false);
        }
    };

    let mut results = Vec::with_capacity(req.commands.len());
    let mut failed = false;
    for cmd in req.commands.iter() {
        if failed {
            results.push(CmdResult::invalid());
            continue;
        }
        match exec_one_cmd(ctx, cmd) {
            Ok(()) => results.push(CmdResult::success()),
            Err(err) => {
                error!("Command failed: {}", err);
                results.push(CmdResult::failed(&err.to_string()));
                failed = true;
            }
        }
    }

    if failed {
        // The batch is atomic: roll staged edits back to the snapshot.
        let mut mng = ctx.mng.lock().unwrap();
        if let Err(err) = ctx.cancel_mng_info(&mut mng) {
            error!("Rollback after failed batch also failed: {}", err);
        }
    } else {
        if req.is_requested_start {
            info!("Execute start command.");
            ctx.capture.set_request(CaptureStatus::Running);
        }
        if req.is_requested_stop {
            info!("Execute stop command.");
            ctx.capture.set_request(CaptureStatus::Idle);
        }
    }

    let response = cmd_format::build_response(ctx, &req, &results);
    let exit = req.is_requested_exit;
    (response, exit)
}

/// The controller-facing command runner owned by the master lcore.
pub struct CmdRunner {
    conn: CtlConnection,
    set: CmdSet,
}

impl CmdRunner {
    pub fn new(ctl_ip: &str, ctl_port: u16, proc_type: ProcType) -> CmdRunner {
        let set = match proc_type {
            ProcType::Pcap => CmdSet::Pcap,
            _ => CmdSet::Worker,
        };
        CmdRunner {
            conn: CtlConnection::new(ctl_ip, ctl_port),
            set,
        }
    }

    /// Poll the channel once; parse, execute and answer one request if a
    /// complete one arrived. Returns false once the exit command was served.
    pub fn run_once(&mut self, ctx: &Context) -> bool {
        let request_str = match self.conn.poll_request() {
            Some(request_str) => request_str,
            None => return true,
        };

        let (response, exit) = exec_request(ctx, self.set, &request_str);
        debug!("Make command response. response_str={}", response);

        if let Err(err) = self.conn.send_message(&response) {
            error!("Failed to send command result response: {}", err);
        }

        if exit {
            info!("Process is terminated with exit cmd.");
            return false;
        }
        true
    }
}

/// The master lcore loop: accept commands until an exit command or signal
/// requests the stop.
pub fn main_loop(ctx: &Context, runner: &mut CmdRunner) {
    let main_lcore = ctx.lcores.main_lcore();

    while ctx.lcores.get_status(main_lcore) != LcoreStatus::StopRequest {
        if crate::context::handle_stop_signal(ctx) {
            break;
        }

        if !runner.run_once(ctx) {
            ctx.lcores.set_status(main_lcore, LcoreStatus::StopRequest);
            ctx.lcores.set_all_status(LcoreStatus::StopRequest);
            break;
        }

        thread::sleep(RUNNER_IDLE_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::context::{self, StartupParam};
    use crate::ethdev;
    use crate::lcore;
    use crate::mbuf::Mbuf;

    fn start_worker_ctx(client_id: i32) -> (Arc<Context>, Vec<std::thread::JoinHandle<()>>) {
        let phys = ethdev::probe_phys(32);
        let ctx = Arc::new(Context::new(
            StartupParam {
                client_id,
                server_ip: "127.0.0.1".into(),
                server_port: 6666,
                vhost_client: false,
                proc_type: ProcType::Vf,
            },
            3,
            &phys,
        ));

        let handles = context::launch_slaves(&ctx);
        ctx.lcores
            .check_core_status_wait_with(LcoreStatus::Idle, Duration::from_millis(10), 500)
            .unwrap();
        ctx.lcores.set_all_status(LcoreStatus::Forward);

        {
            let mut mng = ctx.mng.lock().unwrap();
            ctx.backup_mng_info(&mut mng);
        }
        (ctx, handles)
    }

    fn stop_worker_ctx(ctx: &Arc<Context>, handles: Vec<std::thread::JoinHandle<()>>) {
        ctx.lcores.set_all_status(LcoreStatus::StopRequest);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    fn exec_ok(ctx: &Context, cmd: &str) -> Value {
        let (response, _) = exec_request(ctx, CmdSet::Worker, cmd);
        let value: Value = serde_json::from_str(&response).unwrap();
        for result in value["results"].as_array().unwrap() {
            assert_eq!(
                result["result"], "success",
                "command `{}` failed: {}",
                cmd, response
            );
        }
        value
    }

    fn exec_err(ctx: &Context, cmd: &str) -> Value {
        let (response, _) = exec_request(ctx, CmdSet::Worker, cmd);
        serde_json::from_str(&response).unwrap()
    }

    fn phy_dev(no: u16) -> ethdev::EthDev {
        let id = ethdev::get_port_by_name(&format!("net_phy{}", no)).unwrap();
        ethdev::dev(id).unwrap()
    }

    #[test]
    fn test_forwarder_roundtrip_and_stop() {
        lcore::reset_stop_flag();
        let (ctx, handles) = start_worker_ctx(40);

        exec_ok(&ctx, "component start fwd0 2 forward");
        exec_ok(&ctx, "port add phy:16 rx fwd0");
        exec_ok(&ctx, "port add phy:17 tx fwd0");
        exec_ok(&ctx, "flush");

        let status = exec_ok(&ctx, "status");
        let info = &status["info"];
        assert_eq!(info["client-id"], 40);
        assert!(info["phy"].as_array().unwrap().contains(&Value::from(16)));
        assert_eq!(info["master-lcore"], 0);

        let cores = info["core"].as_array().unwrap();
        let entry = cores
            .iter()
            .find(|c| c["core"] == 2)
            .expect("lcore 2 missing from status");
        assert_eq!(entry["role"], "forward");
        assert_eq!(entry["name"], "fwd0");
        assert_eq!(entry["rx_port"], serde_json::json!(["phy:16"]));
        assert_eq!(entry["tx_port"], serde_json::json!(["phy:17"]));

        // the path is live: a burst injected on rx comes out of tx
        let rx = phy_dev(16);
        let tx = phy_dev(17);
        rx.inject((0..32u8).map(|i| Mbuf::from_bytes(&[i; 60])).collect());
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut out = Vec::new();
        while out.len() < 32 && std::time::Instant::now() < deadline {
            out.extend(tx.drain(32));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(out.len(), 32);

        exec_ok(&ctx, "component stop fwd0");

        // the stop is staged only: until the flush the component is still
        // reported and still forwarding
        let status = exec_ok(&ctx, "status");
        let cores = status["info"]["core"].as_array().unwrap().clone();
        let entry = cores.iter().find(|c| c["core"] == 2).unwrap();
        assert_eq!(entry["role"], "forward");
        assert_eq!(entry["name"], "fwd0");

        rx.inject(vec![Mbuf::from_bytes(&[0xee; 60])]);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut out = Vec::new();
        while out.is_empty() && std::time::Instant::now() < deadline {
            out.extend(tx.drain(32));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(out.len(), 1);

        exec_ok(&ctx, "flush");
        let status = exec_ok(&ctx, "status");
        let cores = status["info"]["core"].as_array().unwrap().clone();
        let entry = cores.iter().find(|c| c["core"] == 2).unwrap();
        assert_eq!(entry["role"], "unuse");

        stop_worker_ctx(&ctx, handles);
    }

    #[test]
    fn test_classifier_stop_takes_effect_at_flush() {
        use crate::ring::{self, Ring};

        lcore::reset_stop_flag();
        let (ctx, handles) = start_worker_ctx(46);

        // rings backing the classifier tx ports must exist before the flush
        Ring::create(&ring::rx_queue_name(30), 64);
        Ring::create(&ring::rx_queue_name(31), 64);

        exec_ok(&ctx, "component start c0 3 classifier_mac");
        exec_ok(&ctx, "port add phy:21 rx c0");
        exec_ok(&ctx, "port add ring:30 tx c0");
        exec_ok(&ctx, "port add ring:31 tx c0");
        exec_ok(&ctx, "classifier_table add mac aa:bb:cc:dd:ee:01 ring:30");
        exec_ok(&ctx, "classifier_table add mac default ring:31");
        exec_ok(&ctx, "flush");

        let status = exec_ok(&ctx, "status");
        assert_eq!(
            status["info"]["classifier_table"].as_array().unwrap().len(),
            2
        );

        exec_ok(&ctx, "component stop c0");

        // staged stop: the classifier and its table are still visible
        let status = exec_ok(&ctx, "status");
        assert_eq!(
            status["info"]["classifier_table"].as_array().unwrap().len(),
            2
        );
        let cores = status["info"]["core"].as_array().unwrap().clone();
        let entry = cores.iter().find(|c| c["core"] == 3).unwrap();
        assert_eq!(entry["role"], "classifier_mac");
        assert_eq!(entry["name"], "c0");

        exec_ok(&ctx, "flush");
        let status = exec_ok(&ctx, "status");
        assert!(status["info"]["classifier_table"]
            .as_array()
            .unwrap()
            .is_empty());
        let cores = status["info"]["core"].as_array().unwrap().clone();
        let entry = cores.iter().find(|c| c["core"] == 3).unwrap();
        assert_eq!(entry["role"], "unuse");

        stop_worker_ctx(&ctx, handles);
    }

    #[test]
    fn test_idempotent_add_and_del() {
        lcore::reset_stop_flag();
        let (ctx, handles) = start_worker_ctx(41);

        exec_ok(&ctx, "component start fwd1 1 forward");
        exec_ok(&ctx, "port add phy:18 rx fwd1");
        exec_ok(&ctx, "port add phy:18 rx fwd1");
        exec_ok(&ctx, "flush");

        let status = exec_ok(&ctx, "status");
        let cores = status["info"]["core"].as_array().unwrap().clone();
        let entry = cores.iter().find(|c| c["name"] == "fwd1").unwrap();
        assert_eq!(entry["rx_port"].as_array().unwrap().len(), 1);

        // deleting a port that is not attached is not an error
        exec_ok(&ctx, "port del phy:19 tx fwd1");

        // a flush without staged edits keeps the snapshot identical
        let before = exec_ok(&ctx, "status");
        exec_ok(&ctx, "flush");
        let after = exec_ok(&ctx, "status");
        assert_eq!(before["info"], after["info"]);

        stop_worker_ctx(&ctx, handles);
    }

    #[test]
    fn test_batch_aborts_and_rolls_back() {
        lcore::reset_stop_flag();
        let (ctx, handles) = start_worker_ctx(42);

        let before = exec_ok(&ctx, "status");

        // second command fails (duplicate name), third must become invalid
        let value = exec_err(
            &ctx,
            "component start dup0 1 forward; component start dup0 2 forward; flush",
        );
        let results = value["results"].as_array().unwrap();
        assert_eq!(results[0]["result"], "success");
        assert_eq!(results[1]["result"], "error");
        assert!(results[1]["error_details"]["message"]
            .as_str()
            .unwrap()
            .contains("dup0"));
        assert_eq!(results[2]["result"], "invalid");

        // the whole batch was rolled back, dup0 does not exist
        let after = exec_ok(&ctx, "status");
        assert_eq!(before["info"], after["info"]);
        let err = exec_err(&ctx, "component stop dup0; flush");
        for result in err["results"].as_array().unwrap() {
            assert_eq!(result["result"], "success");
        }

        stop_worker_ctx(&ctx, handles);
    }

    #[test]
    fn test_component_overflow_and_lcore_checks() {
        lcore::reset_stop_flag();
        let (ctx, handles) = start_worker_ctx(43);

        // lcore 99 exists in the table but is Unuse
        let value = exec_err(&ctx, "component start nope 99 forward");
        assert_eq!(value["results"][0]["result"], "error");

        stop_worker_ctx(&ctx, handles);
    }

    #[test]
    fn test_ability_overflow_reported() {
        lcore::reset_stop_flag();
        let (ctx, handles) = start_worker_ctx(44);

        exec_ok(&ctx, "component start fwd2 3 forward");
        exec_ok(&ctx, "port add phy:20 tx fwd2 add_vlantag 10 0");
        // occupy the remaining ability slots of the tx direction
        {
            let mut mng = ctx.mng.lock().unwrap();
            let uid: PortId = "phy:20".parse().unwrap();
            let info = mng.iface.port_mut(uid);
            info.add_ability(PortAbility::DelVlanTag { dir: PortDir::Tx })
                .unwrap();
            info.add_ability(PortAbility::DelVlanTag { dir: PortDir::Tx })
                .unwrap();
            info.add_ability(PortAbility::DelVlanTag { dir: PortDir::Tx })
                .unwrap();
        }
        let value = exec_err(&ctx, "port add phy:20 tx fwd2 del_vlantag");
        assert_eq!(value["results"][0]["result"], "error");
        assert!(value["results"][0]["error_details"]["message"]
            .as_str()
            .unwrap()
            .contains("ability"));

        stop_worker_ctx(&ctx, handles);
    }

    #[test]
    fn test_get_client_id_response() {
        lcore::reset_stop_flag();
        let (ctx, handles) = start_worker_ctx(45);

        let (response, exit) = exec_request(&ctx, CmdSet::Worker, "_get_client_id");
        assert!(!exit);
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["client_id"], 45);
        assert_eq!(value["process_type"], "vf");

        let (_, exit) = exec_request(&ctx, CmdSet::Worker, "exit");
        assert!(exit);

        stop_worker_ctx(&ctx, handles);
    }
}
