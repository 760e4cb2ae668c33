//! Building JSON responses for the command runner.
//!
//! Responses are assembled as `serde_json` value trees and rendered in one
//! line. The shape mirrors what spp-ctl expects: a `results` array for the
//! request's commands, plus `client_id`/`process_type` or the full `info`
//! block when the matching getter was requested.

use serde_json::{json, Map, Value};

use crate::classifier;
use crate::cmd_parser::CmdRequest;
use crate::comp::ComponentKind;
use crate::context::{Context, ProcType};
use crate::errors::ParseErr;
use crate::forwarder;
use crate::lcore::LcoreStatus;
use crate::mirror;
use crate::pcap::{self, CaptureStatus};
use crate::port::PortKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdResCode {
    Success,
    Failed,
    Invalid,
}

/// Outcome of one command of a request.
#[derive(Clone, Debug)]
pub struct CmdResult {
    pub code: CmdResCode,
    pub err_msg: String,
}

impl CmdResult {
    pub fn success() -> CmdResult {
        CmdResult {
            code: CmdResCode::Success,
            err_msg: String::new(),
        }
    }

    pub fn failed(msg: &str) -> CmdResult {
        CmdResult {
            code: CmdResCode::Failed,
            err_msg: msg.to_string(),
        }
    }

    pub fn invalid() -> CmdResult {
        CmdResult {
            code: CmdResCode::Invalid,
            err_msg: String::new(),
        }
    }

    fn to_value(&self) -> Value {
        match self.code {
            CmdResCode::Success => json!({ "result": "success" }),
            CmdResCode::Invalid => json!({ "result": "invalid" }),
            CmdResCode::Failed => json!({
                "result": "error",
                "error_details": { "message": self.err_msg },
            }),
        }
    }
}

/// The single failed result reported for an unparsable request.
pub fn parse_error_results(err: &ParseErr) -> Vec<CmdResult> {
    vec![CmdResult::failed(&err.message())]
}

fn port_uid_strings(refs: &[crate::port::PortRef]) -> Vec<String> {
    refs.iter().map(|r| r.uid.to_string()).collect()
}

/// The `core` array of a vf/mirror status: one element per non-unused
/// slave lcore and component.
fn worker_core_array(ctx: &Context) -> Vec<Value> {
    let mut cores = Vec::new();

    for lcore_id in ctx.lcores.slave_ids() {
        if ctx.lcores.get_status(*lcore_id) == LcoreStatus::Unuse {
            continue;
        }

        let ids = &ctx.lcores.core(*lcore_id).core.active().ids;
        if ids.is_empty() {
            cores.push(json!({ "core": lcore_id, "role": "unuse" }));
            continue;
        }

        for id in ids.iter() {
            let status = match ctx.comp_kind(*id) {
                Some(ComponentKind::ClassifierMac) => classifier::component_status(ctx, *id),
                Some(ComponentKind::Mirror) => mirror::component_status(ctx, *id),
                Some(_) => forwarder::component_status(ctx, *id),
                None => None,
            };

            match status {
                Some((name, kind, rx, tx)) => cores.push(json!({
                    "core": lcore_id,
                    "name": name,
                    "role": kind.as_str(),
                    "rx_port": port_uid_strings(&rx),
                    "tx_port": port_uid_strings(&tx),
                })),
                None => cores.push(json!({ "core": lcore_id, "role": "unuse" })),
            }
        }
    }

    cores
}

/// The `classifier_table` array listing every live entry.
fn classifier_table_array(ctx: &Context) -> Vec<Value> {
    let mut entries = Vec::new();
    for comp_id in 0..crate::MAX_LCORE {
        if ctx.comp_kind(comp_id) != Some(ComponentKind::ClassifierMac) {
            continue;
        }
        for entry in classifier::iterate_table(ctx, comp_id) {
            let value = match entry.cls_type {
                "vlan" => format!("{}/{}", entry.vid, entry.mac),
                _ => entry.mac.clone(),
            };
            entries.push(json!({
                "type": entry.cls_type,
                "value": value,
                "port": entry.port,
            }));
        }
    }
    entries
}

fn worker_info(ctx: &Context) -> Value {
    let mng = ctx.mng.lock().unwrap();

    let mut info = Map::new();
    info.insert("client-id".into(), json!(ctx.client_id()));
    info.insert("phy".into(), json!(mng.iface.list_flushed(PortKind::Phy)));
    info.insert(
        "vhost".into(),
        json!(mng.iface.list_flushed(PortKind::Vhost)),
    );
    info.insert("ring".into(), json!(mng.iface.list_flushed(PortKind::Ring)));
    drop(mng);

    info.insert("master-lcore".into(), json!(ctx.lcores.main_lcore()));
    info.insert("core".into(), json!(worker_core_array(ctx)));
    if ctx.proc_type() == ProcType::Vf {
        info.insert(
            "classifier_table".into(),
            json!(classifier_table_array(ctx)),
        );
    }

    Value::Object(info)
}

fn pcap_info(ctx: &Context) -> Value {
    let status = match ctx.capture.status() {
        CaptureStatus::Running => "running",
        CaptureStatus::Idle => "idle",
    };

    let mut cores = Vec::new();
    for lcore_id in ctx.lcores.slave_ids() {
        if let Some(core) = pcap::core_status(ctx, *lcore_id) {
            match core.role {
                ComponentKind::PcapReceiver => cores.push(json!({
                    "core": lcore_id,
                    "role": "receive",
                    "rx_port": core.rx.iter().map(|uid| uid.to_string()).collect::<Vec<_>>(),
                })),
                _ => cores.push(json!({
                    "core": lcore_id,
                    "role": "write",
                    "filename": core.filename.unwrap_or_default(),
                })),
            }
        }
    }

    json!({
        "client-id": ctx.client_id(),
        "status": status,
        "core": cores,
    })
}

/// Render the full reply of one request.
pub fn build_response(ctx: &Context, req: &CmdRequest, results: &[CmdResult]) -> String {
    let mut root = Map::new();
    root.insert(
        "results".into(),
        Value::Array(results.iter().map(|r| r.to_value()).collect()),
    );

    if req.is_requested_client_id {
        root.insert("client_id".into(), json!(ctx.client_id()));
        root.insert("process_type".into(), json!(ctx.proc_type().as_str()));
    }

    if req.is_requested_status {
        let info = match ctx.proc_type() {
            ProcType::Pcap => pcap_info(ctx),
            _ => worker_info(ctx),
        };
        root.insert("info".into(), info);
    }

    Value::Object(root).to_string()
}
