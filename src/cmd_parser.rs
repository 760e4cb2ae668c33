//! Parsing of controller requests into typed commands.
//!
//! Requests are whitespace-separated token lines; a request may batch up to
//! `MAX_CMDS` commands separated by `;`. The grammar is validated per
//! command against a vocabulary table carrying the permitted argument
//! counts, and every parameter is normalized by its own decoder.

use std::convert::TryFrom;
use std::str::FromStr;

use crate::comp::ComponentKind;
use crate::errors::{ParseErr, ParseErrKind};
use crate::ether::{VLAN_ID_MAX, VLAN_PCP_MAX};
use crate::port::{cls_mac_from_str, PortAbility, PortDir, PortId, VlanTag, DEFAULT_CLS_SPEC_STR};
use crate::port::{DEFAULT_CLS_DMY_ADDR_STR};
use crate::MAX_LCORE;
use crate::NAME_STR_LEN;

/// Max commands of one request.
pub const MAX_CMDS: usize = 32;

/// Max tokens of one command.
pub const MAX_PARAMS: usize = 8;

/// Which command vocabulary a process accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdSet {
    /// spp_vf and spp_mirror.
    Worker,
    /// spp_pcap.
    Pcap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdAction {
    Start,
    Stop,
    Add,
    Del,
}

impl FromStr for CmdAction {
    type Err = ParseErr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "start" => Ok(CmdAction::Start),
            "stop" => Ok(CmdAction::Stop),
            "add" => Ok(CmdAction::Add),
            "del" => Ok(CmdAction::Del),
            _ => Err(ParseErr::invalid_value("action", s)),
        }
    }
}

/// One parsed command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    ClsTable {
        action: CmdAction,
        vid: Option<u16>,
        mac: String,
        port: PortId,
    },
    GetClientId,
    Status,
    Exit,
    Component {
        action: CmdAction,
        name: String,
        lcore: u32,
        kind: Option<ComponentKind>,
    },
    Port {
        action: CmdAction,
        port: PortId,
        dir: PortDir,
        name: String,
        ability: Option<PortAbility>,
    },
    Flush,
    Start,
    Stop,
}

/// A parsed request with its getter flags.
#[derive(Clone, Debug, Default)]
pub struct CmdRequest {
    pub commands: Vec<Command>,
    pub is_requested_client_id: bool,
    pub is_requested_status: bool,
    pub is_requested_exit: bool,
    pub is_requested_start: bool,
    pub is_requested_stop: bool,
}

fn wrong_format() -> ParseErr {
    ParseErr::new(ParseErrKind::WrongFormat, "", "")
}

fn unknown_cmd(name: &str) -> ParseErr {
    ParseErr::new(ParseErrKind::UnknownCmd, "command", name)
}

/// Parse an integer parameter within an inclusive range.
fn parse_ranged<T>(name: &str, val: &str, min: u64, max: u64) -> std::result::Result<T, ParseErr>
where
    T: TryFrom<u64>,
{
    let n = val
        .parse::<u64>()
        .map_err(|_| ParseErr::invalid_value(name, val))?;
    if n < min || n > max {
        return Err(ParseErr::invalid_value(name, val));
    }
    T::try_from(n).map_err(|_| ParseErr::invalid_value(name, val))
}

/// Normalize a classifier MAC token; `default` maps to the sentinel.
fn parse_cls_mac(val: &str) -> std::result::Result<String, ParseErr> {
    cls_mac_from_str(val).map_err(|_| ParseErr::invalid_value("mac address", val))?;
    Ok(if val == DEFAULT_CLS_SPEC_STR {
        DEFAULT_CLS_DMY_ADDR_STR.to_string()
    } else {
        val.to_string()
    })
}

fn parse_name(kind: &str, val: &str) -> std::result::Result<String, ParseErr> {
    if val.is_empty() || val.len() >= NAME_STR_LEN {
        return Err(ParseErr::invalid_value(kind, val));
    }
    Ok(val.to_string())
}

fn parse_cls_table(argv: &[&str]) -> std::result::Result<Command, ParseErr> {
    let action = argv[1].parse::<CmdAction>()?;
    if action != CmdAction::Add && action != CmdAction::Del {
        return Err(ParseErr::invalid_value("action", argv[1]));
    }

    match (argv.len(), argv[2]) {
        (5, "mac") => Ok(Command::ClsTable {
            action,
            vid: None,
            mac: parse_cls_mac(argv[3])?,
            port: argv[4].parse()?,
        }),
        (6, "vlan") => Ok(Command::ClsTable {
            action,
            vid: Some(parse_ranged("vlan id", argv[3], 0, VLAN_ID_MAX as u64)?),
            mac: parse_cls_mac(argv[4])?,
            port: argv[5].parse()?,
        }),
        _ => Err(ParseErr::invalid_value("type", argv[2])),
    }
}

fn parse_component(argv: &[&str]) -> std::result::Result<Command, ParseErr> {
    let action = argv[1].parse::<CmdAction>()?;
    match action {
        CmdAction::Start => {
            if argv.len() != 5 {
                return Err(wrong_format());
            }
            Ok(Command::Component {
                action,
                name: parse_name("component name", argv[2])?,
                lcore: parse_ranged("core", argv[3], 0, MAX_LCORE as u64 - 1)?,
                kind: Some(argv[4].parse::<ComponentKind>()?),
            })
        }
        CmdAction::Stop => {
            if argv.len() != 3 {
                return Err(wrong_format());
            }
            Ok(Command::Component {
                action,
                name: parse_name("component name", argv[2])?,
                lcore: 0,
                kind: None,
            })
        }
        _ => Err(ParseErr::invalid_value("action", argv[1])),
    }
}

fn parse_port(argv: &[&str]) -> std::result::Result<Command, ParseErr> {
    let action = argv[1].parse::<CmdAction>()?;
    if action != CmdAction::Add && action != CmdAction::Del {
        return Err(ParseErr::invalid_value("action", argv[1]));
    }

    let port: PortId = argv[2].parse()?;
    let dir: PortDir = argv[3].parse()?;
    let name = parse_name("component name", argv[4])?;

    let ability = if argv.len() > 5 {
        match argv[5] {
            "add_vlantag" => {
                if argv.len() < 7 {
                    return Err(ParseErr::new(
                        ParseErrKind::NoParam,
                        "port vid",
                        argv[5],
                    ));
                }
                let vid: u16 = parse_ranged("port vid", argv[6], 0, VLAN_ID_MAX as u64)?;
                let pcp: i8 = if argv.len() > 7 {
                    parse_ranged("port pcp", argv[7], 0, VLAN_PCP_MAX as u64)?
                } else {
                    -1
                };
                Some(PortAbility::AddVlanTag {
                    dir,
                    vlantag: VlanTag { vid, pcp, tci: 0 },
                })
            }
            "del_vlantag" => {
                if argv.len() != 6 {
                    return Err(wrong_format());
                }
                Some(PortAbility::DelVlanTag { dir })
            }
            other => {
                return Err(ParseErr::invalid_value("port ability", other));
            }
        }
    } else {
        None
    };

    Ok(Command::Port {
        action,
        port,
        dir,
        name,
        ability,
    })
}

struct CmdDef {
    name: &'static str,
    param_min: usize,
    param_max: usize,
    parse: fn(&[&str]) -> std::result::Result<Command, ParseErr>,
}

fn parse_noargs(cmd: Command) -> fn(&[&str]) -> std::result::Result<Command, ParseErr> {
    match cmd {
        Command::GetClientId => |_| Ok(Command::GetClientId),
        Command::Status => |_| Ok(Command::Status),
        Command::Exit => |_| Ok(Command::Exit),
        Command::Flush => |_| Ok(Command::Flush),
        Command::Start => |_| Ok(Command::Start),
        Command::Stop => |_| Ok(Command::Stop),
        _ => unreachable!(),
    }
}

fn vocabulary(set: CmdSet) -> Vec<CmdDef> {
    match set {
        CmdSet::Worker => vec![
            CmdDef {
                name: "classifier_table",
                param_min: 5,
                param_max: 6,
                parse: parse_cls_table,
            },
            CmdDef {
                name: "_get_client_id",
                param_min: 1,
                param_max: 1,
                parse: parse_noargs(Command::GetClientId),
            },
            CmdDef {
                name: "status",
                param_min: 1,
                param_max: 1,
                parse: parse_noargs(Command::Status),
            },
            CmdDef {
                name: "exit",
                param_min: 1,
                param_max: 1,
                parse: parse_noargs(Command::Exit),
            },
            CmdDef {
                name: "component",
                param_min: 3,
                param_max: 5,
                parse: parse_component,
            },
            CmdDef {
                name: "port",
                param_min: 5,
                param_max: 8,
                parse: parse_port,
            },
            CmdDef {
                name: "flush",
                param_min: 1,
                param_max: 1,
                parse: parse_noargs(Command::Flush),
            },
        ],
        CmdSet::Pcap => vec![
            CmdDef {
                name: "_get_client_id",
                param_min: 1,
                param_max: 1,
                parse: parse_noargs(Command::GetClientId),
            },
            CmdDef {
                name: "status",
                param_min: 1,
                param_max: 1,
                parse: parse_noargs(Command::Status),
            },
            CmdDef {
                name: "exit",
                param_min: 1,
                param_max: 1,
                parse: parse_noargs(Command::Exit),
            },
            CmdDef {
                name: "start",
                param_min: 1,
                param_max: 1,
                parse: parse_noargs(Command::Start),
            },
            CmdDef {
                name: "stop",
                param_min: 1,
                param_max: 1,
                parse: parse_noargs(Command::Stop),
            },
        ],
    }
}

/// Parse one command line of whitespace-separated tokens.
fn parse_one(set: CmdSet, line: &str) -> std::result::Result<Command, ParseErr> {
    let argv: Vec<&str> = line.split_whitespace().collect();
    if argv.is_empty() {
        return Err(wrong_format());
    }
    if argv.len() > MAX_PARAMS {
        error!("Parameter number over limit. request_str={}", line);
        return Err(wrong_format());
    }

    let vocab = vocabulary(set);
    let mut name_matched = false;
    for def in vocab.iter() {
        if def.name != argv[0] {
            continue;
        }
        name_matched = true;
        if argv.len() < def.param_min || argv.len() > def.param_max {
            continue;
        }
        return (def.parse)(&argv);
    }

    if name_matched {
        error!("Parameter number out of range. request_str={}", line);
        return Err(wrong_format());
    }

    error!("Unknown command. command={}, request_str={}", argv[0], line);
    Err(unknown_cmd(argv[0]))
}

/// Parse a full request: up to `MAX_CMDS` `;`-separated commands.
pub fn parse_request(set: CmdSet, request_str: &str) -> std::result::Result<CmdRequest, ParseErr> {
    let lines: Vec<&str> = request_str
        .split(';')
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();

    if lines.is_empty() {
        return Err(wrong_format());
    }
    if lines.len() > MAX_CMDS {
        return Err(wrong_format());
    }

    let mut request = CmdRequest::default();
    for line in lines {
        let cmd = parse_one(set, line)?;
        match cmd {
            Command::GetClientId => request.is_requested_client_id = true,
            Command::Status => request.is_requested_status = true,
            Command::Exit => request.is_requested_exit = true,
            Command::Start => request.is_requested_start = true,
            Command::Stop => request.is_requested_stop = true,
            _ => {}
        }
        request.commands.push(cmd);
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortKind;

    #[test]
    fn test_component_start() {
        let req = parse_request(CmdSet::Worker, "component start fwd0 2 forward").unwrap();
        assert_eq!(req.commands.len(), 1);
        assert_eq!(
            req.commands[0],
            Command::Component {
                action: CmdAction::Start,
                name: "fwd0".into(),
                lcore: 2,
                kind: Some(ComponentKind::Forwarder),
            }
        );
    }

    #[test]
    fn test_component_stop_short_form() {
        let req = parse_request(CmdSet::Worker, "component stop fwd0").unwrap();
        assert!(matches!(
            req.commands[0],
            Command::Component {
                action: CmdAction::Stop,
                ..
            }
        ));
    }

    #[test]
    fn test_port_with_vlan_ability() {
        let req =
            parse_request(CmdSet::Worker, "port add ring:0 tx cls0 add_vlantag 100 3").unwrap();
        match &req.commands[0] {
            Command::Port {
                action,
                port,
                dir,
                name,
                ability,
            } => {
                assert_eq!(*action, CmdAction::Add);
                assert_eq!(*port, PortId::new(PortKind::Ring, 0));
                assert_eq!(*dir, PortDir::Tx);
                assert_eq!(name, "cls0");
                match ability {
                    Some(PortAbility::AddVlanTag { vlantag, .. }) => {
                        assert_eq!(vlantag.vid, 100);
                        assert_eq!(vlantag.pcp, 3);
                    }
                    other => panic!("unexpected ability {:?}", other),
                }
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_classifier_table_mac_and_vlan() {
        let req = parse_request(
            CmdSet::Worker,
            "classifier_table add mac aa:bb:cc:dd:ee:00 ring:0",
        )
        .unwrap();
        assert_eq!(
            req.commands[0],
            Command::ClsTable {
                action: CmdAction::Add,
                vid: None,
                mac: "aa:bb:cc:dd:ee:00".into(),
                port: PortId::new(PortKind::Ring, 0),
            }
        );

        let req = parse_request(
            CmdSet::Worker,
            "classifier_table add vlan 100 default ring:1",
        )
        .unwrap();
        assert_eq!(
            req.commands[0],
            Command::ClsTable {
                action: CmdAction::Add,
                vid: Some(100),
                mac: "00:00:00:00:00:01".into(),
                port: PortId::new(PortKind::Ring, 1),
            }
        );
    }

    #[test]
    fn test_boundary_values_rejected() {
        // vid 4095 and pcp 8 are invalid values
        let err = parse_request(
            CmdSet::Worker,
            "classifier_table add vlan 4095 default ring:0",
        )
        .unwrap_err();
        assert_eq!(err.kind, ParseErrKind::InvalidValue);

        let err = parse_request(
            CmdSet::Worker,
            "port add ring:0 tx cls0 add_vlantag 100 8",
        )
        .unwrap_err();
        assert_eq!(err.kind, ParseErrKind::InvalidValue);
        assert_eq!(err.msg, "port pcp");

        let err = parse_request(CmdSet::Worker, "component start x 999 forward").unwrap_err();
        assert_eq!(err.kind, ParseErrKind::InvalidValue);
    }

    #[test]
    fn test_unknown_and_malformed() {
        let err = parse_request(CmdSet::Worker, "frobnicate").unwrap_err();
        assert_eq!(err.kind, ParseErrKind::UnknownCmd);
        assert_eq!(err.details, "frobnicate");

        let err = parse_request(CmdSet::Worker, "component start").unwrap_err();
        assert_eq!(err.kind, ParseErrKind::WrongFormat);

        let err = parse_request(CmdSet::Worker, "").unwrap_err();
        assert_eq!(err.kind, ParseErrKind::WrongFormat);

        // start/stop belong to the pcap vocabulary only
        assert!(parse_request(CmdSet::Worker, "start").is_err());
        assert!(parse_request(CmdSet::Pcap, "start").is_ok());
        assert!(parse_request(CmdSet::Pcap, "flush").is_err());
    }

    #[test]
    fn test_batched_commands() {
        let req = parse_request(
            CmdSet::Worker,
            "component start fwd0 2 forward; port add phy:0 rx fwd0; flush",
        )
        .unwrap();
        assert_eq!(req.commands.len(), 3);
        assert_eq!(req.commands[2], Command::Flush);

        let too_many = vec!["status"; MAX_CMDS + 1].join(";");
        assert!(parse_request(CmdSet::Worker, &too_many).is_err());
    }

    #[test]
    fn test_getter_flags() {
        let req = parse_request(CmdSet::Worker, "_get_client_id").unwrap();
        assert!(req.is_requested_client_id);
        let req = parse_request(CmdSet::Worker, "status").unwrap();
        assert!(req.is_requested_status);
        let req = parse_request(CmdSet::Pcap, "exit").unwrap();
        assert!(req.is_requested_exit);
    }
}
