//! spp_pcap: the packet capture secondary process.

#[macro_use]
extern crate log;
extern crate anyhow;
extern crate getopts;
extern crate pretty_env_logger;
extern crate spp;

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};

use spp::cmd_runner::{main_loop, CmdRunner};
use spp::context::{Context, ProcType, StartupParam};
use spp::ethdev;
use spp::lcore::{self, LcoreStatus};
use spp::pcap::{self, PcapCtx};
use spp::port::{self, PortId, PortKind, PortRef};

struct AppArgs {
    startup: StartupParam,
    nof_slaves: u32,
    nof_phys: u16,
    port_cap: PortId,
    output: PathBuf,
    file_limit: u64,
}

fn usage(program: &str, opts: &getopts::Options) {
    let brief = format!(
        "Usage: {} --client-id CLIENT_ID -s SERVER_IP:SERVER_PORT -i PORT \
         [--output DIR] [--limit_file_size BYTES]",
        program
    );
    print!("{}", opts.usage(&brief));
}

fn parse_server(server: &str) -> Result<(String, u16)> {
    let pos = server
        .rfind(':')
        .ok_or_else(|| anyhow!("no port in server address '{}'", server))?;
    let port = server[pos + 1..]
        .parse::<u16>()
        .map_err(|_| anyhow!("bad server port in '{}'", server))?;
    Ok((server[..pos].to_string(), port))
}

fn parse_app_args(args: &[String]) -> Result<AppArgs> {
    let program = &args[0];

    let mut opts = getopts::Options::new();
    opts.reqopt("", "client-id", "My client ID", "CLIENT_ID");
    opts.reqopt("s", "", "Access information to the server", "IP:PORT");
    opts.reqopt("i", "", "capture port(phy,ring)", "PORT");
    opts.optopt("", "output", "file path(default:/tmp)", "DIR");
    opts.optopt(
        "",
        "limit_file_size",
        "file limit size(default:1073741824 Byte)",
        "BYTES",
    );
    opts.optopt("", "lcores", "Number of worker lcores (default 2)", "NUM");
    opts.optopt("", "phys", "Number of probed physical ports", "NUM");
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(err) => {
            println!("Invalid spp_pcap arguments, {}", err);
            usage(program, &opts);
            return Err(err.into());
        }
    };

    if matches.opt_present("h") {
        usage(program, &opts);
        process::exit(0);
    }

    let client_id = matches
        .opt_str("client-id")
        .unwrap()
        .parse::<i32>()
        .map_err(|_| anyhow!("bad client id"))?;
    let (server_ip, server_port) = parse_server(&matches.opt_str("s").unwrap())?;

    let port_cap: PortId = matches
        .opt_str("i")
        .unwrap()
        .parse()
        .map_err(|_| anyhow!("bad capture port"))?;
    if port_cap.kind != PortKind::Phy && port_cap.kind != PortKind::Ring {
        return Err(anyhow!("capture port must be phy or ring"));
    }

    let output = PathBuf::from(
        matches
            .opt_str("output")
            .unwrap_or_else(|| pcap::DEFAULT_OUTPUT_DIR.to_string()),
    );
    if !output.is_dir() {
        usage(program, &opts);
        return Err(anyhow!("output dir '{}' does not exist", output.display()));
    }

    let file_limit = matches
        .opt_str("limit_file_size")
        .map_or(Ok(pcap::DEFAULT_FILE_LIMIT), |v| v.parse::<u64>())
        .map_err(|_| anyhow!("bad limit_file_size"))?;

    let nof_slaves = matches
        .opt_str("lcores")
        .map_or(Ok(2), |v| v.parse::<u32>())
        .map_err(|_| anyhow!("bad lcore count"))?;
    let nof_phys = matches
        .opt_str("phys")
        .map_or(Ok(0), |v| v.parse::<u16>())
        .map_err(|_| anyhow!("bad phy count"))?;

    info!(
        "app opts (client_id={},server={}:{},port={},output={},limit_file_size={})",
        client_id,
        server_ip,
        server_port,
        port_cap,
        output.display(),
        file_limit
    );

    Ok(AppArgs {
        startup: StartupParam {
            client_id,
            server_ip,
            server_port,
            vhost_client: false,
            proc_type: ProcType::Pcap,
        },
        nof_slaves,
        nof_phys,
        port_cap,
        output,
        file_limit,
    })
}

/// Make sure the capture port has a backing ethdev and resolve it.
fn setup_capture_port(ctx: &Context, uid: PortId) -> Result<PortRef> {
    let mut mng = ctx.mng.lock().unwrap();

    match uid.kind {
        PortKind::Phy => {
            if !mng.iface.port(uid).is_flushed() {
                return Err(anyhow!("capture port undefined. ({})", uid));
            }
        }
        PortKind::Ring => {
            mng.iface.port_mut(uid).defined = true;
            if !mng.iface.port(uid).is_flushed() {
                let port_id = port::add_ring_pmd(uid.no)
                    .map_err(|_| anyhow!("capture port undefined. ({})", uid))?;
                mng.iface.port_mut(uid).ethdev_port_id = port_id as i32;
            }
        }
        _ => return Err(anyhow!("capture port undefined. ({})", uid)),
    }

    PortRef::resolve(&mng.iface, uid).map_err(|err| anyhow!("{}", err))
}

fn run(args: AppArgs) -> Result<()> {
    if args.nof_slaves < 2 {
        return Err(anyhow!("spp_pcap needs at least 2 worker lcores"));
    }

    let phys = ethdev::probe_phys(args.nof_phys);
    let server_ip = args.startup.server_ip.clone();
    let server_port = args.startup.server_port;
    let client_id = args.startup.client_id;

    let mut ctx = Context::new(args.startup, args.nof_slaves, &phys);

    let port_cap = setup_capture_port(&ctx, args.port_cap)?;
    debug!(
        "Recv port {}, port_id={}",
        port_cap.uid,
        port_cap.dev.portid()
    );

    let pcap_ctx = PcapCtx::new(args.output, args.file_limit, port_cap, client_id);
    pcap_ctx.assign_threads(ctx.lcores.slave_ids());
    ctx.pcap = Some(pcap_ctx);
    let ctx = Arc::new(ctx);

    // Start worker threads of receive and write
    let handles: Vec<_> = ctx
        .lcores
        .slave_ids()
        .iter()
        .map(|lcore_id| {
            let ctx = ctx.clone();
            let lcore_id = *lcore_id;
            thread::Builder::new()
                .name(format!("lcore{}", lcore_id))
                .spawn(move || pcap::slave_main(&ctx, lcore_id))
                .expect("spawn pcap lcore")
        })
        .collect();

    let main_lcore = ctx.lcores.main_lcore();
    ctx.lcores.set_status(main_lcore, LcoreStatus::Idle);
    ctx.lcores
        .check_core_status_wait(LcoreStatus::Idle)
        .map_err(|err| anyhow!("{}", err))?;

    ctx.lcores.set_all_status(LcoreStatus::Forward);
    info!("[Press Ctrl-C to quit ...]");

    let mut runner = CmdRunner::new(&server_ip, server_port, ProcType::Pcap);
    main_loop(&ctx, &mut runner);

    // main_loop already propagated the stop request to the slaves
    ctx.lcores.set_status(main_lcore, LcoreStatus::Stop);
    if ctx.lcores.check_core_status_wait(LcoreStatus::Stop).is_err() {
        error!("Core did not stop.");
    }
    for handle in handles {
        let _ = handle.join();
    }

    info!("spp_pcap exit.");
    Ok(())
}

fn main() {
    pretty_env_logger::init();
    lcore::register_signal_handlers();

    let args: Vec<String> = env::args().collect();
    let app_args = match parse_app_args(&args) {
        Ok(app_args) => app_args,
        Err(_) => process::exit(1),
    };

    if let Err(err) = run(app_args) {
        error!("spp_pcap failed: {}", err);
        process::exit(1);
    }
}
