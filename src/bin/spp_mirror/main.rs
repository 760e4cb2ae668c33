//! spp_mirror: the traffic mirroring secondary process.

#[macro_use]
extern crate log;
extern crate anyhow;
extern crate getopts;
extern crate pretty_env_logger;
extern crate spp;

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use spp::cmd_runner::{main_loop, CmdRunner};
use spp::context::{self, Context, ProcType, StartupParam};
use spp::ethdev;
use spp::lcore::{self, LcoreStatus};
use spp::mirror;

struct AppArgs {
    startup: StartupParam,
    nof_slaves: u32,
    nof_phys: u16,
}

fn usage(program: &str, opts: &getopts::Options) {
    let brief = format!(
        "Usage: {} --client-id CLIENT_ID -s SERVER_IP:SERVER_PORT [--vhost-client]",
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
    opts.optflag("", "vhost-client", "Run vhost on client");
    opts.optopt("", "lcores", "Number of worker lcores (default 2)", "NUM");
    opts.optopt("", "phys", "Number of probed physical ports", "NUM");
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(err) => {
            println!("Invalid spp_mirror arguments, {}", err);
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

    let nof_slaves = matches
        .opt_str("lcores")
        .map_or(Ok(2), |v| v.parse::<u32>())
        .map_err(|_| anyhow!("bad lcore count"))?;
    let nof_phys = matches
        .opt_str("phys")
        .map_or(Ok(0), |v| v.parse::<u16>())
        .map_err(|_| anyhow!("bad phy count"))?;

    info!(
        "app opts (client_id={},server={}:{},vhost_client={})",
        client_id,
        server_ip,
        server_port,
        matches.opt_present("vhost-client")
    );

    Ok(AppArgs {
        startup: StartupParam {
            client_id,
            server_ip,
            server_port,
            vhost_client: matches.opt_present("vhost-client"),
            proc_type: ProcType::Mirror,
        },
        nof_slaves,
        nof_phys,
    })
}

fn run(args: AppArgs) -> Result<()> {
    let phys = ethdev::probe_phys(args.nof_phys);
    let server_ip = args.startup.server_ip.clone();
    let server_port = args.startup.server_port;
    let client_id = args.startup.client_id;

    let mut ctx = Context::new(args.startup, args.nof_slaves, &phys);
    ctx.mirror_pool = Some(mirror::mirror_pool_create(client_id));
    let ctx = Arc::new(ctx);

    let handles = context::launch_slaves(&ctx);

    let main_lcore = ctx.lcores.main_lcore();
    ctx.lcores.set_status(main_lcore, LcoreStatus::Idle);
    ctx.lcores
        .check_core_status_wait(LcoreStatus::Idle)
        .map_err(|err| anyhow!("{}", err))?;

    ctx.lcores.set_all_status(LcoreStatus::Forward);
    if cfg!(feature = "shallowcopy") {
        info!("My ID {} start handling message(ShallowCopy)", ctx.client_id());
    } else {
        info!("My ID {} start handling message(DeepCopy)", ctx.client_id());
    }
    info!("[Press Ctrl-C to quit ...]");

    {
        let mut mng = ctx.mng.lock().unwrap();
        ctx.backup_mng_info(&mut mng);
    }

    let mut runner = CmdRunner::new(&server_ip, server_port, ProcType::Mirror);
    main_loop(&ctx, &mut runner);

    // main_loop already propagated the stop request to the slaves
    ctx.lcores.set_status(main_lcore, LcoreStatus::Stop);
    if ctx.lcores.check_core_status_wait(LcoreStatus::Stop).is_err() {
        error!("Core did not stop.");
    }
    for handle in handles {
        let _ = handle.join();
    }

    ctx.del_vhost_sockfile();
    info!("spp_mirror exit.");
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
        error!("spp_mirror failed: {}", err);
        process::exit(1);
    }
}
