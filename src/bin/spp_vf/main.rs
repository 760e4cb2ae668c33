//! spp_vf: the classifier/forwarder/merger secondary process.

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
            println!("Invalid spp_vf arguments, {}", err);
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
        "Parsed app args (client_id={},server={}:{},vhost_client={})",
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
            proc_type: ProcType::Vf,
        },
        nof_slaves,
        nof_phys,
    })
}

fn run(args: AppArgs) -> Result<()> {
    let phys = ethdev::probe_phys(args.nof_phys);
    let server_ip = args.startup.server_ip.clone();
    let server_port = args.startup.server_port;
    let ctx = Arc::new(Context::new(args.startup, args.nof_slaves, &phys));

    // Start worker threads of classifier and forwarder
    let handles = context::launch_slaves(&ctx);

    let main_lcore = ctx.lcores.main_lcore();
    ctx.lcores.set_status(main_lcore, LcoreStatus::Idle);
    ctx.lcores
        .check_core_status_wait(LcoreStatus::Idle)
        .map_err(|err| anyhow!("{}", err))?;

    // Start forwarding
    ctx.lcores.set_all_status(LcoreStatus::Forward);
    info!("My ID {} start handling message", ctx.client_id());
    info!("[Press Ctrl-C to quit ...]");

    {
        let mut mng = ctx.mng.lock().unwrap();
        ctx.backup_mng_info(&mut mng);
    }

    let mut runner = CmdRunner::new(&server_ip, server_port, ProcType::Vf);
    main_loop(&ctx, &mut runner);

    // Finalize to exit
    // main_loop already propagated the stop request to the slaves
    ctx.lcores.set_status(main_lcore, LcoreStatus::Stop);
    if ctx.lcores.check_core_status_wait(LcoreStatus::Stop).is_err() {
        error!("Core did not stop.");
    }
    for handle in handles {
        let _ = handle.join();
    }

    ctx.del_vhost_sockfile();
    info!("spp_vf exit.");
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
        error!("spp_vf failed: {}", err);
        process::exit(1);
    }
}
