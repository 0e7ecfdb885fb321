//! nproxy entry point

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use nproxy::config::Config;
use nproxy::{logging, master, worker};

#[derive(Debug, Parser)]
#[command(name = "nproxy", disable_version_flag = true)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', value_name = "file", default_value = "nproxy.conf")]
    config: PathBuf,

    /// Test the configuration and exit
    #[arg(short = 't')]
    test: bool,

    /// Single worker in the foreground (no fork, for development)
    #[arg(short = 'w')]
    single_worker: bool,

    /// Detach from the terminal
    #[arg(short = 'd')]
    daemon: bool,

    /// Print version and exit
    #[arg(short = 'v')]
    version: bool,
}

fn main() {
    let args = Args::parse();

    if args.version {
        println!("nproxy {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("nproxy: {e}");
            process::exit(1);
        }
    };

    if args.test {
        println!("{}", cfg.summary());
        println!("configuration test successful");
        return;
    }

    logging::init(&cfg.log);
    info!("{}", cfg.summary());

    if args.daemon || cfg.process.daemon {
        if let Err(e) = master::daemonize(cfg.process.pid_file.as_deref()) {
            eprintln!("nproxy: daemonize failed: {e}");
            process::exit(1);
        }
    }

    let result = if args.single_worker {
        run_single_worker(cfg)
    } else {
        master::run(cfg, &args.config)
    };

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

fn run_single_worker(cfg: Config) -> nproxy::error::Result<()> {
    let listeners = master::bind_all(&cfg)?;
    let inherited = listeners
        .into_iter()
        .map(|b| (b.listener, b.tls))
        .collect();
    worker::Worker::new(Arc::new(cfg), inherited, 0)?.run()
}
