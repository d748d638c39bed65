// SHAREFLOW -- HIERARCHICAL CPU BANDWIDTH CONTROL
// PROPORTIONAL SHARES OVER A TREE OF CPU CLASSES
//
// THE LIBRARY HOLDS THE POLICY. THIS BINARY DRIVES IT WITH A SYNTHETIC BASE
// SCHEDULER AND PRINTS WHAT THE MONITOR DECIDED.

mod cli;

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use shareflow::{logger, ControllerConfig, CpuController};

use cli::run::SimConfig;
use cli::ClassSpec;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "shareflow")]
#[command(about = "SHAREFLOW -- HIERARCHICAL CPU BANDWIDTH CONTROLLER")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    // NUMBER OF SIMULATED CPUS (DEFAULT: ONLINE CPUS)
    #[arg(long, global = true)]
    cpus: Option<usize>,

    // CLASS DECLARATION, REPEATABLE: NAME=PARENT:GUARANTEE%:LIMIT%[:LOAD%]
    #[arg(long = "class", global = true)]
    classes: Vec<String>,

    // MINIMUM INTERVAL BETWEEN MONITOR CYCLES IN MILLISECONDS
    #[arg(long, global = true, default_value_t = 100)]
    min_interval_ms: u64,

    // PRINT VERBOSE OUTPUT
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    // SIMULATE THE DECLARED WORKLOAD (DEFAULT)
    Run {
        // MONITOR PERIOD IN MILLISECONDS
        #[arg(long, default_value_t = 1000)]
        period_ms: u64,

        // SIMULATED DURATION IN SECONDS
        #[arg(long, default_value_t = 10)]
        duration_secs: u64,

        // BASE SCHEDULER TIME SLICE IN NANOSECONDS
        #[arg(long, default_value_t = shareflow::tuning::DEFAULT_SLICE_NS)]
        slice_ns: u64,

        // PACE THE SIMULATED CLOCK TO WALL TIME
        #[arg(long)]
        realtime: bool,

        // DUMP FULL EVENT LOG ON EXIT
        #[arg(long)]
        dump_log: bool,
    },
    // BUILD THE DECLARED TREE AND PRINT EFFECTIVE SHARES
    Show,
}

fn online_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 { n as usize } else { 1 }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logger::init(cli.verbose).map_err(|e| anyhow!("LOGGER: {}", e))?;

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let specs = cli
        .classes
        .iter()
        .map(|c| ClassSpec::parse(c))
        .collect::<Result<Vec<_>>>()?;

    let nr_cpus = cli.cpus.unwrap_or_else(online_cpus).max(1);
    let mut config = ControllerConfig::with_cpus(nr_cpus);
    config.monitor_min_interval_ns = cli.min_interval_ms * 1_000_000;

    let command = cli.command.unwrap_or(Command::Run {
        period_ms: 1000,
        duration_secs: 10,
        slice_ns: shareflow::tuning::DEFAULT_SLICE_NS,
        realtime: false,
        dump_log: false,
    });

    match command {
        Command::Show => {
            let ctl = CpuController::new(config, 0);
            cli::show::run_show(&ctl, &specs)?;
        }
        Command::Run { period_ms, duration_secs, slice_ns, realtime, dump_log } => {
            config.monitor_period_ns = period_ms * 1_000_000;
            config.slice_ns = slice_ns;
            let ctl = CpuController::new(config, 0);
            let sim = SimConfig {
                duration_ns: duration_secs * 1_000_000_000,
                period_ns: config.monitor_period_ns,
                slice_ns,
                realtime,
                verbose: cli.verbose,
            };

            println!("SHAREFLOW IS ACTIVE (CTRL+C TO EXIT)");
            cli::run::run_sim(&ctl, &specs, &sim, &SHUTDOWN)?;

            let events = ctl.events();
            if dump_log {
                events.dump();
            }
            events.summary();
            println!("\n{}", ctl.report());
        }
    }

    println!("OUT.");
    Ok(())
}
