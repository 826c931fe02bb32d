//! Multiprocessor simulator CLI.
//!
//! This binary is the single entry point for simulation runs. It performs:
//! 1. **Run:** Load a predecoded instruction file and the matching SPARC ELF
//!    application image, build the machine from a JSON config (or defaults),
//!    drive the event loop to completion, and print the statistics report.
//! 2. **Dump-config:** Print the effective configuration defaults so a run
//!    can be reproduced or tweaked from a file.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mpsim_core::isa::InstrFile;
use mpsim_core::mem::addrspace::AddrSpace;
use mpsim_core::sim::loader;
use mpsim_core::{Config, Simulator};

#[derive(Parser, Debug)]
#[command(
    name = "mpsim",
    author,
    version,
    about = "Cycle-accurate multiprocessor simulator",
    long_about = "Simulate predecoded SPARC-V9 binaries on a mesh of out-of-order nodes\n\
                  with a coherent cache/directory hierarchy.\n\n\
                  Examples:\n  \
                  mpsim run --app app.elf --predecoded app.dec\n  \
                  mpsim run --app app.elf --predecoded app.dec --config quad.json --procs 4"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a predecoded application to completion.
    Run {
        /// SPARC ELF application image (data/bss segments).
        #[arg(long)]
        app: PathBuf,

        /// Predecoded instruction file produced by the predecoder.
        #[arg(long)]
        predecoded: PathBuf,

        /// JSON configuration file (defaults used when omitted).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the number of processors.
        #[arg(long)]
        procs: Option<usize>,

        /// Stop after this many simulated cycles.
        #[arg(long)]
        max_cycles: Option<f64>,
    },

    /// Print the default configuration values.
    DumpConfig,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            app,
            predecoded,
            config,
            procs,
            max_cycles,
        } => cmd_run(app, predecoded, config, procs, max_cycles),
        Commands::DumpConfig => {
            let cfg = Config::default();
            println!("{cfg:#?}");
        }
    }
}

fn cmd_run(
    app: PathBuf,
    predecoded: PathBuf,
    config: Option<PathBuf>,
    procs: Option<usize>,
    max_cycles: Option<f64>,
) {
    let mut cfg = match config {
        Some(path) => {
            let text = std::fs::read_to_string(&path).unwrap_or_else(|e| {
                eprintln!("error: cannot read {}: {e}", path.display());
                process::exit(2);
            });
            match Config::from_json(&text) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {e}");
                    process::exit(2);
                }
            }
        }
        None => Config::default(),
    };
    if let Some(n) = procs {
        cfg.system.num_procs = n;
    }

    let instrs = match InstrFile::open(&predecoded) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    };
    let mut space = AddrSpace::new(cfg.system.num_procs);
    if let Err(e) = loader::load_app(&mut space, cfg.system.num_procs, &app) {
        eprintln!("error: {e}");
        process::exit(2);
    }

    let mut sim = match Simulator::new(cfg, instrs, space) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    };

    match sim.run(max_cycles) {
        Ok(status) => {
            print!("{}", sim.report());
            if let Some(fault) = status.fault {
                eprintln!("application fault: {fault:?}");
                process::exit(1);
            }
            // A graceful application exit (whatever its own code) is a
            // successful simulation; the code is reported, not propagated.
            println!("application exit code {}", status.code);
            process::exit(0);
        }
        Err(e) => {
            // Simulator-internal fatal: print the cause and whatever
            // statistics accumulated, then fail.
            eprintln!("fatal: {e}");
            print!("{}", sim.report());
            process::exit(3);
        }
    }
}
