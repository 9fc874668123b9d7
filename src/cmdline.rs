use crate::catalogs;
use crate::{Context, Error};
use clap::ValueHint::FilePath;
use clap::{Args, Parser, Subcommand};
use log::{debug, error, warn};
use std::fs::read_to_string;

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(short = 'c')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the catalog's TOML config file")]
    catalog_config: String,

    #[arg(short = 'b')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the benchmark's TOML config file")]
    benchmark_config: String,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run a benchmark")]
    Bench(BenchArgs),
    #[command(about = "List all registered catalogs")]
    List,
}

fn read(path: &str) -> Result<String, Error> {
    read_to_string(path).map_err(|source| Error::Io {
        path: path.to_string(),
        source,
    })
}

fn bench_cli(args: &BenchArgs, ctx: &Context) -> Result<(), Error> {
    let opt = read(&args.catalog_config)? + "\n" + &read(&args.benchmark_config)?;
    let group = crate::bench::init(&opt)?;
    group.run(ctx)?;
    Ok(())
}

fn list_cli() {
    for name in catalogs::registered() {
        println!("Registered catalog: {}", name);
    }
}

/// Format an error with all of its causes on one line.
fn report(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        message += &format!(": {}", s);
        source = s.source();
    }
    message
}

/// The default command line interface.
///
/// This function is public and can be called in a different crate. For example, one can integrate
/// their own catalogs by registering the constructor function. Then, adding this function will
/// produce a benchmark binary that has the same usage as the one in this crate.
///
/// ## Usage
///
/// To get the usage of the command line interface, users can run:
///
/// ```bash
/// catbench -h
/// ```
///
/// The interface supports two modes, `bench` and `list`.
///
/// ### Benchmark Mode
///
/// Usage:
///
/// ```bash
/// catbench bench -c <CATALOG_CONFIG> -b <BENCH_CONFIG>
/// ```
///
/// Where `CATALOG_CONFIG` and `BENCH_CONFIG` are the paths to the catalog and benchmark
/// configuration files, respectively. For their format, you can refer to the documentations of
/// [`crate::catalogs`], [`crate::tree`] and [`crate::bench`]. The two files are concatenated
/// before parsing, so sections may live in either of them.
///
/// Ctrl-C cancels the running phase. Workers stop issuing requests, the collected results are
/// still reported, and the remaining phases are skipped.
///
/// ### List mode
///
/// Usage:
/// ``` bash
/// catbench list
/// ```
///
/// This command lists all registered catalogs' names.
///
/// Logging is controlled with `RUST_LOG` (e.g., `RUST_LOG=debug`). Errors are logged and turn
/// into a non-zero exit status.
pub fn cmdline() {
    env_logger::init();
    let cli = Cli::parse();
    debug!("Starting catbench with args: {:?}", cli);
    let result = match cli.command {
        Commands::Bench(args) => {
            let ctx = Context::background();
            let handler_ctx = ctx.clone();
            if let Err(e) = ctrlc::set_handler(move || {
                handler_ctx.cancel();
                debug!("SIGINT received, cancelling the benchmark");
            }) {
                warn!("Failed to set Ctrl-C handler: {}", e);
            }
            bench_cli(&args, &ctx)
        }
        Commands::List => {
            list_cli();
            Ok(())
        }
    };
    if let Err(e) = result {
        error!("{}", report(&e));
        std::process::exit(1);
    }
}
