mod benchmark;

use anyhow::{Context, Result};
use bfconv::primitive::registry::list_impls;
use bfconv::{CpuEngine, CpuIsa, DataType};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::benchmark::problem::ConvShape;
use crate::benchmark::run::{run, Dir, RunConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Benchmark and check bfconv convolution primitives")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create, time and optionally check one convolution problem.
    Run(RunArgs),
    /// List the registered implementations in dispatch order.
    List,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Problem string, e.g. `mb2ic20oc32_iw10kw3` or `g2mb1ic32oc32_ih6iw6kh3kw3ph1pw1`.
    #[arg(long)]
    problem: String,
    #[arg(long, value_enum, default_value_t = Dir::Fwd)]
    dir: Dir,
    /// Destination (forward) or diff-src (backward-data) data type.
    #[arg(long, default_value_t = DataType::F32)]
    dst_dt: DataType,
    /// Bias data type; forward only.
    #[arg(long)]
    bias: Option<DataType>,
    #[arg(long, default_value_t = 10)]
    iters: usize,
    /// Threads the kernel plans for; defaults to `BFCONV_NUM_THREADS` or the host.
    #[arg(long)]
    threads: Option<usize>,
    /// Overrides the detected ISA, e.g. `avx512_core` to run the reference kernel anywhere.
    #[arg(long)]
    isa: Option<CpuIsa>,
    #[arg(long, default_value_t = 1)]
    seed: u64,
    /// Compare the output against a naive f32 convolution.
    #[arg(long)]
    check: bool,
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
}

fn run_command(args: RunArgs) -> Result<()> {
    let shape = ConvShape::parse(&args.problem)?;
    let mut engine = CpuEngine::new();
    if let Some(isa) = args.isa {
        engine = engine.with_isa(isa);
    }
    if let Some(threads) = args.threads {
        engine = engine.with_threads(threads);
    }
    let config = RunConfig {
        dir: args.dir,
        out_dt: args.dst_dt,
        bias: args.bias,
        iters: args.iters,
        seed: args.seed,
        check: args.check,
    };
    let report = run(&engine, &shape, &config)?;

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("serializing the report")?;
        println!("{json}");
    } else {
        println!("{}", report.summary());
    }
    if let Some(check) = &report.check {
        anyhow::ensure!(
            check.passed,
            "{} of the outputs differ from the reference",
            check.mismatches
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    bfconv_backend_ref_cpu::register_ref_cpu_impls();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_command(args),
        Command::List => {
            for name in list_impls() {
                println!("{name}");
            }
            Ok(())
        }
    }
}
