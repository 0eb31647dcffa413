#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use std::path;
use std::process::ExitCode;

use zigzag::api;
use zigzag::config::{DseConfig, Opt, TemporalEngine};
use zigzag::cost::report::{pprint, simple_json};
use zigzag::pipeline::PipelineError;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workload JSON file
    workload: path::PathBuf,

    /// Accelerator preset (gemm_l1, ascend_like) or accelerator JSON file
    #[arg(long, short, default_value = "gemm_l1")]
    accelerator: String,

    /// Mapping JSON file; presets come with their own
    #[arg(long, short)]
    mapping: Option<path::PathBuf>,

    /// Run configuration JSON file
    #[arg(long, short)]
    config: Option<path::PathBuf>,

    /// Criterion for picking the best mappings
    #[arg(long, value_enum)]
    opt: Option<Opt>,

    #[arg(long)]
    lpf_limit: Option<usize>,

    /// How temporal mappings are searched
    #[arg(long, value_enum)]
    temporal_engine: Option<TemporalEngine>,

    /// Annealing chains per spatial mapping (salsa engine)
    #[arg(long)]
    salsa_chains: Option<usize>,

    /// Scale every PE array dimension by this power of two (1/8 to 4)
    #[arg(long)]
    pe_array_scaling: Option<f64>,

    /// Number of layers evaluated in parallel
    #[arg(long, short)]
    jobs: Option<usize>,

    /// Where to write the result dumps
    #[arg(long)]
    dump_folder: Option<path::PathBuf>,

    #[arg(long, default_value_t = false)]
    remove_unused_memory: bool,

    #[arg(long, default_value_t = false)]
    skip_if_dump_exists: bool,

    /// Print the totals as JSON instead of a table
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Raise the log level (repeat for more)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn dse_config(&self) -> Result<DseConfig> {
        let mut config = match &self.config {
            Some(path) => DseConfig::from_json_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => DseConfig::default(),
        };
        if let Some(opt) = self.opt {
            config.opt = opt;
        }
        if let Some(lpf_limit) = self.lpf_limit {
            config.lpf_limit = lpf_limit;
        }
        if let Some(engine) = self.temporal_engine {
            config.temporal_engine = engine;
        }
        if let Some(chains) = self.salsa_chains {
            config.salsa.chains = chains;
        }
        if let Some(scaling) = self.pe_array_scaling {
            config.pe_array_scaling = scaling;
        }
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if let Some(dump_folder) = &self.dump_folder {
            config.pickle_filename = dump_folder.join("list_of_cmes.bin");
            config.dump_folder = dump_folder.clone();
        }
        config.remove_unused_memory |= self.remove_unused_memory;
        config.skip_if_dump_exists |= self.skip_if_dump_exists;
        config.verbose |= self.verbose > 0;
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let infeasible = err
                .downcast_ref::<PipelineError>()
                .is_some_and(PipelineError::is_feasibility);
            ExitCode::from(if infeasible { 2 } else { 1 })
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = args.dse_config()?;
    info!("Running with {config:?}");
    let outcome = api::get_hardware_performance(
        &args.workload,
        &args.accelerator,
        args.mapping.as_deref(),
        config,
    )?;
    if args.json {
        println!("{}", simple_json(&outcome.total)?);
    } else {
        for layer in &outcome.layers {
            pprint(layer);
        }
        if outcome.layers.len() > 1 {
            pprint(&outcome.total);
        }
    }
    Ok(())
}
