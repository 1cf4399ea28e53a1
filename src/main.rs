use clap::Parser;
use specter::ir::Module;
use specter::{analyze_module, Config, LeakageClass, SpectreV1Mode};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Statically detect Spectre-style speculative leakage in compiled
/// program fragments.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Module to analyze (JSON).
    input: PathBuf,

    /// Output directory for leakage.txt, transmitters.txt and witnesses.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Search for Spectre-v1 leakage; MODE is `classic` or
    /// `branch-predicate`.
    #[arg(long, value_name = "MODE", num_args = 0..=1, default_missing_value = "classic")]
    spectre_v1: Option<String>,

    /// Search for Spectre-v4 leakage with the given store-buffer size.
    #[arg(long, value_name = "STB_SIZE")]
    spectre_v4: Option<u32>,

    /// Speculation depth.
    #[arg(short = 'd', long)]
    depth: Option<u32>,

    /// Loop iterations kept when unrolling.
    #[arg(long)]
    unroll: Option<u32>,

    /// Reorder-buffer capacity bound.
    #[arg(long)]
    rob_size: Option<u32>,

    /// Maximum rf x (addr + data) traceback chain length.
    #[arg(long)]
    traceback: Option<u32>,

    /// Hard cap on transiently-executed nodes.
    #[arg(long)]
    max_transient: Option<u32>,

    /// Execution-window radius in program-order steps.
    #[arg(long)]
    window: Option<u32>,

    /// Alias-analysis flags, comma separated: `transient`, `lax`.
    #[arg(long, value_name = "FLAGS")]
    aa: Option<String>,

    /// Emit DOT witness executions (default on).
    #[arg(long)]
    witnesses: Option<bool>,

    /// Allow executions that cold-start mid-function.
    #[arg(long)]
    partial: bool,

    /// Stop after the first leak per transmitter.
    #[arg(long)]
    fast: bool,

    /// Parallel detection workers.
    #[arg(short = 'j', long)]
    jobs: Option<u32>,

    /// Analyze only the named functions (repeatable).
    #[arg(short = 'f', long = "function")]
    functions: Vec<String>,

    /// Append to existing output files, prefixing sections per function.
    #[arg(long)]
    batch: bool,

    /// Also dump the intermediate skeleton graphs.
    #[arg(long)]
    graphs: bool,

    /// Per-solver-call timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl Cli {
    fn into_config(self) -> (PathBuf, Config) {
        let mut config = Config::default();
        if let Some(mode) = &self.spectre_v1 {
            config.leakage_class = Some(LeakageClass::SpectreV1);
            config.spectre_v1 = match mode.as_str() {
                "branch-predicate" => SpectreV1Mode::BranchPredicate,
                _ => SpectreV1Mode::Classic,
            };
        }
        if let Some(stb) = self.spectre_v4 {
            config.leakage_class = Some(LeakageClass::SpectreV4);
            config.spectre_v4.stb_size = stb;
        }
        if let Some(d) = self.depth {
            config.spec_depth = d;
        }
        if let Some(u) = self.unroll {
            config.num_unrolls = u;
        }
        if let Some(r) = self.rob_size {
            config.rob_size = r;
        }
        if let Some(t) = self.traceback {
            config.max_traceback = t;
        }
        config.max_transient_nodes = self.max_transient;
        config.window_size = self.window;
        if let Some(flags) = &self.aa {
            for flag in flags.split(',').filter(|f| !f.is_empty()) {
                match flag {
                    "transient" => config.alias_mode.transient = true,
                    "lax" => config.alias_mode.lax = true,
                    other => eprintln!("ignoring unknown alias flag '{other}'"),
                }
            }
        }
        if let Some(w) = self.witnesses {
            config.witness_executions = w;
        }
        config.partial_executions |= self.partial;
        config.fast_mode = self.fast;
        if let Some(j) = self.jobs {
            config.max_parallel = j;
        }
        config.function_names = self.functions.iter().cloned().collect();
        config.batch_mode = self.batch;
        config.output_graphs = self.graphs;
        config.solver_timeout = self.timeout_ms.map(Duration::from_millis);
        config.output_dir = self.output.clone();
        (self.input, config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (input, config) = Cli::parse().into_config();
    let config = match config.validated() {
        Ok(c) => c,
        Err(err) => {
            eprintln!("specter: {err}");
            return ExitCode::FAILURE;
        }
    };

    let module: Module = match std::fs::read_to_string(&input)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(m) => m,
        Err(err) => {
            eprintln!("specter: cannot load {}: {err}", input.display());
            return ExitCode::FAILURE;
        }
    };

    let mut analyzed = BTreeSet::new();
    match analyze_module(&module, &config, &mut analyzed) {
        Ok(reports) => {
            let mut total = 0usize;
            for report in &reports {
                if let Some(reason) = &report.skipped {
                    eprintln!("{}: skipped ({reason})", report.function);
                    continue;
                }
                println!("{}: {} leak(s)", report.function, report.leaks.len());
                for leak in &report.leaks {
                    println!("  {} -- {}", leak.desc, leak.insts.join("; "));
                }
                total += report.leaks.len();
            }
            eprintln!("detected {total} leak(s) in {} function(s)", reports.len());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("specter: {err}");
            ExitCode::FAILURE
        }
    }
}
