//! Static detection of Spectre-style speculative leakage.
//!
//! One function at a time, the pipeline unrolls loops, inlines direct
//! calls, expands speculative fork contexts, builds a symbolic event
//! graph over the result, and drives an SMT solver through
//! variant-specific dependency chains looking for witness executions in
//! which a secret-dependent value reaches a transmitter.

pub mod aeg;
pub mod binrel;
pub mod cfg;
pub mod config;
pub mod dot;
pub mod error;
pub mod ir;
pub mod leakage;
pub mod sym;

#[cfg(test)]
pub(crate) mod testutil;

use crate::cfg::calls::CfgCalls;
use crate::cfg::expanded::{CfgExpanded, ExpandSpectreV1, ExpandSpectreV4, SpeculationPolicy};
use crate::cfg::unrolled::CfgUnrolled;
use crate::ir::{BaseObjectOracle, Module};
use crate::leakage::{detect, detect_parallel, write_output_files, Leakage};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

pub use config::{AliasMode, Config, LeakageClass, SpectreV1Mode, SpectreV4Mode};
pub use error::{ConfigError, Result, Skip, SpecterError};

/// One reported leak, rendered for consumers.
#[derive(Clone, Debug, Serialize)]
pub struct LeakRecord {
    pub refs: Vec<u32>,
    pub transmitter: u32,
    pub desc: String,
    pub insts: Vec<String>,
}

/// Outcome of analyzing a single function.
#[derive(Clone, Debug, Serialize)]
pub struct FunctionReport {
    pub function: String,
    pub leaks: Vec<LeakRecord>,
    /// Set when analysis was skipped with a resumable condition.
    pub skipped: Option<String>,
}

/// Run the skeleton pipeline for one function: unroll, inline, expand.
pub fn expand_function(module: &Module, name: &str, config: &Config) -> Result<CfgExpanded> {
    let func = module
        .get(name)
        .ok_or_else(|| SpecterError::Module(format!("no function named '{name}'")))?;
    let unrolled = CfgUnrolled::construct(func, config.num_unrolls)?;
    let calls = CfgCalls::construct(&unrolled, module, config.spec_depth, config.num_unrolls)?;
    let policy: &dyn SpeculationPolicy = match config.leakage_class() {
        LeakageClass::SpectreV1 => &ExpandSpectreV1,
        LeakageClass::SpectreV4 => &ExpandSpectreV4,
    };
    let expanded = CfgExpanded::construct(&calls, policy, config.spec_depth);

    if config.output_graphs {
        if let Some(dir) = &config.output_dir {
            std::fs::create_dir_all(dir)?;
            let dump = |stage: &str, text: String| -> std::io::Result<()> {
                std::fs::write(dir.join(format!("{stage}-{name}.dot")), text)
            };
            dump("blocks", func.dump_block_graph())?;
            dump("unrolled", unrolled.cfg.dump_graph())?;
            dump("calls", calls.cfg.dump_graph())?;
            dump("expanded", expanded.cfg.dump_graph())?;
        }
    }

    info!(
        function = name,
        unrolled = unrolled.size(),
        expanded = expanded.size(),
        "skeleton constructed"
    );
    Ok(expanded)
}

/// Analyze one function and report its leaks.
pub fn analyze_function(module: &Module, name: &str, config: &Config) -> Result<FunctionReport> {
    let expanded = expand_function(module, name, config)?;
    let oracle = BaseObjectOracle::new(module, name);

    let leaks: Vec<(Leakage, String)> = if config.max_parallel > 1 {
        let leaks = detect_parallel(&expanded, &oracle, config)?;
        write_output_files(&expanded, &leaks, config)?;
        leaks
    } else {
        detect(&expanded, &oracle, config)?
    };

    let records = leaks
        .iter()
        .map(|(leak, desc)| LeakRecord {
            refs: leak.vec.iter().map(|r| r.0).collect(),
            transmitter: leak.transmitter.0,
            desc: desc.clone(),
            insts: leak
                .vec
                .iter()
                .map(|&r| expanded.lookup(r).to_string())
                .collect(),
        })
        .collect();

    Ok(FunctionReport {
        function: name.to_string(),
        leaks: records,
        skipped: None,
    })
}

/// Analyze every selected function of a module. Functions already seen in
/// `analyzed` are skipped; resumable conditions are recorded on the report
/// instead of aborting the run.
pub fn analyze_module(
    module: &Module,
    config: &Config,
    analyzed: &mut BTreeSet<String>,
) -> Result<Vec<FunctionReport>> {
    let mut reports = Vec::new();
    for name in module.functions.keys() {
        if !config.wants_function(name) {
            continue;
        }
        if analyzed.contains(name) {
            let skip = Skip::AlreadyAnalyzed(name.clone());
            warn!(%skip, "skipping");
            reports.push(FunctionReport {
                function: name.clone(),
                leaks: Vec::new(),
                skipped: Some(skip.to_string()),
            });
            continue;
        }
        info!(function = %name, "analyzing");
        let report = analyze_function(module, name, config)?;
        analyzed.insert(name.clone());
        reports.push(report);
    }
    Ok(reports)
}
