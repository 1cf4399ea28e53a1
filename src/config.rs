use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Which leakage family the analysis searches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeakageClass {
    SpectreV1,
    SpectreV4,
}

/// Sub-mode for Spectre-v1 detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpectreV1Mode {
    #[default]
    Classic,
    BranchPredicate,
}

/// Spectre-v4 (store-to-load forwarding) parameters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpectreV4Mode {
    /// Store-buffer depth: a store can be bypassed once this many stores
    /// separate it from the speculating load.
    pub stb_size: u32,
}

/// Alias-analysis behavior switches.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AliasMode {
    /// Apply alias constraints in transient windows too, not only between
    /// architecturally-executed accesses.
    pub transient: bool,
    /// Disable the structural pre-oracle filters.
    pub lax: bool,
}

/// The full configuration surface. Built once at startup, immutable
/// afterwards, passed by reference everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub leakage_class: Option<LeakageClass>,
    pub spectre_v1: SpectreV1Mode,
    pub spectre_v4: SpectreV4Mode,

    /// Maximum transient-window depth.
    pub spec_depth: u32,
    /// Loop iterations retained by unrolling.
    pub num_unrolls: u32,
    /// Reorder-buffer capacity; bounds the transient node count when no
    /// explicit cap is given.
    pub rob_size: u32,
    /// Maximum rf x (addr + data) traceback chain length.
    pub max_traceback: u32,
    /// Hard cap on transiently-executed nodes per witness.
    pub max_transient_nodes: Option<u32>,
    /// Radius (in program-order steps) of the per-transmitter execution
    /// window; `None` disables windowing.
    pub window_size: Option<u32>,

    pub alias_mode: AliasMode,
    /// Allow cold-start executions that begin mid-function.
    pub partial_executions: bool,
    /// Emit a DOT execution per discovered leak.
    pub witness_executions: bool,
    /// Stop after the first leak per transmitter.
    pub fast_mode: bool,
    /// Run the structural lookahead pass before solver-backed search.
    pub use_lookahead: bool,
    /// Number of parallel detection workers.
    pub max_parallel: u32,
    /// Per-call solver timeout.
    pub solver_timeout: Option<Duration>,

    /// Analyze only these functions; empty means all.
    pub function_names: BTreeSet<String>,
    /// Append to output files instead of truncating, prefixing sections
    /// with the function name.
    pub batch_mode: bool,
    /// Dump intermediate graphs alongside the leakage output.
    pub output_graphs: bool,
    /// Where leakage.txt, transmitters.txt and witnesses go. `None`
    /// suppresses all file output.
    pub output_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            leakage_class: None,
            spectre_v1: SpectreV1Mode::default(),
            spectre_v4: SpectreV4Mode::default(),
            spec_depth: 2,
            num_unrolls: 2,
            rob_size: 10,
            max_traceback: 1,
            max_transient_nodes: None,
            window_size: None,
            alias_mode: AliasMode::default(),
            partial_executions: false,
            witness_executions: true,
            fast_mode: false,
            use_lookahead: true,
            max_parallel: 1,
            solver_timeout: None,
            function_names: BTreeSet::new(),
            batch_mode: false,
            output_graphs: false,
            output_dir: None,
        }
    }
}

impl Config {
    /// Check the configuration and normalize implied settings. Fast mode
    /// disables witnesses and implies partial executions; a finite window
    /// is only meaningful under partial-execution semantics.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        let class = self.leakage_class.ok_or(ConfigError::MissingLeakageClass)?;
        if class == LeakageClass::SpectreV4 && self.spectre_v4.stb_size == 0 {
            return Err(ConfigError::BadStbSize(self.spectre_v4.stb_size));
        }
        if self.max_parallel == 0 {
            return Err(ConfigError::BadValue {
                option: "max_parallel",
                message: "must be at least 1".into(),
            });
        }
        if self.fast_mode {
            self.witness_executions = false;
            self.partial_executions = true;
        }
        if self.window_size.is_some() {
            self.partial_executions = true;
        }
        // The store-bypass search relates transient clones to the stores
        // they read around, so their addresses must be constrained too.
        if class == LeakageClass::SpectreV4 {
            self.alias_mode.transient = true;
        }
        Ok(self)
    }

    pub(crate) fn leakage_class(&self) -> LeakageClass {
        self.leakage_class.expect("config was not validated")
    }

    /// Ceiling on the number of transiently-executed nodes in any witness.
    pub(crate) fn transient_cap(&self) -> u32 {
        self.max_transient_nodes.unwrap_or(self.rob_size)
    }

    pub(crate) fn wants_function(&self, name: &str) -> bool {
        self.function_names.is_empty() || self.function_names.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_leakage_class_is_rejected() {
        let err = Config::default().validated().unwrap_err();
        assert!(matches!(err, ConfigError::MissingLeakageClass));
    }

    #[test]
    fn v4_requires_store_buffer_depth() {
        let cfg = Config {
            leakage_class: Some(LeakageClass::SpectreV4),
            ..Config::default()
        };
        assert!(matches!(
            cfg.validated().unwrap_err(),
            ConfigError::BadStbSize(0)
        ));
    }

    #[test]
    fn fast_mode_implies_partial_and_no_witnesses() {
        let cfg = Config {
            leakage_class: Some(LeakageClass::SpectreV1),
            fast_mode: true,
            ..Config::default()
        }
        .validated()
        .unwrap();
        assert!(cfg.partial_executions);
        assert!(!cfg.witness_executions);
    }

    #[test]
    fn windowing_implies_partial() {
        let cfg = Config {
            leakage_class: Some(LeakageClass::SpectreV1),
            window_size: Some(2),
            ..Config::default()
        }
        .validated()
        .unwrap();
        assert!(cfg.partial_executions);
    }
}
