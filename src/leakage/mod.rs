//! Leakage detection: enumerate candidate transmitters, bound the search
//! to a window around each one, and drive the solver through the
//! variant's dependency chain with an explicit backtracking stack.

pub mod parallel;
pub mod spectre_v1;
pub mod spectre_v4;

#[cfg(test)]
mod tests;

use crate::aeg::{Aeg, Direction, EdgeKind, ExecMode};
use crate::cfg::{CfgId, NodeRef};
use crate::config::{Config, LeakageClass, SpectreV1Mode};
use crate::error::{Result, Skip, SpecterError};
use crate::ir::AliasOracle;
use crate::sym::{nullify, TimedSolver};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use z3::ast::{Array, Bool};
use z3::SatResult;

/// Ordered dependency steps consumed from the transmitter inward; each
/// step names the edge kind and the execution mode required of the source.
pub type DepVec = Vec<(EdgeKind, ExecMode)>;

/// Closed set of leakage variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariantKind {
    V1Classic,
    V1BranchPredicate,
    V4Stl,
}

impl VariantKind {
    pub fn from_config(config: &Config) -> Self {
        match config.leakage_class() {
            LeakageClass::SpectreV1 => match config.spectre_v1 {
                SpectreV1Mode::Classic => VariantKind::V1Classic,
                SpectreV1Mode::BranchPredicate => VariantKind::V1BranchPredicate,
            },
            LeakageClass::SpectreV4 => VariantKind::V4Stl,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VariantKind::V1Classic => "spectre-v1",
            VariantKind::V1BranchPredicate => "spectre-v1-ctrl",
            VariantKind::V4Stl => "spectre-v4",
        }
    }
}

/// One discovered leak: the dependency chain in source-to-transmitter
/// order, plus the transmitter itself.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Leakage {
    pub vec: Vec<NodeRef>,
    pub transmitter: NodeRef,
}

impl Leakage {
    pub fn print_short(&self) -> String {
        self.vec
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Worker-to-parent message, one per leak.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeakageMsg {
    pub vec: Vec<u64>,
    pub transmitter: u64,
    pub desc: String,
}

impl LeakageMsg {
    pub fn from_leak(leak: &Leakage, desc: &str) -> Self {
        Self {
            vec: leak.vec.iter().map(|r| r.0 as u64).collect(),
            transmitter: leak.transmitter.0 as u64,
            desc: desc.to_string(),
        }
    }

    pub fn to_leak(&self) -> Leakage {
        Leakage {
            vec: self.vec.iter().map(|&v| NodeRef(v as u32)).collect(),
            transmitter: NodeRef(self.transmitter as u32),
        }
    }
}

/// One backtracking step of the dependency search. `Visit` opens a solver
/// scope and applies its assertions; the matching `Leave` closes it and
/// rolls back the action/flag/chain logs.
enum Step<'ctx> {
    Visit(Frame<'ctx>),
    Leave {
        actions: usize,
        flags: usize,
        chain: usize,
    },
}

struct Frame<'ctx> {
    at: NodeRef,
    dep_idx: usize,
    tb_depth: u32,
    asserts: Vec<Bool<'ctx>>,
    actions: Vec<String>,
    flags: Vec<(NodeRef, NodeRef, EdgeKind)>,
    /// Node refs this step contributes to the witness chain.
    push_chain: Vec<NodeRef>,
}

pub struct Detector<'ctx, 'a> {
    pub aeg: &'a Aeg<'ctx, 'a>,
    pub solver: TimedSolver<'ctx>,
    pub variant: VariantKind,
    config: &'a Config,
    oracle: &'a dyn AliasOracle,
    deps: DepVec,
    pub(crate) mems: BTreeMap<NodeRef, Array<'ctx>>,
    pub(crate) exec_window: BTreeSet<NodeRef>,
    trans_window: BTreeSet<NodeRef>,
    rf_memo: BTreeMap<NodeRef, Vec<(NodeRef, Bool<'ctx>)>>,
    actions: Vec<String>,
    flag_edges: Vec<(NodeRef, NodeRef, EdgeKind)>,
    chain: Vec<NodeRef>,
    leaks: Vec<(Leakage, String)>,
    /// Source instructions already reported as transmitters.
    seen_transmitters: BTreeSet<CfgId>,
    abort_transmitter: bool,
    skips: u32,
}

impl<'ctx, 'a> Detector<'ctx, 'a> {
    pub fn new(aeg: &'a Aeg<'ctx, 'a>, oracle: &'a dyn AliasOracle, config: &'a Config) -> Self {
        let variant = VariantKind::from_config(config);
        let solver = TimedSolver::new(aeg.ctx.z3, config.solver_timeout);
        aeg.add_to_solver(&solver);
        let deps = match variant {
            VariantKind::V1Classic => vec![
                (EdgeKind::Addr, ExecMode::Trans),
                (EdgeKind::Addr, ExecMode::Arch),
            ],
            VariantKind::V1BranchPredicate => vec![(EdgeKind::Ctrl, ExecMode::Exec)],
            VariantKind::V4Stl => vec![(EdgeKind::Addr, ExecMode::Trans)],
        };
        Self {
            aeg,
            solver,
            variant,
            config,
            oracle,
            deps,
            mems: BTreeMap::new(),
            exec_window: BTreeSet::new(),
            trans_window: BTreeSet::new(),
            rf_memo: BTreeMap::new(),
            actions: Vec::new(),
            flag_edges: Vec::new(),
            chain: Vec::new(),
            leaks: Vec::new(),
            seen_transmitters: BTreeSet::new(),
            abort_transmitter: false,
            skips: 0,
        }
    }

    pub fn leaks(&self) -> &[(Leakage, String)] {
        &self.leaks
    }

    pub(crate) fn config(&self) -> &'a Config {
        self.config
    }

    /// Nodes reachable from a transmitter through at least one dependency
    /// edge of the innermost kind, and satisfiable as transient accesses.
    pub fn candidate_transmitters(&mut self) -> Result<Vec<NodeRef>, Skip> {
        let kind = self.deps[0].0;
        let mut dsts = BTreeSet::new();
        self.aeg.for_each_edge_kind(kind, |_, dst, _| {
            dsts.insert(dst);
        });
        if dsts.is_empty() {
            return Err(Skip::NoCandidateEdges(kind));
        }
        let mut candidates = Vec::new();
        for dst in dsts {
            if self.aeg.exits.contains(&dst) {
                continue;
            }
            let node = self.aeg.lookup(dst);
            let assumptions = [node.trans.clone(), node.access()];
            if self.solver.timed_check_assumptions(&assumptions) != SatResult::Unsat {
                candidates.push(dst);
            }
        }
        Ok(candidates)
    }

    /// Full sequential detection over every candidate.
    pub fn run(&mut self) -> Result<(), Skip> {
        if self.solver.timed_check() == SatResult::Unsat {
            return Err(Skip::BaseUnsat);
        }
        let candidates = self.candidate_transmitters()?;
        info!(count = candidates.len(), "candidate transmitters");
        for (i, t) in candidates.iter().enumerate() {
            debug!(transmitter = %t, "{}/{}", i + 1, candidates.len());
            self.run_one(*t, false);
        }
        self.dedup_leaks();
        Ok(())
    }

    pub(crate) fn dedup_leaks(&mut self) {
        let mut seen = BTreeSet::new();
        self.leaks
            .retain(|(leak, _)| seen.insert((leak.transmitter, leak.vec.clone())));
    }

    /// Analyze a single transmitter. With `isolated`, a fresh solver is
    /// built by substituting out-of-window variables with false across all
    /// recorded constraints (the worker path); otherwise the shared solver
    /// is scoped and the window constraints asserted.
    pub fn run_one(&mut self, transmitter: NodeRef, isolated: bool) {
        self.abort_transmitter = false;
        self.rf_memo.clear();
        self.compute_windows(transmitter);
        self.mems = self.aeg.mems_for(&self.exec_window);

        if let Some(id) = self.aeg.po.lookup(transmitter).id() {
            if self.seen_transmitters.contains(id) {
                debug!(%transmitter, "transmitter instruction already reported");
                return;
            }
        }
        if self.aeg.exits.contains(&transmitter) {
            return;
        }

        if self.config.use_lookahead && !self.lookahead(transmitter, 0, 0, true) {
            debug!(%transmitter, "skipping transmitter: failed lookahead");
            self.skips += 1;
            return;
        }

        let node = self.aeg.lookup(transmitter);
        let window_constraints = self.window_constraints();

        if isolated {
            self.solver = self.windowed_solver();
        } else {
            self.solver.push();
        }
        for clause in &window_constraints {
            self.solver.assert(clause);
        }
        self.solver.assert(&node.access());
        self.solver.assert(&node.trans);

        if self.solver.timed_check() != SatResult::Unsat {
            self.search(transmitter);
        } else {
            debug!(%transmitter, "skipping transmitter: window unsat");
            self.skips += 1;
        }

        if !isolated {
            self.solver.pop(1);
        }
    }

    fn compute_windows(&mut self, transmitter: NodeRef) {
        let all: BTreeSet<NodeRef> = self.aeg.node_range().collect();
        match self.config.window_size {
            None => {
                self.exec_window = all.clone();
                self.trans_window = all;
            }
            Some(size) => {
                self.exec_window = self.preds_within(transmitter, size);
                self.trans_window = self.preds_within(transmitter, self.config.spec_depth);
                // Entry and exits stay live: they anchor the architectural
                // skeleton.
                self.exec_window.insert(self.aeg.entry);
                self.trans_window.insert(self.aeg.entry);
                for &e in &self.aeg.exits {
                    self.exec_window.insert(e);
                    self.trans_window.insert(e);
                }
            }
        }
    }

    fn preds_within(&self, from: NodeRef, radius: u32) -> BTreeSet<NodeRef> {
        let mut window = BTreeSet::from([from]);
        let mut frontier = VecDeque::from([(from, 0u32)]);
        while let Some((r, d)) = frontier.pop_front() {
            if d == radius {
                continue;
            }
            for &p in self.aeg.po.po.preds(r) {
                if window.insert(p) {
                    frontier.push_back((p, d + 1));
                }
            }
        }
        window
    }

    /// Negated-execution constraints for everything outside the windows.
    fn window_constraints(&self) -> Vec<Bool<'ctx>> {
        let mut out = Vec::new();
        for r in self.aeg.node_range() {
            if r == self.aeg.entry || self.aeg.exits.contains(&r) {
                continue;
            }
            let node = self.aeg.lookup(r);
            if !self.exec_window.contains(&r) {
                out.push(node.exec().not());
            } else if !self.trans_window.contains(&r) {
                out.push(node.trans.not());
            }
        }
        out
    }

    /// Fresh solver over the window: out-of-window execution and edge
    /// variables are substituted with false in every recorded constraint.
    fn windowed_solver(&self) -> TimedSolver<'ctx> {
        let mut nulled: Vec<Bool<'ctx>> = Vec::new();
        let mut null_var = |b: &Bool<'ctx>| {
            // Only fresh variables can be substituted; literals stay.
            if b.as_bool().is_none() {
                nulled.push(b.clone());
            }
        };
        for r in self.aeg.node_range() {
            if r == self.aeg.entry || self.aeg.exits.contains(&r) {
                continue;
            }
            let node = self.aeg.lookup(r);
            if !self.exec_window.contains(&r) {
                null_var(&node.arch);
                null_var(&node.trans);
            } else if !self.trans_window.contains(&r) {
                null_var(&node.trans);
            }
        }
        let mut edge_nulls: Vec<Bool<'ctx>> = Vec::new();
        self.aeg.for_each_edge(|src, dst, edge| {
            if !(self.exec_window.contains(&src) && self.exec_window.contains(&dst))
                && edge.exists.as_bool().is_none()
            {
                edge_nulls.push(edge.exists.clone());
            }
        });
        nulled.extend(edge_nulls);

        let solver = TimedSolver::new(self.aeg.ctx.z3, self.config.solver_timeout);
        for (clause, _) in self.aeg.all_constraints() {
            solver.assert(&nullify(clause, &nulled, &self.aeg.ctx.fls));
        }
        solver
    }

    pub(crate) fn in_window(&self, r: NodeRef, mode: ExecMode) -> bool {
        match mode {
            ExecMode::Trans => self.trans_window.contains(&r),
            ExecMode::Arch | ExecMode::Exec => self.exec_window.contains(&r),
        }
    }

    fn check_edge(&self, src: NodeRef, dst: NodeRef) -> bool {
        self.exec_window.contains(&src) && self.exec_window.contains(&dst)
    }

    /// Explicit-stack dependency traceback. Every `Visit` owns one solver
    /// scope; children run before the matching `Leave` pops it.
    fn search(&mut self, transmitter: NodeRef) {
        let root = Frame {
            at: transmitter,
            dep_idx: 0,
            tb_depth: 0,
            asserts: Vec::new(),
            actions: vec![format!("transmitter {transmitter}")],
            flags: Vec::new(),
            push_chain: vec![transmitter],
        };
        let mut stack: Vec<Step<'ctx>> = vec![Step::Visit(root)];

        while let Some(step) = stack.pop() {
            match step {
                Step::Leave {
                    actions,
                    flags,
                    chain,
                } => {
                    self.solver.pop(1);
                    self.actions.truncate(actions);
                    self.flag_edges.truncate(flags);
                    self.chain.truncate(chain);
                }
                Step::Visit(frame) => {
                    if self.abort_transmitter {
                        // Drain: only scope bookkeeping remains.
                        continue;
                    }
                    self.visit(frame, transmitter, &mut stack);
                }
            }
        }
    }

    fn visit(&mut self, frame: Frame<'ctx>, transmitter: NodeRef, stack: &mut Vec<Step<'ctx>>) {
        stack.push(Step::Leave {
            actions: self.actions.len(),
            flags: self.flag_edges.len(),
            chain: self.chain.len(),
        });
        self.solver.push();
        for clause in &frame.asserts {
            self.solver.assert(clause);
        }
        self.actions.extend(frame.actions.iter().cloned());
        self.flag_edges.extend(frame.flags.iter().copied());
        self.chain.extend(frame.push_chain.iter().copied());

        if self.solver.timed_check() == SatResult::Unsat {
            debug!(at = %frame.at, "backtrack: unsat");
            return;
        }

        if frame.dep_idx == self.deps.len() {
            match self.variant {
                VariantKind::V1Classic | VariantKind::V1BranchPredicate => {
                    self.complete_v1(&frame);
                }
                VariantKind::V4Stl => self.complete_v4(&frame),
            }
            return;
        }

        let (kind, mode) = self.deps[frame.dep_idx];
        for (src, exists, via) in self.aeg.get_edge_via(Direction::In, frame.at, kind) {
            if !self.check_edge(src, frame.at) || !self.in_window(src, mode) {
                continue;
            }
            let child = self.dep_frame(&frame, src, frame.at, kind, mode, exists, via);
            if self.config.use_lookahead && !self.lookahead(src, frame.dep_idx + 1, frame.tb_depth, false)
            {
                continue;
            }
            stack.push(Step::Visit(child));
        }

        if frame.at != transmitter && frame.tb_depth < self.config.max_traceback {
            self.push_traceback_children(&frame, stack);
        }
    }

    /// Frame committing one dependency edge: the edge holds, speculation
    /// does not rejoin, and the source runs in the required mode.
    fn dep_frame(
        &self,
        parent: &Frame<'ctx>,
        src: NodeRef,
        dst: NodeRef,
        kind: EdgeKind,
        mode: ExecMode,
        exists: Bool<'ctx>,
        via: Option<NodeRef>,
    ) -> Frame<'ctx> {
        let src_node = self.aeg.lookup(src);
        let dst_node = self.aeg.lookup(dst);
        let asserts = vec![
            exists,
            src_node.trans.implies(&dst_node.trans),
            dst_node.arch.implies(&src_node.arch),
            src_node.exec_mode(mode),
        ];
        let mut push_chain = Vec::new();
        if let Some(v) = via {
            push_chain.push(v);
        }
        push_chain.push(src);
        Frame {
            at: src,
            dep_idx: parent.dep_idx + 1,
            tb_depth: parent.tb_depth,
            asserts,
            actions: vec![format!("{src} -{kind}-> {dst}")],
            flags: vec![(src, dst, kind)],
            push_chain,
        }
    }

    /// Traceback children: chase one rf-then-data hop or one address hop
    /// without consuming a dependency step.
    fn push_traceback_children(&mut self, frame: &Frame<'ctx>, stack: &mut Vec<Step<'ctx>>) {
        let load = frame.at;
        if self.aeg.po.lookup(load).may_read() == crate::cfg::Opt::No {
            return;
        }
        let load_node = self.aeg.lookup(load);
        let load_active = self.aeg.ctx.all([&load_node.exec(), &load_node.read]);

        // addr: the load's own address came from an earlier load.
        for (src, exists, _) in self.aeg.get_edge_via(Direction::In, load, EdgeKind::Addr) {
            if !self.check_edge(src, load) {
                continue;
            }
            let src_node = self.aeg.lookup(src);
            let child = Frame {
                at: src,
                dep_idx: frame.dep_idx,
                tb_depth: frame.tb_depth + 1,
                asserts: vec![
                    load_active.clone(),
                    exists,
                    src_node.trans.implies(&load_node.trans),
                    load_node.arch.implies(&src_node.arch),
                ],
                actions: vec![format!("{src} -addr-> {load}")],
                flags: vec![(src, load, EdgeKind::Addr)],
                push_chain: vec![src],
            };
            if self.config.use_lookahead
                && !self.lookahead(src, frame.dep_idx, frame.tb_depth + 1, false)
            {
                continue;
            }
            stack.push(Step::Visit(child));
        }

        // rf . data: the load read a value a store computed from an
        // earlier load.
        let sources = self.rf_sources(load);
        for (store, rf_cond) in sources {
            if !self.in_window(store, ExecMode::Trans) {
                continue;
            }
            for (src, data_exists, _) in self.aeg.get_edge_via(Direction::In, store, EdgeKind::Data)
            {
                if !self.check_edge(src, store) {
                    continue;
                }
                let store_node = self.aeg.lookup(store);
                let src_node = self.aeg.lookup(src);
                let child = Frame {
                    at: src,
                    dep_idx: frame.dep_idx,
                    tb_depth: frame.tb_depth + 1,
                    asserts: vec![
                        load_active.clone(),
                        rf_cond.clone(),
                        store_node.exec(),
                        data_exists,
                        src_node.exec(),
                    ],
                    actions: vec![
                        format!("{store} -rf-> {load}"),
                        format!("{src} -data-> {store}"),
                    ],
                    flags: vec![
                        (store, load, EdgeKind::Rf),
                        (src, store, EdgeKind::Data),
                    ],
                    push_chain: vec![src],
                };
                if self.config.use_lookahead
                    && !self.lookahead(src, frame.dep_idx, frame.tb_depth + 1, false)
                {
                    continue;
                }
                stack.push(Step::Visit(child));
            }
        }
    }

    /// Structural pre-pass: does any complete chain exist from here, edges
    /// and windows only, no solver.
    pub(crate) fn lookahead(&mut self, at: NodeRef, dep_idx: usize, tb: u32, is_root: bool) -> bool {
        if dep_idx == self.deps.len() {
            return match self.variant {
                VariantKind::V1Classic | VariantKind::V1BranchPredicate => true,
                VariantKind::V4Stl => self.stl_pair_exists(at, tb),
            };
        }
        let (kind, mode) = self.deps[dep_idx];
        let nexts: Vec<NodeRef> = self
            .aeg
            .get_edge_via(Direction::In, at, kind)
            .into_iter()
            .map(|(src, _, _)| src)
            .collect();
        for src in nexts {
            if self.check_edge(src, at)
                && self.in_window(src, mode)
                && self.lookahead(src, dep_idx + 1, tb, false)
            {
                return true;
            }
        }
        if !is_root && tb < self.config.max_traceback {
            let addrs: Vec<NodeRef> = self
                .aeg
                .get_edge_via(Direction::In, at, EdgeKind::Addr)
                .into_iter()
                .map(|(src, _, _)| src)
                .collect();
            for src in addrs {
                if self.check_edge(src, at) && self.lookahead(src, dep_idx, tb + 1, false) {
                    return true;
                }
            }
            let stores: Vec<NodeRef> = self.rf_sources(at).iter().map(|(s, _)| *s).collect();
            for store in stores {
                if !self.in_window(store, ExecMode::Trans) {
                    continue;
                }
                let datas: Vec<NodeRef> = self
                    .aeg
                    .get_edge_via(Direction::In, store, EdgeKind::Data)
                    .into_iter()
                    .map(|(src, _, _)| src)
                    .collect();
                for src in datas {
                    if self.check_edge(src, store) && self.lookahead(src, dep_idx, tb + 1, false) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Memoized reads-from sources of a load: candidate stores in the
    /// window with the snapshot condition that the load reads them.
    pub(crate) fn rf_sources(&mut self, load: NodeRef) -> Vec<(NodeRef, Bool<'ctx>)> {
        if let Some(cached) = self.rf_memo.get(&load) {
            return cached.clone();
        }
        let sources = self.precompute_rf(load);
        self.rf_memo.insert(load, sources.clone());
        sources
    }

    fn precompute_rf(&mut self, load: NodeRef) -> Vec<(NodeRef, Bool<'ctx>)> {
        let mut out = Vec::new();
        if self.aeg.exits.contains(&load)
            || self.aeg.po.lookup(load).may_read() == crate::cfg::Opt::No
        {
            return out;
        }

        // Candidate stores are the may-writes reachable backwards inside
        // the window; each carries the snapshot condition that the load's
        // address was last written by it.
        let window = self.reachable_preds(load);
        for store in self.aeg.po.postorder() {
            if !window.contains(&store) || store == load {
                continue;
            }
            let cfg_store = self.aeg.po.lookup(store);
            if cfg_store.may_write() == crate::cfg::Opt::No {
                continue;
            }
            if store != self.aeg.entry {
                // Store-forwarding needs matching access widths.
                if let (Some(ls), Some(ss)) = (self.load_size(load), self.store_size(store)) {
                    if ls != ss {
                        continue;
                    }
                }
                // And addresses that can actually meet.
                if self.alias_impossible(load, store) {
                    continue;
                }
            }
            out.push((store, self.aeg.read_source(&self.mems, load, store)));
        }
        out
    }

    fn reachable_preds(&self, from: NodeRef) -> BTreeSet<NodeRef> {
        let mut seen = BTreeSet::new();
        let mut todo = vec![from];
        while let Some(r) = todo.pop() {
            if !self.exec_window.contains(&r) || !seen.insert(r) {
                continue;
            }
            todo.extend(self.aeg.po.po.preds(r).iter().copied());
        }
        seen
    }

    fn load_size(&self, load: NodeRef) -> Option<u32> {
        self.aeg
            .po
            .lookup(load)
            .inst()
            .map(|i| i.ty.size_bits())
            .filter(|&s| s > 0)
    }

    fn store_size(&self, store: NodeRef) -> Option<u32> {
        let cfg_node = self.aeg.po.lookup(store);
        let value = cfg_node.value_operand()?;
        let defs = cfg_node.refs.get(value)?;
        let def = *defs.iter().next()?;
        self.aeg
            .po
            .lookup(def)
            .inst()
            .map(|i| i.ty.size_bits())
            .filter(|&s| s > 0)
    }

    pub(crate) fn alias_impossible(&self, a: NodeRef, b: NodeRef) -> bool {
        let query = |r: NodeRef| {
            let cfg_node = self.aeg.po.lookup(r);
            let inst = cfg_node.inst()?;
            let value = cfg_node.memory_operand()?;
            Some((inst.id.path.clone(), value.clone(), inst.ty.clone()))
        };
        let (Some((pa, va, ta)), Some((pb, vb, tb))) = (query(a), query(b)) else {
            return false;
        };
        let qa = crate::ir::AliasQuery {
            scope: &pa,
            value: &va,
            ty: &ta,
        };
        let qb = crate::ir::AliasQuery {
            scope: &pb,
            value: &vb,
            ty: &tb,
        };
        matches!(self.oracle.alias(&qa, &qb), Some(crate::ir::AliasResult::No))
    }

    /// Record a completed chain as a leak and emit its witness.
    pub(crate) fn emit_leak(&mut self) {
        let transmitter = self.chain[0];
        let mut vec = self.chain.clone();
        vec.reverse();
        let leak = Leakage { vec, transmitter };
        let desc = self
            .actions
            .iter()
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        info!(leak = %leak.print_short(), "leakage found");

        if let Some(id) = self.aeg.po.lookup(transmitter).id() {
            self.seen_transmitters.insert(id.clone());
        }

        if self.config.witness_executions {
            if let Some(dir) = &self.config.output_dir {
                if let Some(model) = self.solver.get_model() {
                    let mut flags = self.flag_edges.clone();
                    flags.push((transmitter, self.aeg.exit_con(&model), EdgeKind::Rfx));
                    let dot = self.aeg.output_execution(&model, &flags);
                    let path = self.witness_path(dir, &leak);
                    if let Err(err) = std::fs::write(&path, dot) {
                        warn!(?path, %err, "failed to write witness");
                    }
                }
            }
        }

        self.leaks.push((leak, desc));
        if self.config.fast_mode {
            self.abort_transmitter = true;
        }
    }

    fn witness_path(&self, dir: &std::path::Path, leak: &Leakage) -> PathBuf {
        let refs = leak
            .vec
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("-");
        dir.join(format!("{}-{}.dot", self.variant.name(), refs))
    }

    /// Write `leakage.txt` and `transmitters.txt` under the output
    /// directory, appending in batch mode.
    pub fn write_outputs(&self) -> Result<()> {
        write_output_files(self.aeg.po, &self.leaks, self.config)
    }

    pub fn into_messages(&self) -> Vec<LeakageMsg> {
        self.leaks
            .iter()
            .map(|(leak, desc)| LeakageMsg::from_leak(leak, desc))
            .collect()
    }
}

impl Drop for Detector<'_, '_> {
    fn drop(&mut self) {
        info!(
            stats = %self.solver.stats,
            skipped = self.skips,
            "detector shutdown"
        );
    }
}

pub use parallel::detect_parallel;

/// Write `leakage.txt` and `transmitters.txt` for a finished analysis,
/// appending in batch mode with a per-function header.
pub fn write_output_files(
    po: &crate::cfg::expanded::CfgExpanded,
    leaks: &[(Leakage, String)],
    config: &Config,
) -> Result<()> {
    let Some(dir) = &config.output_dir else {
        return Ok(());
    };
    std::fs::create_dir_all(dir)?;
    let open = |name: &str| -> std::io::Result<std::fs::File> {
        let mut opts = OpenOptions::new();
        opts.create(true).write(true);
        if config.batch_mode {
            opts.append(true);
        } else {
            opts.truncate(true);
        }
        opts.open(dir.join(name))
    };

    let mut leakage = open("leakage.txt")?;
    if config.batch_mode {
        writeln!(leakage, "\n{}:", po.name)?;
    }
    for (leak, desc) in leaks {
        let insts = leak
            .vec
            .iter()
            .map(|&r| po.lookup(r).to_string())
            .collect::<Vec<_>>()
            .join("; ");
        writeln!(leakage, "{} : {} -- {}", leak.print_short(), desc, insts)?;
    }

    let mut transmitters = open("transmitters.txt")?;
    let mut unique = BTreeSet::new();
    for (leak, _) in leaks {
        unique.insert(po.lookup(leak.transmitter).to_string());
    }
    for t in unique {
        writeln!(transmitters, "{t}")?;
    }
    Ok(())
}

/// Convenience used by the driver and tests: run the full detection
/// pipeline over one expanded skeleton with a fresh solver context.
pub fn detect<'a>(
    po: &'a crate::cfg::expanded::CfgExpanded,
    oracle: &dyn AliasOracle,
    config: &'a Config,
) -> Result<Vec<(Leakage, String)>, SpecterError> {
    let z3 = z3::Context::new(&z3::Config::new());
    let aeg = Aeg::construct(&z3, po, oracle, config)?;
    let mut detector = Detector::new(&aeg, oracle, config);
    match detector.run() {
        Ok(()) => {}
        Err(skip) => {
            info!(%skip, "analysis skipped");
            return Ok(Vec::new());
        }
    }
    detector.write_outputs()?;
    Ok(detector.leaks().to_vec())
}
