//! Per-fork speculative expansion.
//!
//! Wherever the active policy says speculation may be introduced, the
//! successor chain is cloned into a transient-only copy, so speculative and
//! architectural execution are separate node sequences. Clones stop at the
//! speculation depth, at fences (resynchronization) and at exits; each fork
//! context gets its own copies.

use crate::cfg::calls::CfgCalls;
use crate::cfg::{Cfg, CfgNode, ExecOpt, NodeRef, Opt};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Deref;
use tracing::debug;

/// Variant-specific answers to "where can speculation start and how do
/// speculative copies execute".
pub trait SpeculationPolicy: Sync {
    fn name(&self) -> &'static str;

    fn may_introduce_speculation(&self, cfg: &Cfg, n: NodeRef) -> bool;

    /// Execution options for a clone at the given depth inside the window.
    fn execs(&self, _cfg: &Cfg, _n: NodeRef, _depth: u32) -> ExecOpt {
        ExecOpt::new(Opt::No, Opt::May)
    }

    /// Nodes that terminate a speculative window.
    fn resync(&self, cfg: &Cfg, n: NodeRef) -> bool {
        cfg.lookup(n).is_fence()
    }
}

/// Spectre-v1: every conditional branch may be mispredicted.
pub struct ExpandSpectreV1;

impl SpeculationPolicy for ExpandSpectreV1 {
    fn name(&self) -> &'static str {
        "spectre-v1"
    }

    fn may_introduce_speculation(&self, cfg: &Cfg, n: NodeRef) -> bool {
        let node = cfg.lookup(n);
        node.is_branch() && cfg.po.succs(n).len() >= 2
    }
}

/// Spectre-v4: a store's forwarding to younger loads may fail, letting the
/// continuation run ahead with stale memory.
pub struct ExpandSpectreV4;

impl SpeculationPolicy for ExpandSpectreV4 {
    fn name(&self) -> &'static str {
        "spectre-v4"
    }

    fn may_introduce_speculation(&self, cfg: &Cfg, n: NodeRef) -> bool {
        cfg.lookup(n).may_write() == Opt::Must && !cfg.lookup(n).is_special()
    }
}

#[derive(Clone, Debug)]
pub struct CfgExpanded {
    pub cfg: Cfg,
    /// Architectural nodes where a speculative window may open.
    pub spec_intro: BTreeSet<NodeRef>,
    /// For clones, the architectural node they were copied from.
    pub origin: Vec<Option<NodeRef>>,
    /// For clones, the fork node whose misspeculation produces them.
    pub intro_of: Vec<Option<NodeRef>>,
}

impl Deref for CfgExpanded {
    type Target = Cfg;

    fn deref(&self) -> &Cfg {
        &self.cfg
    }
}

impl CfgExpanded {
    pub fn construct(calls: &CfgCalls, policy: &dyn SpeculationPolicy, spec_depth: u32) -> Self {
        let mut cfg = calls.cfg.clone();
        let base_size = cfg.size();
        let mut origin: Vec<Option<NodeRef>> = vec![None; base_size];
        let mut intro_of: Vec<Option<NodeRef>> = vec![None; base_size];
        let mut spec_intro = BTreeSet::new();

        let forks: Vec<NodeRef> = cfg
            .node_range()
            .filter(|&r| policy.may_introduce_speculation(&calls.cfg, r))
            .collect();

        for fork in forks {
            let mut clone_map: BTreeMap<NodeRef, NodeRef> = BTreeMap::new();
            let mut queue: VecDeque<(NodeRef, u32)> = calls
                .po
                .succs(fork)
                .iter()
                .map(|&s| (s, 1))
                .collect();

            while let Some((orig, depth)) = queue.pop_front() {
                if depth > spec_depth || clone_map.contains_key(&orig) {
                    continue;
                }
                let node = calls.cfg.lookup(orig);
                if node.is_special() || policy.resync(&calls.cfg, orig) {
                    continue;
                }
                let clone = cfg.add_node(CfgNode {
                    v: node.v.clone(),
                    refs: BTreeMap::new(),
                    exec: policy.execs(&calls.cfg, orig, depth),
                });
                origin.push(Some(orig));
                intro_of.push(Some(fork));
                clone_map.insert(orig, clone);
                for &succ in calls.po.succs(orig) {
                    queue.push_back((succ, depth + 1));
                }
            }

            // Wire the speculative chain: fork to its cloned successors,
            // clone to clone along the original edges.
            for (&orig, &clone) in &clone_map {
                if calls.po.succs(fork).contains(&orig) {
                    cfg.add_edge(fork, clone);
                }
                for &succ in calls.po.succs(orig) {
                    if let Some(&succ_clone) = clone_map.get(&succ) {
                        cfg.add_edge(clone, succ_clone);
                    }
                }
            }

            if !clone_map.is_empty() {
                spec_intro.insert(fork);
                debug!(%fork, clones = clone_map.len(), "speculative window");
            }
        }

        cfg.compute_refs();
        Self {
            cfg,
            spec_intro,
            origin,
            intro_of,
        }
    }

    pub fn may_introduce_speculation(&self, n: NodeRef) -> bool {
        self.spec_intro.contains(&n)
    }

    pub fn is_clone(&self, n: NodeRef) -> bool {
        self.intro_of.get(n.index()).copied().flatten().is_some()
    }

    /// Fork node of a transient clone.
    pub fn fork_of(&self, n: NodeRef) -> Option<NodeRef> {
        self.intro_of.get(n.index()).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::unrolled::CfgUnrolled;
    use crate::cfg::InstClass;
    use crate::ir::{FunctionBuilder, Function, Module, Ty, Value};

    fn branchy(with_fence: bool) -> Function {
        let mut b = FunctionBuilder::new("branchy", vec![]);
        let then_bb = b.block();
        let done = b.block();
        let p = b.gep(Ty::ptr(Ty::i64()), Value::Global("idx".into()), vec![]);
        let v = b.load(Ty::i64(), p);
        let c = b.cmp(v, Value::Const(16));
        b.br(c, then_bb, done);
        b.switch_to(then_bb);
        if with_fence {
            b.fence();
        }
        let q = b.gep(Ty::ptr(Ty::i64()), Value::Global("table".into()), vec![]);
        let w = b.load(Ty::i64(), q.clone());
        b.store(q, w);
        b.jmp(done);
        b.switch_to(done);
        b.ret(None);
        b.finish()
    }

    fn expand(f: &Function, depth: u32) -> CfgExpanded {
        let m = {
            let mut m = Module::default();
            m.insert(f.clone());
            m
        };
        let unrolled = CfgUnrolled::construct(f, 2).unwrap();
        let calls = CfgCalls::construct(&unrolled, &m, 2, 2).unwrap();
        CfgExpanded::construct(&calls, &ExpandSpectreV1, depth)
    }

    #[test]
    fn branches_fork_transient_clones() {
        let f = branchy(false);
        let expanded = expand(&f, 8);
        expanded.cfg.check().unwrap();
        assert_eq!(expanded.spec_intro.len(), 1);
        let clones: Vec<_> = expanded
            .cfg
            .node_range()
            .filter(|&r| expanded.is_clone(r))
            .collect();
        assert!(!clones.is_empty());
        for &c in &clones {
            let node = expanded.lookup(c);
            assert_eq!(node.exec, ExecOpt::new(Opt::No, Opt::May));
            assert!(expanded.fork_of(c).is_some());
        }
        // Some clone is a load: the speculative body re-executes the
        // guarded accesses.
        assert!(clones
            .iter()
            .any(|&c| expanded.lookup(c).class() == InstClass::Load));
    }

    #[test]
    fn zero_depth_produces_no_clones() {
        let f = branchy(false);
        let expanded = expand(&f, 0);
        expanded.cfg.check().unwrap();
        assert!(expanded.spec_intro.is_empty());
        assert!(expanded.cfg.node_range().all(|r| !expanded.is_clone(r)));
    }

    #[test]
    fn fences_close_the_window() {
        let f = branchy(true);
        let expanded = expand(&f, 8);
        expanded.cfg.check().unwrap();
        // The fence guards one arm; nothing behind it is cloned, so no
        // clone is a load or store.
        assert!(expanded
            .cfg
            .node_range()
            .filter(|&r| expanded.is_clone(r))
            .all(|r| !expanded.lookup(r).is_memory()));
    }

    #[test]
    fn depth_bounds_window_length() {
        let f = branchy(false);
        let expanded = expand(&f, 1);
        expanded.cfg.check().unwrap();
        let clones = expanded
            .cfg
            .node_range()
            .filter(|&r| expanded.is_clone(r))
            .count();
        // One clone per fork successor at depth 1.
        assert!(clones <= 2);
        assert!(clones >= 1);
    }

    #[test]
    fn clone_refs_reach_pre_fork_defs() {
        let f = branchy(false);
        let expanded = expand(&f, 8);
        let clone_load = expanded
            .cfg
            .node_range()
            .find(|&r| expanded.is_clone(r) && expanded.lookup(r).class() == InstClass::Load)
            .unwrap();
        let node = expanded.lookup(clone_load);
        let addr = node.memory_operand().unwrap().clone();
        let defs = node.refs.get(&addr).unwrap();
        // The address gep was cloned too, so the def is the clone.
        assert!(defs.iter().all(|&d| expanded.is_clone(d)));
    }
}
