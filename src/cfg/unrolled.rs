//! Bounded loop unrolling.
//!
//! Depth-first traversal from the function entry with a per-path
//! repetition count for every instruction. Copies of an instruction are
//! merged when they occur at the same repetition index, so straight-line
//! diamonds collapse while loop iterations stay distinct. Following an
//! edge whose target has already been copied `num_unrolls` times prunes
//! the back edge; a path that loses all its successors this way falls
//! through to the exit, which acts as the merge successor.

use crate::cfg::{Cfg, CfgId, CfgNode, ExecOpt, InstNode, NodeData, NodeRef, Opt};
use crate::error::{Result, SpecterError};
use crate::ir::{CallPath, Function, InstId};
use std::collections::BTreeMap;
use std::ops::Deref;

#[derive(Clone, Debug)]
pub struct CfgUnrolled {
    pub cfg: Cfg,
}

impl Deref for CfgUnrolled {
    type Target = Cfg;

    fn deref(&self) -> &Cfg {
        &self.cfg
    }
}

struct Unroller<'f> {
    func: &'f Function,
    cfg: Cfg,
    num_unrolls: u32,
    /// (instruction, repetition index) -> node
    merge_map: BTreeMap<(InstId, u32), NodeRef>,
}

impl CfgUnrolled {
    pub fn construct(func: &Function, num_unrolls: u32) -> Result<Self> {
        func.validate().map_err(SpecterError::Module)?;
        let mut unroller = Unroller {
            func,
            cfg: Cfg::new(func.name.clone()),
            num_unrolls,
            merge_map: BTreeMap::new(),
        };
        let entry = unroller.cfg.entry;
        let reps = BTreeMap::new();
        unroller.visit(func.entry_inst(), entry, &reps);
        unroller.connect_exit();
        let mut cfg = unroller.cfg;
        cfg.compute_refs();
        Ok(Self { cfg })
    }

    /// Reference definition of the ancestor relation: `parent` reaches
    /// `child` through program-order predecessors.
    pub fn is_ancestor(&self, child: NodeRef, parent: NodeRef) -> bool {
        if child == parent {
            return true;
        }
        self.po
            .preds(child)
            .iter()
            .any(|&p| self.is_ancestor(p, parent))
    }
}

impl Unroller<'_> {
    fn make_node(&mut self, inst: InstId) -> CfgNode {
        let ir_inst = self.func.inst(inst);
        CfgNode {
            v: NodeData::Inst(InstNode {
                id: CfgId {
                    path: CallPath::default(),
                    inst,
                },
                op: ir_inst.op.clone(),
                ty: ir_inst.ty.clone(),
            }),
            refs: BTreeMap::new(),
            exec: ExecOpt::new(Opt::May, Opt::No),
        }
    }

    fn visit(&mut self, inst: InstId, pred: NodeRef, reps: &BTreeMap<InstId, u32>) {
        let count = reps.get(&inst).copied().unwrap_or(0);
        if let Some(&existing) = self.merge_map.get(&(inst, count)) {
            self.cfg.add_edge(pred, existing);
            return;
        }

        let node = self.make_node(inst);
        let r = self.cfg.add_node(node);
        self.merge_map.insert((inst, count), r);
        self.cfg.add_edge(pred, r);

        let mut reps = reps.clone();
        reps.insert(inst, count + 1);

        for succ in self.func.successors(inst) {
            let succ_count = reps.get(&succ).copied().unwrap_or(0);
            if succ_count >= self.num_unrolls {
                // Unroll bound reached: drop the back edge.
                continue;
            }
            self.visit(succ, r, &reps);
        }
    }

    /// Returns and bound-pruned dead ends all flow into a single exit node.
    fn connect_exit(&mut self) {
        let exit = self.cfg.add_node(CfgNode::exit());
        let dangling: Vec<NodeRef> = self
            .cfg
            .node_range()
            .filter(|&r| r != exit && self.cfg.po.succs(r).is_empty())
            .collect();
        for r in dangling {
            self.cfg.add_edge(r, exit);
        }
    }
}
