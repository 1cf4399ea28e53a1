//! Inline-by-duplication for direct calls.
//!
//! Call nodes whose callee is known are replaced by a copy of the callee's
//! unrolled body, up to a nesting bound. The call node itself stays in the
//! graph as the return point: the callee's returns flow into it and its
//! result value resolves to the callee's return operands.

use crate::cfg::unrolled::CfgUnrolled;
use crate::cfg::{Cfg, CfgId, CfgNode, ExecOpt, InstNode, NodeData, NodeRef, Opt};
use crate::error::Result;
use crate::ir::{Module, Op, Value};
use std::collections::BTreeMap;
use std::ops::Deref;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct CfgCalls {
    pub cfg: Cfg,
}

impl Deref for CfgCalls {
    type Target = Cfg;

    fn deref(&self) -> &Cfg {
        &self.cfg
    }
}

impl CfgCalls {
    pub fn construct(
        unrolled: &CfgUnrolled,
        module: &Module,
        call_depth: u32,
        num_unrolls: u32,
    ) -> Result<Self> {
        let mut cfg = unrolled.cfg.clone();

        // Work-list of call nodes still eligible for inlining. Splicing
        // appends nodes, so newly-revealed nested calls join the queue.
        let mut cursor = 0u32;
        while (cursor as usize) < cfg.nodes.len() {
            let r = NodeRef(cursor);
            cursor += 1;

            let Some(inst) = cfg.lookup(r).inst() else {
                continue;
            };
            let Op::Call { callee, args } = &inst.op else {
                continue;
            };
            if inst.id.path.0.len() as u32 >= call_depth {
                continue;
            }
            let Some(callee_fn) = module.get(callee) else {
                // Unknown target: stays an opaque call.
                continue;
            };
            let scope = inst.id.path.child(inst.id.inst);
            let args = args.clone();
            debug!(call = %r, callee = %callee_fn.name, "inlining");

            let body = CfgUnrolled::construct(callee_fn, num_unrolls)?;
            splice(&mut cfg, r, scope, &body, args);
        }

        cfg.compute_refs();
        Ok(Self { cfg })
    }
}

/// Replace the call at `site` with a copy of `body`. Predecessors of the
/// call flow into the callee entry block, returns flow back into the call
/// node, and the call keeps its successors.
fn splice(
    cfg: &mut Cfg,
    site: NodeRef,
    scope: crate::ir::CallPath,
    body: &CfgUnrolled,
    args: Vec<Value>,
) {
    let mut map: BTreeMap<NodeRef, NodeRef> = BTreeMap::new();
    let mut rets: Vec<Value> = Vec::new();

    for r in body.node_range() {
        let node = body.lookup(r);
        let Some(inst) = node.inst() else {
            continue;
        };
        if let Op::Ret { value } = &inst.op {
            if let Some(v) = value {
                rets.push(v.clone());
            }
        }
        let mut path = scope.0.clone();
        path.extend(inst.id.path.0.iter().copied());
        let new = cfg.add_node(CfgNode {
            v: NodeData::Inst(InstNode {
                id: CfgId {
                    path: crate::ir::CallPath(path),
                    inst: inst.id.inst,
                },
                op: inst.op.clone(),
                ty: inst.ty.clone(),
            }),
            refs: BTreeMap::new(),
            exec: ExecOpt::new(Opt::May, Opt::No),
        });
        map.insert(r, new);
    }

    // Internal edges.
    for src in body.po.nodes() {
        for &dst in body.po.succs(src) {
            if let (Some(&s), Some(&d)) = (map.get(&src), map.get(&dst)) {
                cfg.add_edge(s, d);
            }
        }
    }

    // Callers flow into the callee entry's successors.
    let preds: Vec<NodeRef> = cfg.po.preds(site).iter().copied().collect();
    for &body_start in body.po.succs(body.entry) {
        if let Some(&start) = map.get(&body_start) {
            for &p in &preds {
                cfg.po.remove(p, site);
                cfg.add_edge(p, start);
            }
        }
    }

    // Returns flow into the call node, which keeps its successors.
    for exit in &body.exits {
        for &ret in body.po.preds(*exit) {
            if let Some(&ret_node) = map.get(&ret) {
                cfg.add_edge(ret_node, site);
            }
        }
    }

    cfg.call_args.insert(scope.clone(), args);
    cfg.call_rets.insert(scope, rets);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::InstClass;
    use crate::ir::{FunctionBuilder, Ty};

    fn module_with_call() -> Module {
        let mut m = Module::default();

        let mut callee = FunctionBuilder::new("deref", vec![Ty::ptr(Ty::i64())]);
        let v = callee.load(Ty::i64(), Value::Arg(0));
        callee.ret(Some(v));
        m.insert(callee.finish());

        let mut caller = FunctionBuilder::new("main", vec![]);
        let p = caller.gep(Ty::ptr(Ty::i64()), Value::Global("g".into()), vec![]);
        let x = caller.call(Ty::i64(), "deref", vec![p.clone()]);
        caller.store(p, x);
        caller.ret(None);
        m.insert(caller.finish());

        m
    }

    fn build(m: &Module, depth: u32) -> CfgCalls {
        let unrolled = CfgUnrolled::construct(m.get("main").unwrap(), 2).unwrap();
        CfgCalls::construct(&unrolled, m, depth, 2).unwrap()
    }

    #[test]
    fn callee_body_is_duplicated() {
        let m = module_with_call();
        let calls = build(&m, 2);
        calls.cfg.check().unwrap();
        let loads = calls
            .cfg
            .node_range()
            .filter(|&r| calls.lookup(r).class() == InstClass::Load)
            .count();
        assert_eq!(loads, 1);
        // The inlined load carries the extended call path.
        let load = calls
            .cfg
            .node_range()
            .find(|&r| calls.lookup(r).class() == InstClass::Load)
            .unwrap();
        assert_eq!(calls.lookup(load).id().unwrap().path.0.len(), 1);
    }

    #[test]
    fn zero_depth_keeps_call_opaque() {
        let m = module_with_call();
        let calls = build(&m, 0);
        calls.cfg.check().unwrap();
        let loads = calls
            .cfg
            .node_range()
            .filter(|&r| calls.lookup(r).class() == InstClass::Load)
            .count();
        assert_eq!(loads, 0);
    }

    #[test]
    fn caller_store_sees_callee_return_def() {
        let m = module_with_call();
        let calls = build(&m, 2);
        let store = calls
            .cfg
            .node_range()
            .find(|&r| calls.lookup(r).class() == InstClass::Store)
            .unwrap();
        let store_node = calls.lookup(store);
        // The stored value is the call result, which resolves to the
        // inlined load.
        let value = store_node.value_operand().unwrap().clone();
        let defs = store_node.refs.get(&value).unwrap();
        assert_eq!(defs.len(), 1);
        let def = *defs.iter().next().unwrap();
        assert_eq!(calls.lookup(def).class(), InstClass::Load);
    }

    #[test]
    fn argument_loads_resolve_to_caller_pointer() {
        let m = module_with_call();
        let calls = build(&m, 2);
        let load = calls
            .cfg
            .node_range()
            .find(|&r| calls.lookup(r).class() == InstClass::Load)
            .unwrap();
        let node = calls.lookup(load);
        let addr = node.memory_operand().unwrap().clone();
        let defs = node.refs.get(&addr).unwrap();
        let def = *defs.iter().next().unwrap();
        // Defined by the caller's gep.
        assert_eq!(calls.lookup(def).id().unwrap().path.0.len(), 0);
    }
}
