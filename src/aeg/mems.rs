//! Per-node symbolic memory snapshots: an `Array Int Int` mapping address
//! to the node id of its last writer. These snapshots answer the
//! detector's reads-from queries.

use crate::aeg::{Aeg, Direction, EdgeKind};
use crate::cfg::{NodeRef, Opt};
use std::collections::{BTreeMap, BTreeSet};
use z3::ast::{Array, Ast, Bool, Int};
use z3::Sort;

impl<'ctx, 'a> Aeg<'ctx, 'a> {
    /// Initial memory: every address was last written by the entry.
    pub fn init_mem(&self) -> Array<'ctx> {
        Array::const_array(
            self.ctx.z3,
            &Sort::int(self.ctx.z3),
            &Int::from_u64(self.ctx.z3, self.entry.0 as u64),
        )
    }

    fn node_id(&self, r: NodeRef) -> Int<'ctx> {
        Int::from_u64(self.ctx.z3, r.0 as u64)
    }

    /// Snapshot before each node of `window`, accumulated along a single
    /// reverse-postorder linearization of the window.
    pub fn mems_for(&self, window: &BTreeSet<NodeRef>) -> BTreeMap<NodeRef, Array<'ctx>> {
        let mut ins = BTreeMap::new();
        let mut mem = self.init_mem();
        for r in self.po.reverse_postorder() {
            if r == self.entry || !window.contains(&r) {
                continue;
            }
            ins.insert(r, mem.clone());
            mem = self.apply_write(mem, r);
        }
        ins
    }

    /// Snapshot variant that merges multiple incoming transient-fetch
    /// predecessors with if-then-else on the edge propositions.
    pub fn mems_for_merged(&self, window: &BTreeSet<NodeRef>) -> BTreeMap<NodeRef, Array<'ctx>> {
        let mut ins: BTreeMap<NodeRef, Array<'ctx>> = BTreeMap::new();
        let mut outs: BTreeMap<NodeRef, Array<'ctx>> = BTreeMap::new();
        let init = self.init_mem();
        for r in self.po.reverse_postorder() {
            if r == self.entry || !window.contains(&r) {
                continue;
            }
            let tfos = self.get_nodes(Direction::In, r, EdgeKind::Tfo);
            let mut mem = match tfos.first() {
                None => init.clone(),
                Some((p, _)) => outs.get(p).cloned().unwrap_or_else(|| init.clone()),
            };
            for (p, exists) in tfos.iter().skip(1) {
                let pred_mem = outs.get(p).cloned().unwrap_or_else(|| init.clone());
                mem = exists.ite(&pred_mem, &mem);
            }
            ins.insert(r, mem.clone());
            outs.insert(r, self.apply_write(mem, r));
        }
        ins
    }

    fn apply_write(&self, mem: Array<'ctx>, r: NodeRef) -> Array<'ctx> {
        if self.po.lookup(r).may_write() == Opt::No {
            return mem;
        }
        let Some(addr) = self.memory_address(r) else {
            return mem;
        };
        let node = self.lookup(r);
        let cond = self.ctx.all([&node.exec(), &node.write]);
        let stored = mem.store(&addr, &self.node_id(r));
        cond.ite(&stored, &mem)
    }

    /// "`load` takes its value from `store`" over a snapshot map.
    pub fn read_source(
        &self,
        mems: &BTreeMap<NodeRef, Array<'ctx>>,
        load: NodeRef,
        store: NodeRef,
    ) -> Bool<'ctx> {
        let Some(addr) = self.memory_address(load) else {
            return self.ctx.fls.clone();
        };
        let Some(mem) = mems.get(&load) else {
            return self.ctx.fls.clone();
        };
        match mem.select(&addr).as_int() {
            Some(writer) => writer._eq(&self.node_id(store)),
            None => self.ctx.fls.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::aeg::Aeg;
    use crate::cfg::InstClass;
    use crate::ir::{BaseObjectOracle, FunctionBuilder, Module, Ty, Value};
    use crate::testutil;
    use std::collections::BTreeSet;
    use z3::{Context, SatResult, Solver};

    fn store_load_module() -> Module {
        let mut b = FunctionBuilder::new("victim", vec![]);
        let p = b.gep(Ty::ptr(Ty::i64()), Value::Global("X".into()), vec![]);
        b.store(p.clone(), Value::Const(7));
        b.load(Ty::i64(), p);
        b.ret(None);
        let mut m = Module::default();
        m.insert(b.finish());
        m
    }

    #[test]
    fn snapshot_tracks_the_last_writer() {
        let m = store_load_module();
        let config = testutil::v1_config();
        let po = crate::expand_function(&m, "victim", &config).unwrap();
        let oracle = BaseObjectOracle::new(&m, "victim");
        let z3 = Context::new(&z3::Config::new());
        let aeg = Aeg::construct(&z3, &po, &oracle, &config).unwrap();

        let store = aeg
            .node_range()
            .find(|&r| po.lookup(r).class() == InstClass::Store)
            .unwrap();
        let load = aeg
            .node_range()
            .find(|&r| po.lookup(r).class() == InstClass::Load)
            .unwrap();

        let window: BTreeSet<_> = aeg.node_range().collect();
        let mems = aeg.mems_for(&window);

        let solver = Solver::new(&z3);
        aeg.add_to_solver(&solver);

        // The load can read the store...
        solver.push();
        solver.assert(&aeg.read_source(&mems, load, store));
        assert_eq!(solver.check(), SatResult::Sat);
        solver.pop(1);

        // ...but not the initial state: the store is on every path.
        solver.push();
        solver.assert(&aeg.read_source(&mems, load, aeg.entry));
        assert_eq!(solver.check(), SatResult::Unsat);
        solver.pop(1);
    }

    #[test]
    fn merged_snapshot_agrees_on_straight_lines() {
        let m = store_load_module();
        let config = testutil::v1_config();
        let po = crate::expand_function(&m, "victim", &config).unwrap();
        let oracle = BaseObjectOracle::new(&m, "victim");
        let z3 = Context::new(&z3::Config::new());
        let aeg = Aeg::construct(&z3, &po, &oracle, &config).unwrap();

        let store = aeg
            .node_range()
            .find(|&r| po.lookup(r).class() == InstClass::Store)
            .unwrap();
        let load = aeg
            .node_range()
            .find(|&r| po.lookup(r).class() == InstClass::Load)
            .unwrap();

        let window: BTreeSet<_> = aeg.node_range().collect();
        let mems = aeg.mems_for_merged(&window);
        let solver = Solver::new(&z3);
        aeg.add_to_solver(&solver);
        solver.push();
        solver.assert(&aeg.read_source(&mems, load, store));
        assert_eq!(solver.check(), SatResult::Sat);
        solver.pop(1);
        solver.push();
        solver.assert(&aeg.read_source(&mems, load, aeg.entry));
        assert_eq!(solver.check(), SatResult::Unsat);
        solver.pop(1);
    }

    #[test]
    fn later_writers_never_source_earlier_reads() {
        let m = testutil::s3_module();
        let config = testutil::v4_config(1);
        let po = crate::expand_function(&m, "victim", &config).unwrap();
        let oracle = BaseObjectOracle::new(&m, "victim");
        let z3 = Context::new(&z3::Config::new());
        let aeg = Aeg::construct(&z3, &po, &oracle, &config).unwrap();

        let stores: Vec<_> = aeg
            .node_range()
            .filter(|&r| !po.is_clone(r) && po.lookup(r).class() == InstClass::Store)
            .collect();
        let load = aeg
            .node_range()
            .find(|&r| !po.is_clone(r) && po.lookup(r).class() == InstClass::Load && r > stores[1])
            .unwrap();

        let window: BTreeSet<_> = aeg.node_range().collect();
        let mems = aeg.mems_for(&window);
        let solver = Solver::new(&z3);
        aeg.add_to_solver(&solver);

        // Architecturally the load reads the most recent store.
        solver.push();
        solver.assert(&aeg.read_source(&mems, load, stores[1]));
        assert_eq!(solver.check(), SatResult::Sat);
        solver.pop(1);

        // The stale store is shadowed in the snapshot.
        solver.push();
        solver.assert(&aeg.read_source(&mems, load, stores[0]));
        assert_eq!(solver.check(), SatResult::Unsat);
        solver.pop(1);
    }
}
