//! Spectre-v4 (store-to-load forwarding) completion.
//!
//! The dependency step has already committed a transient load feeding the
//! transmitter's address. That load sits in the speculative window of a
//! store -- the store whose forwarding is bypassed. The completion commits
//! a *stale* earlier store as the value source: both stores overlap the
//! load's address, and in the xs-access order the load reads before the
//! bypassed store becomes visible.

use crate::aeg::EdgeKind;
use crate::cfg::{NodeRef, Opt};
use crate::leakage::{Detector, Frame};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;
use z3::ast::{Ast, Bool};
use z3::SatResult;

impl<'ctx, 'a> Detector<'ctx, 'a> {
    pub(crate) fn complete_v4(&mut self, frame: &Frame<'ctx>) {
        // The bypass consumes the rf step of the traceback budget.
        if frame.tb_depth >= self.config().max_traceback {
            debug!("backtrack: store-bypass exceeds traceback budget");
            return;
        }
        let load = frame.at;
        let Some(bypassed) = self.aeg.po.fork_of(load) else {
            return;
        };
        if self.aeg.po.lookup(bypassed).may_write() != Opt::Must {
            return;
        }

        for stale in self.stale_candidates(load, bypassed) {
            let Some(clause) = self.bypass_clause(stale, bypassed, load) else {
                continue;
            };
            self.solver.push();
            self.solver.assert(&clause);
            let chain_len = {
                self.chain.push(bypassed);
                self.chain.push(stale);
                self.actions
                    .push(format!("{stale} -rf-> {load} bypassing {bypassed}"));
                self.flag_edges.push((stale, load, EdgeKind::Rf));
                self.chain.len() - 2
            };

            if self.solver.timed_check() == SatResult::Sat {
                self.emit_leak();
            }

            self.chain.truncate(chain_len);
            self.actions.pop();
            self.flag_edges.pop();
            self.solver.pop(1);
            if self.abort_transmitter {
                break;
            }
        }
    }

    /// Stores program-order-before the bypassed store that could hold the
    /// stale value: real writes, deep enough in the store buffer, whose
    /// address can meet the load's.
    pub(crate) fn stale_candidates(&self, load: NodeRef, bypassed: NodeRef) -> Vec<NodeRef> {
        let stb = self.config().spectre_v4.stb_size;
        let load_in = self.aeg.lookup(load).stores_in;
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut todo: VecDeque<NodeRef> =
            self.aeg.po.po.preds(bypassed).iter().copied().collect();
        while let Some(r) = todo.pop_front() {
            if !seen.insert(r) {
                continue;
            }
            todo.extend(self.aeg.po.po.preds(r).iter().copied());
            let cfg_node = self.aeg.po.lookup(r);
            if cfg_node.may_write() != Opt::Must || cfg_node.is_special() {
                continue;
            }
            if !self.in_window(r, crate::aeg::ExecMode::Exec) {
                continue;
            }
            if load_in.saturating_sub(self.aeg.lookup(r).stores_out) < stb {
                continue;
            }
            if self.alias_impossible(load, r) || self.alias_impossible(load, bypassed) {
                continue;
            }
            out.push(r);
        }
        out
    }

    /// The symbolic conditions of one bypass: all three accesses execute
    /// and overlap, and the load's microarchitectural read lands between
    /// the stale and the bypassed write.
    fn bypass_clause(
        &self,
        stale: NodeRef,
        bypassed: NodeRef,
        load: NodeRef,
    ) -> Option<Bool<'ctx>> {
        let sn = self.aeg.lookup(stale);
        let bn = self.aeg.lookup(bypassed);
        let ln = self.aeg.lookup(load);
        let so = sn.xsaccess_order.clone()?;
        let bo = bn.xsaccess_order.clone()?;
        let lo = ln.xsaccess_order.clone()?;
        let stale_addr = self.aeg.memory_address(stale)?;
        let bypassed_addr = self.aeg.memory_address(bypassed)?;
        let load_addr = self.aeg.memory_address(load)?;
        Some(self.aeg.ctx.all([
            &sn.exec(),
            &sn.write,
            &bn.arch,
            &bn.write,
            &ln.trans,
            &ln.read,
            &stale_addr._eq(&load_addr),
            &bypassed_addr._eq(&load_addr),
            &so.lt(&lo),
            &lo.lt(&bo),
        ]))
    }

    /// Structural counterpart used by the lookahead pass.
    pub(crate) fn stl_pair_exists(&self, load: NodeRef, tb_depth: u32) -> bool {
        if tb_depth >= self.config().max_traceback {
            return false;
        }
        let Some(bypassed) = self.aeg.po.fork_of(load) else {
            return false;
        };
        if self.aeg.po.lookup(bypassed).may_write() != Opt::Must {
            return false;
        }
        !self.stale_candidates(load, bypassed).is_empty()
    }
}
