//! The abstract event graph: one symbolic node per expanded-skeleton node,
//! with propositional execution flags and symbolic addresses, plus a typed
//! edge list whose existence propositions the solver decides.

pub mod construct;
pub mod mems;

use crate::cfg::expanded::CfgExpanded;
use crate::cfg::NodeRef;
use crate::config::Config;
use crate::dot;
use crate::ir::Value;
use crate::sym::{Constraints, SymCtx};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use z3::ast::{Ast, Bool, Int};
use z3::Model;

/// Edge kinds of the event graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeKind {
    Po,
    Tfo,
    Rf,
    Co,
    Fr,
    Rfx,
    Cox,
    Frx,
    Addr,
    AddrGep,
    Data,
    Ctrl,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeKind::Po => "po",
            EdgeKind::Tfo => "tfo",
            EdgeKind::Rf => "rf",
            EdgeKind::Co => "co",
            EdgeKind::Fr => "fr",
            EdgeKind::Rfx => "rfx",
            EdgeKind::Cox => "cox",
            EdgeKind::Frx => "frx",
            EdgeKind::Addr => "addr",
            EdgeKind::AddrGep => "addr_gep",
            EdgeKind::Data => "data",
            EdgeKind::Ctrl => "ctrl",
        };
        f.write_str(s)
    }
}

/// Execution mode required of a dependency source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecMode {
    Arch,
    Trans,
    Exec,
}

#[derive(Clone, Debug)]
pub struct Edge<'ctx> {
    pub kind: EdgeKind,
    pub exists: Bool<'ctx>,
    pub constraints: Constraints<'ctx>,
    /// Mediating node, where the relation has one (the branch of a CTRL
    /// dependency).
    pub via: Option<NodeRef>,
}

#[derive(Clone, Debug)]
pub(crate) struct EdgeRec<'ctx> {
    pub src: NodeRef,
    pub dst: NodeRef,
    pub edge: Edge<'ctx>,
}

/// Per-instance symbolic state.
#[derive(Clone, Debug)]
pub struct Node<'ctx> {
    pub arch: Bool<'ctx>,
    pub trans: Bool<'ctx>,
    pub read: Bool<'ctx>,
    pub write: Bool<'ctx>,
    pub xsread: Bool<'ctx>,
    pub xswrite: Bool<'ctx>,
    /// Microarchitectural address footprint; equals the memory address for
    /// real accesses.
    pub xstate: Option<Int<'ctx>>,
    /// Linear position among xs-accesses in a witness.
    pub xsaccess_order: Option<Int<'ctx>>,
    /// Address this instruction defines, if it produces a pointer.
    pub addr_def: Option<Int<'ctx>>,
    /// Symbolic address per consumed operand.
    pub addr_refs: BTreeMap<Value, Int<'ctx>>,
    /// Static minimum store counts on any path from entry.
    pub stores_in: u32,
    pub stores_out: u32,
    pub constraints: Constraints<'ctx>,
}

impl<'ctx> Node<'ctx> {
    fn new(ctx: &SymCtx<'ctx>) -> Self {
        Self {
            arch: ctx.fls.clone(),
            trans: ctx.fls.clone(),
            read: ctx.fls.clone(),
            write: ctx.fls.clone(),
            xsread: ctx.fls.clone(),
            xswrite: ctx.fls.clone(),
            xstate: None,
            xsaccess_order: None,
            addr_def: None,
            addr_refs: BTreeMap::new(),
            stores_in: 0,
            stores_out: 0,
            constraints: Constraints::new(),
        }
    }

    /// This instance executes, architecturally or transiently.
    pub fn exec(&self) -> Bool<'ctx> {
        Bool::or(self.arch.get_ctx(), &[&self.arch, &self.trans])
    }

    pub fn exec_mode(&self, mode: ExecMode) -> Bool<'ctx> {
        match mode {
            ExecMode::Arch => self.arch.clone(),
            ExecMode::Trans => self.trans.clone(),
            ExecMode::Exec => self.exec(),
        }
    }

    /// This instance performs a memory access.
    pub fn access(&self) -> Bool<'ctx> {
        Bool::or(self.read.get_ctx(), &[&self.read, &self.write])
    }

    pub fn xsaccess(&self) -> Bool<'ctx> {
        Bool::or(self.xsread.get_ctx(), &[&self.xsread, &self.xswrite])
    }
}

pub struct Aeg<'ctx, 'a> {
    pub ctx: SymCtx<'ctx>,
    pub po: &'a CfgExpanded,
    pub config: &'a Config,
    pub nodes: Vec<Node<'ctx>>,
    pub(crate) edges: Vec<EdgeRec<'ctx>>,
    fwd: Vec<Vec<usize>>,
    rev: Vec<Vec<usize>>,
    pub constraints: Constraints<'ctx>,
    pub entry: NodeRef,
    pub exits: BTreeSet<NodeRef>,
    /// Transitive use-def closure per node.
    pub dependencies: Vec<BTreeSet<NodeRef>>,
    /// Dominator relation: node -> set of nodes it dominates.
    pub dominators: BTreeMap<NodeRef, BTreeSet<NodeRef>>,
    pub postdominators: BTreeMap<NodeRef, BTreeSet<NodeRef>>,
    pub control_equivalents: BTreeMap<NodeRef, BTreeSet<NodeRef>>,
    /// Cached addresses for root values (arguments, globals, constants).
    pub(crate) root_addrs: BTreeMap<Value, Int<'ctx>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl<'ctx, 'a> Aeg<'ctx, 'a> {
    pub(crate) fn empty(
        z3: &'ctx z3::Context,
        po: &'a CfgExpanded,
        config: &'a Config,
    ) -> Self {
        let ctx = SymCtx::new(z3);
        let size = po.size();
        let nodes = (0..size).map(|_| Node::new(&ctx)).collect();
        Self {
            ctx,
            po,
            config,
            nodes,
            edges: Vec::new(),
            fwd: vec![Vec::new(); size],
            rev: vec![Vec::new(); size],
            constraints: Constraints::new(),
            entry: po.entry,
            exits: po.exits.clone(),
            dependencies: vec![BTreeSet::new(); size],
            dominators: BTreeMap::new(),
            postdominators: BTreeMap::new(),
            control_equivalents: BTreeMap::new(),
            root_addrs: BTreeMap::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_range(&self) -> impl Iterator<Item = NodeRef> {
        (0..self.nodes.len() as u32).map(NodeRef)
    }

    pub fn lookup(&self, r: NodeRef) -> &Node<'ctx> {
        &self.nodes[r.index()]
    }

    pub fn lookup_mut(&mut self, r: NodeRef) -> &mut Node<'ctx> {
        &mut self.nodes[r.index()]
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub(crate) fn add_unidir_edge(&mut self, src: NodeRef, dst: NodeRef, edge: Edge<'ctx>) {
        // Statically-false edges would only bloat the solver.
        if edge.exists.as_bool() == Some(false) {
            return;
        }
        let idx = self.edges.len();
        self.fwd[src.index()].push(idx);
        self.rev[dst.index()].push(idx);
        self.edges.push(EdgeRec { src, dst, edge });
    }

    /// Insert an edge whose existence is a fresh variable implied to
    /// satisfy `cond`; returns the existence variable.
    pub(crate) fn add_optional_edge(
        &mut self,
        src: NodeRef,
        dst: NodeRef,
        kind: EdgeKind,
        cond: Bool<'ctx>,
        name: &str,
    ) -> Bool<'ctx> {
        let exists = self.ctx.make_bool(name);
        let mut constraints = Constraints::new();
        constraints.add(exists.implies(&cond), format!("{name}-{src}-{dst}"));
        self.add_unidir_edge(
            src,
            dst,
            Edge {
                kind,
                exists: exists.clone(),
                constraints,
                via: None,
            },
        );
        exists
    }

    /// Insert an edge whose existence variable is equivalent to `cond`, so
    /// every model decides it both ways.
    pub(crate) fn add_iff_edge(
        &mut self,
        src: NodeRef,
        dst: NodeRef,
        kind: EdgeKind,
        cond: Bool<'ctx>,
        name: &str,
    ) -> Bool<'ctx> {
        let exists = self.ctx.make_bool(name);
        let mut constraints = Constraints::new();
        constraints.add(exists.iff(&cond), format!("{name}-{src}-{dst}"));
        self.add_unidir_edge(
            src,
            dst,
            Edge {
                kind,
                exists: exists.clone(),
                constraints,
                via: None,
            },
        );
        exists
    }

    pub(crate) fn get_edges(
        &self,
        dir: Direction,
        r: NodeRef,
        kind: EdgeKind,
    ) -> Vec<&EdgeRec<'ctx>> {
        let list = match dir {
            Direction::Out => &self.fwd[r.index()],
            Direction::In => &self.rev[r.index()],
        };
        list.iter()
            .map(|&i| &self.edges[i])
            .filter(|rec| rec.edge.kind == kind)
            .collect()
    }

    /// Neighbors over `kind` edges paired with the edge existence
    /// proposition.
    pub fn get_nodes(&self, dir: Direction, r: NodeRef, kind: EdgeKind) -> Vec<(NodeRef, Bool<'ctx>)> {
        self.get_edges(dir, r, kind)
            .into_iter()
            .map(|rec| {
                let n = match dir {
                    Direction::Out => rec.dst,
                    Direction::In => rec.src,
                };
                (n, rec.edge.exists.clone())
            })
            .collect()
    }

    pub fn get_edge_via(&self, dir: Direction, r: NodeRef, kind: EdgeKind) -> Vec<(NodeRef, Bool<'ctx>, Option<NodeRef>)> {
        self.get_edges(dir, r, kind)
            .into_iter()
            .map(|rec| {
                let n = match dir {
                    Direction::Out => rec.dst,
                    Direction::In => rec.src,
                };
                (n, rec.edge.exists.clone(), rec.edge.via)
            })
            .collect()
    }

    pub fn for_each_edge_kind(&self, kind: EdgeKind, mut f: impl FnMut(NodeRef, NodeRef, &Edge<'ctx>)) {
        for rec in &self.edges {
            if rec.edge.kind == kind {
                f(rec.src, rec.dst, &rec.edge);
            }
        }
    }

    pub fn for_each_edge(&self, mut f: impl FnMut(NodeRef, NodeRef, &Edge<'ctx>)) {
        for rec in &self.edges {
            f(rec.src, rec.dst, &rec.edge);
        }
    }

    pub fn find_edge(&self, src: NodeRef, dst: NodeRef, kind: EdgeKind) -> Option<&Edge<'ctx>> {
        self.fwd[src.index()]
            .iter()
            .map(|&i| &self.edges[i])
            .find(|rec| rec.dst == dst && rec.edge.kind == kind)
            .map(|rec| &rec.edge)
    }

    /// Symbolic memory address of an access, when the node is one.
    pub fn memory_address(&self, r: NodeRef) -> Option<Int<'ctx>> {
        let cfg_node = self.po.lookup(r);
        let operand = cfg_node.memory_operand()?;
        self.lookup(r).addr_refs.get(operand).cloned()
    }

    pub fn same_addr(&self, a: NodeRef, b: NodeRef) -> Bool<'ctx> {
        match (self.memory_address(a), self.memory_address(b)) {
            (Some(x), Some(y)) => x._eq(&y),
            _ => self.ctx.fls.clone(),
        }
    }

    /// Equality of microarchitectural footprints; entry and exit compare
    /// equal to everything (initial state, final drain).
    pub fn same_xstate(&self, a: NodeRef, b: NodeRef) -> Bool<'ctx> {
        if self.po.lookup(a).is_special() || self.po.lookup(b).is_special() {
            return self.ctx.tru.clone();
        }
        match (&self.lookup(a).xstate, &self.lookup(b).xstate) {
            (Some(x), Some(y)) => x._eq(y),
            _ => self.ctx.fls.clone(),
        }
    }

    /// Every recorded constraint: global, per-node, per-edge.
    pub fn all_constraints(&self) -> impl Iterator<Item = &(Bool<'ctx>, String)> {
        self.constraints
            .iter()
            .chain(self.nodes.iter().flat_map(|n| n.constraints.iter()))
            .chain(self.edges.iter().flat_map(|e| e.edge.constraints.iter()))
    }

    pub fn add_to_solver(&self, solver: &z3::Solver<'ctx>) {
        self.constraints.add_to(solver);
        for node in &self.nodes {
            node.constraints.add_to(solver);
        }
        for rec in &self.edges {
            rec.edge.constraints.add_to(solver);
        }
    }

    fn eval_bool(model: &Model<'ctx>, e: &Bool<'ctx>) -> bool {
        model
            .eval(e, true)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn eval_int(model: &Model<'ctx>, e: &Int<'ctx>) -> Option<i64> {
        model.eval(e, true).and_then(|v| v.as_i64())
    }

    /// The architecturally-taken exit in a model.
    pub fn exit_con(&self, model: &Model<'ctx>) -> NodeRef {
        self.exits
            .iter()
            .copied()
            .find(|&e| Self::eval_bool(model, &self.lookup(e).arch))
            .unwrap_or_else(|| *self.exits.iter().next().unwrap())
    }

    /// Render one concrete execution from a model as DOT. Nodes are green
    /// when architectural and red when transient; `flag_edges` are drawn
    /// red regardless of kind.
    pub fn output_execution(
        &self,
        model: &Model<'ctx>,
        flag_edges: &[(NodeRef, NodeRef, EdgeKind)],
    ) -> String {
        let mut out = String::from("digraph G {\noverlap = scale;\nsplines = true;\n");
        let mut shown = BTreeSet::new();
        for r in self.node_range() {
            let node = self.lookup(r);
            if !Self::eval_bool(model, &node.exec()) {
                continue;
            }
            shown.insert(r);
            let mut label = format!("{r} {}", self.po.lookup(r));
            if let Some(addr) = self.memory_address(r) {
                if let Some(v) = Self::eval_int(model, &addr) {
                    label.push_str(&format!("\n{{{v}}}"));
                }
            }
            let xsread = Self::eval_bool(model, &node.xsread);
            let xswrite = Self::eval_bool(model, &node.xswrite);
            if xsread {
                label.push_str(" R");
            }
            if xswrite {
                label.push_str(" W");
            }
            if xsread || xswrite {
                if let Some(order) = &node.xsaccess_order {
                    if let Some(v) = Self::eval_int(model, order) {
                        label.push_str(&format!(" ({v})"));
                    }
                }
            }
            let color = if Self::eval_bool(model, &node.arch) {
                "green"
            } else {
                "red"
            };
            out.push_str(&format!("n{} ", r.0));
            dot::emit_kvs(&mut out, &[("label", &label), ("color", color)]);
            out.push_str(";\n");
        }

        let edge_color = |kind: EdgeKind| match kind {
            EdgeKind::Po | EdgeKind::Tfo => "black",
            EdgeKind::Rf | EdgeKind::Rfx => "gray",
            EdgeKind::Co | EdgeKind::Cox => "blue",
            EdgeKind::Fr | EdgeKind::Frx => "purple",
            EdgeKind::Addr | EdgeKind::AddrGep => "brown",
            EdgeKind::Data => "orange",
            EdgeKind::Ctrl => "purple",
        };
        let flagged: BTreeSet<_> = flag_edges.iter().copied().collect();
        let emit = |src: NodeRef, dst: NodeRef, kind: EdgeKind, out: &mut String| {
            if !(shown.contains(&src) && shown.contains(&dst)) {
                return;
            }
            let color = if flagged.contains(&(src, dst, kind)) {
                "red"
            } else {
                edge_color(kind)
            };
            out.push_str(&format!("n{} -> n{} ", src.0, dst.0));
            dot::emit_kvs(out, &[("label", &kind.to_string()), ("color", color)]);
            out.push_str(";\n");
        };
        for rec in &self.edges {
            if Self::eval_bool(model, &rec.edge.exists) {
                emit(rec.src, rec.dst, rec.edge.kind, &mut out);
            }
        }
        for &(src, dst, kind) in &flagged {
            if self.find_edge(src, dst, kind).is_none() {
                emit(src, dst, kind, &mut out);
            }
        }
        out.push_str("}\n");
        out
    }
}
