//! Shared machinery for the execution-graph skeletons: the unrolled,
//! call-inlined and speculatively-expanded control-flow graphs all share
//! one node model and one relation container.

pub mod calls;
pub mod expanded;
pub mod unrolled;

use crate::binrel::BinRel;
use crate::dot;
use crate::ir::{CallPath, InstId, Op, Ty, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Dense index of a node in a skeleton graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef(pub u32);

impl NodeRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Three-valued execution capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opt {
    Must,
    May,
    No,
}

/// Per-node execution options, one for architectural and one for transient
/// execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecOpt {
    pub arch: Opt,
    pub trans: Opt,
}

impl ExecOpt {
    pub const fn new(arch: Opt, trans: Opt) -> Self {
        Self { arch, trans }
    }
}

/// Identity of a source instruction instance: the call path it was inlined
/// through plus the instruction id in its defining function.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CfgId {
    pub path: CallPath,
    pub inst: InstId,
}

impl fmt::Display for CfgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%{}", self.path, self.inst)
    }
}

/// Instruction payload of a non-entry, non-exit node.
#[derive(Clone, Debug)]
pub struct InstNode {
    pub id: CfgId,
    pub op: Op,
    pub ty: Ty,
}

#[derive(Clone, Debug)]
pub enum NodeData {
    Entry,
    Exit,
    Inst(InstNode),
}

/// Coarse instruction classification driving the event-graph capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstClass {
    Entry,
    Exit,
    Load,
    Store,
    Fence,
    Branch,
    Call,
    Other,
}

impl fmt::Display for InstClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstClass::Entry => "entry",
            InstClass::Exit => "exit",
            InstClass::Load => "load",
            InstClass::Store => "store",
            InstClass::Fence => "fence",
            InstClass::Branch => "branch",
            InstClass::Call => "call",
            InstClass::Other => "other",
        };
        f.write_str(s)
    }
}

/// One speculative instance of one source instruction.
#[derive(Clone, Debug)]
pub struct CfgNode {
    pub v: NodeData,
    /// Use-def links, resolved against this skeleton: operand value to the
    /// set of nodes that may define it.
    pub refs: BTreeMap<Value, BTreeSet<NodeRef>>,
    pub exec: ExecOpt,
}

impl CfgNode {
    pub fn entry() -> Self {
        Self {
            v: NodeData::Entry,
            refs: BTreeMap::new(),
            exec: ExecOpt::new(Opt::Must, Opt::No),
        }
    }

    pub fn exit() -> Self {
        Self {
            v: NodeData::Exit,
            refs: BTreeMap::new(),
            exec: ExecOpt::new(Opt::May, Opt::No),
        }
    }

    pub fn class(&self) -> InstClass {
        match &self.v {
            NodeData::Entry => InstClass::Entry,
            NodeData::Exit => InstClass::Exit,
            NodeData::Inst(inst) => match &inst.op {
                Op::Load { .. } => InstClass::Load,
                Op::Store { .. } => InstClass::Store,
                Op::Fence => InstClass::Fence,
                Op::Branch { .. } => InstClass::Branch,
                Op::Call { .. } => InstClass::Call,
                Op::Alloca | Op::Gep { .. } | Op::Ret { .. } | Op::Other { .. } => InstClass::Other,
            },
        }
    }

    pub fn inst(&self) -> Option<&InstNode> {
        match &self.v {
            NodeData::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&CfgId> {
        self.inst().map(|i| &i.id)
    }

    pub fn is_special(&self) -> bool {
        matches!(self.v, NodeData::Entry | NodeData::Exit)
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.v, NodeData::Entry)
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.v, NodeData::Exit)
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.class(), InstClass::Load | InstClass::Store)
    }

    pub fn is_fence(&self) -> bool {
        self.class() == InstClass::Fence
    }

    pub fn is_branch(&self) -> bool {
        self.class() == InstClass::Branch
    }

    /// Architectural read capability. The entry node is the pseudo-writer
    /// of initial memory; the exit node only observes microarchitectural
    /// state.
    pub fn may_read(&self) -> Opt {
        match self.class() {
            InstClass::Load => Opt::Must,
            _ => Opt::No,
        }
    }

    pub fn may_write(&self) -> Opt {
        match self.class() {
            InstClass::Entry => Opt::Must,
            InstClass::Store => Opt::Must,
            _ => Opt::No,
        }
    }

    /// Transient-visible read: loads always hit the extra-architectural
    /// state; the exit pseudo-read drains it.
    pub fn may_xsread(&self) -> Opt {
        match self.class() {
            InstClass::Load => Opt::Must,
            InstClass::Exit => Opt::Must,
            InstClass::Store => Opt::May,
            _ => Opt::No,
        }
    }

    /// Transient-visible write: stores always touch the extra-architectural
    /// state, loads may (line fill), entry seeds it.
    pub fn may_xswrite(&self) -> Opt {
        match self.class() {
            InstClass::Store => Opt::Must,
            InstClass::Entry => Opt::Must,
            InstClass::Load => Opt::May,
            _ => Opt::No,
        }
    }

    pub fn may_access(&self) -> bool {
        self.may_read() != Opt::No || self.may_write() != Opt::No
    }

    /// Whether this instruction produces a pointer value.
    pub fn defines_addr(&self) -> bool {
        self.inst().map(|i| i.ty.is_ptr()).unwrap_or(false)
    }

    /// Operand values that must be resolved to symbolic addresses.
    pub fn addr_operands(&self) -> Vec<&Value> {
        match self.inst().map(|i| &i.op) {
            Some(Op::Load { addr }) => vec![addr],
            Some(Op::Store { addr, .. }) => vec![addr],
            Some(Op::Gep { base, .. }) => vec![base],
            _ => vec![],
        }
    }

    pub fn memory_operand(&self) -> Option<&Value> {
        self.inst().and_then(|i| i.op.memory_operand())
    }

    pub fn value_operand(&self) -> Option<&Value> {
        self.inst().and_then(|i| i.op.value_operand())
    }

    pub fn operands(&self) -> Vec<&Value> {
        self.inst().map(|i| i.op.operands()).unwrap_or_default()
    }
}

impl fmt::Display for CfgNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.v {
            NodeData::Entry => write!(f, "<entry>"),
            NodeData::Exit => write!(f, "<exit>"),
            NodeData::Inst(inst) => {
                let id = &inst.id;
                match &inst.op {
                    Op::Alloca => write!(f, "{id} = alloca {}", inst.ty),
                    Op::Load { addr } => write!(f, "{id} = load [{addr}]"),
                    Op::Store { addr, value } => write!(f, "{id}: store {value}, [{addr}]"),
                    Op::Fence => write!(f, "{id}: fence"),
                    Op::Gep { base, indices } => {
                        write!(f, "{id} = gep {base}")?;
                        for idx in indices {
                            write!(f, ", {idx}")?;
                        }
                        Ok(())
                    }
                    Op::Branch { cond: Some(c), .. } => write!(f, "{id}: br {c}"),
                    Op::Branch { cond: None, .. } => write!(f, "{id}: br"),
                    Op::Call { callee, .. } => write!(f, "{id} = call @{callee}"),
                    Op::Ret { value: Some(v) } => write!(f, "{id}: ret {v}"),
                    Op::Ret { value: None } => write!(f, "{id}: ret"),
                    Op::Other { inputs } => {
                        write!(f, "{id} = op")?;
                        for v in inputs {
                            write!(f, " {v}")?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Base skeleton graph: an arena of nodes plus the program-order relation.
/// Exactly one entry; at least one exit; acyclic by construction of the
/// producing passes.
#[derive(Clone, Debug)]
pub struct Cfg {
    pub name: String,
    pub nodes: Vec<CfgNode>,
    pub po: BinRel<NodeRef>,
    pub entry: NodeRef,
    pub exits: BTreeSet<NodeRef>,
    /// For every inlined call scope, the argument values passed at its
    /// call site (values in the caller's scope).
    pub call_args: BTreeMap<CallPath, Vec<Value>>,
    /// For every inlined call scope, the return-value operands of the
    /// callee (values in the callee's scope).
    pub call_rets: BTreeMap<CallPath, Vec<Value>>,
}

/// What an operand value resolves to across inlined scopes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolved {
    /// Defined by instances of this instruction identity.
    Def(CfgId),
    /// A root-scope argument, global or constant.
    Root(Value),
}

impl Cfg {
    pub fn new(name: impl Into<String>) -> Self {
        let mut po = BinRel::new();
        po.add_node(NodeRef(0));
        Self {
            name: name.into(),
            nodes: vec![CfgNode::entry()],
            po,
            entry: NodeRef(0),
            exits: BTreeSet::new(),
            call_args: BTreeMap::new(),
            call_rets: BTreeMap::new(),
        }
    }

    pub fn add_node(&mut self, node: CfgNode) -> NodeRef {
        let r = NodeRef(self.nodes.len() as u32);
        if node.is_exit() {
            self.exits.insert(r);
        }
        self.nodes.push(node);
        self.po.add_node(r);
        r
    }

    pub fn add_edge(&mut self, src: NodeRef, dst: NodeRef) {
        self.po.insert(src, dst);
    }

    pub fn lookup(&self, r: NodeRef) -> &CfgNode {
        &self.nodes[r.index()]
    }

    pub fn lookup_mut(&mut self, r: NodeRef) -> &mut CfgNode {
        &mut self.nodes[r.index()]
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_range(&self) -> impl Iterator<Item = NodeRef> {
        (0..self.nodes.len() as u32).map(NodeRef)
    }

    pub fn postorder(&self) -> Vec<NodeRef> {
        self.po.postorder(self.entry)
    }

    pub fn reverse_postorder(&self) -> Vec<NodeRef> {
        self.po.reverse_postorder(self.entry)
    }

    pub fn dump_graph(&self) -> String {
        let mut out = String::from("digraph G {\noverlap = scale;\nsplines = true;\n");
        for r in self.node_range() {
            let node = self.lookup(r);
            let label = format!(
                "{r} {node}\narch: {:?} trans: {:?}",
                node.exec.arch, node.exec.trans
            );
            out.push_str(&format!("n{} ", r.0));
            dot::emit_kvs(&mut out, &[("label", &label)]);
            out.push_str(";\n");
        }
        for src in self.po.nodes() {
            for &dst in self.po.succs(src) {
                out.push_str(&format!("n{} -> n{};\n", src.0, dst.0));
            }
        }
        out.push_str("}\n");
        out
    }

    /// Resolve an operand value seen from `path` to its defining
    /// instruction identities, following inlined-argument and return-value
    /// bindings across call scopes. Results of inlined calls resolve to the
    /// callee's return operands, so a value may have several resolutions.
    pub fn resolve_value(&self, path: &CallPath, v: &Value) -> Vec<Resolved> {
        match v {
            Value::Inst(id) => {
                let scope = path.child(*id);
                if let Some(rets) = self.call_rets.get(&scope) {
                    rets.iter()
                        .flat_map(|rv| self.resolve_value(&scope, rv))
                        .collect()
                } else {
                    vec![Resolved::Def(CfgId {
                        path: path.clone(),
                        inst: *id,
                    })]
                }
            }
            Value::Arg(i) => {
                if path.0.is_empty() {
                    vec![Resolved::Root(v.clone())]
                } else {
                    let parent = CallPath(path.0[..path.0.len() - 1].to_vec());
                    match self
                        .call_args
                        .get(path)
                        .and_then(|args| args.get(*i as usize))
                    {
                        Some(arg) => self.resolve_value(&parent, arg),
                        None => vec![Resolved::Root(v.clone())],
                    }
                }
            }
            Value::Global(_) | Value::Const(_) | Value::Null => vec![Resolved::Root(v.clone())],
        }
    }

    /// Recompute every node's use-def links by a reaching-definitions sweep
    /// over the graph: a later instance of the same instruction identity
    /// kills earlier ones, merges union.
    pub fn compute_refs(&mut self) {
        let order = self.reverse_postorder();
        let mut outs: Vec<BTreeMap<CfgId, BTreeSet<NodeRef>>> = vec![BTreeMap::new(); self.size()];
        for &n in &order {
            let mut reaching: BTreeMap<CfgId, BTreeSet<NodeRef>> = BTreeMap::new();
            for &p in self.po.preds(n) {
                for (id, defs) in &outs[p.index()] {
                    reaching.entry(id.clone()).or_default().extend(defs);
                }
            }

            let mut refs: BTreeMap<Value, BTreeSet<NodeRef>> = BTreeMap::new();
            if let Some(inst) = self.lookup(n).inst() {
                let path = inst.id.path.clone();
                let operands: Vec<Value> = inst.op.operands().into_iter().cloned().collect();
                for v in operands {
                    let mut defs = BTreeSet::new();
                    for res in self.resolve_value(&path, &v) {
                        if let Resolved::Def(key) = res {
                            if let Some(d) = reaching.get(&key) {
                                defs.extend(d);
                            }
                        }
                    }
                    if !defs.is_empty() {
                        refs.insert(v, defs);
                    }
                }
            }
            self.lookup_mut(n).refs = refs;

            let mut out = reaching;
            if let Some(id) = self.lookup(n).id().cloned() {
                out.insert(id, BTreeSet::from([n]));
            }
            outs[n.index()] = out;
        }
    }

    /// Structural sanity: entry unique, exits present, non-entry nodes have
    /// predecessors, non-exit nodes have successors, graph acyclic.
    pub fn check(&self) -> Result<(), String> {
        if !self.lookup(self.entry).is_entry() {
            return Err("node 0 is not the entry".into());
        }
        if self.exits.is_empty() {
            return Err("no exit node".into());
        }
        for r in self.node_range() {
            let node = self.lookup(r);
            if !node.is_entry() && self.po.preds(r).is_empty() {
                return Err(format!("node {r} has no predecessors"));
            }
            // Transient-only clones legitimately dead-end where their
            // speculative window closes.
            if !node.is_exit() && node.exec.arch != Opt::No && self.po.succs(r).is_empty() {
                return Err(format!("node {r} has no successors"));
            }
        }
        if self.po.postorder(self.entry).len() != self.size() {
            return Err("unreachable nodes present".into());
        }
        // Acyclicity: in a postorder of a DAG every edge goes from a later
        // to an earlier position.
        let order = self.po.postorder(self.entry);
        let mut pos = vec![0usize; self.size()];
        for (i, r) in order.iter().enumerate() {
            pos[r.index()] = i;
        }
        for src in self.po.nodes() {
            for &dst in self.po.succs(src) {
                if pos[src.index()] <= pos[dst.index()] {
                    return Err(format!("cycle through {src} -> {dst}"));
                }
            }
        }
        Ok(())
    }
}
