//! Input program representation.
//!
//! The analysis consumes one function at a time, already lowered to a small
//! SSA-flavored instruction set: memory accesses, pointer arithmetic,
//! branches, fences, direct calls and opaque computations. Modules
//! round-trip through serde, and `FunctionBuilder` constructs them
//! programmatically.

use petgraph::dot::{Config as DotConfig, Dot};
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type InstId = u32;
pub type BlockId = u32;

/// An SSA value: the result of an instruction, a function argument, a
/// global, or a constant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Inst(InstId),
    Arg(u32),
    Global(String),
    Const(i64),
    Null,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Inst(id) => write!(f, "%{id}"),
            Value::Arg(i) => write!(f, "$arg{i}"),
            Value::Global(name) => write!(f, "@{name}"),
            Value::Const(c) => write!(f, "{c}"),
            Value::Null => write!(f, "null"),
        }
    }
}

/// Element types, enough structure for the layout and aliasing filters:
/// sized integers, typed pointers, and named structs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ty {
    Int(u32),
    Ptr(Box<Ty>),
    Struct(String, Vec<Ty>),
}

impl Ty {
    pub fn i64() -> Ty {
        Ty::Int(64)
    }

    pub fn ptr(pointee: Ty) -> Ty {
        Ty::Ptr(Box::new(pointee))
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Ty::Ptr(_))
    }

    pub fn pointee(&self) -> Option<&Ty> {
        match self {
            Ty::Ptr(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Ty::Struct(..))
    }

    /// Size of the type in bits; the layout oracle for store-forwarding
    /// compatibility checks.
    pub fn size_bits(&self) -> u32 {
        match self {
            Ty::Int(bits) => *bits,
            Ty::Ptr(_) => 64,
            Ty::Struct(_, fields) => fields.iter().map(Ty::size_bits).sum(),
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Int(bits) => write!(f, "i{bits}"),
            Ty::Ptr(inner) => write!(f, "{inner}*"),
            Ty::Struct(name, _) => write!(f, "%{name}"),
        }
    }
}

/// Instruction payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Op {
    /// Stack allocation; the instruction's type is the pointer type.
    Alloca,
    Load {
        addr: Value,
    },
    Store {
        addr: Value,
        value: Value,
    },
    Fence,
    /// Pointer arithmetic over a base and index operands.
    Gep {
        base: Value,
        indices: Vec<Value>,
    },
    /// Terminator. Conditional branches carry two targets, unconditional
    /// ones a single target.
    Branch {
        cond: Option<Value>,
        targets: Vec<BlockId>,
    },
    Call {
        callee: String,
        args: Vec<Value>,
    },
    /// Terminator: function return.
    Ret {
        value: Option<Value>,
    },
    /// Opaque computation (arithmetic, comparisons, casts).
    Other {
        inputs: Vec<Value>,
    },
}

impl Op {
    /// All input values, in operand order.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Op::Alloca | Op::Fence => vec![],
            Op::Load { addr } => vec![addr],
            Op::Store { addr, value } => vec![addr, value],
            Op::Gep { base, indices } => {
                let mut ops = vec![base];
                ops.extend(indices.iter());
                ops
            }
            Op::Branch { cond, .. } => cond.iter().collect(),
            Op::Call { args, .. } => args.iter().collect(),
            Op::Ret { value } => value.iter().collect(),
            Op::Other { inputs } => inputs.iter().collect(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Branch { .. } | Op::Ret { .. })
    }

    pub fn memory_operand(&self) -> Option<&Value> {
        match self {
            Op::Load { addr } => Some(addr),
            Op::Store { addr, .. } => Some(addr),
            _ => None,
        }
    }

    pub fn value_operand(&self) -> Option<&Value> {
        match self {
            Op::Store { value, .. } => Some(value),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Inst {
    pub op: Op,
    /// Result type. Instructions without a result use `Int(0)` by
    /// convention (builder takes care of this).
    pub ty: Ty,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Block {
    pub insts: Vec<InstId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Ty>,
    pub insts: Vec<Inst>,
    /// Block 0 is the entry block.
    pub blocks: Vec<Block>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Module {
    pub functions: BTreeMap<String, Function>,
}

impl Module {
    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn insert(&mut self, f: Function) {
        self.functions.insert(f.name.clone(), f);
    }
}

impl Function {
    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id as usize]
    }

    pub fn entry_inst(&self) -> InstId {
        self.blocks[0].insts[0]
    }

    fn position(&self, id: InstId) -> (BlockId, usize) {
        for (b, block) in self.blocks.iter().enumerate() {
            if let Some(i) = block.insts.iter().position(|&x| x == id) {
                return (b as BlockId, i);
            }
        }
        panic!("instruction %{id} not placed in any block");
    }

    /// Control-flow successors of an instruction.
    pub fn successors(&self, id: InstId) -> Vec<InstId> {
        match &self.inst(id).op {
            Op::Ret { .. } => vec![],
            Op::Branch { targets, .. } => targets
                .iter()
                .map(|&b| self.blocks[b as usize].insts[0])
                .collect(),
            _ => {
                let (b, i) = self.position(id);
                let block = &self.blocks[b as usize];
                vec![block.insts[i + 1]]
            }
        }
    }

    /// Loop back-edges `(latch, header)` discovered by DFS over the
    /// instruction graph.
    pub fn back_edges(&self) -> Vec<(InstId, InstId)> {
        let mut back = Vec::new();
        let mut on_stack = vec![false; self.insts.len()];
        let mut seen = vec![false; self.insts.len()];
        let mut stack: Vec<(InstId, bool)> = vec![(self.entry_inst(), false)];
        while let Some((n, leaving)) = stack.pop() {
            if leaving {
                on_stack[n as usize] = false;
                continue;
            }
            if seen[n as usize] {
                continue;
            }
            seen[n as usize] = true;
            on_stack[n as usize] = true;
            stack.push((n, true));
            for succ in self.successors(n) {
                if on_stack[succ as usize] {
                    back.push((n, succ));
                } else if !seen[succ as usize] {
                    stack.push((succ, false));
                }
            }
        }
        back
    }

    /// Basic sanity checks: every block terminated, targets in range,
    /// operands resolvable.
    pub fn validate(&self) -> Result<(), String> {
        for (b, block) in self.blocks.iter().enumerate() {
            let last = block
                .insts
                .last()
                .ok_or_else(|| format!("{}: block {b} is empty", self.name))?;
            if !self.inst(*last).op.is_terminator() {
                return Err(format!("{}: block {b} is not terminated", self.name));
            }
            for (i, &id) in block.insts.iter().enumerate() {
                let inst = self.inst(id);
                if inst.op.is_terminator() && i + 1 != block.insts.len() {
                    return Err(format!("{}: terminator %{id} mid-block", self.name));
                }
                if let Op::Branch { targets, .. } = &inst.op {
                    for &t in targets {
                        if t as usize >= self.blocks.len() {
                            return Err(format!("{}: branch to missing block {t}", self.name));
                        }
                    }
                }
                for v in inst.op.operands() {
                    if let Value::Inst(def) = v {
                        if *def as usize >= self.insts.len() {
                            return Err(format!("{}: operand {v} undefined", self.name));
                        }
                    }
                    if let Value::Arg(a) = v {
                        if *a as usize >= self.params.len() {
                            return Err(format!("{}: argument {v} out of range", self.name));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Block-level control-flow graph, mainly for DOT dumps.
    pub fn block_graph(&self) -> DiGraph<String, ()> {
        let mut graph = DiGraph::new();
        let indices: Vec<_> = (0..self.blocks.len())
            .map(|b| graph.add_node(format!("bb{b}")))
            .collect();
        for (b, block) in self.blocks.iter().enumerate() {
            if let Some(&last) = block.insts.last() {
                if let Op::Branch { targets, .. } = &self.inst(last).op {
                    for &t in targets {
                        graph.add_edge(indices[b], indices[t as usize], ());
                    }
                }
            }
        }
        graph
    }

    pub fn dump_block_graph(&self) -> String {
        let graph = self.block_graph();
        format!("{:?}", Dot::with_config(&graph, &[DotConfig::EdgeNoLabel]))
    }
}

/// Incremental function construction, used by tests and front ends.
pub struct FunctionBuilder {
    name: String,
    params: Vec<Ty>,
    insts: Vec<Inst>,
    blocks: Vec<Block>,
    current: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, params: Vec<Ty>) -> Self {
        Self {
            name: name.into(),
            params,
            insts: Vec::new(),
            blocks: vec![Block::default()],
            current: 0,
        }
    }

    pub fn block(&mut self) -> BlockId {
        self.blocks.push(Block::default());
        (self.blocks.len() - 1) as BlockId
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    fn push(&mut self, op: Op, ty: Ty) -> Value {
        let id = self.insts.len() as InstId;
        self.insts.push(Inst { op, ty });
        self.blocks[self.current as usize].insts.push(id);
        Value::Inst(id)
    }

    pub fn alloca(&mut self, pointee: Ty) -> Value {
        self.push(Op::Alloca, Ty::ptr(pointee))
    }

    pub fn load(&mut self, ty: Ty, addr: Value) -> Value {
        self.push(Op::Load { addr }, ty)
    }

    pub fn store(&mut self, addr: Value, value: Value) {
        self.push(Op::Store { addr, value }, Ty::Int(0));
    }

    pub fn fence(&mut self) {
        self.push(Op::Fence, Ty::Int(0));
    }

    pub fn gep(&mut self, ty: Ty, base: Value, indices: Vec<Value>) -> Value {
        self.push(Op::Gep { base, indices }, ty)
    }

    pub fn other(&mut self, ty: Ty, inputs: Vec<Value>) -> Value {
        self.push(Op::Other { inputs }, ty)
    }

    pub fn cmp(&mut self, a: Value, b: Value) -> Value {
        self.other(Ty::Int(1), vec![a, b])
    }

    pub fn br(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) {
        self.push(
            Op::Branch {
                cond: Some(cond),
                targets: vec![then_block, else_block],
            },
            Ty::Int(0),
        );
    }

    pub fn jmp(&mut self, target: BlockId) {
        self.push(
            Op::Branch {
                cond: None,
                targets: vec![target],
            },
            Ty::Int(0),
        );
    }

    pub fn call(&mut self, ty: Ty, callee: impl Into<String>, args: Vec<Value>) -> Value {
        self.push(
            Op::Call {
                callee: callee.into(),
                args,
            },
            ty,
        )
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.push(Op::Ret { value }, Ty::Int(0));
    }

    pub fn finish(self) -> Function {
        let f = Function {
            name: self.name,
            params: self.params,
            insts: self.insts,
            blocks: self.blocks,
        };
        if let Err(msg) = f.validate() {
            panic!("invalid function: {msg}");
        }
        f
    }
}

/// Call path from the analyzed root function: the instruction ids of the
/// call sites traversed by inlining. Two scopes can be compared for alias
/// purposes only when one is a prefix of the other.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallPath(pub Vec<InstId>);

impl CallPath {
    pub fn child(&self, site: InstId) -> CallPath {
        let mut path = self.0.clone();
        path.push(site);
        CallPath(path)
    }

    pub fn prefix_compatible(&self, other: &CallPath) -> bool {
        let n = self.0.len().min(other.0.len());
        self.0[..n] == other.0[..n]
    }
}

impl fmt::Display for CallPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for site in &self.0 {
            write!(f, "{site}/")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasResult {
    No,
    May,
    Must,
}

/// One side of an alias query.
#[derive(Debug, Clone, Copy)]
pub struct AliasQuery<'a> {
    pub scope: &'a CallPath,
    pub value: &'a Value,
    pub ty: &'a Ty,
}

/// The alias-analysis collaborator. `None` means the oracle cannot judge
/// the pair (for example, scopes that are not prefix-compatible).
pub trait AliasOracle: Sync {
    fn alias(&self, a: &AliasQuery, b: &AliasQuery) -> Option<AliasResult>;
}

/// Base object a pointer value is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Base {
    Alloca(CallPath, InstId),
    Global(String),
    Arg(u32),
    Constant,
    Unknown,
}

/// Rule-based oracle: chases GEP bases and inlined arguments down to
/// allocas, globals and root arguments, then judges pairs structurally.
pub struct BaseObjectOracle<'m> {
    module: &'m Module,
    root: String,
}

impl<'m> BaseObjectOracle<'m> {
    pub fn new(module: &'m Module, root: impl Into<String>) -> Self {
        Self {
            module,
            root: root.into(),
        }
    }

    fn function_at(&self, scope: &CallPath) -> Option<&'m Function> {
        let mut f = self.module.get(&self.root)?;
        for &site in &scope.0 {
            match &f.insts.get(site as usize)?.op {
                Op::Call { callee, .. } => f = self.module.get(callee)?,
                _ => return None,
            }
        }
        Some(f)
    }

    fn base(&self, scope: &CallPath, value: &Value) -> Base {
        match value {
            Value::Const(_) | Value::Null => Base::Constant,
            Value::Global(name) => Base::Global(name.clone()),
            Value::Arg(i) => {
                // Arguments of inlined callees resolve to the call site's
                // operand in the caller.
                if let Some((&site, parent)) = scope.0.split_last() {
                    let parent = CallPath(parent.to_vec());
                    if let Some(f) = self.function_at(&parent) {
                        if let Op::Call { args, .. } = &f.inst(site).op {
                            if let Some(arg) = args.get(*i as usize) {
                                return self.base(&parent, arg);
                            }
                        }
                    }
                    Base::Unknown
                } else {
                    Base::Arg(*i)
                }
            }
            Value::Inst(id) => {
                let Some(f) = self.function_at(scope) else {
                    return Base::Unknown;
                };
                match &f.inst(*id).op {
                    Op::Alloca => Base::Alloca(scope.clone(), *id),
                    Op::Gep { base, .. } => self.base(scope, base),
                    _ => Base::Unknown,
                }
            }
        }
    }
}

impl AliasOracle for BaseObjectOracle<'_> {
    fn alias(&self, a: &AliasQuery, b: &AliasQuery) -> Option<AliasResult> {
        if !a.scope.prefix_compatible(b.scope) {
            return None;
        }
        if a.scope == b.scope && a.value == b.value {
            return Some(AliasResult::Must);
        }
        let base_a = self.base(a.scope, a.value);
        let base_b = self.base(b.scope, b.value);
        match (&base_a, &base_b) {
            (Base::Unknown, _) | (_, Base::Unknown) => Some(AliasResult::May),
            (Base::Constant, Base::Constant) => Some(AliasResult::No),
            (Base::Alloca(..), Base::Alloca(..)) if base_a != base_b => Some(AliasResult::No),
            (Base::Global(x), Base::Global(y)) if x != y => Some(AliasResult::No),
            (Base::Alloca(..), Base::Global(_)) | (Base::Global(_), Base::Alloca(..)) => {
                Some(AliasResult::No)
            }
            (Base::Alloca(..), Base::Arg(_)) | (Base::Arg(_), Base::Alloca(..)) => {
                Some(AliasResult::No)
            }
            (Base::Constant, _) | (_, Base::Constant) => Some(AliasResult::No),
            _ => {
                // Same base object: identical GEPs collapse, distinct
                // constant offsets split, anything else may overlap.
                if let (Some(fa), Some(fb)) = (self.function_at(a.scope), self.function_at(b.scope))
                {
                    if let (Value::Inst(ia), Value::Inst(ib)) = (a.value, b.value) {
                        if let (
                            Op::Gep {
                                base: ba,
                                indices: xa,
                            },
                            Op::Gep {
                                base: bb,
                                indices: xb,
                            },
                        ) = (&fa.inst(*ia).op, &fb.inst(*ib).op)
                        {
                            if ba == bb && xa == xb && a.scope == b.scope {
                                return Some(AliasResult::Must);
                            }
                            let consts = |ix: &Vec<Value>| {
                                ix.iter()
                                    .map(|v| match v {
                                        Value::Const(c) => Some(*c),
                                        _ => None,
                                    })
                                    .collect::<Option<Vec<i64>>>()
                            };
                            if let (Some(ca), Some(cb)) = (consts(xa), consts(xb)) {
                                if ca != cb {
                                    return Some(AliasResult::No);
                                }
                            }
                        }
                    }
                }
                Some(AliasResult::May)
            }
        }
    }
}

/// Test oracle answering the same result for every valid pair.
pub struct ForcedOracle(pub AliasResult);

impl AliasOracle for ForcedOracle {
    fn alias(&self, a: &AliasQuery, b: &AliasQuery) -> Option<AliasResult> {
        if !a.scope.prefix_compatible(b.scope) {
            return None;
        }
        Some(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_line() -> Function {
        let mut b = FunctionBuilder::new("f", vec![Ty::ptr(Ty::i64())]);
        let x = b.alloca(Ty::i64());
        let v = b.load(Ty::i64(), x.clone());
        b.store(Value::Arg(0), v);
        b.ret(None);
        b.finish()
    }

    #[test]
    fn successors_follow_block_order() {
        let f = straight_line();
        assert_eq!(f.successors(0), vec![1]);
        assert_eq!(f.successors(1), vec![2]);
        assert!(f.successors(3).is_empty());
    }

    #[test]
    fn back_edges_found_in_loops() {
        let mut b = FunctionBuilder::new("loopy", vec![]);
        let body = b.block();
        let done = b.block();
        b.jmp(body);
        b.switch_to(body);
        let c = b.cmp(Value::Const(0), Value::Const(1));
        b.br(c, body, done);
        b.switch_to(done);
        b.ret(None);
        let f = b.finish();
        let back = f.back_edges();
        assert_eq!(back.len(), 1);
        // The latch is the conditional branch, the header the comparison.
        assert_eq!(back[0].1, f.blocks[1].insts[0]);
    }

    #[test]
    fn module_roundtrips_through_json() {
        let mut m = Module::default();
        m.insert(straight_line());
        let text = serde_json::to_string(&m).unwrap();
        let back: Module = serde_json::from_str(&text).unwrap();
        assert_eq!(back.functions.len(), 1);
        assert_eq!(back.get("f").unwrap().insts.len(), 4);
    }

    #[test]
    fn base_oracle_separates_allocas() {
        let mut b = FunctionBuilder::new("g", vec![]);
        let x = b.alloca(Ty::i64());
        let y = b.alloca(Ty::i64());
        b.store(x.clone(), Value::Const(1));
        b.store(y.clone(), Value::Const(2));
        b.ret(None);
        let mut m = Module::default();
        m.insert(b.finish());
        let oracle = BaseObjectOracle::new(&m, "g");
        let scope = CallPath::default();
        let ty = Ty::ptr(Ty::i64());
        fn q<'a>(scope: &'a CallPath, ty: &'a Ty, v: &'a Value) -> AliasQuery<'a> {
            AliasQuery {
                scope,
                value: v,
                ty,
            }
        }
        assert_eq!(
            oracle.alias(&q(&scope, &ty, &x), &q(&scope, &ty, &y)),
            Some(AliasResult::No)
        );
        assert_eq!(
            oracle.alias(&q(&scope, &ty, &x), &q(&scope, &ty, &x)),
            Some(AliasResult::Must)
        );
    }

    #[test]
    fn base_oracle_must_aliases_identical_geps() {
        let mut b = FunctionBuilder::new("h", vec![]);
        let base = Value::Global("table".into());
        let i = b.other(Ty::i64(), vec![]);
        let p = b.gep(Ty::ptr(Ty::i64()), base.clone(), vec![i.clone()]);
        let q = b.gep(Ty::ptr(Ty::i64()), base, vec![i]);
        b.store(p.clone(), Value::Const(0));
        b.store(q.clone(), Value::Const(1));
        b.ret(None);
        let mut m = Module::default();
        m.insert(b.finish());
        let oracle = BaseObjectOracle::new(&m, "h");
        let scope = CallPath::default();
        let ty = Ty::ptr(Ty::i64());
        let qa = AliasQuery {
            scope: &scope,
            value: &p,
            ty: &ty,
        };
        let qb = AliasQuery {
            scope: &scope,
            value: &q,
            ty: &ty,
        };
        assert_eq!(oracle.alias(&qa, &qb), Some(AliasResult::Must));
    }
}
