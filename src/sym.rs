use std::cell::Cell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use z3::ast::{Ast, Bool, Int};
use z3::{Context, Params, SatResult, Solver};

/// Factory for the propositional and integer variables that populate the
/// event graph. Keeps solver-specific types out of graph-structural code:
/// graph code asks this context for fresh symbols and records them in
/// [`Constraints`], and only the detector ever touches a solver.
pub struct SymCtx<'ctx> {
    pub z3: &'ctx Context,
    pub tru: Bool<'ctx>,
    pub fls: Bool<'ctx>,
    next_id: Cell<u32>,
}

impl<'ctx> SymCtx<'ctx> {
    pub fn new(z3: &'ctx Context) -> Self {
        Self {
            z3,
            tru: Bool::from_bool(z3, true),
            fls: Bool::from_bool(z3, false),
            next_id: Cell::new(0),
        }
    }

    fn fresh(&self, name: &str) -> String {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        format!("{name}!{id}")
    }

    pub fn make_bool(&self, name: &str) -> Bool<'ctx> {
        Bool::new_const(self.z3, self.fresh(name))
    }

    pub fn make_int(&self, name: &str) -> Int<'ctx> {
        Int::new_const(self.z3, self.fresh(name))
    }

    pub fn int_val(&self, v: u64) -> Int<'ctx> {
        Int::from_u64(self.z3, v)
    }

    /// Conjunction of an iterator of bools; empty iterators give TRUE.
    pub fn all<'a, I>(&self, exprs: I) -> Bool<'ctx>
    where
        I: IntoIterator<Item = &'a Bool<'ctx>>,
        'ctx: 'a,
    {
        let refs: Vec<&Bool> = exprs.into_iter().collect();
        Bool::and(self.z3, &refs)
    }

    /// Disjunction of an iterator of bools; empty iterators give FALSE.
    pub fn any<'a, I>(&self, exprs: I) -> Bool<'ctx>
    where
        I: IntoIterator<Item = &'a Bool<'ctx>>,
        'ctx: 'a,
    {
        let refs: Vec<&Bool> = exprs.into_iter().collect();
        Bool::or(self.z3, &refs)
    }

    /// At most `k` of `exprs` hold.
    pub fn at_most(&self, exprs: &[Bool<'ctx>], k: i32) -> Bool<'ctx> {
        let weighted: Vec<(&Bool, i32)> = exprs.iter().map(|e| (e, 1)).collect();
        Bool::pb_le(self.z3, &weighted, k)
    }

    /// Exactly `k` of `exprs` hold.
    pub fn exactly(&self, exprs: &[Bool<'ctx>], k: i32) -> Bool<'ctx> {
        let weighted: Vec<(&Bool, i32)> = exprs.iter().map(|e| (e, 1)).collect();
        Bool::pb_eq(self.z3, &weighted, k)
    }
}

/// A named clause list. Nodes, edges and the graph itself each carry one;
/// the union of all of them is the axiomatic model handed to the solver.
#[derive(Debug, Clone, Default)]
pub struct Constraints<'ctx> {
    pub exprs: Vec<(Bool<'ctx>, String)>,
}

impl<'ctx> Constraints<'ctx> {
    pub fn new() -> Self {
        Self { exprs: Vec::new() }
    }

    pub fn add(&mut self, clause: Bool<'ctx>, name: impl Into<String>) {
        self.exprs.push((clause, name.into()));
    }

    pub fn add_to(&self, solver: &Solver<'ctx>) {
        for (clause, name) in &self.exprs {
            trace!(constraint = %name, "assert");
            solver.assert(clause);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Bool<'ctx>, String)> {
        self.exprs.iter()
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }
}

impl fmt::Display for Constraints<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (clause, name) in &self.exprs {
            writeln!(f, "{name}: {clause}")?;
        }
        Ok(())
    }
}

/// Outcome counters for every solver call made during detection. Reported
/// when the detector shuts down.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckStats {
    pub sat: u32,
    pub unsat: u32,
    pub unknown: u32,
}

impl CheckStats {
    pub fn total(&self) -> u32 {
        self.sat + self.unsat + self.unknown
    }
}

impl fmt::Display for CheckStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frac = |n: u32| {
            if self.total() == 0 {
                0
            } else {
                n * 100 / self.total()
            }
        };
        write!(
            f,
            "sat: {}%, unsat: {}%, unknown: {}%",
            frac(self.sat),
            frac(self.unsat),
            frac(self.unknown)
        )
    }
}

/// A `z3::Solver` with per-call timeouts and outcome accounting. `unknown`
/// is never an error here: callers treat it as a failed branch and
/// backtrack, which is sound for absence-of-witness reporting.
pub struct TimedSolver<'ctx> {
    solver: Solver<'ctx>,
    timeout: Option<Duration>,
    pub stats: CheckStats,
}

impl<'ctx> TimedSolver<'ctx> {
    pub fn new(ctx: &'ctx Context, timeout: Option<Duration>) -> Self {
        let solver = Solver::new(ctx);
        if let Some(t) = timeout {
            let mut params = Params::new(ctx);
            params.set_u32("timeout", t.as_millis() as u32);
            solver.set_params(&params);
        }
        Self {
            solver,
            timeout,
            stats: CheckStats::default(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Check and record the outcome.
    pub fn timed_check(&mut self) -> SatResult {
        let start = Instant::now();
        let res = self.solver.check();
        self.record(res, start.elapsed());
        res
    }

    pub fn timed_check_assumptions(&mut self, assumptions: &[Bool<'ctx>]) -> SatResult {
        let start = Instant::now();
        let res = self.solver.check_assumptions(assumptions);
        self.record(res, start.elapsed());
        res
    }

    fn record(&mut self, res: SatResult, elapsed: Duration) {
        debug!(?res, ?elapsed, "solver check");
        match res {
            SatResult::Sat => self.stats.sat += 1,
            SatResult::Unsat => self.stats.unsat += 1,
            SatResult::Unknown => self.stats.unknown += 1,
        }
    }
}

impl<'ctx> Deref for TimedSolver<'ctx> {
    type Target = Solver<'ctx>;

    fn deref(&self) -> &Self::Target {
        &self.solver
    }
}

impl DerefMut for TimedSolver<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.solver
    }
}

/// Substitute every variable in `nulled` with FALSE inside `expr`. Used to
/// nullify out-of-window nodes when building a windowed solver.
pub fn nullify<'ctx>(expr: &Bool<'ctx>, nulled: &[Bool<'ctx>], fls: &Bool<'ctx>) -> Bool<'ctx> {
    let pairs: Vec<(&Bool, &Bool)> = nulled.iter().map(|v| (v, fls)).collect();
    expr.substitute(&pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::Config;

    #[test]
    fn fresh_symbols_are_distinct() {
        let z3 = Context::new(&Config::new());
        let ctx = SymCtx::new(&z3);
        let a = ctx.make_bool("arch");
        let b = ctx.make_bool("arch");
        let solver = Solver::new(&z3);
        solver.assert(&a);
        solver.assert(&b.not());
        assert_eq!(solver.check(), SatResult::Sat);
    }

    #[test]
    fn cardinality_helpers() {
        let z3 = Context::new(&Config::new());
        let ctx = SymCtx::new(&z3);
        let vars: Vec<Bool> = (0..3).map(|_| ctx.make_bool("v")).collect();
        let solver = Solver::new(&z3);
        solver.assert(&ctx.exactly(&vars, 1));
        solver.assert(&ctx.at_most(&vars[..2], 0));
        assert_eq!(solver.check(), SatResult::Sat);
        let model = solver.get_model().unwrap();
        let on = vars
            .iter()
            .filter(|v| model.eval(*v, true).unwrap().as_bool().unwrap())
            .count();
        assert_eq!(on, 1);
        assert!(model.eval(&vars[2], true).unwrap().as_bool().unwrap());
    }

    #[test]
    fn nullify_substitutes_to_false() {
        let z3 = Context::new(&Config::new());
        let ctx = SymCtx::new(&z3);
        let a = ctx.make_bool("a");
        let b = ctx.make_bool("b");
        let expr = ctx.any([&a, &b]);
        let nulled = nullify(&expr, &[a.clone()], &ctx.fls);
        let solver = Solver::new(&z3);
        solver.assert(&nulled);
        solver.assert(&b.not());
        assert_eq!(solver.check(), SatResult::Unsat);
    }

    #[test]
    fn timed_solver_counts_outcomes() {
        let z3 = Context::new(&Config::new());
        let ctx = SymCtx::new(&z3);
        let mut solver = TimedSolver::new(&z3, None);
        let a = ctx.make_bool("a");
        solver.assert(&a);
        assert_eq!(solver.timed_check(), SatResult::Sat);
        solver.assert(&a.not());
        assert_eq!(solver.timed_check(), SatResult::Unsat);
        assert_eq!(solver.stats.sat, 1);
        assert_eq!(solver.stats.unsat, 1);
    }
}
