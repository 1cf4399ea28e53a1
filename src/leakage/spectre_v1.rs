//! Spectre-v1 completion.
//!
//! The classic variant chains two address dependencies: an architectural
//! load feeds the address of a transient load, whose result feeds the
//! transmitter's address. The branch-predicate variant instead follows a
//! control dependency from the load computing the branch condition into a
//! transiently-executed access; the mediating branch is part of the
//! witness.

use crate::leakage::{Detector, Frame};

impl<'ctx, 'a> Detector<'ctx, 'a> {
    /// All dependency steps committed and the scope is satisfiable: the
    /// chain itself is the witness.
    pub(crate) fn complete_v1(&mut self, _frame: &Frame<'ctx>) {
        self.emit_leak();
    }
}
