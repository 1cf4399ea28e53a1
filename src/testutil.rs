//! Shared builders for the scenario tests: small victim functions in the
//! shape of the classic Spectre gadgets.

use crate::config::{Config, LeakageClass, SpectreV1Mode};
use crate::ir::{FunctionBuilder, Module, Ty, Value};

pub fn v1_config() -> Config {
    Config {
        leakage_class: Some(LeakageClass::SpectreV1),
        spec_depth: 8,
        ..Config::default()
    }
    .validated()
    .unwrap()
}

pub fn v1_ctrl_config() -> Config {
    Config {
        leakage_class: Some(LeakageClass::SpectreV1),
        spectre_v1: SpectreV1Mode::BranchPredicate,
        spec_depth: 8,
        ..Config::default()
    }
    .validated()
    .unwrap()
}

pub fn v4_config(stb_size: u32) -> Config {
    let mut config = Config {
        leakage_class: Some(LeakageClass::SpectreV4),
        spec_depth: 8,
        ..Config::default()
    };
    config.spectre_v4.stb_size = stb_size;
    config.validated().unwrap()
}

/// Bounds-checked double indexation:
/// `idx = load idx; if idx < N { t = load A[idx]; load B[t*64] }`.
pub fn s1_module(with_fence: bool) -> Module {
    let mut b = FunctionBuilder::new("victim", vec![]);
    let guarded = b.block();
    let done = b.block();
    let idx = b.load(Ty::i64(), Value::Global("idx".into()));
    let cond = b.cmp(idx.clone(), Value::Const(16));
    b.br(cond, guarded, done);
    b.switch_to(guarded);
    if with_fence {
        b.fence();
    }
    let pa = b.gep(Ty::ptr(Ty::i64()), Value::Global("A".into()), vec![idx]);
    let secret = b.load(Ty::i64(), pa);
    let scaled = b.other(Ty::i64(), vec![secret]);
    let pb = b.gep(Ty::ptr(Ty::i64()), Value::Global("B".into()), vec![scaled]);
    b.load(Ty::i64(), pb);
    b.jmp(done);
    b.switch_to(done);
    b.ret(None);

    let mut m = Module::default();
    m.insert(b.finish());
    m
}

/// The branch condition itself is the secret:
/// `s = load secret; if s != 0 { load X }`.
pub fn s2_module() -> Module {
    let mut b = FunctionBuilder::new("victim", vec![]);
    let taken = b.block();
    let done = b.block();
    let secret = b.load(Ty::i64(), Value::Global("secret".into()));
    let cond = b.cmp(secret, Value::Const(0));
    b.br(cond, taken, done);
    b.switch_to(taken);
    b.load(Ty::i64(), Value::Global("X".into()));
    b.jmp(done);
    b.switch_to(done);
    b.ret(None);

    let mut m = Module::default();
    m.insert(b.finish());
    m
}

/// Store-to-load forwarding bypass:
/// `store X, 1; store X, 2; t = load X; load A[t*64]`, with the three
/// accesses to X going through distinct must-alias pointers.
pub fn s3_module() -> Module {
    let mut b = FunctionBuilder::new("victim", vec![]);
    let x = Value::Global("X".into());
    let p1 = b.gep(Ty::ptr(Ty::i64()), x.clone(), vec![Value::Const(0)]);
    let p2 = b.gep(Ty::ptr(Ty::i64()), x.clone(), vec![Value::Const(0)]);
    let p3 = b.gep(Ty::ptr(Ty::i64()), x, vec![Value::Const(0)]);
    b.store(p1, Value::Const(1));
    b.store(p2, Value::Const(2));
    let stale = b.load(Ty::i64(), p3);
    let scaled = b.other(Ty::i64(), vec![stale]);
    let pa = b.gep(Ty::ptr(Ty::i64()), Value::Global("A".into()), vec![scaled]);
    b.load(Ty::i64(), pa);
    b.ret(None);

    let mut m = Module::default();
    m.insert(b.finish());
    m
}

/// S1 with the guarded pointer taken through a second, must-aliasing gep.
pub fn s5_module() -> Module {
    let mut b = FunctionBuilder::new("victim", vec![]);
    let guarded = b.block();
    let done = b.block();
    let idx = b.load(Ty::i64(), Value::Global("idx".into()));
    let cond = b.cmp(idx.clone(), Value::Const(16));
    b.br(cond, guarded, done);
    b.switch_to(guarded);
    let _pa = b.gep(Ty::ptr(Ty::i64()), Value::Global("A".into()), vec![idx.clone()]);
    let qa = b.gep(Ty::ptr(Ty::i64()), Value::Global("A".into()), vec![idx]);
    let secret = b.load(Ty::i64(), qa);
    let scaled = b.other(Ty::i64(), vec![secret]);
    let pb = b.gep(Ty::ptr(Ty::i64()), Value::Global("B".into()), vec![scaled]);
    b.load(Ty::i64(), pb);
    b.jmp(done);
    b.switch_to(done);
    b.ret(None);

    let mut m = Module::default();
    m.insert(b.finish());
    m
}
