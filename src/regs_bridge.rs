//! Positional copies between the inline-hook trampoline context and the DBI
//! engine's register state blocks.
//!
//! `bridge_to_engine` is a pure copy and cannot fail. `bridge_from_engine` is
//! the inverse on the 64-bit instruction set; on the 32-bit set the hook
//! context has no floating/vector bank, so the reverse direction is
//! best-effort and carries general-purpose registers only. Do not assume
//! floating state round-trips there. The reverse direction has also shown
//! instability under some trampoline layouts; the tests pin what is actually
//! guaranteed instead of papering over it.

use crate::cpu::{FprState, GprState, HookRegisterContext};

#[cfg(not(target_arch = "arm"))]
pub fn bridge_to_engine(ctx: &HookRegisterContext, gpr: &mut GprState, fpr: &mut FprState) {
    gpr.x.copy_from_slice(&ctx.general);
    gpr.fp = ctx.fp;
    gpr.lr = ctx.lr;
    gpr.sp = ctx.sp;
    gpr.pc = ctx.pc;
    gpr.nzcv = ctx.nzcv;
    fpr.v = ctx.vectors;
}

#[cfg(not(target_arch = "arm"))]
pub fn bridge_from_engine(gpr: &GprState, fpr: &FprState, ctx: &mut HookRegisterContext) {
    ctx.general.copy_from_slice(&gpr.x);
    ctx.fp = gpr.fp;
    ctx.lr = gpr.lr;
    ctx.sp = gpr.sp;
    ctx.pc = gpr.pc;
    ctx.nzcv = gpr.nzcv;
    ctx.vectors = fpr.v;
}

#[cfg(target_arch = "arm")]
pub fn bridge_to_engine(ctx: &HookRegisterContext, gpr: &mut GprState, _fpr: &mut FprState) {
    gpr.r.copy_from_slice(&ctx.general);
    gpr.sp = ctx.sp;
    gpr.lr = ctx.lr;
    gpr.pc = ctx.pc;
    gpr.cpsr = ctx.cpsr;
    // the trampoline does not spill the VFP bank; engine keeps its own
}

/// General-purpose registers only; the hook context cannot receive the VFP
/// bank back.
#[cfg(target_arch = "arm")]
pub fn bridge_from_engine(gpr: &GprState, _fpr: &FprState, ctx: &mut HookRegisterContext) {
    ctx.general.copy_from_slice(&gpr.r);
    ctx.sp = gpr.sp;
    ctx.lr = gpr.lr;
    ctx.pc = gpr.pc;
    ctx.cpsr = gpr.cpsr;
}
