//! Narrow contracts of the external collaborators: the DBI virtual machine
//! and the module/symbol resolver.
//!
//! The engine single-steps target code and calls back into a
//! [`TraceHandler`] around every instruction. Callback-based C engines thread
//! an opaque user pointer instead; here the handler object carries its own
//! state.

use bitflags::bitflags;

use crate::cpu::{FprState, GprState};
use crate::range::Address;
use crate::result::Result;

bitflags! {
    /// Selects which fields of [`InstAnalysis`] the engine must populate.
    pub struct AnalysisType: u32 {
        const INSTRUCTION = 1;
        const DISASSEMBLY = 1 << 1;
        const OPERANDS = 1 << 2;
    }
}

/// Static decode info for the instruction the engine is currently stepping.
///
/// Owned copy: the engine's own analysis buffer only lives for the duration
/// of one callback, so anything kept across steps (a call site awaiting its
/// return) must be copied out.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstAnalysis {
    pub address: Address,
    pub mnemonic: String,
    pub operands: String,
    pub is_branch: bool,
    /// Branch-and-link semantics: the instruction establishes a return.
    pub is_call: bool,
    pub affects_control_flow: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryAccess {
    pub address: Address,
    pub kind: AccessKind,
}

/// What a callback tells the engine to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    /// Abort the current invocation. The engine reports the call as not
    /// completed.
    Stop,
}

/// Outcome of an instrumented call. `completed == false` means the target
/// crashed, was redirected unexpectedly, or a callback stopped the engine;
/// it is distinct from a normal return value of zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineExit {
    pub completed: bool,
    pub value: u64,
}

/// Per-step view of the engine, valid only inside a callback.
pub trait EngineContext {
    fn inst_analysis(&mut self, wanted: AnalysisType) -> Option<InstAnalysis>;
    fn gpr_state(&self) -> GprState;
    fn set_gpr_state(&mut self, regs: &GprState);
    fn fpr_state(&self) -> FprState;
    fn set_fpr_state(&mut self, regs: &FprState);
    /// Memory accesses performed by the instruction that just executed.
    fn memory_accesses(&self) -> Vec<MemoryAccess>;
}

/// Callbacks the session installs around every instrumented instruction.
pub trait TraceHandler {
    fn pre_instruction(&mut self, vm: &mut dyn EngineContext) -> CallbackAction;
    fn post_instruction(&mut self, vm: &mut dyn EngineContext) -> CallbackAction;

    /// Mnemonic-specific pre-execution callback. The engine fires this for
    /// registered mnemonics after the positional `pre_instruction` callback
    /// and before the instruction executes.
    fn mnemonic_pre(&mut self, _vm: &mut dyn EngineContext, _mnemonic: &str) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Execution transferred out of (or back into) the instrumented range.
    fn call_transfer(&mut self, _vm: &mut dyn EngineContext, _target: Address) -> CallbackAction {
        CallbackAction::Continue
    }

    /// One memory access, reported as it happens.
    fn memory_access(
        &mut self,
        _vm: &mut dyn EngineContext,
        _access: &MemoryAccess,
    ) -> CallbackAction {
        CallbackAction::Continue
    }
}

/// The DBI virtual machine.
pub trait DbiEngine {
    fn instrument_module_containing(&mut self, address: Address) -> Result<()>;
    fn instrument_range(&mut self, start: Address, end: Address) -> Result<()>;

    /// Invoke `target` with register `args` under instrumentation, driving
    /// `handler` around every executed instruction.
    fn call(
        &mut self,
        target: Address,
        args: &[u64],
        handler: &mut dyn TraceHandler,
    ) -> Result<EngineExit>;

    fn gpr_state(&self) -> GprState;
    fn set_gpr_state(&mut self, regs: &GprState);
    fn fpr_state(&self) -> FprState;
    fn set_fpr_state(&mut self, regs: &FprState);

    /// Drop translated code so a later re-instrumentation of an overlapping
    /// range does not execute stale blocks.
    fn clear_cache(&mut self);
}

/// A loaded module as the resolver reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub base: Address,
    pub end: Address,
    pub name: String,
}

/// The module/symbol resolution collaborator.
pub trait ModuleResolver {
    fn find_module(&self, name: &str) -> Option<ModuleInfo>;
    fn module_at(&self, address: Address) -> Option<ModuleInfo>;
    fn find_symbol(&self, module: &ModuleInfo, name: &str) -> Option<Address>;
    /// Symbol name covering `address`, or empty if unknown.
    fn symbol_at(&self, module: &ModuleInfo, address: Address) -> String;
}

/// Mnemonic of the supervisor-call trap instruction (same on both
/// instruction sets).
pub const SVC_MNEMONIC: &str = "svc";
