//! The pre/post instruction callback pair that turns engine steps into
//! coherent trace records.
//!
//! One record is begun per instruction in the pre callback and completed in
//! the post callback. Call sites (branch-and-link or svc) are the exception:
//! their return value only exists after the following instruction executed,
//! so they are emitted one step late, resolved against the landing step's
//! post state.

use log::trace;
use std::collections::BTreeMap;

use crate::cpu::{CpuStatus, FprState, GprState, ARG_REGISTER_COUNT};
use crate::engine::{
    AnalysisType, CallbackAction, EngineContext, MemoryAccess, TraceHandler, SVC_MNEMONIC,
};
use crate::range::{Address, RecordRanges, TraceRange};
use crate::record::{FunCall, InfoHistory, InstTraceInfo, TraceSink};
use crate::result::Error;

/// User extension callback, keyed by module-relative offset. Receives the
/// offset and the register state at that point; nothing is consulted on
/// return.
pub type UserHook = Box<dyn FnMut(u64, &GprState, &FprState)>;

/// Arguments per the module's internal procedure-call standard.
fn internal_call_args(gpr: &GprState) -> Vec<u64> {
    (0..ARG_REGISTER_COUNT).map(|i| gpr.argument(i)).collect()
}

/// Raw/external convention: opaque callees and supervisor calls. Carries the
/// syscall-number register on top of the ordinary argument registers.
fn external_call_args(gpr: &GprState) -> Vec<u64> {
    let mut args = internal_call_args(gpr);
    args.push(gpr.syscall_nr());
    args
}

fn filter_stack_accesses(accesses: Vec<MemoryAccess>, stack: &TraceRange) -> Vec<MemoryAccess> {
    accesses
        .into_iter()
        .filter(|a| !stack.contains(a.address))
        .collect()
}

pub struct Correlator {
    module: TraceRange,
    ranges: RecordRanges,
    stack: TraceRange,
    history: InfoHistory,
    sink: Box<dyn TraceSink>,
    pre_hooks: BTreeMap<u64, UserHook>,
    post_hooks: BTreeMap<u64, UserHook>,
    fault: Option<Error>,
}

impl Correlator {
    pub fn new(module: TraceRange, sink: Box<dyn TraceSink>) -> Correlator {
        Correlator {
            module,
            ranges: RecordRanges::default(),
            stack: TraceRange::default(),
            history: InfoHistory::default(),
            sink,
            pre_hooks: BTreeMap::new(),
            post_hooks: BTreeMap::new(),
            fault: None,
        }
    }

    /// Stack-internal memory traffic is filtered out of every record.
    pub fn set_stack(&mut self, stack: TraceRange) {
        self.stack = stack;
    }

    pub fn add_record_range(&mut self, range: TraceRange) {
        self.ranges.add(range);
    }

    pub fn add_pre_hook(&mut self, offset: u64, hook: UserHook) {
        self.pre_hooks.insert(offset, hook);
    }

    pub fn add_post_hook(&mut self, offset: u64, hook: UserHook) {
        self.post_hooks.insert(offset, hook);
    }

    /// Flush the sink and forget any in-flight records. A call site still in
    /// the history at this point never saw its return land (the engine
    /// stopped first); it is emitted unresolved rather than dropped.
    pub fn finish(&mut self) {
        if let Some(current) = self.history.take_current() {
            if current.is_call_site() {
                self.sink.emit(current);
            }
        }
        self.history.clear();
        self.sink.flush();
    }

    /// Fatal correlation error from the current run, if any.
    pub fn take_fault(&mut self) -> Option<Error> {
        self.fault.take()
    }
}

impl TraceHandler for Correlator {
    fn pre_instruction(&mut self, vm: &mut dyn EngineContext) -> CallbackAction {
        let analysis = match vm.inst_analysis(AnalysisType::all()) {
            Some(a) => a,
            // decode misses are tolerated; the instruction goes unrecorded
            None => return CallbackAction::Continue,
        };
        if !self.ranges.is_recorded(analysis.address) {
            return CallbackAction::Continue;
        }

        let gpr = vm.gpr_state();
        let fpr = vm.fpr_state();
        let offset = analysis.address.wrapping_sub(self.module.base);
        if let Some(hook) = self.pre_hooks.get_mut(&offset) {
            hook(offset, &gpr, &fpr);
        }

        let mut info = InstTraceInfo::new(analysis.clone());
        info.pre_status = CpuStatus { gpr, fpr };
        if analysis.is_call {
            // call site: decode info must outlive this step to resolve the
            // return one instruction later
            info.fun_call = Some(FunCall::new(false, analysis));
        }
        self.history.begin(info);
        CallbackAction::Continue
    }

    fn post_instruction(&mut self, vm: &mut dyn EngineContext) -> CallbackAction {
        let analysis = match vm.inst_analysis(AnalysisType::all()) {
            Some(a) => a,
            None => return CallbackAction::Continue,
        };
        if !self.ranges.is_recorded(analysis.address) {
            return CallbackAction::Continue;
        }

        // correlation invariant: exactly one current record, keyed by this pc
        let record_pc = self.history.current_mut().map(|r| r.pc);
        match record_pc {
            Some(pc) if pc == analysis.address => {}
            other => {
                self.fault = Some(Error::CorrelationInvariant {
                    engine_pc: analysis.address,
                    record_pc: other,
                });
                return CallbackAction::Stop;
            }
        }

        let gpr = vm.gpr_state();
        let fpr = vm.fpr_state();
        let offset = analysis.address.wrapping_sub(self.module.base);
        if let Some(hook) = self.post_hooks.get_mut(&offset) {
            hook(offset, &gpr, &fpr);
        }

        let module = self.module;
        let stack = self.stack;

        if let Some(current) = self.history.current_mut() {
            current.post_status = CpuStatus { gpr, fpr };
            if let Some(call) = current.fun_call.as_mut() {
                // post-execution pc is the callee entry; it decides the
                // argument convention
                let internal = module.contains_inclusive(gpr.ip()) && !call.is_svc;
                call.args = if internal {
                    internal_call_args(&current.pre_status.gpr)
                } else {
                    external_call_args(&current.pre_status.gpr)
                };
                // the call's own accesses are fixed now; the landing step
                // contributes none
                current.accesses = filter_stack_accesses(vm.memory_accesses(), &stack);
            }
        }

        // a call one step back resolves here: its return value is this
        // step's post state
        if self.history.previous().map_or(false, |p| p.is_call_site()) {
            if let Some(mut prev) = self.history.take_previous() {
                if let Some(call) = prev.fun_call.as_mut() {
                    let internal =
                        module.contains_inclusive(prev.post_status.gpr.ip()) && !call.is_svc;
                    call.return_value = Some(gpr.return_value());
                    trace!(
                        "call at {:#x} returned {:#x} ({})",
                        prev.pc,
                        gpr.return_value(),
                        if internal { "internal" } else { "external" }
                    );
                }
                self.sink.emit(prev);
            }
        }

        // non-call records finalize immediately; call sites wait for their
        // landing
        let is_call = self.history.current_mut().map_or(false, |c| c.is_call_site());
        if !is_call {
            if let Some(mut info) = self.history.take_current() {
                info.accesses = filter_stack_accesses(vm.memory_accesses(), &stack);
                self.sink.emit(info);
            }
        }

        CallbackAction::Continue
    }

    /// Supervisor-call trap about to execute: promote the current record to
    /// a call site so return resolution treats it like any other call, but
    /// on the external dispatch path unconditionally.
    fn mnemonic_pre(&mut self, vm: &mut dyn EngineContext, mnemonic: &str) -> CallbackAction {
        if !mnemonic.eq_ignore_ascii_case(SVC_MNEMONIC) {
            return CallbackAction::Continue;
        }
        let analysis = match vm.inst_analysis(AnalysisType::all()) {
            Some(a) => a,
            None => return CallbackAction::Continue,
        };
        if !self.ranges.is_recorded(analysis.address) {
            return CallbackAction::Continue;
        }
        if let Some(current) = self.history.current_mut() {
            if current.pc == analysis.address && current.fun_call.is_none() {
                current.fun_call = Some(FunCall::new(true, analysis));
            }
        }
        CallbackAction::Continue
    }

    fn call_transfer(&mut self, _vm: &mut dyn EngineContext, target: Address) -> CallbackAction {
        trace!("execution transfer to {:#x}", target);
        CallbackAction::Continue
    }
}
