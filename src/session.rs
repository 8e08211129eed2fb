//! One attach/run cycle of the DBI engine against a single target function.
//!
//! The session owns the engine and the correlator, resolves the target
//! module, redirects execution onto the dedicated stack and drives the
//! engine either directly (`run`) or from an inline-hook trampoline
//! (`run_attach`). Not reentrant; a process-wide guard rejects a second
//! concurrent run instead of corrupting shared state.

use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::correlator::{Correlator, UserHook};
use crate::cpu::{FprState, GprState, HookRegisterContext, ARG_REGISTER_COUNT};
use crate::engine::{DbiEngine, EngineExit, ModuleInfo, ModuleResolver};
use crate::hook::{EntryHandler, InlineHookEngine};
use crate::range::{Address, ModuleRange, TraceRange};
use crate::record::TraceSink;
use crate::regs_bridge;
use crate::result::{Error, Result};
use crate::stack;

/// Span instrumented beyond the original entry point in attach mode. The
/// engine follows control flow within it; a whole-module instrumentation is
/// deliberately avoided here because the hooked entry itself was rewritten.
pub const ATTACH_WINDOW: u64 = 0x1_0000;

/// Decides per entry whether an attached call gets instrumented. Receives
/// the original entry address, the number of argument registers the calling
/// convention uses, and the raw trampoline context.
pub type AttachCondition = Box<dyn Fn(Address, usize, &HookRegisterContext) -> bool>;

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Holds the process-wide "a session is running" flag for one run.
struct ActiveGuard;

impl ActiveGuard {
    fn acquire() -> Result<ActiveGuard> {
        if SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::SessionActive);
        }
        Ok(ActiveGuard)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::Release);
    }
}

pub struct TraceSession<E: DbiEngine> {
    engine: E,
    module: ModuleRange,
    target: Address,
    correlator: Correlator,
}

fn resolve_module(resolver: &dyn ModuleResolver, library: &str) -> Result<ModuleInfo> {
    resolver
        .find_module(library)
        .ok_or_else(|| Error::ModuleNotFound(library.to_string()))
}

impl<E: DbiEngine> TraceSession<E> {
    fn new(engine: E, info: ModuleInfo, target: Address, sink: Box<dyn TraceSink>) -> Result<Self> {
        let range = TraceRange::new(info.base, info.end)?;
        info!(
            "trace target {:#x} in {} ({:#x}..{:#x})",
            target, info.name, info.base, info.end
        );
        Ok(TraceSession {
            engine,
            correlator: Correlator::new(range, sink),
            module: ModuleRange {
                range,
                name: info.name,
            },
            target,
        })
    }

    /// Target by module name and exported symbol.
    pub fn from_symbol(
        engine: E,
        resolver: &dyn ModuleResolver,
        sink: Box<dyn TraceSink>,
        library: &str,
        symbol: &str,
    ) -> Result<Self> {
        let info = resolve_module(resolver, library)?;
        let target = resolver
            .find_symbol(&info, symbol)
            .ok_or_else(|| Error::SymbolNotFound {
                module: library.to_string(),
                symbol: symbol.to_string(),
            })?;
        Self::new(engine, info, target, sink)
    }

    /// Target by module name and byte offset from its base.
    pub fn from_offset(
        engine: E,
        resolver: &dyn ModuleResolver,
        sink: Box<dyn TraceSink>,
        library: &str,
        offset: u64,
    ) -> Result<Self> {
        let info = resolve_module(resolver, library)?;
        let size = info.end - info.base;
        if offset > size {
            return Err(Error::OffsetOutOfRange { offset, size });
        }
        let target = info.base + offset;
        Self::new(engine, info, target, sink)
    }

    /// Target by absolute address; the containing module is looked up.
    pub fn from_address(
        engine: E,
        resolver: &dyn ModuleResolver,
        sink: Box<dyn TraceSink>,
        address: Address,
    ) -> Result<Self> {
        let info = resolver
            .module_at(address)
            .ok_or_else(|| Error::ModuleNotFound(format!("{:#x}", address)))?;
        let symbol = resolver.symbol_at(&info, address);
        if !symbol.is_empty() {
            debug!("target {:#x} is {}:{}", address, info.name, symbol);
        }
        Self::new(engine, info, address, sink)
    }

    pub fn module(&self) -> &ModuleRange {
        &self.module
    }

    pub fn target(&self) -> Address {
        self.target
    }

    /// Restrict recording to `[base_offset, end_offset)` relative to the
    /// module base. Without any registered range everything is recorded.
    pub fn add_record_range(&mut self, base_offset: u64, end_offset: u64) -> Result<()> {
        let module = self.module.range;
        let base = module.base.wrapping_add(base_offset);
        let end = module.base.wrapping_add(end_offset);
        let range = TraceRange::new(base, end)?;
        if !module.contains_inclusive(base) || !module.contains_inclusive(end) {
            return Err(Error::RangeNotContainedInModule {
                base,
                end,
                module_base: module.base,
                module_end: module.end,
            });
        }
        self.correlator.add_record_range(range);
        Ok(())
    }

    pub fn add_record_range_size(&mut self, base_offset: u64, size: u64) -> Result<()> {
        self.add_record_range(base_offset, base_offset + size)
    }

    /// User extension callback before the instruction at this
    /// module-relative offset executes.
    pub fn add_pre_hook(&mut self, offset: u64, hook: UserHook) {
        self.correlator.add_pre_hook(offset, hook);
    }

    /// User extension callback after the instruction at this
    /// module-relative offset executed.
    pub fn add_post_hook(&mut self, offset: u64, hook: UserHook) {
        self.correlator.add_post_hook(offset, hook);
    }

    /// Instrument the target module and invoke the target function with the
    /// given register arguments. Returns the call's return value, or
    /// `EngineCallFailure` if the engine reports the call did not complete
    /// (distinct from a normal return of zero).
    pub fn run(&mut self, args: &[u64]) -> Result<u64> {
        let _active = ActiveGuard::acquire()?;
        let stack_range = stack::dedicated_stack()?;
        self.correlator.set_stack(stack_range);

        let mut gpr = self.engine.gpr_state();
        gpr.redirect_stack(stack_range.end);
        self.engine.set_gpr_state(&gpr);

        self.engine.instrument_module_containing(self.target)?;
        info!("invoking {:#x} with {} args", self.target, args.len());
        let exit = self.engine.call(self.target, args, &mut self.correlator)?;
        self.finish_run(exit)
    }

    /// Redirect the target's entry point through the inline-hook engine and
    /// trace the first accepted entry. The handler runs synchronously on
    /// the thread that entered the hooked function.
    pub fn run_attach(
        &mut self,
        hooker: &mut dyn InlineHookEngine,
        condition: Option<AttachCondition>,
    ) -> Result<()> {
        let _active = ActiveGuard::acquire()?;
        let target = self.target;
        let mut shim = AttachShim {
            session: self,
            condition,
            outcome: Ok(()),
        };
        hooker
            .instrument(target, &mut shim)
            .map_err(|e| Error::AttachFailure(e.to_string()))?;
        shim.outcome
    }

    fn trace_entry(&mut self, original: Address, ctx: &mut HookRegisterContext) -> Result<()> {
        let stack_range = stack::dedicated_stack()?;
        self.correlator.set_stack(stack_range);

        let mut gpr = GprState::default();
        let mut fpr = FprState::default();
        regs_bridge::bridge_to_engine(ctx, &mut gpr, &mut fpr);
        let args: Vec<u64> = (0..ARG_REGISTER_COUNT).map(|i| gpr.argument(i)).collect();
        gpr.redirect_stack(stack_range.end);
        self.engine.set_gpr_state(&gpr);
        self.engine.set_fpr_state(&fpr);

        self.engine
            .instrument_range(original, original.saturating_add(ATTACH_WINDOW))?;
        let exit = self.engine.call(original, &args, &mut self.correlator)?;
        self.finish_run(exit)?;

        // hand the traced call's result back to the resumed caller; on the
        // 32-bit instruction set this carries general-purpose registers only
        let gpr = self.engine.gpr_state();
        let fpr = self.engine.fpr_state();
        regs_bridge::bridge_from_engine(&gpr, &fpr, ctx);
        Ok(())
    }

    fn finish_run(&mut self, exit: EngineExit) -> Result<u64> {
        self.correlator.finish();
        self.engine.clear_cache();
        if let Some(fault) = self.correlator.take_fault() {
            return Err(fault);
        }
        if !exit.completed {
            return Err(Error::EngineCallFailure);
        }
        Ok(exit.value)
    }
}

struct AttachShim<'a, E: DbiEngine> {
    session: &'a mut TraceSession<E>,
    condition: Option<AttachCondition>,
    outcome: Result<()>,
}

impl<'a, E: DbiEngine> EntryHandler for AttachShim<'a, E> {
    fn on_entry(&mut self, original: Address, ctx: &mut HookRegisterContext) {
        if let Some(condition) = &self.condition {
            if !condition(original, ARG_REGISTER_COUNT, ctx) {
                debug!("attach condition rejected entry at {:#x}", original);
                return;
            }
        }
        let started = Instant::now();
        self.outcome = self.session.trace_entry(original, ctx);
        let elapsed = started.elapsed();
        info!(
            "attach trace finished in {:02}:{:02}.{:03}",
            elapsed.as_secs() / 60,
            elapsed.as_secs() % 60,
            elapsed.subsec_millis()
        );
    }
}

// register plumbing in these tests is layout-specific
#[cfg(all(test, not(target_arch = "arm")))]
mod tests {
    use super::*;
    use crate::engine::{
        AccessKind, AnalysisType, CallbackAction, EngineContext, InstAnalysis, MemoryAccess,
        TraceHandler,
    };
    use crate::record::InstTraceInfo;
    use lazy_static::lazy_static;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Mutex;

    lazy_static! {
        // run()/run_attach() take the process-wide active flag; tests must
        // not race each other for it
        static ref RUN_LOCK: Mutex<()> = Mutex::new(());
    }

    fn lock_run() -> std::sync::MutexGuard<'static, ()> {
        match RUN_LOCK.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    #[derive(Clone)]
    struct Step {
        pre: InstAnalysis,
        post: Option<InstAnalysis>,
        post_gpr: GprState,
        accesses: Vec<MemoryAccess>,
        skip_pre: bool,
    }

    impl Step {
        fn new(pre: InstAnalysis, post_gpr: GprState) -> Step {
            Step {
                pre,
                post: None,
                post_gpr,
                accesses: vec![],
                skip_pre: false,
            }
        }
    }

    struct FakeEngine {
        gpr: GprState,
        fpr: FprState,
        steps: Vec<Step>,
        current: Option<InstAnalysis>,
        accesses: Vec<MemoryAccess>,
        instrumented: Vec<(u64, u64)>,
        complete: bool,
        return_value: u64,
        cache_clears: u32,
        redirected_sp: Vec<u64>,
    }

    impl FakeEngine {
        fn new(steps: Vec<Step>, return_value: u64) -> FakeEngine {
            FakeEngine {
                gpr: GprState::default(),
                fpr: FprState::default(),
                steps,
                current: None,
                accesses: vec![],
                instrumented: vec![],
                complete: true,
                return_value,
                cache_clears: 0,
                redirected_sp: vec![],
            }
        }
    }

    impl EngineContext for FakeEngine {
        fn inst_analysis(&mut self, _wanted: AnalysisType) -> Option<InstAnalysis> {
            self.current.clone()
        }
        fn gpr_state(&self) -> GprState {
            self.gpr
        }
        fn set_gpr_state(&mut self, regs: &GprState) {
            self.gpr = *regs;
        }
        fn fpr_state(&self) -> FprState {
            self.fpr
        }
        fn set_fpr_state(&mut self, regs: &FprState) {
            self.fpr = *regs;
        }
        fn memory_accesses(&self) -> Vec<MemoryAccess> {
            self.accesses.clone()
        }
    }

    impl DbiEngine for FakeEngine {
        fn instrument_module_containing(&mut self, address: Address) -> Result<()> {
            self.instrumented.push((address, address));
            Ok(())
        }
        fn instrument_range(&mut self, start: Address, end: Address) -> Result<()> {
            self.instrumented.push((start, end));
            Ok(())
        }
        fn call(
            &mut self,
            target: Address,
            args: &[u64],
            handler: &mut dyn TraceHandler,
        ) -> Result<EngineExit> {
            for (i, arg) in args.iter().enumerate().take(ARG_REGISTER_COUNT) {
                self.gpr.x[i] = *arg;
            }
            self.gpr.pc = target;

            let steps = std::mem::take(&mut self.steps);
            for step in steps {
                self.current = Some(step.pre.clone());
                self.accesses = vec![];
                if !step.skip_pre {
                    if handler.pre_instruction(self) == CallbackAction::Stop {
                        return Ok(EngineExit {
                            completed: false,
                            value: 0,
                        });
                    }
                    if step.pre.mnemonic == "svc"
                        && handler.mnemonic_pre(self, "svc") == CallbackAction::Stop
                    {
                        return Ok(EngineExit {
                            completed: false,
                            value: 0,
                        });
                    }
                }

                // execute
                self.gpr = step.post_gpr;
                self.accesses = step.accesses.clone();
                self.current = Some(step.post.unwrap_or(step.pre));

                if handler.post_instruction(self) == CallbackAction::Stop {
                    return Ok(EngineExit {
                        completed: false,
                        value: 0,
                    });
                }
            }

            self.gpr.x[0] = self.return_value;
            Ok(EngineExit {
                completed: self.complete,
                value: self.return_value,
            })
        }
        fn gpr_state(&self) -> GprState {
            self.gpr
        }
        fn set_gpr_state(&mut self, regs: &GprState) {
            self.redirected_sp.push(regs.sp);
            self.gpr = *regs;
        }
        fn fpr_state(&self) -> FprState {
            self.fpr
        }
        fn set_fpr_state(&mut self, regs: &FprState) {
            self.fpr = *regs;
        }
        fn clear_cache(&mut self) {
            self.cache_clears += 1;
        }
    }

    struct FakeResolver {
        modules: Vec<ModuleInfo>,
        symbols: Vec<(String, String, u64)>,
    }

    impl FakeResolver {
        fn with_target() -> FakeResolver {
            FakeResolver {
                modules: vec![ModuleInfo {
                    base: 0x1000,
                    end: 0x9000,
                    name: "libtarget.so".to_string(),
                }],
                symbols: vec![("libtarget.so".to_string(), "decrypt".to_string(), 0x1000)],
            }
        }
    }

    impl ModuleResolver for FakeResolver {
        fn find_module(&self, name: &str) -> Option<ModuleInfo> {
            self.modules.iter().find(|m| m.name == name).cloned()
        }
        fn module_at(&self, address: Address) -> Option<ModuleInfo> {
            self.modules
                .iter()
                .find(|m| m.base <= address && address <= m.end)
                .cloned()
        }
        fn find_symbol(&self, module: &ModuleInfo, name: &str) -> Option<Address> {
            self.symbols
                .iter()
                .find(|(m, s, _)| *m == module.name && s == name)
                .map(|(_, _, a)| *a)
        }
        fn symbol_at(&self, module: &ModuleInfo, address: Address) -> String {
            self.symbols
                .iter()
                .find(|(m, _, a)| *m == module.name && *a == address)
                .map(|(_, s, _)| s.clone())
                .unwrap_or_default()
        }
    }

    #[derive(Default)]
    struct VecSink {
        records: Rc<RefCell<Vec<InstTraceInfo>>>,
        flushes: Rc<RefCell<u32>>,
    }

    impl crate::record::TraceSink for VecSink {
        fn emit(&mut self, info: InstTraceInfo) {
            self.records.borrow_mut().push(info);
        }
        fn flush(&mut self) {
            *self.flushes.borrow_mut() += 1;
        }
    }

    fn inst(pc: u64, mnemonic: &str) -> InstAnalysis {
        InstAnalysis {
            address: pc,
            mnemonic: mnemonic.to_string(),
            ..InstAnalysis::default()
        }
    }

    fn gpr_at(pc: u64) -> GprState {
        let mut gpr = GprState::default();
        gpr.pc = pc;
        gpr
    }

    fn straight_line_steps(pcs: &[u64]) -> Vec<Step> {
        pcs.iter()
            .map(|&pc| Step::new(inst(pc, "mov"), gpr_at(pc + 4)))
            .collect()
    }

    fn session_with(
        steps: Vec<Step>,
        return_value: u64,
    ) -> (
        TraceSession<FakeEngine>,
        Rc<RefCell<Vec<InstTraceInfo>>>,
        Rc<RefCell<u32>>,
    ) {
        let sink = VecSink::default();
        let records = Rc::clone(&sink.records);
        let flushes = Rc::clone(&sink.flushes);
        let session = TraceSession::from_symbol(
            FakeEngine::new(steps, return_value),
            &FakeResolver::with_target(),
            Box::new(sink),
            "libtarget.so",
            "decrypt",
        )
        .unwrap();
        (session, records, flushes)
    }

    #[test]
    fn unknown_module_fails_setup() {
        let err = TraceSession::from_symbol(
            FakeEngine::new(vec![], 0),
            &FakeResolver::with_target(),
            Box::new(VecSink::default()),
            "libmissing.so",
            "decrypt",
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::ModuleNotFound(_)));
    }

    #[test]
    fn unknown_symbol_fails_setup() {
        let err = TraceSession::from_symbol(
            FakeEngine::new(vec![], 0),
            &FakeResolver::with_target(),
            Box::new(VecSink::default()),
            "libtarget.so",
            "nonexistent",
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::SymbolNotFound { .. }));
    }

    #[test]
    fn offset_beyond_module_fails_setup() {
        let err = TraceSession::from_offset(
            FakeEngine::new(vec![], 0),
            &FakeResolver::with_target(),
            Box::new(VecSink::default()),
            "libtarget.so",
            0x1_0000,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::OffsetOutOfRange { .. }));
    }

    #[test]
    fn address_mode_resolves_containing_module() {
        let session = TraceSession::from_address(
            FakeEngine::new(vec![], 0),
            &FakeResolver::with_target(),
            Box::new(VecSink::default()),
            0x1000,
        )
        .unwrap();
        assert_eq!(session.module().name, "libtarget.so");
        assert_eq!(session.target(), 0x1000);
    }

    #[test]
    fn record_range_must_lie_in_module() {
        let (mut session, _, _) = session_with(vec![], 0);
        assert!(session.add_record_range(0, 0x100).is_ok());
        let err = session.add_record_range(0, 0x9000).err().unwrap();
        assert!(matches!(err, Error::RangeNotContainedInModule { .. }));
        let err = session.add_record_range(0x200, 0x100).err().unwrap();
        assert!(matches!(err, Error::InvalidRange { .. }));
    }

    #[test]
    fn run_emits_one_record_per_instruction() {
        let _lock = lock_run();
        let (mut session, records, flushes) =
            session_with(straight_line_steps(&[0x1000, 0x1004, 0x1008]), 42);

        let ret = session.run(&[5, 6]).unwrap();
        assert_eq!(ret, 42);

        let out = records.borrow();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].pc, 0x1000);
        assert_eq!(out[2].pc, 0x1008);
        assert_eq!(*flushes.borrow(), 1);
        assert_eq!(session.engine.cache_clears, 1);
    }

    #[test]
    fn run_redirects_sp_into_dedicated_stack() {
        let _lock = lock_run();
        let (mut session, _, _) = session_with(straight_line_steps(&[0x1000]), 0);
        session.run(&[]).unwrap();

        let stack_range = stack::dedicated_stack().unwrap();
        let sp = session.engine.redirected_sp[0];
        assert!(stack_range.contains_inclusive(sp));
        assert_eq!(sp % 16, 0);
    }

    #[test]
    fn record_range_filter_drops_outside_instructions() {
        let _lock = lock_run();
        let (mut session, records, _) =
            session_with(straight_line_steps(&[0x1000, 0x1004, 0x1008]), 0);
        session.add_record_range_size(0, 4).unwrap();

        session.run(&[]).unwrap();
        let out = records.borrow();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pc, 0x1000);
    }

    #[test]
    fn call_record_waits_for_its_landing() {
        let _lock = lock_run();
        let stack_range = stack::dedicated_stack().unwrap();

        let mut call = inst(0x1000, "bl");
        call.is_call = true;
        call.is_branch = true;
        call.affects_control_flow = true;
        let mut call_step = Step::new(call, gpr_at(0x2000));
        call_step.accesses = vec![
            MemoryAccess {
                address: stack_range.base + 0x10,
                kind: AccessKind::Write,
            },
            MemoryAccess {
                address: 0x3000,
                kind: AccessKind::Read,
            },
        ];

        let mut landing_gpr = gpr_at(0x2004);
        landing_gpr.x[0] = 99;
        let landing_step = Step::new(inst(0x2000, "mov"), landing_gpr);

        let (mut session, records, _) = session_with(vec![call_step, landing_step], 99);
        session.run(&[7, 8]).unwrap();

        let out = records.borrow();
        assert_eq!(out.len(), 2);

        // the call site comes out first, resolved against the landing step
        let call_record = &out[0];
        assert_eq!(call_record.pc, 0x1000);
        let fun_call = call_record.fun_call.as_ref().unwrap();
        assert!(!fun_call.is_svc);
        assert_eq!(fun_call.return_value, Some(99));
        // callee at 0x2000 is inside the module: internal convention
        assert_eq!(fun_call.args.len(), ARG_REGISTER_COUNT);
        assert_eq!(fun_call.args[0], 7);
        assert_eq!(fun_call.args[1], 8);
        // stack-internal traffic is noise
        assert_eq!(call_record.accesses.len(), 1);
        assert_eq!(call_record.accesses[0].address, 0x3000);

        assert_eq!(out[1].pc, 0x2000);
    }

    #[test]
    fn svc_uses_external_dispatch() {
        let _lock = lock_run();
        let mut svc_gpr = gpr_at(0x1004);
        svc_gpr.x[0] = 0;
        let svc_step = Step::new(inst(0x1000, "svc"), svc_gpr);

        let mut landing_gpr = gpr_at(0x1008);
        landing_gpr.x[0] = 3; // syscall result
        let landing_step = Step::new(inst(0x1004, "mov"), landing_gpr);

        let (mut session, records, _) = session_with(vec![svc_step, landing_step], 3);
        let mut args = vec![0u64; ARG_REGISTER_COUNT];
        args[0] = 0xdead;
        session.run(&args).unwrap();

        let out = records.borrow();
        let call = out[0].fun_call.as_ref().unwrap();
        assert!(call.is_svc);
        // external convention appends the syscall-number register
        assert_eq!(call.args.len(), ARG_REGISTER_COUNT + 1);
        assert_eq!(call.return_value, Some(3));
    }

    #[test]
    fn pc_mismatch_surfaces_as_run_failure() {
        let _lock = lock_run();
        let mut step = Step::new(inst(0x1000, "mov"), gpr_at(0x1004));
        step.post = Some(inst(0x1400, "mov"));

        let (mut session, records, _) = session_with(vec![step], 0);
        let err = session.run(&[]).err().unwrap();
        assert!(matches!(err, Error::CorrelationInvariant { .. }));
        assert!(records.borrow().is_empty());
    }

    #[test]
    fn missed_pre_callback_surfaces_as_run_failure() {
        let _lock = lock_run();
        let mut step = Step::new(inst(0x1000, "mov"), gpr_at(0x1004));
        step.skip_pre = true;

        let (mut session, _, _) = session_with(vec![step], 0);
        let err = session.run(&[]).err().unwrap();
        match err {
            Error::CorrelationInvariant {
                engine_pc: 0x1000,
                record_pc: None,
            } => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn incomplete_engine_call_is_distinct_failure() {
        let _lock = lock_run();
        let (mut session, _, flushes) = session_with(straight_line_steps(&[0x1000]), 0);
        session.engine.complete = false;

        let err = session.run(&[]).err().unwrap();
        assert!(matches!(err, Error::EngineCallFailure));
        // the sink still gets flushed on the failure path
        assert_eq!(*flushes.borrow(), 1);
    }

    #[test]
    fn user_hooks_fire_at_their_offsets() {
        let _lock = lock_run();
        let (mut session, _, _) = session_with(straight_line_steps(&[0x1000, 0x1004]), 0);

        let pre_hits = Rc::new(RefCell::new(vec![]));
        let post_hits = Rc::new(RefCell::new(vec![]));
        let pre_clone = Rc::clone(&pre_hits);
        let post_clone = Rc::clone(&post_hits);
        session.add_pre_hook(
            0x4,
            Box::new(move |offset, gpr, _fpr| {
                pre_clone.borrow_mut().push((offset, gpr.pc));
            }),
        );
        session.add_post_hook(
            0x4,
            Box::new(move |offset, gpr, _fpr| {
                post_clone.borrow_mut().push((offset, gpr.pc));
            }),
        );

        session.run(&[]).unwrap();
        assert_eq!(*pre_hits.borrow(), vec![(0x4, 0x1004)]);
        assert_eq!(*post_hits.borrow(), vec![(0x4, 0x1008)]);
    }

    #[test]
    fn only_one_session_runs_at_a_time() {
        let _lock = lock_run();
        let _guard = ActiveGuard::acquire().unwrap();
        assert!(matches!(ActiveGuard::acquire(), Err(Error::SessionActive)));
    }

    struct FakeHookEngine {
        fail: bool,
        original: Address,
        ctx: HookRegisterContext,
    }

    impl InlineHookEngine for FakeHookEngine {
        fn instrument(
            &mut self,
            _address: Address,
            handler: &mut dyn EntryHandler,
        ) -> Result<()> {
            if self.fail {
                return Err(Error::Engine("no trampoline space".to_string()));
            }
            let mut ctx = self.ctx;
            handler.on_entry(self.original, &mut ctx);
            self.ctx = ctx;
            Ok(())
        }
    }

    #[test]
    fn attach_failure_is_reported() {
        let _lock = lock_run();
        let (mut session, _, _) = session_with(vec![], 0);
        let mut hooker = FakeHookEngine {
            fail: true,
            original: 0x1100,
            ctx: HookRegisterContext::default(),
        };
        let err = session.run_attach(&mut hooker, None).err().unwrap();
        assert!(matches!(err, Error::AttachFailure(_)));
    }

    #[test]
    fn attach_condition_can_reject_entry() {
        let _lock = lock_run();
        let (mut session, records, _) = session_with(straight_line_steps(&[0x1100]), 0);
        let mut hooker = FakeHookEngine {
            fail: false,
            original: 0x1100,
            ctx: HookRegisterContext::default(),
        };
        session
            .run_attach(&mut hooker, Some(Box::new(|_, _, _| false)))
            .unwrap();
        assert!(records.borrow().is_empty());
    }

    #[test]
    fn attach_traces_and_returns_result_to_caller() {
        let _lock = lock_run();
        let (mut session, records, _) = session_with(straight_line_steps(&[0x1100]), 7);

        let mut ctx = HookRegisterContext::default();
        ctx.general[0] = 0x41;
        ctx.general[1] = 0x42;
        ctx.sp = 0x7fff_0000;
        let mut hooker = FakeHookEngine {
            fail: false,
            original: 0x1100,
            ctx,
        };

        let seen_args = Rc::new(RefCell::new(0u64));
        let seen_clone = Rc::clone(&seen_args);
        session
            .run_attach(
                &mut hooker,
                Some(Box::new(move |original, arg_hint, ctx| {
                    assert_eq!(original, 0x1100);
                    assert_eq!(arg_hint, ARG_REGISTER_COUNT);
                    *seen_clone.borrow_mut() = ctx.argument(0);
                    true
                })),
            )
            .unwrap();

        assert_eq!(*seen_args.borrow(), 0x41);
        assert_eq!(records.borrow().len(), 1);
        // the instrumented window starts at the original entry
        assert_eq!(session.engine.instrumented[0].0, 0x1100);
        // the traced call's return value flows back into the caller context
        assert_eq!(hooker.ctx.general[0], 7);
    }
}
