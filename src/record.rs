//! Per-instruction trace records and the fixed-depth record history.

use log::info;
use std::fmt;

use crate::cpu::CpuStatus;
use crate::engine::{InstAnalysis, MemoryAccess};
use crate::range::Address;

/// Marks an instruction as a call site (branch-and-link or supervisor call)
/// whose return value lands one step later.
#[derive(Clone, Debug, PartialEq)]
pub struct FunCall {
    pub is_svc: bool,
    /// Retained decode info of the call instruction itself; the engine's own
    /// buffer does not survive into the next step.
    pub analysis: InstAnalysis,
    pub args: Vec<u64>,
    pub return_value: Option<u64>,
}

impl FunCall {
    pub fn new(is_svc: bool, analysis: InstAnalysis) -> FunCall {
        FunCall {
            is_svc,
            analysis,
            args: vec![],
            return_value: None,
        }
    }
}

/// One record per executed instruction, keyed by pc.
#[derive(Clone, Debug, PartialEq)]
pub struct InstTraceInfo {
    pub pc: Address,
    pub pre_status: CpuStatus,
    pub post_status: CpuStatus,
    pub analysis: InstAnalysis,
    pub fun_call: Option<FunCall>,
    pub accesses: Vec<MemoryAccess>,
}

impl InstTraceInfo {
    pub fn new(analysis: InstAnalysis) -> InstTraceInfo {
        InstTraceInfo {
            pc: analysis.address,
            pre_status: CpuStatus::default(),
            post_status: CpuStatus::default(),
            analysis,
            fun_call: None,
            accesses: vec![],
        }
    }

    pub fn is_call_site(&self) -> bool {
        self.fun_call.is_some()
    }
}

impl fmt::Display for InstTraceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x} {} {}", self.pc, self.analysis.mnemonic, self.analysis.operands)?;
        if let Some(call) = &self.fun_call {
            let kind = if call.is_svc { "svc" } else { "call" };
            write!(f, " [{} args {:x?}", kind, call.args)?;
            match call.return_value {
                Some(ret) => write!(f, " ret {:#x}]", ret)?,
                None => write!(f, " ret ?]")?,
            }
        }
        Ok(())
    }
}

/// The current record and the immediately preceding one. A call site's
/// return value is only known one step after it executed, so exactly this
/// much history must stay retrievable; anything deeper would grow without
/// bound on long traces.
#[derive(Debug, Default)]
pub struct InfoHistory {
    current: Option<InstTraceInfo>,
    previous: Option<InstTraceInfo>,
}

impl InfoHistory {
    /// Start a new record: the old current becomes previous, the old
    /// previous is dropped.
    pub fn begin(&mut self, info: InstTraceInfo) {
        self.previous = self.current.take();
        self.current = Some(info);
    }

    pub fn current_mut(&mut self) -> Option<&mut InstTraceInfo> {
        self.current.as_mut()
    }

    pub fn take_current(&mut self) -> Option<InstTraceInfo> {
        self.current.take()
    }

    pub fn previous(&self) -> Option<&InstTraceInfo> {
        self.previous.as_ref()
    }

    pub fn take_previous(&mut self) -> Option<InstTraceInfo> {
        self.previous.take()
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
    }
}

/// Consumes finished records. Persistence/formatting live behind this
/// boundary, outside the core.
pub trait TraceSink {
    fn emit(&mut self, info: InstTraceInfo);
    fn flush(&mut self);
}

/// Formats finished records through the logging facade. Handy default when
/// no persistent sink is wired up.
#[derive(Debug, Default)]
pub struct LogSink {
    emitted: u64,
}

impl TraceSink for LogSink {
    fn emit(&mut self, info: InstTraceInfo) {
        self.emitted += 1;
        info!("{}", info);
    }

    fn flush(&mut self) {
        info!("trace finished, {} records", self.emitted);
    }
}
