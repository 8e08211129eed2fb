use std::result;
use thiserror::Error;

/// Split the way the session surfaces failures: everything before `run` is
/// recoverable (retry with other parameters), everything mid-run stops the
/// engine and truncates the trace.
#[derive(Debug, Error)]
pub enum Error {
    #[error("module {0} is not loaded")]
    ModuleNotFound(String),

    #[error("symbol {symbol} not found in {module}")]
    SymbolNotFound { module: String, symbol: String },

    #[error("offset {offset:#x} lies outside the module (size {size:#x})")]
    OffsetOutOfRange { offset: u64, size: u64 },

    #[error(
        "range {base:#x}..{end:#x} is not contained in module {module_base:#x}..{module_end:#x}"
    )]
    RangeNotContainedInModule {
        base: u64,
        end: u64,
        module_base: u64,
        module_end: u64,
    },

    #[error("invalid range {base:#x}..{end:#x}")]
    InvalidRange { base: u64, end: u64 },

    /// The post-instruction callback found no current record, or a record
    /// whose pc disagrees with the engine. The trace is truncated at this
    /// instruction.
    #[error("record desynchronized at {engine_pc:#x}: current record is {}",
        .record_pc.map_or_else(|| "missing".to_string(), |pc| format!("{:#x}", pc)))]
    CorrelationInvariant {
        engine_pc: u64,
        record_pc: Option<u64>,
    },

    #[error("inline hook installation failed: {0}")]
    AttachFailure(String),

    #[error("instrumented call did not complete")]
    EngineCallFailure,

    #[error("engine: {0}")]
    Engine(String),

    #[error("a trace session is already active in this process")]
    SessionActive,

    #[error("cannot reserve dedicated stack: {0}")]
    StackAllocation(String),

    #[error("cannot read process maps: {0}")]
    ProcMaps(String),
}

pub type Result<T> = result::Result<T, Error>;
