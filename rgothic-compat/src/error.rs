use rgothic_script::vm::VmError;

use crate::cpu32::CpuError;
use crate::mem32::{MemError, Ptr32};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("address translation failed: {0}")]
    TranslationFailure(Ptr32),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("no function at {0}")]
    UnresolvedFunction(String),

    #[error("loop analysis failed in {function} at 0x{pc:X}: {reason}")]
    LoopAnalysisFailure { function: String, pc: u32, reason: String },

    #[error(transparent)]
    Mem(#[from] MemError),

    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    Vm(#[from] VmError),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
