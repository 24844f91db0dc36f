//! Script VM interface.
//!
//! The compatibility layer talks to the script VM only through [`ScriptVm`], and the
//! VM calls back into its embedder only through [`ExternalHost`]. [`DaedalusVm`] is
//! the in-tree implementation used by the tools and the tests.

mod daedalus;
pub mod opcode;

use std::cell::RefCell;
use std::rc::Rc;

pub use daedalus::{DaedalusVm, NativeInstance};
pub use opcode::{decode, decode_range, Instruction, Opcode};

use crate::symbol::{InstanceRef, Symbol, SymbolFlags};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum VmError {
    #[error("pc out of range: pc=0x{pc:X}, code_len=0x{len:X}")]
    PcOutOfRange { pc: u32, len: u32 },

    #[error("invalid opcode: 0x{opcode:02X} at pc=0x{pc:X}")]
    InvalidOpcode { opcode: u8, pc: u32 },

    #[error("stack underflow")]
    StackUnderflow,

    #[error("stack overflow (limit={limit})")]
    StackOverflow { limit: usize },

    #[error("expected a reference on the stack, found {found}")]
    NotAReference { found: &'static str },

    #[error("unknown symbol index {index}")]
    UnknownSymbol { index: u32 },

    #[error("symbol {name} is not callable")]
    NotCallable { name: String },

    #[error("no handler for external {name}")]
    UnboundExternal { name: String },

    #[error("step limit of {limit} exceeded")]
    StepLimit { limit: usize },
}

/// A value on the VM operand stack.
#[derive(Debug, Clone, PartialEq)]
pub enum StackValue {
    Int(i32),
    Float(f32),
    Str(String),
    Instance(InstanceRef),
    /// A symbol reference, optionally bound to the instance that was current
    /// when a class member was pushed.
    Ref { symbol: u32, index: u32, context: InstanceRef },
}

impl StackValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StackValue::Int(_) => "int",
            StackValue::Float(_) => "float",
            StackValue::Str(_) => "string",
            StackValue::Instance(_) => "instance",
            StackValue::Ref { .. } => "reference",
        }
    }
}

/// A resolved `var` argument: symbol plus array index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarRef {
    pub symbol: u32,
    pub index: u32,
}

/// Callbacks from the VM into its embedder.
pub trait ExternalHost {
    /// Dispatch an external function. Arguments are on the VM stack, last argument on top.
    fn call_external(&mut self, vm: &mut dyn ScriptVm, symbol: u32) -> Result<(), VmError>;

    /// Called when a symbol with `access_trap` is pushed. Return `true` if the host
    /// redirected control flow and the push must be skipped.
    fn access_trap(&mut self, _vm: &mut dyn ScriptVm, _symbol: u32) -> bool {
        false
    }

    /// Member read on a memory-backed instance; `address` already includes the member offset.
    fn read_instance_int(&mut self, _vm: &dyn ScriptVm, _address: u32) -> i32 {
        0
    }

    fn write_instance_int(&mut self, _vm: &mut dyn ScriptVm, _address: u32, _value: i32) {}

    fn read_instance_string(&mut self, _vm: &dyn ScriptVm, _address: u32) -> String {
        String::new()
    }

    fn write_instance_string(&mut self, _vm: &mut dyn ScriptVm, _address: u32, _value: &str) {}
}

/// A host that only knows how to fail externals. Useful for running pure script code.
#[derive(Debug, Default)]
pub struct NullHost;

impl ExternalHost for NullHost {
    fn call_external(&mut self, vm: &mut dyn ScriptVm, symbol: u32) -> Result<(), VmError> {
        let name = vm.symbol(symbol).map(|s| s.name.clone()).unwrap_or_default();
        Err(VmError::UnboundExternal { name })
    }
}

/// What the compatibility layer needs from a script VM.
pub trait ScriptVm {
    fn symbols(&self) -> &[Symbol];

    fn symbol(&self, index: u32) -> Option<&Symbol> {
        self.symbols().get(index as usize)
    }

    fn symbol_mut(&mut self, index: u32) -> Option<&mut Symbol>;

    /// Case-insensitive lookup.
    fn find_symbol(&self, name: &str) -> Option<u32>;

    /// The function, prototype or instance symbol whose code starts at `address`.
    fn function_at(&self, address: u32) -> Option<u32>;

    fn code(&self) -> &[u8];

    /// Address of the instruction currently executing.
    fn current_instruction(&self) -> u32;

    /// Continue execution at `pc` once the current instruction completes.
    fn unsafe_jump(&mut self, pc: u32);

    /// Route calls to `symbol` through [`ExternalHost::call_external`], also for
    /// script-defined functions reached with `bl`.
    fn override_function(&mut self, symbol: u32) -> bool {
        match self.symbol_mut(symbol) {
            Some(s) if s.kind.has_code() => {
                s.flags |= SymbolFlags::EXTERNAL;
                true
            }
            _ => false,
        }
    }

    /// Run a function to completion. Arguments must already be on the stack.
    fn call_function(&mut self, host: &mut dyn ExternalHost, symbol: u32) -> Result<(), VmError>;

    fn push_int(&mut self, value: i32);
    fn push_float(&mut self, value: f32);
    fn push_string(&mut self, value: String);
    fn push_instance(&mut self, value: InstanceRef);

    fn pop_int(&mut self, host: &mut dyn ExternalHost) -> Result<i32, VmError>;
    fn pop_float(&mut self, host: &mut dyn ExternalHost) -> Result<f32, VmError>;
    fn pop_string(&mut self, host: &mut dyn ExternalHost) -> Result<String, VmError>;
    fn pop_instance(&mut self) -> Result<InstanceRef, VmError>;
    fn pop_reference(&mut self) -> Result<VarRef, VmError>;
    /// Pop the top value without dereferencing it.
    fn pop_raw(&mut self) -> Result<StackValue, VmError>;

    fn stack_len(&self) -> usize;

    /// Byte storage of a VM-owned instance, shared so the host can alias it.
    fn instance_storage(&self, instance: InstanceRef) -> Option<Rc<RefCell<Vec<u8>>>>;
}
