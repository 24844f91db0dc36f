//! Interpreter for the x86 trampolines injected by legacy script extensions.
//!
//! Only the handful of encodings the known mod toolchains emit are understood.
//! Calls do not run machine code: a call target must be a registered
//! [`NativeHandler`], which receives its arguments popped off the emulated stack.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::mem32::{Mem32, Ptr32};
use crate::trace;

/// Call target that resolves library imports; calling it is a silent no-op returning 0.
pub const DLL_STUB: Ptr32 = Ptr32(0x7FFF_F000);

/// Logical value of `esp` when the stack is empty.
const STACK_TOP: u32 = 0x7FFE_0000;
const DEFAULT_MAX_STEPS: usize = 100_000;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CpuError {
    #[error("unknown instruction {bytes:02X?} at +0x{pc:X}")]
    UnknownInstruction { pc: usize, bytes: Vec<u8> },

    #[error("instruction at +0x{pc:X} runs past the end of the code")]
    Truncated { pc: usize },

    #[error("step limit of {limit} exceeded")]
    StepLimit { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    Stdcall,
    /// `ecx` is passed as the implicit first argument.
    Thiscall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Ptr,
    /// A pointer to a zString record, passed on as its bytes.
    Str,
    Float,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NativeArg {
    Int(i32),
    Ptr(Ptr32),
    Str(Vec<u8>),
    Float(f32),
}

impl NativeArg {
    pub fn as_int(&self) -> i32 {
        match self {
            NativeArg::Int(v) => *v,
            NativeArg::Ptr(p) => p.to_script(),
            NativeArg::Float(f) => f.to_bits() as i32,
            NativeArg::Str(_) => 0,
        }
    }

    pub fn as_ptr(&self) -> Ptr32 {
        Ptr32(self.as_int() as u32)
    }

    pub fn as_f32(&self) -> f32 {
        match self {
            NativeArg::Float(f) => *f,
            other => f32::from_bits(other.as_int() as u32),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            NativeArg::Str(b) => b,
            _ => &[],
        }
    }
}

/// What native handlers can reach while the interpreter runs.
pub trait CpuHost {
    fn mem(&mut self) -> &mut Mem32;

    /// Index of a script symbol by (raw, case-insensitive) name.
    fn find_symbol(&mut self, _name: &[u8]) -> Option<u32> {
        None
    }

    /// Address of the symbol's shadow record.
    fn symbol_address(&mut self, _index: u32) -> Ptr32 {
        Ptr32::BAD
    }

    /// Run a script function; returns its int result if it has one.
    fn call_script(&mut self, _index: u32) -> Option<i32> {
        None
    }
}

pub type HandlerFn = Box<dyn FnMut(&mut dyn CpuHost, &[NativeArg]) -> Option<u32>>;

pub struct NativeHandler {
    pub name: String,
    pub conv: CallConv,
    pub params: Vec<ArgKind>,
    func: HandlerFn,
}

impl fmt::Debug for NativeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandler")
            .field("name", &self.name)
            .field("conv", &self.conv)
            .field("params", &self.params)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// `retn`, `retn imm16` or a tail call.
    Returned,
    /// The cursor ran off the end of the span.
    EndOfSpan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reg {
    Eax,
    Ecx,
    Edx,
}

pub struct Cpu32 {
    regs: Registers,
    stack: Vec<u32>,
    handlers: BTreeMap<u32, NativeHandler>,
    max_steps: usize,
    logged_opcodes: HashSet<u8>,
    logged_targets: HashSet<u32>,
}

impl Default for Cpu32 {
    fn default() -> Self {
        Self {
            regs: Registers { esp: STACK_TOP, ..Registers::default() },
            stack: Vec::new(),
            handlers: BTreeMap::new(),
            max_steps: DEFAULT_MAX_STEPS,
            logged_opcodes: HashSet::new(),
            logged_targets: HashSet::new(),
        }
    }
}

impl fmt::Debug for Cpu32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu32")
            .field("regs", &self.regs)
            .field("stack", &self.stack)
            .field("handlers", &self.handlers.values().map(|h| h.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

fn imm32(code: &[u8], at: usize, pc: usize) -> Result<u32, CpuError> {
    code.get(at..at + 4).map(LittleEndian::read_u32).ok_or(CpuError::Truncated { pc })
}

impl Cpu32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_max_steps(&mut self, steps: usize) {
        self.max_steps = steps.max(1);
    }

    pub fn registers(&self) -> Registers {
        self.regs
    }

    pub fn set_registers(&mut self, regs: Registers) {
        self.regs = regs;
    }

    pub fn stack(&self) -> &[u32] {
        &self.stack
    }

    pub fn push(&mut self, v: u32) {
        self.stack.push(v);
        self.sync_esp();
    }

    pub fn handler(&self, address: Ptr32) -> Option<&NativeHandler> {
        self.handlers.get(&address.0)
    }

    pub fn register(
        &mut self,
        address: Ptr32,
        name: &str,
        conv: CallConv,
        params: &[ArgKind],
        func: impl FnMut(&mut dyn CpuHost, &[NativeArg]) -> Option<u32> + 'static,
    ) {
        let handler = NativeHandler { name: name.to_string(), conv, params: params.to_vec(), func: Box::new(func) };
        if let Some(old) = self.handlers.insert(address.0, handler) {
            log::warn!("native handler {} at {} replaced", old.name, address);
        }
    }

    fn sync_esp(&mut self) {
        self.regs.esp = STACK_TOP.wrapping_sub(4 * self.stack.len() as u32);
    }

    fn reg(&mut self, r: Reg) -> &mut u32 {
        match r {
            Reg::Eax => &mut self.regs.eax,
            Reg::Ecx => &mut self.regs.ecx,
            Reg::Edx => &mut self.regs.edx,
        }
    }

    /// Pop one value. An empty stack reads as 0.
    fn pop(&mut self, pc: usize) -> u32 {
        let v = match self.stack.pop() {
            Some(v) => v,
            None => {
                log::warn!("cpu32: stack underflow at +0x{:X}, reading 0", pc);
                0
            }
        };
        self.sync_esp();
        v
    }

    /// Stack slot addressed by `[esp+disp]`.
    fn esp_slot(&mut self, disp: u8, pc: usize) -> Option<&mut u32> {
        let depth = disp as usize / 4;
        let len = self.stack.len();
        if disp as i8 as i32 % 4 != 0 || (disp as i8) < 0 || depth >= len {
            log::warn!("cpu32: [esp+0x{:X}] outside the stack at +0x{:X}", disp, pc);
            return None;
        }
        Some(&mut self.stack[len - 1 - depth])
    }

    fn log_unimplemented(&mut self, op: u8, name: &str) {
        if self.logged_opcodes.insert(op) {
            log::warn!("cpu32: unimplemented instruction {} (0x{:02X}) ignored", name, op);
        }
    }

    /// Run `code`, whose first byte sits at logical address `base`.
    ///
    /// The operand stack is cleared first; registers carry over from earlier calls.
    pub fn exec(&mut self, host: &mut dyn CpuHost, base: Ptr32, code: &[u8]) -> Result<ExecOutcome, CpuError> {
        self.stack.clear();
        self.sync_esp();

        let mut pc = 0usize;
        let mut steps = 0usize;
        while pc < code.len() {
            if steps >= self.max_steps {
                return Err(CpuError::StepLimit { limit: self.max_steps });
            }
            steps += 1;

            let step = match self.step1(host, base, code, pc)? {
                Some(s) => s,
                None => match self.step2(host, code, pc)? {
                    Some(s) => s,
                    None => match self.step3(code, pc)? {
                        Some(s) => s,
                        None => {
                            let bytes = code[pc..code.len().min(pc + 3)].to_vec();
                            log::error!("cpu32: unknown instruction {:02X?} at {}", bytes, base.offset(pc as u32));
                            return Err(CpuError::UnknownInstruction { pc, bytes });
                        }
                    },
                },
            };

            match step {
                Step::Next(len) => pc += len,
                Step::Jump(to) => pc = to,
                Step::Return => return Ok(ExecOutcome::Returned),
            }
        }
        Ok(ExecOutcome::EndOfSpan)
    }

    fn step1(&mut self, host: &mut dyn CpuHost, base: Ptr32, code: &[u8], pc: usize) -> Result<Option<Step>, CpuError> {
        let op = code[pc];
        let step = match op {
            0x50 => {
                self.push(self.regs.eax);
                Step::Next(1)
            }
            0x51 => {
                self.push(self.regs.ecx);
                Step::Next(1)
            }
            0x52 => {
                self.push(self.regs.edx);
                Step::Next(1)
            }
            0x58 | 0x59 | 0x5A => {
                let v = self.pop(pc);
                let r = match op {
                    0x58 => Reg::Eax,
                    0x59 => Reg::Ecx,
                    _ => Reg::Edx,
                };
                *self.reg(r) = v;
                Step::Next(1)
            }
            0x68 => {
                let v = imm32(code, pc + 1, pc)?;
                self.push(v);
                Step::Next(5)
            }
            0x6A => {
                let v = *code.get(pc + 1).ok_or(CpuError::Truncated { pc })? as i8 as i32 as u32;
                self.push(v);
                Step::Next(2)
            }
            0xB8 | 0xB9 | 0xBA => {
                let v = imm32(code, pc + 1, pc)?;
                let r = match op {
                    0xB8 => Reg::Eax,
                    0xB9 => Reg::Ecx,
                    _ => Reg::Edx,
                };
                *self.reg(r) = v;
                Step::Next(5)
            }
            0xA1 => {
                let at = Ptr32(imm32(code, pc + 1, pc)?);
                self.regs.eax = host.mem().read_u32(at);
                Step::Next(5)
            }
            0xA3 => {
                let at = Ptr32(imm32(code, pc + 1, pc)?);
                let v = self.regs.eax as i32;
                host.mem().write_int(at, v);
                Step::Next(5)
            }
            0xE8 => {
                let rel = imm32(code, pc + 1, pc)?;
                let target = base.0.wrapping_add(pc as u32).wrapping_add(rel).wrapping_add(5);
                self.call(host, Ptr32(target), pc)?;
                Step::Next(5)
            }
            0xE9 => {
                let rel = imm32(code, pc + 1, pc)? as i32;
                let dest = pc as i64 + 5 + rel as i64;
                if dest >= 0 && (dest as usize) < code.len() {
                    Step::Jump(dest as usize)
                } else {
                    let target = base.0.wrapping_add(dest as u32);
                    self.call(host, Ptr32(target), pc)?;
                    Step::Return
                }
            }
            0xC3 => Step::Return,
            0xC2 => {
                let n = code.get(pc + 1..pc + 3).map(LittleEndian::read_u16).ok_or(CpuError::Truncated { pc })?;
                for _ in 0..n / 4 {
                    if self.stack.pop().is_none() {
                        break;
                    }
                }
                self.sync_esp();
                Step::Return
            }
            0x90 => Step::Next(1),
            0x60 => {
                self.log_unimplemented(op, "pushad");
                Step::Next(1)
            }
            0x61 => {
                self.log_unimplemented(op, "popad");
                Step::Next(1)
            }
            0x9C => {
                self.log_unimplemented(op, "pushfd");
                Step::Next(1)
            }
            0x9D => {
                self.log_unimplemented(op, "popfd");
                Step::Next(1)
            }
            0x56 | 0x57 => {
                self.log_unimplemented(op, "push esi/edi");
                Step::Next(1)
            }
            0x5E | 0x5F => {
                self.log_unimplemented(op, "pop esi/edi");
                Step::Next(1)
            }
            0xCC => {
                self.log_unimplemented(op, "int3");
                Step::Next(1)
            }
            _ => return Ok(None),
        };
        Ok(Some(step))
    }

    fn step2(&mut self, host: &mut dyn CpuHost, code: &[u8], pc: usize) -> Result<Option<Step>, CpuError> {
        let Some(&modrm) = code.get(pc + 1) else { return Ok(None) };
        let step = match (code[pc], modrm) {
            (0x8B, 0x05 | 0x0D | 0x15) => {
                let at = Ptr32(imm32(code, pc + 2, pc)?);
                let v = host.mem().read_u32(at);
                let r = match modrm {
                    0x05 => Reg::Eax,
                    0x0D => Reg::Ecx,
                    _ => Reg::Edx,
                };
                *self.reg(r) = v;
                Step::Next(6)
            }
            (0x89, 0x05 | 0x0D | 0x15) => {
                let at = Ptr32(imm32(code, pc + 2, pc)?);
                let r = match modrm {
                    0x05 => Reg::Eax,
                    0x0D => Reg::Ecx,
                    _ => Reg::Edx,
                };
                let v = *self.reg(r) as i32;
                host.mem().write_int(at, v);
                Step::Next(6)
            }
            // mov ecx, eax
            (0x8B, 0xC8) | (0x89, 0xC1) => {
                self.regs.ecx = self.regs.eax;
                Step::Next(2)
            }
            // mov eax, ecx
            (0x8B, 0xC1) => {
                self.regs.eax = self.regs.ecx;
                Step::Next(2)
            }
            (0xFF, 0x15) => {
                let cell = Ptr32(imm32(code, pc + 2, pc)?);
                let target = host.mem().read_ptr(cell);
                self.call(host, target, pc)?;
                Step::Next(6)
            }
            (0xFF, 0xD0) => {
                let target = Ptr32(self.regs.eax);
                self.call(host, target, pc)?;
                Step::Next(2)
            }
            (0x83, 0xC4) => {
                let n = *code.get(pc + 2).ok_or(CpuError::Truncated { pc })? as i8;
                if n >= 0 {
                    for _ in 0..n / 4 {
                        self.pop(pc);
                    }
                } else {
                    for _ in 0..(-(n as i32)) / 4 {
                        self.push(0);
                    }
                }
                Step::Next(3)
            }
            (0x31 | 0x33, 0xC0) => {
                self.regs.eax = 0;
                Step::Next(2)
            }
            _ => return Ok(None),
        };
        Ok(Some(step))
    }

    fn step3(&mut self, code: &[u8], pc: usize) -> Result<Option<Step>, CpuError> {
        let Some(bytes) = code.get(pc..pc + 3) else { return Ok(None) };
        let key = (bytes[0], bytes[1], bytes[2]);
        if !matches!(key, (0x89, 0x44, 0x24) | (0x8B, 0x44, 0x24) | (0x8B, 0x4C, 0x24) | (0xFF, 0x74, 0x24)) {
            return Ok(None);
        }
        let disp = *code.get(pc + 3).ok_or(CpuError::Truncated { pc })?;
        match key {
            (0x89, 0x44, 0x24) => {
                let eax = self.regs.eax;
                if let Some(slot) = self.esp_slot(disp, pc) {
                    *slot = eax;
                }
            }
            (0x8B, 0x44, 0x24) => {
                self.regs.eax = self.esp_slot(disp, pc).map(|v| *v).unwrap_or(0);
            }
            (0x8B, 0x4C, 0x24) => {
                self.regs.ecx = self.esp_slot(disp, pc).map(|v| *v).unwrap_or(0);
            }
            _ => {
                let v = self.esp_slot(disp, pc).map(|v| *v).unwrap_or(0);
                self.push(v);
            }
        }
        Ok(Some(Step::Next(4)))
    }

    fn call(&mut self, host: &mut dyn CpuHost, target: Ptr32, pc: usize) -> Result<(), CpuError> {
        if target == DLL_STUB {
            self.regs.eax = 0;
            return Ok(());
        }
        let Some(handler) = self.handlers.get_mut(&target.0) else {
            if self.logged_targets.insert(target.0) {
                log::warn!("cpu32: call to unregistered address {} ignored", target);
            }
            return Ok(());
        };

        let mut args = Vec::with_capacity(handler.params.len() + 1);
        if handler.conv == CallConv::Thiscall {
            args.push(NativeArg::Ptr(Ptr32(self.regs.ecx)));
        }
        for kind in &handler.params {
            let raw = match self.stack.pop() {
                Some(v) => v,
                None => {
                    log::warn!("cpu32: {} called at +0x{:X} with too few arguments, passing 0", handler.name, pc);
                    0
                }
            };
            args.push(match kind {
                ArgKind::Int => NativeArg::Int(raw as i32),
                ArgKind::Ptr => NativeArg::Ptr(Ptr32(raw)),
                ArgKind::Float => NativeArg::Float(f32::from_bits(raw)),
                ArgKind::Str => NativeArg::Str(host.mem().read_zstring(Ptr32(raw))),
            });
        }
        self.regs.esp = STACK_TOP.wrapping_sub(4 * self.stack.len() as u32);

        trace::cpu(format_args!("cpu32: call {} ({}) args={:?}", handler.name, target, args));
        if let Some(ret) = (handler.func)(host, &args) {
            self.regs.eax = ret;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Next(usize),
    Jump(usize),
    Return,
}
