use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::symbol::{InstanceRef, Symbol, SymbolKind};

use super::opcode::{decode, Opcode};
use super::{ExternalHost, ScriptVm, StackValue, VarRef, VmError};

const STACK_LIMIT: usize = 2048;
const FRAME_LIMIT: usize = 512;
const DEFAULT_STEP_LIMIT: usize = 10_000_000;

/// Storage of a VM-owned instance.
///
/// Int and float members live in `storage` at their class offsets so the bytes can
/// be aliased by the host; string members are kept on the side.
#[derive(Debug)]
pub struct NativeInstance {
    pub symbol: u32,
    pub storage: Rc<RefCell<Vec<u8>>>,
    pub strings: HashMap<u32, String>,
}

/// Reference interpreter for compiled Daedalus byte-code.
///
/// IMPORTANT: the VM is single-threaded and reentrant only through
/// [`ScriptVm::call_function`]; every nested call runs to completion before the
/// caller resumes.
#[derive(Debug)]
pub struct DaedalusVm {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, u32>,
    by_address: HashMap<u32, u32>,
    code: Arc<[u8]>,

    pc: u32,
    current: u32,
    stack: Vec<StackValue>,
    /// Return addresses of the active `bl` frames.
    frames: Vec<u32>,
    /// The instance register set by `gmovi`; class members resolve against it.
    instance: InstanceRef,
    instances: Vec<NativeInstance>,
    step_limit: usize,
}

impl DaedalusVm {
    pub fn new(symbols: Vec<Symbol>, code: impl Into<Arc<[u8]>>) -> Self {
        let mut by_name = HashMap::with_capacity(symbols.len());
        let mut by_address = HashMap::new();
        for s in &symbols {
            by_name.entry(s.name.to_uppercase()).or_insert(s.index);
            if s.kind.has_code() && !s.is_external() {
                by_address.entry(s.address).or_insert(s.index);
            }
        }

        Self {
            symbols,
            by_name,
            by_address,
            code: code.into(),
            pc: 0,
            current: 0,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            instance: InstanceRef::Null,
            instances: Vec::new(),
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn set_step_limit(&mut self, limit: usize) {
        self.step_limit = limit.max(1);
    }

    pub fn current_instance(&self) -> InstanceRef {
        self.instance
    }

    pub fn set_current_instance(&mut self, instance: InstanceRef) {
        self.instance = instance;
    }

    pub fn global_int(&self, name: &str) -> Option<i32> {
        self.symbol(self.find_symbol(name)?)?.get_int(0)
    }

    pub fn set_global_int(&mut self, name: &str, value: i32) -> bool {
        match self.find_symbol(name) {
            Some(i) => self.symbols[i as usize].set_int(0, value),
            None => false,
        }
    }

    /// Find a function by name and run it.
    pub fn call_by_name(&mut self, host: &mut dyn ExternalHost, name: &str) -> Result<(), VmError> {
        let Some(index) = self.find_symbol(name) else {
            log::warn!("call_by_name: unknown function {}", name);
            return Err(VmError::NotCallable { name: name.to_string() });
        };
        self.call_function(host, index)
    }

    /// Allocate VM-owned storage for `symbol`, bind it and run its initializer.
    ///
    /// The storage size comes from the class at the root of the parent chain.
    pub fn init_instance(&mut self, host: &mut dyn ExternalHost, symbol: u32) -> Result<InstanceRef, VmError> {
        let sym = self.symbols.get(symbol as usize).ok_or(VmError::UnknownSymbol { index: symbol })?;
        if sym.kind != SymbolKind::Instance {
            return Err(VmError::NotCallable { name: sym.name.clone() });
        }
        let size = self.class_size(symbol);
        let address = sym.address;

        let id = self.instances.len() as u32;
        self.instances.push(NativeInstance {
            symbol,
            storage: Rc::new(RefCell::new(vec![0u8; size as usize])),
            strings: HashMap::new(),
        });
        let handle = InstanceRef::Native(id);
        self.symbols[symbol as usize].instance = handle;

        let saved = self.instance;
        self.instance = handle;
        let result = self.run_at(host, address);
        self.instance = saved;
        result.map(|_| handle)
    }

    fn class_size(&self, symbol: u32) -> u32 {
        let mut cursor = Some(symbol);
        let mut guard = 0;
        while let Some(i) = cursor {
            let Some(s) = self.symbols.get(i as usize) else { break };
            if s.kind == SymbolKind::Class {
                return s.offset;
            }
            cursor = s.parent;
            guard += 1;
            if guard > 16 {
                break;
            }
        }
        0
    }

    // -------------------------
    // Execution
    // -------------------------

    fn run_at(&mut self, host: &mut dyn ExternalHost, address: u32) -> Result<(), VmError> {
        let saved_pc = self.pc;
        let saved_current = self.current;
        let depth = self.frames.len();

        self.frames.push(saved_pc);
        self.pc = address;

        let mut steps = 0usize;
        let result = loop {
            if self.frames.len() <= depth {
                break Ok(());
            }
            if steps >= self.step_limit {
                break Err(VmError::StepLimit { limit: self.step_limit });
            }
            steps += 1;
            if let Err(e) = self.step(host) {
                break Err(e);
            }
        };

        if result.is_err() {
            self.frames.truncate(depth);
        }
        self.pc = saved_pc;
        self.current = saved_current;
        result
    }

    fn step(&mut self, host: &mut dyn ExternalHost) -> Result<(), VmError> {
        let ins = decode(&self.code, self.pc)?;
        self.current = ins.address;
        self.pc = ins.next();

        match ins.op {
            op if op.is_binary() => {
                let a = self.pop_int(host)?;
                let b = self.pop_int(host)?;
                let v = binary(op, a, b);
                self.push(StackValue::Int(v))?;
            }
            Opcode::Plus => {
                let a = self.pop_int(host)?;
                self.push(StackValue::Int(a))?;
            }
            Opcode::Negate => {
                let a = self.pop_int(host)?;
                self.push(StackValue::Int(a.wrapping_neg()))?;
            }
            Opcode::Not => {
                let a = self.pop_int(host)?;
                self.push(StackValue::Int((a == 0) as i32))?;
            }
            Opcode::Cmpl => {
                let a = self.pop_int(host)?;
                self.push(StackValue::Int(!a))?;
            }
            Opcode::MovI | Opcode::AddMovI | Opcode::SubMovI | Opcode::MulMovI | Opcode::DivMovI => {
                let (target, context) = self.pop_ref_with_context()?;
                let value = self.pop_int(host)?;
                let value = match ins.op {
                    Opcode::MovI => value,
                    op => {
                        let old = self.read_int(host, target, context)?;
                        match op {
                            Opcode::AddMovI => old.wrapping_add(value),
                            Opcode::SubMovI => old.wrapping_sub(value),
                            Opcode::MulMovI => old.wrapping_mul(value),
                            _ => checked_div(old, value),
                        }
                    }
                };
                self.write_int(host, target, context, value)?;
            }
            Opcode::MovF | Opcode::MovVF => {
                let (target, context) = self.pop_ref_with_context()?;
                let value = self.pop_float(host)?;
                self.write_int(host, target, context, value.to_bits() as i32)?;
            }
            Opcode::MovS | Opcode::MovSS => {
                let (target, context) = self.pop_ref_with_context()?;
                let value = self.pop_string(host)?;
                self.write_string(host, target, context, &value)?;
            }
            Opcode::MovVI => {
                let (target, _) = self.pop_ref_with_context()?;
                let value = self.pop_instance()?;
                let sym = self
                    .symbols
                    .get_mut(target.symbol as usize)
                    .ok_or(VmError::UnknownSymbol { index: target.symbol })?;
                sym.instance = value;
            }
            Opcode::Nop => {}
            Opcode::Rsr => {
                let ret = self.frames.pop().ok_or(VmError::StackUnderflow)?;
                self.pc = ret;
            }
            Opcode::Bl => {
                if let Some(&target) = self.by_address.get(&ins.operand) {
                    if self.symbols[target as usize].is_external() {
                        return host.call_external(self, target);
                    }
                }
                if self.frames.len() >= FRAME_LIMIT {
                    return Err(VmError::StackOverflow { limit: FRAME_LIMIT });
                }
                self.frames.push(self.pc);
                self.pc = ins.operand;
            }
            Opcode::Be => {
                host.call_external(self, ins.operand)?;
            }
            Opcode::PushI => self.push(StackValue::Int(ins.immediate()))?,
            Opcode::PushV | Opcode::PushVV => {
                let symbol = ins.operand;
                let trapped = self.symbols.get(symbol as usize).map(|s| s.access_trap).unwrap_or(false);
                if trapped && host.access_trap(self, symbol) {
                    return Ok(());
                }
                self.push(StackValue::Ref { symbol, index: ins.index as u32, context: self.instance })?;
            }
            Opcode::PushVI => {
                self.push(StackValue::Ref { symbol: ins.operand, index: 0, context: self.instance })?;
            }
            Opcode::B => self.pc = ins.operand,
            Opcode::Bz => {
                if self.pop_int(host)? == 0 {
                    self.pc = ins.operand;
                }
            }
            Opcode::GMovI => {
                let sym = self
                    .symbols
                    .get(ins.operand as usize)
                    .ok_or(VmError::UnknownSymbol { index: ins.operand })?;
                self.instance = sym.instance;
            }
            // Binary operators are handled by the guard arm above.
            _ => {}
        }
        Ok(())
    }

    // -------------------------
    // Stack helpers
    // -------------------------

    fn push(&mut self, v: StackValue) -> Result<(), VmError> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(VmError::StackOverflow { limit: STACK_LIMIT });
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<StackValue, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn pop_ref_with_context(&mut self) -> Result<(VarRef, InstanceRef), VmError> {
        match self.pop()? {
            StackValue::Ref { symbol, index, context } => Ok((VarRef { symbol, index }, context)),
            other => Err(VmError::NotAReference { found: other.kind_name() }),
        }
    }

    // -------------------------
    // Variable access
    // -------------------------

    fn read_int(&mut self, host: &mut dyn ExternalHost, var: VarRef, context: InstanceRef) -> Result<i32, VmError> {
        let sym = self.symbols.get(var.symbol as usize).ok_or(VmError::UnknownSymbol { index: var.symbol })?;
        if sym.is_member() {
            let offset = sym.offset + var.index * 4;
            return Ok(self.member_int(host, context, offset));
        }
        let v = match sym.kind {
            SymbolKind::Int => sym.get_int(var.index),
            SymbolKind::Float => sym.get_float(var.index).map(|f| f.to_bits() as i32),
            // Function symbols double as their own index when passed as values.
            SymbolKind::Function | SymbolKind::Prototype | SymbolKind::Instance => Some(sym.index as i32),
            _ => None,
        };
        Ok(v.unwrap_or_else(|| {
            log::warn!("read_int: {} has no int value at index {}", sym, var.index);
            0
        }))
    }

    fn write_int(
        &mut self,
        host: &mut dyn ExternalHost,
        var: VarRef,
        context: InstanceRef,
        value: i32,
    ) -> Result<(), VmError> {
        let sym = self
            .symbols
            .get_mut(var.symbol as usize)
            .ok_or(VmError::UnknownSymbol { index: var.symbol })?;
        if sym.is_member() {
            let offset = sym.offset + var.index * 4;
            self.set_member_int(host, context, offset, value);
            return Ok(());
        }
        let ok = match sym.kind {
            SymbolKind::Float => sym.set_float(var.index, f32::from_bits(value as u32)),
            _ => sym.set_int(var.index, value),
        };
        if !ok {
            log::warn!("write_int: {} rejected value at index {}", sym, var.index);
        }
        Ok(())
    }

    fn read_string(&mut self, host: &mut dyn ExternalHost, var: VarRef, context: InstanceRef) -> Result<String, VmError> {
        let sym = self.symbols.get(var.symbol as usize).ok_or(VmError::UnknownSymbol { index: var.symbol })?;
        if sym.is_member() {
            let offset = sym.offset + var.index * 20;
            return Ok(self.member_string(host, context, offset));
        }
        Ok(sym.get_string(var.index).unwrap_or_default().to_string())
    }

    fn write_string(
        &mut self,
        host: &mut dyn ExternalHost,
        var: VarRef,
        context: InstanceRef,
        value: &str,
    ) -> Result<(), VmError> {
        let sym = self
            .symbols
            .get_mut(var.symbol as usize)
            .ok_or(VmError::UnknownSymbol { index: var.symbol })?;
        if sym.is_member() {
            let offset = sym.offset + var.index * 20;
            match context {
                InstanceRef::Native(id) => {
                    if let Some(inst) = self.instances.get_mut(id as usize) {
                        inst.strings.insert(offset, value.to_string());
                    }
                }
                InstanceRef::Memory(addr) => host.write_instance_string(self, addr.wrapping_add(offset), value),
                InstanceRef::Null => log::warn!("write_string: member access without an instance"),
            }
            return Ok(());
        }
        if !sym.set_string(var.index, value) {
            log::warn!("write_string: {} rejected value at index {}", sym, var.index);
        }
        Ok(())
    }

    fn member_int(&mut self, host: &mut dyn ExternalHost, context: InstanceRef, offset: u32) -> i32 {
        match context {
            InstanceRef::Native(id) => {
                let Some(inst) = self.instances.get(id as usize) else { return 0 };
                let bytes = inst.storage.borrow();
                let at = offset as usize;
                let value = bytes.get(at..at + 4).map(LittleEndian::read_i32);
                if value.is_none() {
                    log::warn!("member read past instance end: offset={} size={}", offset, bytes.len());
                }
                value.unwrap_or(0)
            }
            InstanceRef::Memory(addr) => host.read_instance_int(&*self, addr.wrapping_add(offset)),
            InstanceRef::Null => {
                log::warn!("member read without an instance (offset={})", offset);
                0
            }
        }
    }

    fn set_member_int(&mut self, host: &mut dyn ExternalHost, context: InstanceRef, offset: u32, value: i32) {
        match context {
            InstanceRef::Native(id) => {
                let Some(inst) = self.instances.get(id as usize) else { return };
                let mut bytes = inst.storage.borrow_mut();
                let at = offset as usize;
                match bytes.get_mut(at..at + 4) {
                    Some(b) => LittleEndian::write_i32(b, value),
                    None => log::warn!("member write past instance end: offset={}", offset),
                }
            }
            InstanceRef::Memory(addr) => host.write_instance_int(self, addr.wrapping_add(offset), value),
            InstanceRef::Null => log::warn!("member write without an instance (offset={})", offset),
        }
    }

    fn member_string(&mut self, host: &mut dyn ExternalHost, context: InstanceRef, offset: u32) -> String {
        match context {
            InstanceRef::Native(id) => self
                .instances
                .get(id as usize)
                .and_then(|i| i.strings.get(&offset).cloned())
                .unwrap_or_default(),
            InstanceRef::Memory(addr) => host.read_instance_string(&*self, addr.wrapping_add(offset)),
            InstanceRef::Null => String::new(),
        }
    }
}

impl ScriptVm for DaedalusVm {
    fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    fn symbol_mut(&mut self, index: u32) -> Option<&mut Symbol> {
        self.symbols.get_mut(index as usize)
    }

    fn find_symbol(&self, name: &str) -> Option<u32> {
        self.by_name.get(&name.to_uppercase()).copied()
    }

    fn function_at(&self, address: u32) -> Option<u32> {
        self.by_address.get(&address).copied()
    }

    fn code(&self) -> &[u8] {
        &self.code
    }

    fn current_instruction(&self) -> u32 {
        self.current
    }

    fn unsafe_jump(&mut self, pc: u32) {
        self.pc = pc;
    }

    fn call_function(&mut self, host: &mut dyn ExternalHost, symbol: u32) -> Result<(), VmError> {
        let sym = self.symbols.get(symbol as usize).ok_or(VmError::UnknownSymbol { index: symbol })?;
        if sym.is_external() {
            return host.call_external(self, symbol);
        }
        if !sym.kind.has_code() {
            return Err(VmError::NotCallable { name: sym.name.clone() });
        }
        let address = sym.address;
        self.run_at(host, address)
    }

    fn push_int(&mut self, value: i32) {
        if self.push(StackValue::Int(value)).is_err() {
            log::error!("push_int: stack overflow");
        }
    }

    fn push_float(&mut self, value: f32) {
        if self.push(StackValue::Float(value)).is_err() {
            log::error!("push_float: stack overflow");
        }
    }

    fn push_string(&mut self, value: String) {
        if self.push(StackValue::Str(value)).is_err() {
            log::error!("push_string: stack overflow");
        }
    }

    fn push_instance(&mut self, value: InstanceRef) {
        if self.push(StackValue::Instance(value)).is_err() {
            log::error!("push_instance: stack overflow");
        }
    }

    fn pop_int(&mut self, host: &mut dyn ExternalHost) -> Result<i32, VmError> {
        match self.pop()? {
            StackValue::Int(v) => Ok(v),
            StackValue::Float(f) => Ok(f.to_bits() as i32),
            StackValue::Ref { symbol, index, context } => self.read_int(host, VarRef { symbol, index }, context),
            other => {
                log::warn!("pop_int: found {} on the stack", other.kind_name());
                Ok(0)
            }
        }
    }

    fn pop_float(&mut self, host: &mut dyn ExternalHost) -> Result<f32, VmError> {
        match self.pop()? {
            // Float literals are compiled as `pushi` with the raw bit pattern.
            StackValue::Int(v) => Ok(f32::from_bits(v as u32)),
            StackValue::Float(f) => Ok(f),
            StackValue::Ref { symbol, index, context } => {
                let bits = self.read_int(host, VarRef { symbol, index }, context)?;
                Ok(f32::from_bits(bits as u32))
            }
            other => {
                log::warn!("pop_float: found {} on the stack", other.kind_name());
                Ok(0.0)
            }
        }
    }

    fn pop_string(&mut self, host: &mut dyn ExternalHost) -> Result<String, VmError> {
        match self.pop()? {
            StackValue::Str(s) => Ok(s),
            StackValue::Ref { symbol, index, context } => self.read_string(host, VarRef { symbol, index }, context),
            other => {
                log::warn!("pop_string: found {} on the stack", other.kind_name());
                Ok(String::new())
            }
        }
    }

    fn pop_instance(&mut self) -> Result<InstanceRef, VmError> {
        match self.pop()? {
            StackValue::Instance(i) => Ok(i),
            StackValue::Ref { symbol, .. } => self
                .symbols
                .get(symbol as usize)
                .map(|s| s.instance)
                .ok_or(VmError::UnknownSymbol { index: symbol }),
            StackValue::Int(0) => Ok(InstanceRef::Null),
            other => Err(VmError::NotAReference { found: other.kind_name() }),
        }
    }

    fn pop_reference(&mut self) -> Result<VarRef, VmError> {
        self.pop_ref_with_context().map(|(r, _)| r)
    }

    fn pop_raw(&mut self) -> Result<StackValue, VmError> {
        self.pop()
    }

    fn stack_len(&self) -> usize {
        self.stack.len()
    }

    fn instance_storage(&self, instance: InstanceRef) -> Option<Rc<RefCell<Vec<u8>>>> {
        match instance {
            InstanceRef::Native(id) => self.instances.get(id as usize).map(|i| i.storage.clone()),
            _ => None,
        }
    }
}

fn checked_div(a: i32, b: i32) -> i32 {
    if b == 0 {
        log::warn!("division by zero");
        return 0;
    }
    a.wrapping_div(b)
}

/// `a` is the operand that was on top of the stack (the left-hand side).
fn binary(op: Opcode, a: i32, b: i32) -> i32 {
    match op {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div => checked_div(a, b),
        Opcode::Mod => {
            if b == 0 {
                log::warn!("modulo by zero");
                0
            } else {
                a.wrapping_rem(b)
            }
        }
        Opcode::Or => a | b,
        Opcode::AndB => a & b,
        Opcode::Lt => (a < b) as i32,
        Opcode::Gt => (a > b) as i32,
        Opcode::LogOr => (a != 0 || b != 0) as i32,
        Opcode::LogAnd => (a != 0 && b != 0) as i32,
        Opcode::Shl => a.wrapping_shl(b as u32),
        Opcode::Shr => a.wrapping_shr(b as u32),
        Opcode::Lte => (a <= b) as i32,
        Opcode::Eq => (a == b) as i32,
        Opcode::Neq => (a != b) as i32,
        Opcode::Gte => (a >= b) as i32,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ScriptBuilder;
    use crate::vm::NullHost;

    #[test]
    fn left_operand_is_on_top() {
        // result = 10 - 3, compiled right operand first
        let mut b = ScriptBuilder::new();
        let result = b.int_var("RESULT", 1);
        let f = b.begin_function("CALC", 0, false);
        b.code().push_i(3).push_i(10).op(Opcode::Sub).push_v(result).op(Opcode::MovI).rsr();
        b.end_function(f);
        let mut vm = b.into_vm();

        vm.call_by_name(&mut NullHost, "calc").unwrap();
        assert_eq!(vm.global_int("RESULT"), Some(7));
    }

    #[test]
    fn bz_skips_when_zero() {
        let mut b = ScriptBuilder::new();
        let out = b.int_var("OUT", 1);
        let f = b.begin_function("BRANCH", 0, false);
        let skip = b.code().push_i(0).bz_forward();
        b.code().push_i(1).push_v(out).op(Opcode::MovI);
        b.code().bind(skip);
        b.code().rsr();
        b.end_function(f);
        let mut vm = b.into_vm();

        vm.call_by_name(&mut NullHost, "branch").unwrap();
        assert_eq!(vm.global_int("OUT"), Some(0));
    }

    #[test]
    fn nested_call_returns_value_on_stack() {
        let mut b = ScriptBuilder::new();
        let out = b.int_var("OUT", 1);
        let five = b.begin_function("FIVE", 0, true);
        b.code().push_i(5).rsr();
        b.end_function(five);
        let main = b.begin_function("MAIN", 0, false);
        let five_addr = b.symbol_address(five);
        b.code().bl(five_addr).push_v(out).op(Opcode::MovI).rsr();
        b.end_function(main);
        let mut vm = b.into_vm();

        vm.call_by_name(&mut NullHost, "main").unwrap();
        assert_eq!(vm.global_int("OUT"), Some(5));
        assert_eq!(vm.stack_len(), 0);
    }

    #[test]
    fn endless_loop_hits_step_limit() {
        let mut b = ScriptBuilder::new();
        let f = b.begin_function("SPIN", 0, false);
        let start = b.code().offset();
        b.code().b(start);
        b.end_function(f);
        let mut vm = b.into_vm();
        vm.set_step_limit(100);

        let err = vm.call_by_name(&mut NullHost, "spin").unwrap_err();
        assert_eq!(err, VmError::StepLimit { limit: 100 });
    }

    #[test]
    fn native_instance_members_live_in_storage() {
        let mut b = ScriptBuilder::new();
        let class = b.class("C_ITEM", 8);
        let value = b.member(class, "C_ITEM.VALUE", SymbolKind::Int, 4);
        let inst = b.begin_instance("ITEM_GOLD", class);
        b.code().push_i(25).push_v(value).op(Opcode::MovI).rsr();
        b.end_function(inst);
        let mut vm = b.into_vm();

        let handle = vm.init_instance(&mut NullHost, inst).unwrap();
        let storage = vm.instance_storage(handle).unwrap();
        assert_eq!(LittleEndian::read_i32(&storage.borrow()[4..8]), 25);
    }
}
