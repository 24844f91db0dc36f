//! Programmatic construction of script images.
//!
//! Used by the tests of this workspace and by tools that synthesize small
//! snippets; real mods are loaded with [`crate::dat::DatFile`].

use crate::symbol::{Symbol, SymbolFlags, SymbolKind};
use crate::vm::{DaedalusVm, Opcode};

/// A forward branch whose target has not been bound yet.
#[derive(Debug)]
#[must_use]
pub struct Label {
    /// Position of the u32 target operand in the buffer.
    operand_pos: usize,
}

/// Emits Daedalus byte-code.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    buf: Vec<u8>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current byte offset in the code stream.
    pub fn offset(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_with(&mut self, op: Opcode, operand: u32) -> &mut Self {
        self.buf.push(op as u8);
        self.emit_u32(operand);
        self
    }

    /// Any single-byte instruction.
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        debug_assert_eq!(op.size(), 1, "{} takes an operand", op.mnemonic());
        self.buf.push(op as u8);
        self
    }

    pub fn push_i(&mut self, value: i32) -> &mut Self {
        self.emit_with(Opcode::PushI, value as u32)
    }

    pub fn push_v(&mut self, symbol: u32) -> &mut Self {
        self.emit_with(Opcode::PushV, symbol)
    }

    pub fn push_vi(&mut self, symbol: u32) -> &mut Self {
        self.emit_with(Opcode::PushVI, symbol)
    }

    pub fn push_vv(&mut self, symbol: u32, index: u8) -> &mut Self {
        self.emit_with(Opcode::PushVV, symbol);
        self.buf.push(index);
        self
    }

    pub fn be(&mut self, symbol: u32) -> &mut Self {
        self.emit_with(Opcode::Be, symbol)
    }

    pub fn bl(&mut self, address: u32) -> &mut Self {
        self.emit_with(Opcode::Bl, address)
    }

    pub fn b(&mut self, address: u32) -> &mut Self {
        self.emit_with(Opcode::B, address)
    }

    pub fn bz(&mut self, address: u32) -> &mut Self {
        self.emit_with(Opcode::Bz, address)
    }

    pub fn gmovi(&mut self, symbol: u32) -> &mut Self {
        self.emit_with(Opcode::GMovI, symbol)
    }

    pub fn rsr(&mut self) -> &mut Self {
        self.op(Opcode::Rsr)
    }

    /// `b` to a label bound later.
    pub fn b_forward(&mut self) -> Label {
        self.emit_with(Opcode::B, 0);
        Label { operand_pos: self.buf.len() - 4 }
    }

    /// `bz` to a label bound later.
    pub fn bz_forward(&mut self) -> Label {
        self.emit_with(Opcode::Bz, 0);
        Label { operand_pos: self.buf.len() - 4 }
    }

    /// Resolve `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        let target = self.offset().to_le_bytes();
        self.buf[label.operand_pos..label.operand_pos + 4].copy_from_slice(&target);
    }
}

/// Builds a symbol table together with its code.
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    symbols: Vec<Symbol>,
    code: CodeBuilder,
    open: Option<u32>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(&mut self) -> &mut CodeBuilder {
        &mut self.code
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn symbol_mut(&mut self, index: u32) -> &mut Symbol {
        &mut self.symbols[index as usize]
    }

    pub fn symbol_address(&self, index: u32) -> u32 {
        self.symbols[index as usize].address
    }

    /// Append a raw symbol; its index is overwritten.
    pub fn add(&mut self, mut symbol: Symbol) -> u32 {
        let index = self.symbols.len() as u32;
        symbol.index = index;
        self.symbols.push(symbol);
        index
    }

    pub fn int_var(&mut self, name: &str, count: u32) -> u32 {
        self.add(Symbol::new(0, name, SymbolKind::Int, count))
    }

    pub fn float_var(&mut self, name: &str, count: u32) -> u32 {
        self.add(Symbol::new(0, name, SymbolKind::Float, count))
    }

    pub fn string_var(&mut self, name: &str, count: u32) -> u32 {
        self.add(Symbol::new(0, name, SymbolKind::String, count))
    }

    pub fn int_const(&mut self, name: &str, value: i32) -> u32 {
        let mut s = Symbol::new(0, name, SymbolKind::Int, 1);
        s.flags |= SymbolFlags::CONST;
        s.set_int(0, value);
        self.add(s)
    }

    /// An instance variable not bound to any code (e.g. `var C_NPC hero`).
    pub fn instance_var(&mut self, name: &str, class: Option<u32>) -> u32 {
        let mut s = Symbol::new(0, name, SymbolKind::Instance, 0);
        s.parent = class;
        self.add(s)
    }

    /// A host function with `params` arguments.
    pub fn external(&mut self, name: &str, params: u32, returns: bool) -> u32 {
        let mut s = Symbol::new(0, name, SymbolKind::Function, params);
        s.flags |= SymbolFlags::CONST | SymbolFlags::EXTERNAL;
        if returns {
            s.flags |= SymbolFlags::RETURN;
        }
        self.add(s)
    }

    pub fn class(&mut self, name: &str, size: u32) -> u32 {
        let mut s = Symbol::new(0, name, SymbolKind::Class, 0);
        s.offset = size;
        self.add(s)
    }

    pub fn member(&mut self, class: u32, name: &str, kind: SymbolKind, offset: u32) -> u32 {
        let mut s = Symbol::new(0, name, kind, 1);
        s.flags |= SymbolFlags::CLASS_VAR;
        s.offset = offset;
        s.parent = Some(class);
        self.symbols[class as usize].count += 1;
        self.add(s)
    }

    /// Start a script function at the current code offset.
    pub fn begin_function(&mut self, name: &str, params: u32, returns: bool) -> u32 {
        let mut s = Symbol::new(0, name, SymbolKind::Function, params);
        s.flags |= SymbolFlags::CONST;
        if returns {
            s.flags |= SymbolFlags::RETURN;
        }
        self.begin_code(s)
    }

    /// Start the initializer of an instance of `class`.
    pub fn begin_instance(&mut self, name: &str, class: u32) -> u32 {
        let mut s = Symbol::new(0, name, SymbolKind::Instance, 0);
        s.parent = Some(class);
        self.begin_code(s)
    }

    fn begin_code(&mut self, mut symbol: Symbol) -> u32 {
        debug_assert!(self.open.is_none(), "nested function definitions");
        symbol.address = self.code.offset();
        let index = self.add(symbol);
        self.open = Some(index);
        index
    }

    pub fn end_function(&mut self, index: u32) {
        debug_assert_eq!(self.open, Some(index));
        self.open = None;
    }

    pub fn into_parts(self) -> (Vec<Symbol>, Vec<u8>) {
        (self.symbols, self.code.into_bytes())
    }

    pub fn into_vm(self) -> DaedalusVm {
        let (symbols, code) = self.into_parts();
        DaedalusVm::new(symbols, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::decode_range;

    #[test]
    fn forward_labels_patch_the_operand() {
        let mut c = CodeBuilder::new();
        let l = c.push_i(1).bz_forward();
        c.push_i(2);
        c.bind(l);
        c.rsr();

        let ins = decode_range(c.as_bytes(), 0, c.offset()).unwrap();
        assert_eq!(ins[1].op, Opcode::Bz);
        assert_eq!(ins[1].operand, 15);
        assert_eq!(ins[3].address, 15);
    }

    #[test]
    fn members_extend_their_class() {
        let mut b = ScriptBuilder::new();
        let c = b.class("C_NPC", 16);
        b.member(c, "C_NPC.ID", SymbolKind::Int, 0);
        b.member(c, "C_NPC.NAME", SymbolKind::String, 4);
        assert_eq!(b.symbols()[c as usize].count, 2);
        assert!(b.symbols()[2].is_member());
    }
}
