//! Byte projection of the script symbol table.
//!
//! Every symbol owns a 60-byte `zCPar_Symbol` record and, for variables, a data slot
//! in the variable region. Neither is a source of truth: the bytes are rewritten
//! from the live VM symbol right before they are read, and writes are forwarded to
//! the VM where legacy code is known to mutate them.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use rgothic_script::nls::TextDecoder;
use rgothic_script::vm::ScriptVm;
use rgothic_script::{Symbol, SymbolKind};

use crate::error::Result;
use crate::mem32::{Mem32, Ptr32, ZSTRING_LEN, ZSTRING_PTR, ZSTRING_RES, ZSTRING_SIZE};
use crate::trace;

use super::pins::{parser, PARSER};
use super::DirectMemory;

pub const RECORD_SIZE: u32 = 60;

/// `zCPar_Symbol` field offsets.
pub mod field {
    pub const NAME: u32 = 0;
    pub const NEXT: u32 = 20;
    pub const CONTENT: u32 = 24;
    pub const OFFSET: u32 = 28;
    pub const BITFIELD: u32 = 32;
    pub const FILE_INDEX: u32 = 36;
    pub const LINE: u32 = 40;
    pub const PARENT: u32 = 56;
}

/// Where an address landed inside the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowHit {
    Record { symbol: u32, field: u32 },
    /// `byte` is the offset inside element `index` of the symbol's data slot.
    Var { symbol: u32, index: u32, byte: u32 },
}

#[derive(Debug)]
pub struct SymbolShadow {
    records: Ptr32,
    count: u32,
    pointer_array: Option<Ptr32>,
    vars: Ptr32,
    vars_size: u32,
    /// `(offset, symbol)` sorted by offset.
    var_slots: Vec<(u32, u32)>,
    var_offset: HashMap<u32, u32>,
    names: HashMap<u32, Ptr32>,
    /// Character buffer currently published for a string element.
    strings: HashMap<(u32, u32), (Ptr32, Vec<u8>)>,
}

fn elem_size(kind: SymbolKind) -> Option<u32> {
    match kind {
        SymbolKind::Int | SymbolKind::Float => Some(4),
        SymbolKind::String => Some(ZSTRING_SIZE),
        SymbolKind::Instance => Some(4),
        _ => None,
    }
}

fn slot_size(sym: &Symbol) -> Option<u32> {
    if sym.is_member() {
        return None;
    }
    let elem = elem_size(sym.kind)?;
    let count = if sym.kind == SymbolKind::Instance { 1 } else { sym.count.max(1) };
    Some(elem * count)
}

impl SymbolShadow {
    /// Reserve the record block and the variable region for `symbols`.
    pub fn new(mem: &mut Mem32, symbols: &[Symbol]) -> Result<Self> {
        let count = symbols.len() as u32;
        let records = mem.alloc((count * RECORD_SIZE).max(RECORD_SIZE), "symbol records")?;

        let mut var_slots = Vec::new();
        let mut var_offset = HashMap::new();
        let mut size = 0u32;
        for sym in symbols {
            if let Some(n) = slot_size(sym) {
                var_slots.push((size, sym.index));
                var_offset.insert(sym.index, size);
                size += n;
            }
        }
        let vars = mem.alloc(size.max(4), "symbol variables")?;
        log::debug!("symbol shadow: {} records at {}, 0x{:X} variable bytes at {}", count, records, size, vars);

        Ok(Self {
            records,
            count,
            pointer_array: None,
            vars,
            vars_size: size,
            var_slots,
            var_offset,
            names: HashMap::new(),
            strings: HashMap::new(),
        })
    }

    pub fn record_address(&self, symbol: u32) -> Option<Ptr32> {
        (symbol < self.count).then(|| self.records.offset(symbol * RECORD_SIZE))
    }

    /// Address of element `index` of the symbol's data slot.
    pub fn var_address(&self, sym: &Symbol, index: u32) -> Option<Ptr32> {
        let base = *self.var_offset.get(&sym.index)?;
        let elem = elem_size(sym.kind)?;
        let count = if sym.kind == SymbolKind::Instance { 1 } else { sym.count.max(1) };
        (index < count).then(|| self.vars.offset(base + index * elem))
    }

    pub fn is_materialized(&self) -> bool {
        self.pointer_array.is_some()
    }

    /// Whether `[address, address+len)` touches any symbol record.
    pub fn overlaps_records(&self, address: Ptr32, len: u32) -> bool {
        let (lo, hi) = (address.0 as u64, address.0 as u64 + len as u64);
        let start = self.records.0 as u64;
        lo < start + (self.count * RECORD_SIZE) as u64 && hi > start
    }

    /// Symbols whose data slot intersects `[address, address+len)`.
    pub fn vars_overlapping(&self, address: Ptr32, len: u32) -> Vec<u32> {
        let lo = address.0 as u64;
        let hi = lo + len as u64;
        let base = self.vars.0 as u64;
        self.var_slots
            .iter()
            .enumerate()
            .filter(|(i, (off, _))| {
                let start = base + *off as u64;
                let end = base + self.var_slots.get(i + 1).map(|(next, _)| *next).unwrap_or(self.vars_size) as u64;
                lo < end && hi > start
            })
            .map(|(_, (_, symbol))| *symbol)
            .collect()
    }

    pub fn classify(&self, address: Ptr32, symbols: &[Symbol]) -> Option<ShadowHit> {
        let a = address.0;
        if a >= self.records.0 && a < self.records.0 + self.count * RECORD_SIZE {
            let rel = a - self.records.0;
            return Some(ShadowHit::Record { symbol: rel / RECORD_SIZE, field: rel % RECORD_SIZE });
        }
        if a >= self.vars.0 && a < self.vars.0 + self.vars_size {
            let rel = a - self.vars.0;
            let i = self.var_slots.partition_point(|(off, _)| *off <= rel).checked_sub(1)?;
            let (off, symbol) = self.var_slots[i];
            let elem = elem_size(symbols.get(symbol as usize)?.kind)?;
            let inner = rel - off;
            return Some(ShadowHit::Var { symbol, index: inner / elem, byte: inner % elem });
        }
        None
    }
}

fn is_symtab_field(address: Ptr32, len: u32) -> bool {
    let lo = PARSER.0 + parser::SYMTAB_ARRAY;
    let hi = PARSER.0 + parser::SYMTAB_NUM_IN_ARRAY + 4;
    address.0 < hi && address.0.saturating_add(len) > lo
}

impl DirectMemory {
    /// Publish the symbol pointer array in the parser struct on first use.
    pub(crate) fn materialize_symtab(&mut self) {
        if self.shadow.pointer_array.is_some() {
            return;
        }
        let count = self.shadow.count;
        let num_alloc = count.max(1).next_power_of_two();
        let array = match self.mem.alloc(num_alloc * 4, "symtab.table") {
            Ok(a) => a,
            Err(e) => {
                log::error!("symbol table pointer array: {}", e);
                return;
            }
        };
        let mut bytes = vec![0u8; (num_alloc * 4) as usize];
        for i in 0..count {
            let rec = self.shadow.records.offset(i * RECORD_SIZE);
            LittleEndian::write_u32(&mut bytes[(i * 4) as usize..], rec.0);
        }
        self.mem.write_bytes(array, &bytes);
        self.mem.write_int(PARSER.offset(parser::SYMTAB_ARRAY), array.to_script());
        self.mem.write_int(PARSER.offset(parser::SYMTAB_NUM_ALLOC), num_alloc as i32);
        self.mem.write_int(PARSER.offset(parser::SYMTAB_NUM_IN_ARRAY), count as i32);
        self.shadow.pointer_array = Some(array);
        trace::mem(format_args!("symbol table materialized: {} symbols, array at {}", count, array));
    }

    /// Character buffer holding `bytes` plus a terminating NUL.
    pub(crate) fn alloc_chars(&mut self, bytes: &[u8], label: &str) -> Ptr32 {
        match self.mem.alloc(bytes.len() as u32 + 1, label) {
            Ok(p) => {
                self.mem.write_bytes(p, bytes);
                p
            }
            Err(_) => Ptr32::NULL,
        }
    }

    /// Fill a zString record with a pointer to `chars` of length `len`.
    pub(crate) fn write_zstring_header(&mut self, record: Ptr32, chars: Ptr32, len: u32) {
        self.mem.write_int(record.offset(ZSTRING_PTR), chars.to_script());
        self.mem.write_int(record.offset(ZSTRING_LEN), len as i32);
        self.mem.write_int(record.offset(ZSTRING_RES), len as i32);
    }

    fn name_buffer(&mut self, sym: &Symbol) -> (Ptr32, u32) {
        let bytes = self.decoder.encode_owned(&sym.name);
        let len = bytes.len() as u32;
        if let Some(p) = self.shadow.names.get(&sym.index) {
            return (*p, len);
        }
        let p = self.alloc_chars(&bytes, "symbol name");
        self.shadow.names.insert(sym.index, p);
        (p, len)
    }

    /// The `content` word as legacy code expects it.
    fn derive_content(&self, sym: &Symbol) -> i32 {
        match sym.kind {
            SymbolKind::Int if sym.count <= 1 => sym.get_int(0).unwrap_or(0),
            SymbolKind::Float if sym.count <= 1 => sym.get_float(0).map(|f| f.to_bits() as i32).unwrap_or(0),
            SymbolKind::Int | SymbolKind::Float | SymbolKind::String => {
                self.shadow.var_address(sym, 0).unwrap_or(Ptr32::NULL).to_script()
            }
            SymbolKind::Function | SymbolKind::Prototype | SymbolKind::Instance if !sym.is_external() => {
                sym.address as i32
            }
            SymbolKind::Class => sym.address as i32,
            _ => 0,
        }
    }

    /// Rewrite the record of `symbol` from the live VM state.
    pub(crate) fn refresh_record(&mut self, vm: &dyn ScriptVm, symbol: u32) {
        let (Some(sym), Some(rec)) = (vm.symbol(symbol), self.shadow.record_address(symbol)) else {
            return;
        };
        let (name, name_len) = self.name_buffer(sym);
        let content = self.derive_content(sym);
        let offset = match sym.kind {
            SymbolKind::Instance if !sym.is_member() => self.inst_to_ptr(vm, sym.instance).to_script(),
            _ => sym.offset as i32,
        };
        let parent = sym
            .parent
            .and_then(|p| self.shadow.record_address(p))
            .unwrap_or(Ptr32::NULL);

        let mut bytes = [0u8; RECORD_SIZE as usize];
        let f = |at: u32| at as usize..at as usize + 4;
        LittleEndian::write_u32(&mut bytes[f(ZSTRING_PTR)], name.0);
        LittleEndian::write_u32(&mut bytes[f(ZSTRING_LEN)], name_len);
        LittleEndian::write_u32(&mut bytes[f(ZSTRING_RES)], name_len);
        LittleEndian::write_i32(&mut bytes[f(field::CONTENT)], content);
        LittleEndian::write_i32(&mut bytes[f(field::OFFSET)], offset);
        LittleEndian::write_u32(&mut bytes[f(field::BITFIELD)], sym.bitfield());
        LittleEndian::write_u32(&mut bytes[f(field::PARENT)], parent.0);
        self.mem.write_bytes(rec, &bytes);
    }

    /// Rewrite the data slot of `symbol` from the live VM state.
    pub(crate) fn refresh_var(&mut self, vm: &dyn ScriptVm, symbol: u32) {
        let Some(sym) = vm.symbol(symbol) else { return };
        let Some(base) = self.shadow.var_address(sym, 0) else { return };
        match sym.kind {
            SymbolKind::Int => {
                for i in 0..sym.count.max(1) {
                    self.mem.write_int(base.offset(i * 4), sym.get_int(i).unwrap_or(0));
                }
            }
            SymbolKind::Float => {
                for i in 0..sym.count.max(1) {
                    self.mem.write_float(base.offset(i * 4), sym.get_float(i).unwrap_or(0.0));
                }
            }
            SymbolKind::String => {
                for i in 0..sym.count.max(1) {
                    let value = self.decoder.encode_owned(sym.get_string(i).unwrap_or_default());
                    self.publish_string(symbol, i, base.offset(i * ZSTRING_SIZE), value);
                }
            }
            SymbolKind::Instance => {
                let p = self.inst_to_ptr(vm, sym.instance);
                self.mem.write_int(base, p.to_script());
            }
            _ => {}
        }
    }

    fn publish_string(&mut self, symbol: u32, index: u32, record: Ptr32, value: Vec<u8>) {
        let existing = self.shadow.strings.get(&(symbol, index)).map(|(p, old)| (*p, *old == value));
        let chars = match existing {
            Some((p, true)) => p,
            stale => {
                if let Some((p, false)) = stale {
                    let _ = self.mem.free(p);
                }
                let p = self.alloc_chars(&value, "string variable");
                self.shadow.strings.insert((symbol, index), (p, value.clone()));
                p
            }
        };
        self.write_zstring_header(record, chars, value.len() as u32);
    }

    /// Bring the projection up to date before `[address, address+len)` is read.
    pub(crate) fn before_read(&mut self, vm: &dyn ScriptVm, address: Ptr32, len: u32) {
        if is_symtab_field(address, len) {
            self.materialize_symtab();
        }
        let len = len.max(1);
        let mut at = address;
        let end = address.0 as u64 + len as u64;
        while (at.0 as u64) < end {
            let next = match self.shadow.classify(at, vm.symbols()) {
                Some(ShadowHit::Record { symbol, field }) => {
                    self.refresh_record(vm, symbol);
                    at.offset(RECORD_SIZE - field)
                }
                Some(ShadowHit::Var { symbol, .. }) => {
                    self.refresh_var(vm, symbol);
                    match vm.symbol(symbol).and_then(|s| {
                        let size = slot_size(s)?;
                        Some(self.shadow.var_address(s, 0)?.offset(size))
                    }) {
                        Some(end) => end,
                        None => break,
                    }
                }
                // Skip ahead to whichever shadow block comes next.
                None => {
                    let candidates = [self.shadow.records.0, self.shadow.vars.0];
                    match candidates.iter().filter(|&&c| c > at.0 && (c as u64) < end).min() {
                        Some(&c) => Ptr32(c),
                        None => break,
                    }
                }
            };
            if next.0 <= at.0 {
                break;
            }
            at = next;
        }
    }

    /// Forward a 4-byte write that hit the projection. Returns `false` if rejected.
    pub(crate) fn write_shadow(&mut self, vm: &mut dyn ScriptVm, hit: ShadowHit, value: i32) -> bool {
        match hit {
            ShadowHit::Record { symbol, field: field::CONTENT } => {
                let Some(sym) = vm.symbol_mut(symbol) else { return false };
                let ok = match sym.kind {
                    SymbolKind::Int if sym.count <= 1 => sym.set_int(0, value),
                    SymbolKind::Float if sym.count <= 1 => sym.set_float(0, f32::from_bits(value as u32)),
                    _ => false,
                };
                if !ok {
                    log::error!("write to content of {} rejected", sym);
                }
                ok
            }
            ShadowHit::Record { symbol, field: field::OFFSET } => {
                let is_instance = vm.symbol(symbol).map(|s| s.kind == SymbolKind::Instance).unwrap_or(false);
                if !is_instance {
                    log::error!("write to offset of symbol {} rejected", symbol);
                    return false;
                }
                let inst = self.ptr_to_inst(Ptr32::from_script(value));
                if let Some(sym) = vm.symbol_mut(symbol) {
                    sym.instance = inst;
                }
                true
            }
            ShadowHit::Record { symbol, field } => {
                log::error!("write to read-only field +{} of symbol record {} rejected", field, symbol);
                false
            }
            ShadowHit::Var { symbol, index, byte: 0 } => {
                let kind = vm.symbol(symbol).map(|s| s.kind);
                match kind {
                    Some(SymbolKind::Int) => vm.symbol_mut(symbol).is_some_and(|s| s.set_int(index, value)),
                    Some(SymbolKind::Float) => {
                        vm.symbol_mut(symbol).is_some_and(|s| s.set_float(index, f32::from_bits(value as u32)))
                    }
                    Some(SymbolKind::Instance) => {
                        let inst = self.ptr_to_inst(Ptr32::from_script(value));
                        if let Some(sym) = vm.symbol_mut(symbol) {
                            sym.instance = inst;
                        }
                        true
                    }
                    _ => {
                        log::error!("raw write into string variable {} rejected", symbol);
                        false
                    }
                }
            }
            ShadowHit::Var { symbol, byte, .. } => {
                log::error!("unaligned write (+{}) into variable {} rejected", byte, symbol);
                false
            }
        }
    }

    /// Pull int/float/instance slots back into the VM after raw byte writes.
    pub(crate) fn pull_var(&mut self, vm: &mut dyn ScriptVm, symbol: u32) {
        let Some(sym) = vm.symbol(symbol) else { return };
        let Some(base) = self.shadow.var_address(sym, 0) else { return };
        let kind = sym.kind;
        let count = sym.count.max(1);
        match kind {
            SymbolKind::Int | SymbolKind::Float => {
                for i in 0..count {
                    let raw = self.mem.read_int(base.offset(i * 4));
                    if let Some(sym) = vm.symbol_mut(symbol) {
                        if kind == SymbolKind::Int {
                            sym.set_int(i, raw);
                        } else {
                            sym.set_float(i, f32::from_bits(raw as u32));
                        }
                    }
                }
            }
            SymbolKind::Instance => {
                let raw = self.mem.read_ptr(base);
                let inst = self.ptr_to_inst(raw);
                if let Some(sym) = vm.symbol_mut(symbol) {
                    sym.instance = inst;
                }
            }
            _ => {}
        }
    }

    /// Refresh every variable slot and, once materialized, every record.
    pub(crate) fn sync_all_to_memory(&mut self, vm: &dyn ScriptVm) {
        let slots: Vec<u32> = self.shadow.var_slots.iter().map(|(_, s)| *s).collect();
        for s in slots {
            self.refresh_var(vm, s);
        }
        if self.shadow.is_materialized() {
            for s in 0..self.shadow.count {
                self.refresh_record(vm, s);
            }
        }
    }

    /// Apply raw writes to the variables whose slots intersect `[address, address+len)`.
    pub(crate) fn sync_vars_in_range(&mut self, vm: &mut dyn ScriptVm, address: Ptr32, len: u32) {
        for s in self.shadow.vars_overlapping(address, len) {
            self.pull_var(vm, s);
        }
    }

    /// Apply raw writes made by native code to int/float/instance variables.
    pub(crate) fn sync_vars_from_memory(&mut self, vm: &mut dyn ScriptVm) {
        let slots: Vec<u32> = self.shadow.var_slots.iter().map(|(_, s)| *s).collect();
        for s in slots {
            self.pull_var(vm, s);
        }
    }

    /// String read through the projection, straight from the VM.
    pub(crate) fn shadow_string(&self, vm: &dyn ScriptVm, address: Ptr32) -> Option<String> {
        match self.shadow.classify(address, vm.symbols())? {
            ShadowHit::Var { symbol, index, byte: 0 } => {
                let sym = vm.symbol(symbol)?;
                (sym.kind == SymbolKind::String).then(|| sym.get_string(index).unwrap_or_default().to_string())
            }
            ShadowHit::Record { symbol, field: field::NAME } => vm.symbol(symbol).map(|s| s.name.clone()),
            _ => None,
        }
    }

    /// String write through the projection, straight into the VM.
    pub(crate) fn write_shadow_string(&mut self, vm: &mut dyn ScriptVm, address: Ptr32, value: &str) -> Option<bool> {
        match self.shadow.classify(address, vm.symbols())? {
            ShadowHit::Var { symbol, index, byte: 0 } => {
                let sym = vm.symbol_mut(symbol)?;
                if sym.kind != SymbolKind::String {
                    return None;
                }
                Some(sym.set_string(index, value))
            }
            ShadowHit::Record { symbol, field } => {
                log::error!("string write into symbol record {} (+{}) rejected", symbol, field);
                Some(false)
            }
            _ => None,
        }
    }

    /// Decode the zString at `address`, honoring the projection.
    pub(crate) fn read_string_at(&mut self, vm: &dyn ScriptVm, address: Ptr32) -> String {
        if let Some(s) = self.shadow_string(vm, address) {
            return s;
        }
        let bytes = self.mem.read_zstring(address);
        self.decoder.decode(&bytes).into_owned()
    }

    pub(crate) fn shadow_hit(&self, vm: &dyn ScriptVm, address: Ptr32) -> Option<ShadowHit> {
        self.shadow.classify(address, vm.symbols())
    }
}
