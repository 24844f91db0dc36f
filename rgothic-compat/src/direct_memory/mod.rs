//! The bridge between the script VM and the emulated address space.
//!
//! [`DirectMemory`] owns the address space and the trampoline interpreter, pins the
//! engine singletons at their historical addresses, projects the symbol table into
//! memory and serves the memory externals of the extension packages. It is the VM's
//! [`ExternalHost`]: every bound external and every loop trap lands here.

mod externals;
mod instance;
mod loops;
pub mod pins;
pub mod shadow;

use std::collections::HashMap;

use rgothic_script::nls::{Decoder, TextDecoder};
use rgothic_script::vm::{ExternalHost, ScriptVm, VmError};
use serde::Serialize;

use crate::config::CompatConfig;
use crate::cpu32::{ArgKind, CallConv, Cpu32, CpuHost};
use crate::engine::EngineServices;
use crate::error::{BridgeError, Result};
use crate::mem32::{Mem32, Ptr32, RegionInfo};
use crate::{ikarus, lego, trace};

pub use externals::{Binding, BindingReport, ExternalFn, ExternalTable};
pub use loops::{LoopKind, LoopReport, LoopSite, LoopTable};
pub use pins::PinnedTable;
pub use shadow::{ShadowHit, SymbolShadow, RECORD_SIZE};

pub(crate) use externals::pop_func;

pub struct DirectMemory {
    config: CompatConfig,
    decoder: Decoder,
    mem: Mem32,
    /// Taken out while a trampoline runs.
    cpu: Option<Cpu32>,
    engine: EngineServices,
    pinned: PinnedTable,
    shadow: SymbolShadow,
    code_base: Ptr32,
    code_size: u32,
    loops: LoopTable,
    externals: ExternalTable,
    native_pins: HashMap<u32, Ptr32>,
    native_by_address: HashMap<u32, u32>,
    fallback: Option<Box<dyn ExternalHost>>,
    pub(crate) hash_tables: HashMap<u32, HashMap<i32, i32>>,
}

/// Everything the probe prints after construction.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeReport {
    pub pinned: PinnedTable,
    pub code_base: Ptr32,
    pub code_size: u32,
    pub externals: BindingReport,
    pub loops: LoopReport,
    pub regions: Vec<RegionInfo>,
}

impl DirectMemory {
    /// Build the address space around `vm`: pin the engine, mirror the byte-code,
    /// reserve the symbol projection, analyze loops and bind the externals.
    pub fn new(config: CompatConfig, engine: EngineServices, vm: &mut dyn ScriptVm) -> Result<Self> {
        let mut mem = Mem32::new(config.mem_begin, config.mem_end);
        let pinned = pins::pin_engine(&mut mem, &engine)?;

        let code_size = vm.code().len() as u32;
        let code_base = mem.alloc(code_size.max(1), "code stack")?;
        mem.write_bytes(code_base, vm.code());
        let parser = pinned.parser;
        mem.write_int(parser.offset(pins::parser::STACK_STACK), code_base.to_script());
        mem.write_int(parser.offset(pins::parser::STACK_STACKPTR), code_base.to_script());
        mem.write_int(parser.offset(pins::parser::STACK_STACKLAST), code_base.offset(code_size).to_script());
        mem.write_int(parser.offset(pins::parser::STACK_STACKSIZE), code_size as i32);

        let shadow = SymbolShadow::new(&mut mem, vm.symbols())?;
        let loops = LoopTable::analyze(&*vm);

        let mut cpu = Cpu32::new();
        cpu.set_max_steps(config.cpu_step_limit);
        register_natives(&mut cpu);

        let mut dm = Self {
            decoder: Decoder::new(config.encoding),
            config,
            mem,
            cpu: Some(cpu),
            engine,
            pinned,
            shadow,
            code_base,
            code_size,
            loops,
            externals: ExternalTable::default(),
            native_pins: HashMap::new(),
            native_by_address: HashMap::new(),
            fallback: None,
            hash_tables: HashMap::new(),
        };
        dm.externals.bind(vm, ikarus::EXTERNALS);
        dm.externals.bind(vm, lego::EXTERNALS);
        dm.install_loop_traps(vm);
        log::info!(
            "direct memory ready: {} externals bound, {} loops, code at {} (0x{:X} bytes)",
            dm.externals.len(),
            dm.loops.sites().count(),
            code_base,
            code_size
        );
        Ok(dm)
    }

    /// Host for externals the bridge does not implement itself.
    pub fn with_fallback(mut self, host: Box<dyn ExternalHost>) -> Self {
        self.fallback = Some(host);
        self
    }

    pub fn mem(&self) -> &Mem32 {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut Mem32 {
        &mut self.mem
    }

    pub fn config(&self) -> &CompatConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut CompatConfig {
        &mut self.config
    }

    pub fn engine(&self) -> &EngineServices {
        &self.engine
    }

    pub fn pinned(&self) -> &PinnedTable {
        &self.pinned
    }

    pub fn decoder(&self) -> Decoder {
        self.decoder
    }

    /// Absolute address of the mirrored byte-code.
    pub fn code_base(&self) -> Ptr32 {
        self.code_base
    }

    pub fn cpu(&self) -> Option<&Cpu32> {
        self.cpu.as_ref()
    }

    pub fn cpu_mut(&mut self) -> Option<&mut Cpu32> {
        self.cpu.as_mut()
    }

    pub fn externals(&self) -> &ExternalTable {
        &self.externals
    }

    /// Address of the projected record of `symbol`.
    pub fn symbol_record(&mut self, vm: &dyn ScriptVm, symbol: u32) -> Ptr32 {
        self.materialize_symtab();
        self.refresh_record(vm, symbol);
        self.shadow.record_address(symbol).unwrap_or(Ptr32::BAD)
    }

    /// Address of element `index` of a variable's data slot.
    pub fn variable_address(&mut self, vm: &dyn ScriptVm, symbol: u32, index: u32) -> Ptr32 {
        let Some(sym) = vm.symbol(symbol) else { return Ptr32::BAD };
        match self.shadow.var_address(sym, index) {
            Some(p) => {
                self.refresh_var(vm, symbol);
                p
            }
            None => {
                log::warn!("{} has no data slot (index {})", sym, index);
                Ptr32::BAD
            }
        }
    }

    /// Code offset of the function at absolute address `ptr`.
    pub fn code_offset(&self, ptr: Ptr32) -> Option<u32> {
        (ptr.0 >= self.code_base.0 && ptr.0 < self.code_base.0 + self.code_size).then(|| ptr.0 - self.code_base.0)
    }

    pub fn report(&self) -> BridgeReport {
        BridgeReport {
            pinned: self.pinned.clone(),
            code_base: self.code_base,
            code_size: self.code_size,
            externals: self.externals.report(),
            loops: self.loops.report(),
            regions: self.mem.regions(),
        }
    }

    // -------------------------
    // Memory access through the projection
    // -------------------------

    pub fn read_int(&mut self, vm: &dyn ScriptVm, address: Ptr32) -> i32 {
        self.before_read(vm, address, 4);
        self.mem.read_int(address)
    }

    pub fn write_int(&mut self, vm: &mut dyn ScriptVm, address: Ptr32, value: i32) {
        match self.shadow_hit(&*vm, address) {
            Some(hit) => {
                if self.write_shadow(vm, hit, value) {
                    self.mem.write_int(address, value);
                }
            }
            None => self.mem.write_int(address, value),
        }
    }

    pub fn read_byte(&mut self, vm: &dyn ScriptVm, address: Ptr32) -> u8 {
        self.before_read(vm, address, 1);
        self.mem.read_byte(address)
    }

    pub fn write_byte(&mut self, vm: &mut dyn ScriptVm, address: Ptr32, value: u8) {
        match self.shadow_hit(&*vm, address) {
            Some(ShadowHit::Var { symbol, .. }) => {
                self.refresh_var(&*vm, symbol);
                self.mem.write_byte(address, value);
                self.pull_var(vm, symbol);
            }
            Some(ShadowHit::Record { symbol, field }) => {
                log::error!("byte write into symbol record {} (+{}) rejected", symbol, field);
            }
            None => self.mem.write_byte(address, value),
        }
    }

    /// Raw copy. Symbol records are read-only; variables in the target take the new bytes.
    pub fn copy_bytes(&mut self, vm: &mut dyn ScriptVm, src: Ptr32, dst: Ptr32, size: u32) {
        if self.shadow.overlaps_records(dst, size) {
            log::warn!("copy of {} bytes into symbol records at {} rejected", size, dst);
            return;
        }
        self.before_read(&*vm, src, size);
        self.before_read(&*vm, dst, size);
        self.mem.copy_bytes(src, dst, size);
        self.sync_vars_in_range(vm, dst, size);
    }

    pub fn read_string(&mut self, vm: &dyn ScriptVm, address: Ptr32) -> String {
        self.read_string_at(vm, address)
    }

    /// Store `value` into the zString record at `address`.
    pub fn write_string(&mut self, vm: &mut dyn ScriptVm, address: Ptr32, value: &str) {
        if let Some(done) = self.write_shadow_string(vm, address, value) {
            if done {
                let symbol = self.shadow_symbol(&*vm, address);
                self.refresh_var(&*vm, symbol);
            }
            return;
        }
        let old = self.mem.read_ptr(address.offset(crate::mem32::ZSTRING_PTR));
        let bytes = self.decoder.encode_owned(value);
        let chars = self.alloc_chars(&bytes, "zString");
        if chars.is_null() {
            log::warn!("write_string: out of memory for {} bytes", bytes.len());
            return;
        }
        self.write_zstring_header(address, chars, bytes.len() as u32);
        if !old.is_null() && self.mem.is_allocated_start(old) {
            let _ = self.mem.free(old);
        }
    }

    fn shadow_symbol(&self, vm: &dyn ScriptVm, address: Ptr32) -> u32 {
        match self.shadow_hit(vm, address) {
            Some(ShadowHit::Var { symbol, .. } | ShadowHit::Record { symbol, .. }) => symbol,
            None => u32::MAX,
        }
    }

    // -------------------------
    // Native code
    // -------------------------

    /// Run the trampoline starting at `address`; returns `eax`.
    pub fn exec_asm(&mut self, vm: &mut dyn ScriptVm, address: Ptr32) -> Result<u32> {
        let Some(region) = self.mem.region_at(address) else {
            return Err(BridgeError::TranslationFailure(address));
        };
        let len = region.address.0.saturating_add(region.size).saturating_sub(address.0);
        let code = self.mem.read_bytes(address, len);
        self.exec_code(vm, address, &code)
    }

    /// Run `code` as if it were mapped at `base`; returns `eax`.
    pub fn exec_code(&mut self, vm: &mut dyn ScriptVm, base: Ptr32, code: &[u8]) -> Result<u32> {
        let Some(mut cpu) = self.cpu.take() else {
            log::error!("native code at {} entered while another trampoline is running", base);
            return Ok(0);
        };
        self.materialize_symtab();
        self.sync_all_to_memory(&*vm);

        let result = {
            let mut host = AsmHost { bridge: &mut *self, vm: &mut *vm };
            cpu.exec(&mut host, base, code)
        };
        let eax = cpu.registers().eax;
        self.cpu = Some(cpu);
        self.sync_vars_from_memory(vm);

        let outcome = result?;
        trace::cpu(format_args!("trampoline at {} finished: {:?}, eax=0x{:X}", base, outcome, eax));
        Ok(eax)
    }
}

impl ExternalHost for DirectMemory {
    fn call_external(&mut self, vm: &mut dyn ScriptVm, symbol: u32) -> std::result::Result<(), VmError> {
        if let Some(binding) = self.externals.get(symbol) {
            trace::external(format_args!("{}", binding.name));
            return match (binding.func)(self, vm) {
                Ok(()) => Ok(()),
                Err(BridgeError::Vm(e)) => Err(e),
                Err(e) => {
                    log::warn!("{}: {}", binding.name, e);
                    Ok(())
                }
            };
        }
        match self.fallback.as_mut() {
            Some(host) => host.call_external(vm, symbol),
            None => {
                let name = vm.symbol(symbol).map(|s| s.name.clone()).unwrap_or_default();
                Err(VmError::UnboundExternal { name })
            }
        }
    }

    fn access_trap(&mut self, vm: &mut dyn ScriptVm, symbol: u32) -> bool {
        self.loop_trap(vm, symbol)
    }

    fn read_instance_int(&mut self, vm: &dyn ScriptVm, address: u32) -> i32 {
        self.read_int(vm, Ptr32(address))
    }

    fn write_instance_int(&mut self, vm: &mut dyn ScriptVm, address: u32, value: i32) {
        self.write_int(vm, Ptr32(address), value)
    }

    fn read_instance_string(&mut self, vm: &dyn ScriptVm, address: u32) -> String {
        self.read_string(vm, Ptr32(address))
    }

    fn write_instance_string(&mut self, vm: &mut dyn ScriptVm, address: u32, value: &str) {
        self.write_string(vm, Ptr32(address), value)
    }
}

/// What native handlers see while a trampoline runs.
struct AsmHost<'a> {
    bridge: &'a mut DirectMemory,
    vm: &'a mut dyn ScriptVm,
}

impl CpuHost for AsmHost<'_> {
    fn mem(&mut self) -> &mut Mem32 {
        &mut self.bridge.mem
    }

    fn find_symbol(&mut self, name: &[u8]) -> Option<u32> {
        let name = self.bridge.decoder.decode_cstr(name);
        self.vm.find_symbol(&name)
    }

    fn symbol_address(&mut self, index: u32) -> Ptr32 {
        self.bridge.symbol_record(&*self.vm, index)
    }

    fn call_script(&mut self, index: u32) -> Option<i32> {
        // The script sees what native code wrote so far, and the slots see what the script wrote.
        self.bridge.sync_vars_from_memory(&mut *self.vm);
        let called = self.vm.call_function(&mut *self.bridge, index);
        self.bridge.sync_all_to_memory(&*self.vm);
        if let Err(e) = called {
            log::warn!("native call into script symbol {}: {}", index, e);
            return None;
        }
        let returns = self.vm.symbol(index).map(|s| s.has_return()).unwrap_or(false);
        if !returns {
            return None;
        }
        self.vm.pop_int(&mut *self.bridge).ok()
    }
}

fn register_natives(cpu: &mut Cpu32) {
    use pins::native::*;

    cpu.register(ZCPARSER_GET_SYMBOL_INT, "zCParser::GetSymbol(int)", CallConv::Thiscall, &[ArgKind::Int], |host, args| {
        Some(host.symbol_address(args[1].as_int() as u32).0)
    });
    cpu.register(
        ZCPAR_SYMBOLTABLE_GET_SYMBOL,
        "zCPar_SymbolTable::GetSymbol(int)",
        CallConv::Thiscall,
        &[ArgKind::Int],
        |host, args| Some(host.symbol_address(args[1].as_int() as u32).0),
    );
    cpu.register(ZCPARSER_GET_INDEX, "zCParser::GetIndex(zSTRING const&)", CallConv::Thiscall, &[ArgKind::Str], |host, args| {
        Some(host.find_symbol(args[1].as_bytes()).map(|i| i as i32).unwrap_or(-1) as u32)
    });
    cpu.register(ZCPARSER_CALL_FUNC, "zCParser::CallFunc(int)", CallConv::Thiscall, &[ArgKind::Int], |host, args| {
        Some(host.call_script(args[1].as_int() as u32).unwrap_or(0) as u32)
    });
    cpu.register(
        ZCTIMER_SET_MOTION_FACTOR,
        "zCTimer::SetMotionFactor(float)",
        CallConv::Thiscall,
        &[ArgKind::Float],
        |host, args| {
            let timer = args[0].as_ptr();
            host.mem().write_float(timer, args[1].as_f32());
            None
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem32::{ZSTRING_LEN, ZSTRING_PTR};
    use pretty_assertions::assert_eq;
    use rgothic_script::builder::ScriptBuilder;
    use rgothic_script::vm::DaedalusVm;
    use rgothic_script::SymbolKind;

    fn bridge(b: ScriptBuilder) -> (DirectMemory, DaedalusVm) {
        let mut vm = b.into_vm();
        let dm = DirectMemory::new(CompatConfig::default(), EngineServices::default(), &mut vm).unwrap();
        (dm, vm)
    }

    #[test]
    fn symbol_table_materializes_on_first_access() {
        let mut b = ScriptBuilder::new();
        b.int_var("A", 1);
        b.int_var("B", 1);
        let (mut dm, vm) = bridge(b);

        let array_field = pins::PARSER.offset(pins::parser::SYMTAB_ARRAY);
        assert_eq!(dm.mem().read_int(array_field), 0);
        let array = Ptr32::from_script(dm.read_int(&vm, array_field));
        assert!(!array.is_null());
        assert_eq!(dm.read_int(&vm, pins::PARSER.offset(pins::parser::SYMTAB_NUM_IN_ARRAY)), 2);
        assert_eq!(dm.read_int(&vm, pins::PARSER.offset(pins::parser::SYMTAB_NUM_ALLOC)), 2);
    }

    #[test]
    fn records_follow_live_values() {
        let mut b = ScriptBuilder::new();
        let a = b.int_var("COUNTER", 1);
        let (mut dm, mut vm) = bridge(b);

        let rec = dm.symbol_record(&vm, a);
        vm.symbol_mut(a).unwrap().set_int(0, 5);
        assert_eq!(dm.read_int(&vm, rec.offset(shadow::field::CONTENT)), 5);

        let name = dm.read_int(&vm, rec.offset(ZSTRING_PTR));
        assert_eq!(dm.read_int(&vm, rec.offset(ZSTRING_LEN)), 7);
        assert_eq!(dm.mem().read_cstr(Ptr32::from_script(name), 64), b"COUNTER".to_vec());

        dm.write_int(&mut vm, rec.offset(shadow::field::CONTENT), 9);
        assert_eq!(vm.global_int("COUNTER"), Some(9));
    }

    #[test]
    fn read_only_record_fields_reject_writes() {
        let mut b = ScriptBuilder::new();
        let a = b.int_var("ARR", 3);
        let (mut dm, mut vm) = bridge(b);
        let rec = dm.symbol_record(&vm, a);
        let bitfield = dm.read_int(&vm, rec.offset(shadow::field::BITFIELD));

        dm.write_int(&mut vm, rec.offset(shadow::field::BITFIELD), 0);
        dm.write_int(&mut vm, rec.offset(shadow::field::CONTENT), 1);
        assert_eq!(dm.read_int(&vm, rec.offset(shadow::field::BITFIELD)), bitfield);
        assert_eq!(vm.symbol(a).unwrap().kind, SymbolKind::Int);
        assert_eq!(vm.symbol(a).unwrap().get_int(0), Some(0));
    }

    #[test]
    fn raw_copies_into_symbol_records_are_rejected() {
        let mut b = ScriptBuilder::new();
        let a = b.int_var("ARR", 3);
        let x = b.int_var("X", 1);
        let (mut dm, mut vm) = bridge(b);
        let rec = dm.symbol_record(&vm, a);
        let before = dm.mem().read_bytes(rec, RECORD_SIZE);

        let junk = dm.mem_mut().alloc(RECORD_SIZE, "junk").unwrap();
        dm.mem_mut().write_bytes(junk, &[0xAB; RECORD_SIZE as usize]);
        dm.copy_bytes(&mut vm, junk, rec, RECORD_SIZE);
        assert_eq!(dm.mem().read_bytes(rec, RECORD_SIZE), before);

        // A copy into one variable slot leaves the neighbours alone.
        vm.symbol_mut(a).unwrap().set_int(2, 4);
        dm.mem_mut().write_int(junk, 12);
        let slot = dm.variable_address(&vm, x, 0);
        dm.copy_bytes(&mut vm, junk, slot, 4);
        assert_eq!(vm.symbol(x).unwrap().get_int(0), Some(12));
        assert_eq!(vm.symbol(a).unwrap().get_int(2), Some(4));
    }

    #[test]
    fn variable_slots_alias_vm_values() {
        let mut b = ScriptBuilder::new();
        let arr = b.int_var("ARR", 3);
        let s = b.string_var("NAME", 1);
        let (mut dm, mut vm) = bridge(b);

        let p = dm.variable_address(&vm, arr, 2);
        dm.write_int(&mut vm, p, 31);
        assert_eq!(vm.symbol(arr).unwrap().get_int(2), Some(31));

        vm.symbol_mut(s).unwrap().set_string(0, "Xardas");
        let sp = dm.variable_address(&vm, s, 0);
        assert_eq!(dm.read_string(&vm, sp), "Xardas");
        dm.write_string(&mut vm, sp, "Diego");
        assert_eq!(vm.symbol(s).unwrap().get_string(0), Some("Diego"));
    }

    #[test]
    fn code_mirror_is_published_in_the_parser() {
        let mut b = ScriptBuilder::new();
        let f = b.begin_function("F", 0, false);
        b.code().push_i(1).op(rgothic_script::vm::Opcode::Plus).rsr();
        b.end_function(f);
        let (dm, vm) = bridge(b);

        let base = dm.mem().read_ptr(pins::PARSER.offset(pins::parser::STACK_STACK));
        assert_eq!(base, dm.code_base());
        assert_eq!(dm.mem().read_bytes(base, vm.code().len() as u32), vm.code().to_vec());
    }

    #[test]
    fn unbound_externals_reach_the_fallback() {
        struct Counting(std::rc::Rc<std::cell::Cell<u32>>);
        impl ExternalHost for Counting {
            fn call_external(&mut self, _: &mut dyn ScriptVm, _: u32) -> std::result::Result<(), VmError> {
                self.0.set(self.0.get() + 1);
                Ok(())
            }
        }
        let mut b = ScriptBuilder::new();
        let ext = b.external("PRINT", 1, false);
        let (dm, mut vm) = bridge(b);
        let hits = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut dm = dm.with_fallback(Box::new(Counting(hits.clone())));

        dm.call_external(&mut vm, ext).unwrap();
        assert_eq!(hits.get(), 1);
    }
}
