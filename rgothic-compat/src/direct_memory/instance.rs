use rgothic_script::vm::ScriptVm;
use rgothic_script::{InstanceRef, SymbolKind};

use crate::mem32::{Ptr32, SharedPin};

use super::DirectMemory;

impl DirectMemory {
    /// Address of an instance. VM-owned storage is pinned the first time it is asked for.
    pub fn inst_to_ptr(&mut self, vm: &dyn ScriptVm, instance: InstanceRef) -> Ptr32 {
        match instance {
            InstanceRef::Null => Ptr32::NULL,
            InstanceRef::Memory(address) => Ptr32(address),
            InstanceRef::Native(id) => {
                if let Some(p) = self.native_pins.get(&id) {
                    return *p;
                }
                let Some(storage) = vm.instance_storage(instance) else {
                    log::warn!("inst_to_ptr: native instance {} has no storage", id);
                    return Ptr32::NULL;
                };
                let size = storage.borrow().len() as u32;
                if size == 0 {
                    log::warn!("inst_to_ptr: native instance {} is empty", id);
                    return Ptr32::NULL;
                }
                let target: SharedPin = storage;
                match self.mem.pin(target, 0, Ptr32::NULL, size, "instance") {
                    Ok(p) => {
                        self.native_pins.insert(id, p);
                        self.native_by_address.insert(p.0, id);
                        p
                    }
                    Err(e) => {
                        log::error!("inst_to_ptr: pinning instance {}: {}", id, e);
                        Ptr32::NULL
                    }
                }
            }
        }
    }

    /// The instance living at `ptr`; pinned VM storage maps back to its native handle.
    pub fn ptr_to_inst(&self, ptr: Ptr32) -> InstanceRef {
        if ptr.is_null() {
            return InstanceRef::Null;
        }
        match self.native_by_address.get(&ptr.0) {
            Some(id) => InstanceRef::Native(*id),
            None => InstanceRef::Memory(ptr.0),
        }
    }

    /// Make the instance symbol `symbol` point at `ptr`.
    pub(crate) fn assign_instance(&mut self, vm: &mut dyn ScriptVm, symbol: u32, ptr: Ptr32) -> bool {
        let inst = self.ptr_to_inst(ptr);
        match vm.symbol_mut(symbol) {
            Some(sym) if sym.kind == SymbolKind::Instance => {
                sym.instance = inst;
                true
            }
            Some(sym) => {
                log::warn!("assign_instance: {} is not an instance", sym);
                false
            }
            None => {
                log::warn!("assign_instance: unknown symbol {}", symbol);
                false
            }
        }
    }
}
