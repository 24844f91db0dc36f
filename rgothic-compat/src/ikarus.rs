//! Memory externals of the Ikarus script package.
//!
//! Each function here replaces a script function of the same name. Arguments come
//! off the VM stack last-first. Failures are logged and a neutral value (`0`, `-1`,
//! an empty string or [`Ptr32::BAD`]) is pushed so the script keeps running.

use rgothic_script::vm::{ScriptVm, StackValue};
use rgothic_script::SymbolKind;

use crate::direct_memory::{pop_func, DirectMemory, ExternalFn};
use crate::error::Result;
use crate::mem32::{Ptr32, ZSTRING_SIZE};

pub const EXTERNALS: &[(&str, ExternalFn)] = &[
    ("MEM_ReadInt", mem_read_int),
    ("MEM_WriteInt", mem_write_int),
    ("MEM_ReadByte", mem_read_byte),
    ("MEM_WriteByte", mem_write_byte),
    ("MEM_ReadIntArray", mem_read_int_array),
    ("MEM_WriteIntArray", mem_write_int_array),
    ("MEM_ReadString", mem_read_string),
    ("MEM_WriteString", mem_write_string),
    ("MEM_CopyBytes", mem_copy_bytes),
    ("MEM_Alloc", mem_alloc),
    ("MEM_Free", mem_free),
    ("MEM_Realloc", mem_realloc),
    ("MEM_CallByID", mem_call_by_id),
    ("MEM_CallByPtr", mem_call_by_ptr),
    ("MEM_CallByOffset", mem_call_by_offset),
    ("MEM_CallByString", mem_call_by_string),
    ("MEM_Call", mem_call),
    ("MEM_GetFuncID", mem_get_func_id),
    ("MEM_GetFuncPtr", mem_get_func_ptr),
    ("MEM_GetFuncOffset", mem_get_func_offset),
    ("MEM_FindParserSymbol", mem_find_parser_symbol),
    ("MEM_GetSymbolIndex", mem_find_parser_symbol),
    ("MEM_GetSymbol", mem_get_symbol),
    ("MEM_GetParserSymbol", mem_get_symbol),
    ("MEM_GetSymbolByIndex", mem_get_symbol_by_index),
    ("_@", int_address),
    ("_@f", float_address),
    ("_@s", string_address),
    ("MEM_GetIntAddress", int_address),
    ("MEM_GetFloatAddress", float_address),
    ("MEM_GetStringAddress", string_address),
    ("MEM_PtrToInst", mem_ptr_to_inst),
    ("_^", mem_ptr_to_inst),
    ("MEM_InstToPtr", mem_inst_to_ptr),
    ("MEM_AssignInst", mem_assign_inst),
    ("MEM_ArrayCreate", mem_array_create),
    ("MEM_ArrayFree", mem_array_free),
    ("MEM_ArrayClear", mem_array_clear),
    ("MEM_ArraySize", mem_array_size),
    ("MEM_ArrayRead", mem_array_read),
    ("MEM_ArrayWrite", mem_array_write),
    ("MEM_ArrayInsert", mem_array_insert),
    ("MEM_ArrayPop", mem_array_pop),
    ("MEM_ArrayIndexOf", mem_array_index_of),
    ("repeat", repeat),
    ("while", while_),
    ("MEM_Label", mem_label),
    ("MEM_Goto", mem_goto),
    ("MEMINT_StackPushInt", memint_stack_int),
    ("MEMINT_StackPopInt", memint_stack_int),
    ("MEMINT_StackPushInst", memint_stack_push_inst),
    ("MEM_Info", mem_info),
    ("MEM_Warn", mem_warn),
    ("MEM_Error", mem_error),
    ("MEM_Assert", mem_assert),
    ("MEM_SetShowDebug", mem_set_show_debug),
    ("MEM_GetShowDebug", mem_get_show_debug),
    ("MEM_GetGothOpt", mem_get_goth_opt),
    ("MEM_SetGothOpt", mem_set_goth_opt),
    ("MEM_GothOptExists", mem_goth_opt_exists),
    ("MEM_GetModOpt", mem_get_mod_opt),
    ("MEM_ModOptExists", mem_mod_opt_exists),
    ("MEM_GetCommandLine", mem_get_command_line),
    ("MEM_InitAll", mem_init_all),
    ("MEM_ReinitParser", mem_init_all),
    ("ASMINT_Init", asmint_init),
    ("ASMINT_CallMyExternal", asmint_call_my_external),
    ("mkf", mkf),
    ("truncf", truncf),
    ("roundf", roundf),
    ("addf", addf),
    ("subf", subf),
    ("mulf", mulf),
    ("divf", divf),
    ("castToIntf", cast_to_intf),
    ("castFromIntf", cast_from_intf),
];

fn pop_ptr(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<Ptr32> {
    Ok(Ptr32::from_script(vm.pop_int(dm)?))
}

fn push_ptr(vm: &mut dyn ScriptVm, p: Ptr32) {
    vm.push_int(p.to_script());
}

// -------------------------
// Raw memory
// -------------------------

fn mem_read_int(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let address = pop_ptr(dm, vm)?;
    let v = dm.read_int(&*vm, address);
    vm.push_int(v);
    Ok(())
}

fn mem_write_int(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let value = vm.pop_int(dm)?;
    let address = pop_ptr(dm, vm)?;
    dm.write_int(vm, address, value);
    Ok(())
}

fn mem_read_byte(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let address = pop_ptr(dm, vm)?;
    let v = dm.read_byte(&*vm, address);
    vm.push_int(v as i32);
    Ok(())
}

fn mem_write_byte(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let value = vm.pop_int(dm)?;
    let address = pop_ptr(dm, vm)?;
    dm.write_byte(vm, address, (value & 0xFF) as u8);
    Ok(())
}

fn mem_read_int_array(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let offset = vm.pop_int(dm)?;
    let array = pop_ptr(dm, vm)?;
    let v = dm.read_int(&*vm, array.offset((offset as u32).wrapping_mul(4)));
    vm.push_int(v);
    Ok(())
}

fn mem_write_int_array(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let value = vm.pop_int(dm)?;
    let offset = vm.pop_int(dm)?;
    let array = pop_ptr(dm, vm)?;
    dm.write_int(vm, array.offset((offset as u32).wrapping_mul(4)), value);
    Ok(())
}

fn mem_read_string(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let address = pop_ptr(dm, vm)?;
    let s = dm.read_string(&*vm, address);
    vm.push_string(s);
    Ok(())
}

fn mem_write_string(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let value = vm.pop_string(dm)?;
    let address = pop_ptr(dm, vm)?;
    dm.write_string(vm, address, &value);
    Ok(())
}

fn mem_copy_bytes(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let size = vm.pop_int(dm)?;
    let dst = pop_ptr(dm, vm)?;
    let src = pop_ptr(dm, vm)?;
    if size < 0 {
        log::warn!("MEM_CopyBytes: negative size {}", size);
        return Ok(());
    }
    dm.copy_bytes(vm, src, dst, size as u32);
    Ok(())
}

// -------------------------
// Allocation
// -------------------------

fn mem_alloc(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let size = vm.pop_int(dm)?;
    if size <= 0 {
        log::warn!("MEM_Alloc({}): nothing to allocate", size);
        vm.push_int(0);
        return Ok(());
    }
    let p = match dm.mem_mut().alloc(size as u32, "MEM_Alloc") {
        Ok(p) => p,
        Err(e) => {
            log::warn!("MEM_Alloc({}): {}", size, e);
            Ptr32::NULL
        }
    };
    push_ptr(vm, p);
    Ok(())
}

fn mem_free(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let p = pop_ptr(dm, vm)?;
    if p.is_null() {
        return Ok(());
    }
    if let Err(e) = dm.mem_mut().free(p) {
        log::warn!("MEM_Free: {}", e);
    }
    Ok(())
}

fn mem_realloc(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let new_size = vm.pop_int(dm)?;
    let _old_size = vm.pop_int(dm)?;
    let p = pop_ptr(dm, vm)?;
    if new_size <= 0 {
        log::warn!("MEM_Realloc: new size {}", new_size);
        push_ptr(vm, Ptr32::NULL);
        return Ok(());
    }
    let mem = dm.mem_mut();
    let result = if p.is_null() { mem.alloc(new_size as u32, "MEM_Alloc") } else { mem.realloc(p, new_size as u32, "MEM_Alloc") };
    let q = result.unwrap_or_else(|e| {
        log::warn!("MEM_Realloc({}, {}): {}", p, new_size, e);
        Ptr32::NULL
    });
    push_ptr(vm, q);
    Ok(())
}

// -------------------------
// Calls
// -------------------------

fn mem_call_by_id(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let id = vm.pop_int(dm)?;
    dm.call_symbol(vm, id as u32)
}

fn call_offset(dm: &mut DirectMemory, vm: &mut dyn ScriptVm, offset: u32, what: &str) -> Result<()> {
    match vm.function_at(offset) {
        Some(symbol) => dm.call_symbol(vm, symbol),
        None => {
            log::warn!("{}: no function at code offset 0x{:X}", what, offset);
            Ok(())
        }
    }
}

fn mem_call_by_ptr(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let p = pop_ptr(dm, vm)?;
    match dm.code_offset(p) {
        Some(offset) => call_offset(dm, vm, offset, "MEM_CallByPtr"),
        None => {
            log::warn!("MEM_CallByPtr: {} is outside the code stack", p);
            Ok(())
        }
    }
}

fn mem_call_by_offset(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let offset = vm.pop_int(dm)?;
    call_offset(dm, vm, offset as u32, "MEM_CallByOffset")
}

fn mem_call_by_string(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let name = vm.pop_string(dm)?;
    match vm.find_symbol(&name) {
        Some(symbol) => dm.call_symbol(vm, symbol),
        None => {
            log::warn!("MEM_CallByString: unknown function {:?}", name);
            Ok(())
        }
    }
}

fn mem_call(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    match pop_func(vm) {
        Ok(symbol) => dm.call_symbol(vm, symbol),
        Err(e) => {
            log::warn!("MEM_Call: {}", e);
            Ok(())
        }
    }
}

fn mem_get_func_id(_dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let id = pop_func(vm).map(|s| s as i32).unwrap_or(-1);
    vm.push_int(id);
    Ok(())
}

fn func_offset(vm: &mut dyn ScriptVm) -> Option<u32> {
    let symbol = pop_func(vm).ok()?;
    let sym = vm.symbol(symbol)?;
    sym.kind.has_code().then_some(sym.address)
}

fn mem_get_func_ptr(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let p = match func_offset(vm) {
        Some(offset) => dm.code_base().offset(offset),
        None => Ptr32::NULL,
    };
    push_ptr(vm, p);
    Ok(())
}

fn mem_get_func_offset(_dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let offset = func_offset(vm).map(|o| o as i32).unwrap_or(-1);
    vm.push_int(offset);
    Ok(())
}

// -------------------------
// Symbols
// -------------------------

fn mem_find_parser_symbol(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let name = vm.pop_string(dm)?;
    let index = vm.find_symbol(&name).map(|i| i as i32).unwrap_or(-1);
    vm.push_int(index);
    Ok(())
}

fn mem_get_symbol(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let name = vm.pop_string(dm)?;
    let p = match vm.find_symbol(&name) {
        Some(i) => dm.symbol_record(&*vm, i),
        None => {
            log::warn!("MEM_GetSymbol: unknown symbol {:?}", name);
            Ptr32::NULL
        }
    };
    push_ptr(vm, p);
    Ok(())
}

fn mem_get_symbol_by_index(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let index = vm.pop_int(dm)?;
    let p = if index >= 0 && (index as usize) < vm.symbols().len() {
        dm.symbol_record(&*vm, index as u32)
    } else {
        log::warn!("MEM_GetSymbolByIndex: index {} out of range", index);
        Ptr32::NULL
    };
    push_ptr(vm, p);
    Ok(())
}

fn address_of(dm: &mut DirectMemory, vm: &mut dyn ScriptVm, elem: u32) -> Result<Ptr32> {
    match vm.pop_raw()? {
        StackValue::Ref { symbol, index, context } => {
            let member_offset = vm.symbol(symbol).filter(|s| s.is_member()).map(|s| s.offset);
            Ok(match member_offset {
                Some(offset) if !context.is_null() => {
                    dm.inst_to_ptr(&*vm, context).offset(offset + index * elem)
                }
                _ => dm.variable_address(&*vm, symbol, index),
            })
        }
        other => {
            log::warn!("address of a {} requested", other.kind_name());
            Ok(Ptr32::BAD)
        }
    }
}

fn int_address(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let p = address_of(dm, vm, 4)?;
    push_ptr(vm, p);
    Ok(())
}

fn float_address(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    int_address(dm, vm)
}

fn string_address(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let p = address_of(dm, vm, ZSTRING_SIZE)?;
    push_ptr(vm, p);
    Ok(())
}

// -------------------------
// Instances
// -------------------------

fn mem_ptr_to_inst(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let p = pop_ptr(dm, vm)?;
    let inst = dm.ptr_to_inst(p);
    vm.push_instance(inst);
    Ok(())
}

fn mem_inst_to_ptr(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let inst = vm.pop_instance()?;
    let p = dm.inst_to_ptr(&*vm, inst);
    push_ptr(vm, p);
    Ok(())
}

fn mem_assign_inst(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let p = pop_ptr(dm, vm)?;
    let symbol = match vm.pop_raw()? {
        StackValue::Ref { symbol, .. } => symbol,
        StackValue::Int(i) => i as u32,
        other => {
            log::warn!("MEM_AssignInst: a {} is not an instance symbol", other.kind_name());
            return Ok(());
        }
    };
    dm.assign_instance(vm, symbol, p);
    Ok(())
}

// -------------------------
// zCArray
// -------------------------

mod zarray {
    pub const DATA: u32 = 0;
    pub const NUM_ALLOC: u32 = 4;
    pub const NUM_IN_ARRAY: u32 = 8;
    pub const SIZE: u32 = 12;
}

fn mem_array_create(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let p = dm.mem_mut().alloc(zarray::SIZE, "zCArray").unwrap_or_else(|e| {
        log::warn!("MEM_ArrayCreate: {}", e);
        Ptr32::NULL
    });
    push_ptr(vm, p);
    Ok(())
}

fn release_data(dm: &mut DirectMemory, array: Ptr32) {
    let mem = dm.mem_mut();
    let data = mem.read_ptr(array.offset(zarray::DATA));
    if !data.is_null() && mem.is_allocated_start(data) {
        let _ = mem.free(data);
    }
    mem.write_int(array.offset(zarray::DATA), 0);
    mem.write_int(array.offset(zarray::NUM_ALLOC), 0);
    mem.write_int(array.offset(zarray::NUM_IN_ARRAY), 0);
}

fn mem_array_free(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let array = pop_ptr(dm, vm)?;
    if array.is_null() {
        return Ok(());
    }
    release_data(dm, array);
    if let Err(e) = dm.mem_mut().free(array) {
        log::warn!("MEM_ArrayFree: {}", e);
    }
    Ok(())
}

fn mem_array_clear(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let array = pop_ptr(dm, vm)?;
    if !array.is_null() {
        release_data(dm, array);
    }
    Ok(())
}

fn array_len(dm: &DirectMemory, array: Ptr32) -> i32 {
    dm.mem().read_int(array.offset(zarray::NUM_IN_ARRAY)).max(0)
}

fn mem_array_size(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let array = pop_ptr(dm, vm)?;
    vm.push_int(array_len(dm, array));
    Ok(())
}

fn element(dm: &DirectMemory, array: Ptr32, index: i32, what: &str) -> Option<Ptr32> {
    let len = array_len(dm, array);
    if index < 0 || index >= len {
        log::warn!("{}: index {} out of range (size {})", what, index, len);
        return None;
    }
    let data = dm.mem().read_ptr(array.offset(zarray::DATA));
    Some(data.offset(index as u32 * 4))
}

fn mem_array_read(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let index = vm.pop_int(dm)?;
    let array = pop_ptr(dm, vm)?;
    let v = element(dm, array, index, "MEM_ArrayRead").map(|p| dm.mem().read_int(p)).unwrap_or(0);
    vm.push_int(v);
    Ok(())
}

fn mem_array_write(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let value = vm.pop_int(dm)?;
    let index = vm.pop_int(dm)?;
    let array = pop_ptr(dm, vm)?;
    if let Some(p) = element(dm, array, index, "MEM_ArrayWrite") {
        dm.mem_mut().write_int(p, value);
    }
    Ok(())
}

fn mem_array_insert(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let value = vm.pop_int(dm)?;
    let array = pop_ptr(dm, vm)?;
    let mem = dm.mem_mut();
    let mut data = mem.read_ptr(array.offset(zarray::DATA));
    let alloc = mem.read_int(array.offset(zarray::NUM_ALLOC)).max(0) as u32;
    let len = mem.read_int(array.offset(zarray::NUM_IN_ARRAY)).max(0) as u32;
    if len >= alloc {
        let grown = (alloc * 2).max(8);
        let result = if data.is_null() {
            mem.alloc(grown * 4, "zCArray.array")
        } else {
            mem.realloc(data, grown * 4, "zCArray.array")
        };
        data = match result {
            Ok(p) => p,
            Err(e) => {
                log::warn!("MEM_ArrayInsert: {}", e);
                return Ok(());
            }
        };
        mem.write_int(array.offset(zarray::DATA), data.to_script());
        mem.write_int(array.offset(zarray::NUM_ALLOC), grown as i32);
    }
    mem.write_int(data.offset(len * 4), value);
    mem.write_int(array.offset(zarray::NUM_IN_ARRAY), len as i32 + 1);
    Ok(())
}

fn mem_array_pop(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let array = pop_ptr(dm, vm)?;
    let len = array_len(dm, array);
    let v = match element(dm, array, len - 1, "MEM_ArrayPop") {
        Some(p) => {
            let v = dm.mem().read_int(p);
            dm.mem_mut().write_int(array.offset(zarray::NUM_IN_ARRAY), len - 1);
            v
        }
        None => 0,
    };
    vm.push_int(v);
    Ok(())
}

fn mem_array_index_of(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let value = vm.pop_int(dm)?;
    let array = pop_ptr(dm, vm)?;
    let len = array_len(dm, array);
    let data = dm.mem().read_ptr(array.offset(zarray::DATA));
    let index = (0..len).find(|i| dm.mem().read_int(data.offset(*i as u32 * 4)) == value).unwrap_or(-1);
    vm.push_int(index);
    Ok(())
}

// -------------------------
// Control flow
// -------------------------

fn repeat(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    dm.ext_repeat(vm)
}

fn while_(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    dm.ext_while(vm)
}

fn mem_label(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    dm.ext_label(vm)
}

fn mem_goto(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    dm.ext_goto(vm)
}

// -------------------------
// Stack helpers
// -------------------------

/// Leaves the argument on the stack as a plain int.
fn memint_stack_int(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let v = vm.pop_int(dm)?;
    vm.push_int(v);
    Ok(())
}

fn memint_stack_push_inst(_dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let inst = vm.pop_instance()?;
    vm.push_instance(inst);
    Ok(())
}

// -------------------------
// Diagnostics and options
// -------------------------

fn mem_info(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let msg = vm.pop_string(dm)?;
    log::info!("{}", msg);
    Ok(())
}

fn mem_warn(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let msg = vm.pop_string(dm)?;
    log::warn!("{}", msg);
    Ok(())
}

fn mem_error(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let msg = vm.pop_string(dm)?;
    log::error!("{}", msg);
    Ok(())
}

fn mem_assert(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let msg = vm.pop_string(dm)?;
    let cond = vm.pop_int(dm)?;
    if cond == 0 {
        log::error!("assertion failed: {}", msg);
    }
    Ok(())
}

fn mem_set_show_debug(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let on = vm.pop_int(dm)?;
    dm.config_mut().show_debug = on != 0;
    Ok(())
}

fn mem_get_show_debug(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    vm.push_int(dm.config().show_debug as i32);
    Ok(())
}

fn mem_get_goth_opt(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let key = vm.pop_string(dm)?;
    let section = vm.pop_string(dm)?;
    let value = dm.config().goth_opt(&section, &key).unwrap_or_default().to_string();
    vm.push_string(value);
    Ok(())
}

fn mem_set_goth_opt(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let value = vm.pop_string(dm)?;
    let key = vm.pop_string(dm)?;
    let section = vm.pop_string(dm)?;
    dm.config_mut().set_goth_opt(&section, &key, &value);
    Ok(())
}

fn mem_goth_opt_exists(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let key = vm.pop_string(dm)?;
    let section = vm.pop_string(dm)?;
    vm.push_int(dm.config().goth_opt(&section, &key).is_some() as i32);
    Ok(())
}

fn mem_get_mod_opt(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let key = vm.pop_string(dm)?;
    let section = vm.pop_string(dm)?;
    let value = dm.config().mod_opt(&section, &key).unwrap_or_default().to_string();
    vm.push_string(value);
    Ok(())
}

fn mem_mod_opt_exists(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let key = vm.pop_string(dm)?;
    let section = vm.pop_string(dm)?;
    vm.push_int(dm.config().mod_opt(&section, &key).is_some() as i32);
    Ok(())
}

fn mem_get_command_line(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    vm.push_string(dm.config().command_line.clone());
    Ok(())
}

// -------------------------
// Initialization and native code
// -------------------------

fn mem_init_all(dm: &mut DirectMemory, _vm: &mut dyn ScriptVm) -> Result<()> {
    dm.materialize_symtab();
    Ok(())
}

fn asmint_init(_dm: &mut DirectMemory, _vm: &mut dyn ScriptVm) -> Result<()> {
    log::debug!("ASMINT_Init: nothing to patch");
    Ok(())
}

/// Runs the trampoline whose address the script stored in `ASMINT_CallTarget`.
fn asmint_call_my_external(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let target = vm
        .find_symbol("ASMINT_CALLTARGET")
        .and_then(|i| vm.symbol(i))
        .filter(|s| s.kind == SymbolKind::Int)
        .and_then(|s| s.get_int(0))
        .map(Ptr32::from_script)
        .unwrap_or(Ptr32::NULL);
    if target.is_null() {
        log::warn!("ASMINT_CallMyExternal: no call target");
        return Ok(());
    }
    dm.exec_asm(vm, target)?;
    Ok(())
}

// -------------------------
// Floats as int bit patterns
// -------------------------

fn bits(v: i32) -> f32 {
    f32::from_bits(v as u32)
}

fn to_bits(f: f32) -> i32 {
    f.to_bits() as i32
}

fn mkf(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let v = vm.pop_int(dm)?;
    vm.push_int(to_bits(v as f32));
    Ok(())
}

fn truncf(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let v = vm.pop_int(dm)?;
    vm.push_int(bits(v).trunc() as i32);
    Ok(())
}

fn roundf(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let v = vm.pop_int(dm)?;
    vm.push_int(bits(v).round() as i32);
    Ok(())
}

fn float_op(dm: &mut DirectMemory, vm: &mut dyn ScriptVm, op: fn(f32, f32) -> f32) -> Result<()> {
    let b = vm.pop_int(dm)?;
    let a = vm.pop_int(dm)?;
    vm.push_int(to_bits(op(bits(a), bits(b))));
    Ok(())
}

fn addf(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    float_op(dm, vm, |a, b| a + b)
}

fn subf(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    float_op(dm, vm, |a, b| a - b)
}

fn mulf(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    float_op(dm, vm, |a, b| a * b)
}

fn divf(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    float_op(dm, vm, |a, b| {
        if b == 0.0 {
            log::warn!("divf: division by zero");
            0.0
        } else {
            a / b
        }
    })
}

fn cast_to_intf(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let f = vm.pop_float(dm)?;
    vm.push_int(to_bits(f));
    Ok(())
}

fn cast_from_intf(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let v = vm.pop_int(dm)?;
    vm.push_float(bits(v));
    Ok(())
}
