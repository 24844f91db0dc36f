//! Externals of the LeGo script package: integer hash tables and the game timers.

use std::collections::HashMap;

use rgothic_script::vm::ScriptVm;

use crate::direct_memory::{DirectMemory, ExternalFn};
use crate::error::Result;
use crate::mem32::Ptr32;

pub const EXTERNALS: &[(&str, ExternalFn)] = &[
    ("_HT_Create", ht_create),
    ("_HT_Insert", ht_insert),
    ("_HT_Resize", ht_resize),
    ("_HT_Get", ht_get),
    ("_HT_Has", ht_has),
    ("_HT_Remove", ht_remove),
    ("_HT_Destroy", ht_destroy),
    ("Timer", timer),
    ("TimerGT", timer),
];

/// Size of the memory block backing a table handle.
const HANDLE_SIZE: u32 = 12;
/// Element count, mirrored into the handle block.
const HANDLE_COUNT: u32 = 8;

fn table<'a>(dm: &'a mut DirectMemory, handle: i32, what: &str) -> Option<&'a mut HashMap<i32, i32>> {
    let t = dm.hash_tables.get_mut(&(handle as u32));
    if t.is_none() {
        log::warn!("{}: invalid hash table handle 0x{:X}", what, handle);
    }
    t
}

fn publish_count(dm: &mut DirectMemory, handle: i32) {
    let count = dm.hash_tables.get(&(handle as u32)).map(|t| t.len() as i32).unwrap_or(0);
    dm.mem_mut().write_int(Ptr32::from_script(handle).offset(HANDLE_COUNT), count);
}

fn ht_create(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let size = vm.pop_int(dm)?;
    let handle = match dm.mem_mut().alloc(HANDLE_SIZE, "hashtable") {
        Ok(p) => p,
        Err(e) => {
            log::warn!("_HT_Create: {}", e);
            vm.push_int(0);
            return Ok(());
        }
    };
    dm.hash_tables.insert(handle.0, HashMap::with_capacity(size.max(0) as usize));
    vm.push_int(handle.to_script());
    Ok(())
}

fn ht_insert(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let key = vm.pop_int(dm)?;
    let value = vm.pop_int(dm)?;
    let handle = vm.pop_int(dm)?;
    if let Some(t) = table(dm, handle, "_HT_Insert") {
        t.insert(key, value);
        publish_count(dm, handle);
    }
    Ok(())
}

fn ht_resize(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let size = vm.pop_int(dm)?;
    let handle = vm.pop_int(dm)?;
    if let Some(t) = table(dm, handle, "_HT_Resize") {
        t.reserve((size.max(0) as usize).saturating_sub(t.len()));
    }
    Ok(())
}

fn ht_get(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let key = vm.pop_int(dm)?;
    let handle = vm.pop_int(dm)?;
    let v = table(dm, handle, "_HT_Get").and_then(|t| t.get(&key).copied()).unwrap_or(0);
    vm.push_int(v);
    Ok(())
}

fn ht_has(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let key = vm.pop_int(dm)?;
    let handle = vm.pop_int(dm)?;
    let v = table(dm, handle, "_HT_Has").map(|t| t.contains_key(&key)).unwrap_or(false);
    vm.push_int(v as i32);
    Ok(())
}

fn ht_remove(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let key = vm.pop_int(dm)?;
    let handle = vm.pop_int(dm)?;
    if let Some(t) = table(dm, handle, "_HT_Remove") {
        t.remove(&key);
        publish_count(dm, handle);
    }
    Ok(())
}

fn ht_destroy(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let handle = vm.pop_int(dm)?;
    if dm.hash_tables.remove(&(handle as u32)).is_none() {
        log::warn!("_HT_Destroy: invalid hash table handle 0x{:X}", handle);
        return Ok(());
    }
    if let Err(e) = dm.mem_mut().free(Ptr32::from_script(handle)) {
        log::warn!("_HT_Destroy: {}", e);
    }
    Ok(())
}

/// Milliseconds since the engine started, from the pinned `zCTimer`.
fn timer(dm: &mut DirectMemory, vm: &mut dyn ScriptVm) -> Result<()> {
    let t = dm.engine().timer.borrow().total_time;
    vm.push_int(t as i32);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompatConfig;
    use crate::engine::EngineServices;
    use rgothic_script::builder::ScriptBuilder;
    use rgothic_script::vm::DaedalusVm;

    fn bridge() -> (DirectMemory, DaedalusVm) {
        let mut b = ScriptBuilder::new();
        b.external("_HT_CREATE", 1, true);
        b.external("TIMER", 0, true);
        let mut vm = b.into_vm();
        let dm = DirectMemory::new(CompatConfig::default(), EngineServices::default(), &mut vm).unwrap();
        (dm, vm)
    }

    #[test]
    fn hash_table_insert_get_remove() {
        let (mut dm, mut vm) = bridge();
        vm.push_int(16);
        ht_create(&mut dm, &mut vm).unwrap();
        let h = vm.pop_int(&mut dm).unwrap();
        assert_ne!(h, 0);

        for (k, v) in [(1, 10), (2, 20), (1, 11)] {
            vm.push_int(h);
            vm.push_int(v);
            vm.push_int(k);
            ht_insert(&mut dm, &mut vm).unwrap();
        }
        vm.push_int(h);
        vm.push_int(1);
        ht_get(&mut dm, &mut vm).unwrap();
        assert_eq!(vm.pop_int(&mut dm).unwrap(), 11);
        assert_eq!(dm.mem().read_int(Ptr32::from_script(h).offset(HANDLE_COUNT)), 2);

        vm.push_int(h);
        vm.push_int(2);
        ht_remove(&mut dm, &mut vm).unwrap();
        vm.push_int(h);
        vm.push_int(2);
        ht_has(&mut dm, &mut vm).unwrap();
        assert_eq!(vm.pop_int(&mut dm).unwrap(), 0);

        vm.push_int(h);
        ht_destroy(&mut dm, &mut vm).unwrap();
        assert!(!dm.mem().is_allocated_start(Ptr32::from_script(h)));
    }

    #[test]
    fn timer_reads_the_engine_clock() {
        let (mut dm, mut vm) = bridge();
        dm.engine().timer.borrow_mut().tick(250);
        timer(&mut dm, &mut vm).unwrap();
        assert_eq!(vm.pop_int(&mut dm).unwrap(), 250);
    }
}
