use std::cell::RefCell;
use std::mem::{offset_of, size_of};
use std::rc::Rc;

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use pretty_assertions::assert_eq;

use rgothic_compat::direct_memory::pins::{native, PARSER};
use rgothic_compat::mem32::{Ptr32, SharedPin};
use rgothic_compat::{CompatConfig, DirectMemory, EngineServices};
use rgothic_script::builder::ScriptBuilder;
use rgothic_script::vm::{DaedalusVm, Opcode, ScriptVm};
use rgothic_script::{InstanceRef, SymbolKind};

fn bridge(b: ScriptBuilder) -> Result<(DirectMemory, DaedalusVm)> {
    let mut vm = b.into_vm();
    let dm = DirectMemory::new(CompatConfig::default(), EngineServices::default(), &mut vm)?;
    Ok((dm, vm))
}

/// `COUNT += 1` inside `repeat(I, n) ... end;`.
fn repeat_script(n: i32) -> ScriptBuilder {
    let mut b = ScriptBuilder::new();
    let i = b.int_var("I", 1);
    let count = b.int_var("COUNT", 1);
    let end = b.int_var("END", 1);
    let repeat = b.external("REPEAT", 2, false);
    let f = b.begin_function("LOOP", 0, false);
    b.code().push_v(i).push_i(n).be(repeat);
    b.code().push_i(1).push_v(count).op(Opcode::AddMovI);
    b.code().push_v(end).rsr();
    b.end_function(f);
    b
}

#[test]
fn repeat_runs_its_body_n_times() -> Result<()> {
    let (mut dm, mut vm) = bridge(repeat_script(5))?;
    assert_eq!(dm.loop_report().sites.len(), 1);

    vm.call_by_name(&mut dm, "LOOP")?;
    assert_eq!(vm.global_int("COUNT"), Some(5));
    assert_eq!(vm.global_int("I"), Some(5));
    assert_eq!(vm.stack_len(), 0);

    // A second call starts over.
    vm.call_by_name(&mut dm, "LOOP")?;
    assert_eq!(vm.global_int("COUNT"), Some(10));
    Ok(())
}

#[test]
fn repeat_zero_skips_the_body() -> Result<()> {
    let (mut dm, mut vm) = bridge(repeat_script(0))?;
    vm.call_by_name(&mut dm, "LOOP")?;
    assert_eq!(vm.global_int("COUNT"), Some(0));
    assert_eq!(vm.global_int("I"), Some(0));
    Ok(())
}

#[test]
fn break_leaves_the_innermost_loop() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let i = b.int_var("I", 1);
    let count = b.int_var("COUNT", 1);
    let end = b.int_var("END", 1);
    let brk = b.int_var("BREAK", 1);
    let repeat = b.external("REPEAT", 2, false);
    let f = b.begin_function("LOOP", 0, false);
    b.code().push_v(i).push_i(10).be(repeat);
    b.code().push_i(1).push_v(count).op(Opcode::AddMovI);
    // if (I == 2) { break; };
    let skip = b.code().push_i(2).push_v(i).op(Opcode::Eq).bz_forward();
    b.code().push_v(brk);
    b.code().bind(skip);
    b.code().push_v(end).rsr();
    b.end_function(f);
    let (mut dm, mut vm) = bridge(b)?;

    vm.call_by_name(&mut dm, "LOOP")?;
    assert_eq!(vm.global_int("COUNT"), Some(3));
    assert_eq!(vm.global_int("I"), Some(2));
    Ok(())
}

#[test]
fn while_reevaluates_its_condition() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let x = b.int_var("X", 1);
    let end = b.int_var("END", 1);
    let while_ = b.external("WHILE", 1, false);
    let f = b.begin_function("LOOP", 0, false);
    // while (X < 3); X += 1; end;
    b.code().push_i(3).push_v(x).op(Opcode::Lt).be(while_);
    b.code().push_i(1).push_v(x).op(Opcode::AddMovI);
    b.code().push_v(end).rsr();
    b.end_function(f);
    let (mut dm, mut vm) = bridge(b)?;

    vm.call_by_name(&mut dm, "LOOP")?;
    assert_eq!(vm.global_int("X"), Some(3));
    Ok(())
}

#[test]
fn continue_skips_the_rest_of_a_repeat_body() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let i = b.int_var("I", 1);
    let count = b.int_var("COUNT", 1);
    let after = b.int_var("AFTER", 1);
    let end = b.int_var("END", 1);
    let cont = b.int_var("CONTINUE", 1);
    let repeat = b.external("REPEAT", 2, false);
    let f = b.begin_function("LOOP", 0, false);
    b.code().push_v(i).push_i(5).be(repeat);
    b.code().push_i(1).push_v(count).op(Opcode::AddMovI);
    // if (I >= 2) { continue; };
    let skip = b.code().push_i(2).push_v(i).op(Opcode::Gte).bz_forward();
    b.code().push_v(cont);
    b.code().bind(skip);
    b.code().push_i(1).push_v(after).op(Opcode::AddMovI);
    b.code().push_v(end).rsr();
    b.end_function(f);
    let (mut dm, mut vm) = bridge(b)?;

    vm.call_by_name(&mut dm, "LOOP")?;
    assert_eq!(vm.global_int("COUNT"), Some(5));
    assert_eq!(vm.global_int("AFTER"), Some(2));
    assert_eq!(vm.global_int("I"), Some(5));
    Ok(())
}

#[test]
fn continue_in_while_goes_back_to_the_condition() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let x = b.int_var("X", 1);
    let y = b.int_var("Y", 1);
    let end = b.int_var("END", 1);
    let cont = b.int_var("CONTINUE", 1);
    let while_ = b.external("WHILE", 1, false);
    let f = b.begin_function("LOOP", 0, false);
    // while (X < 4); X += 1; if (X == 2) { continue; }; Y += 1; end;
    b.code().push_i(4).push_v(x).op(Opcode::Lt).be(while_);
    b.code().push_i(1).push_v(x).op(Opcode::AddMovI);
    let skip = b.code().push_i(2).push_v(x).op(Opcode::Eq).bz_forward();
    b.code().push_v(cont);
    b.code().bind(skip);
    b.code().push_i(1).push_v(y).op(Opcode::AddMovI);
    b.code().push_v(end).rsr();
    b.end_function(f);
    let (mut dm, mut vm) = bridge(b)?;

    vm.call_by_name(&mut dm, "LOOP")?;
    assert_eq!(vm.global_int("X"), Some(4));
    assert_eq!(vm.global_int("Y"), Some(3));
    Ok(())
}

#[test]
fn goto_jumps_back_to_a_label() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let x = b.int_var("X", 1);
    let label = b.external("MEM_LABEL", 1, false);
    let goto = b.external("MEM_GOTO", 1, false);
    let f = b.begin_function("LOOP", 0, false);
    // MEM_Label(0); X += 1; if (X < 3) { MEM_Goto(0); };
    b.code().push_i(0).be(label);
    b.code().push_i(1).push_v(x).op(Opcode::AddMovI);
    let skip = b.code().push_i(3).push_v(x).op(Opcode::Lt).bz_forward();
    b.code().push_i(0).be(goto);
    b.code().bind(skip);
    b.code().rsr();
    b.end_function(f);
    let (mut dm, mut vm) = bridge(b)?;
    assert_eq!(dm.loop_report().labels, 1);

    vm.call_by_name(&mut dm, "LOOP")?;
    assert_eq!(vm.global_int("X"), Some(3));
    Ok(())
}

#[test]
fn untraceable_while_condition_runs_the_body_at_most_once() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let x = b.int_var("X", 1);
    let count = b.int_var("COUNT", 1);
    let end = b.int_var("END", 1);
    let while_ = b.external("WHILE", 1, false);
    let f = b.begin_function("LOOP", 0, false);
    // The condition value is pushed before an unrelated assignment.
    b.code().push_i(1).push_i(5).push_v(x).op(Opcode::MovI).be(while_);
    b.code().push_i(1).push_v(count).op(Opcode::AddMovI);
    b.code().push_v(end).rsr();
    b.end_function(f);
    let (mut dm, mut vm) = bridge(b)?;

    let report = dm.loop_report();
    assert_eq!(report.sites.len(), 1);
    assert_eq!(report.sites[0].cond_start, None);
    assert!(report.failures.iter().any(|f| f.contains("could not be traced")), "{:?}", report.failures);

    vm.call_by_name(&mut dm, "LOOP")?;
    assert_eq!(vm.global_int("COUNT"), Some(1));
    assert_eq!(vm.global_int("X"), Some(5));
    Ok(())
}

#[test]
fn loop_control_outside_a_loop_is_reported_and_ignored() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let x = b.int_var("X", 1);
    b.int_var("END", 1);
    let brk = b.int_var("BREAK", 1);
    let cont = b.int_var("CONTINUE", 1);
    b.external("REPEAT", 2, false);
    let f = b.begin_function("STRAY", 0, false);
    b.code().push_v(brk);
    b.code().push_v(cont);
    b.code().push_i(7).push_v(x).op(Opcode::MovI).rsr();
    b.end_function(f);
    let (mut dm, mut vm) = bridge(b)?;

    let report = dm.loop_report();
    assert_eq!(report.failures.iter().filter(|f| f.contains("outside of a loop")).count(), 2);

    vm.call_by_name(&mut dm, "STRAY")?;
    assert_eq!(vm.global_int("X"), Some(7));
    Ok(())
}

#[test]
fn copying_bytes_leaves_unrelated_variables_alone() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let alloc = b.external("MEM_ALLOC", 1, true);
    let write = b.external("MEM_WRITEINT", 2, false);
    let copy = b.external("MEM_COPYBYTES", 3, false);
    let ptr_to_inst = b.external("MEM_PTRTOINST", 1, true);
    let addr = b.external("_@", 1, true);
    let class = b.class("C_ITEM", 16);
    let item = b.instance_var("ITEM", Some(class));
    let x = b.int_var("X", 1);
    let y = b.int_var("Y", 1);
    let a = b.int_var("A", 1);

    let f = b.begin_function("COPY", 0, false);
    // X = 5; A = MEM_Alloc(8); ITEM = MEM_PtrToInst(A);
    b.code().push_i(5).push_v(x).op(Opcode::MovI);
    b.code().push_i(8).be(alloc).push_v(a).op(Opcode::MovI);
    b.code().push_v(a).be(ptr_to_inst).push_vi(item).op(Opcode::MovVI);
    // MEM_CopyBytes(A, A + 4, 4);
    b.code().push_v(a).push_i(4).push_v(a).op(Opcode::Add).push_i(4).be(copy);
    // MEM_WriteInt(A, 9); MEM_CopyBytes(A, _@(Y), 4);
    b.code().push_v(a).push_i(9).be(write);
    b.code().push_v(a).push_v(y).be(addr).push_i(4).be(copy).rsr();
    b.end_function(f);
    let (mut dm, mut vm) = bridge(b)?;

    vm.call_by_name(&mut dm, "COPY")?;
    let block = vm.global_int("A").unwrap_or(0);
    assert!(dm.mem().is_allocated_start(Ptr32::from_script(block)));
    assert_eq!(vm.global_int("X"), Some(5));
    assert_eq!(vm.global_int("Y"), Some(9));
    assert_eq!(vm.symbol(item).map(|s| s.instance), Some(InstanceRef::Memory(block as u32)));
    Ok(())
}

#[test]
fn script_called_from_a_trampoline_keeps_its_writes() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let hits = b.int_var("HITS", 1);
    b.int_var("X", 1);
    let inc = b.begin_function("INC", 0, false);
    b.code().push_i(1).push_v(hits).op(Opcode::AddMovI).rsr();
    b.end_function(inc);
    let (mut dm, mut vm) = bridge(b)?;
    assert!(vm.set_global_int("X", 5));

    let id = inc.to_le_bytes();
    let parser = PARSER.0.to_le_bytes();
    let target = native::ZCPARSER_CALL_FUNC.0.to_le_bytes();
    // push INC; mov ecx, parser; mov eax, zCParser::CallFunc; call eax; retn
    let code = [
        0x68, id[0], id[1], id[2], id[3],
        0xB9, parser[0], parser[1], parser[2], parser[3],
        0xB8, target[0], target[1], target[2], target[3],
        0xFF, 0xD0,
        0xC3,
    ];
    dm.exec_code(&mut vm, Ptr32(0x0040_0000), &code)?;
    assert_eq!(vm.global_int("HITS"), Some(1));
    assert_eq!(vm.global_int("X"), Some(5));

    dm.exec_code(&mut vm, Ptr32(0x0040_0000), &code)?;
    assert_eq!(vm.global_int("HITS"), Some(2));
    Ok(())
}

#[test]
fn script_members_of_a_memory_instance_live_in_the_block() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let alloc = b.external("MEM_ALLOC", 1, true);
    let read = b.external("MEM_READINT", 1, true);
    let write = b.external("MEM_WRITEINT", 2, false);
    let ptr_to_inst = b.external("MEM_PTRTOINST", 1, true);
    let class = b.class("C_ITEM", 16);
    let value = b.member(class, "C_ITEM.VALUE", SymbolKind::Int, 4);
    let item = b.instance_var("ITEM", Some(class));
    let block = b.int_var("BLOCK", 1);
    let seen = b.int_var("SEEN", 1);
    let back = b.int_var("BACK", 1);

    let f = b.begin_function("MEMBERS", 0, false);
    // BLOCK = MEM_Alloc(16); ITEM = MEM_PtrToInst(BLOCK);
    b.code().push_i(16).be(alloc).push_v(block).op(Opcode::MovI);
    b.code().push_v(block).be(ptr_to_inst).push_vi(item).op(Opcode::MovVI);
    // ITEM.VALUE = 77; SEEN = MEM_ReadInt(BLOCK + 4);
    b.code().push_i(77).gmovi(item).push_v(value).op(Opcode::MovI);
    b.code().push_i(4).push_v(block).op(Opcode::Add).be(read).push_v(seen).op(Opcode::MovI);
    // MEM_WriteInt(BLOCK + 4, 91); BACK = ITEM.VALUE;
    b.code().push_i(4).push_v(block).op(Opcode::Add).push_i(91).be(write);
    b.code().gmovi(item).push_v(value).push_v(back).op(Opcode::MovI).rsr();
    b.end_function(f);
    let (mut dm, mut vm) = bridge(b)?;

    vm.call_by_name(&mut dm, "MEMBERS")?;
    let block = Ptr32::from_script(vm.global_int("BLOCK").unwrap_or(0));
    assert!(dm.mem().is_allocated_start(block));
    assert_eq!(vm.global_int("SEEN"), Some(77));
    assert_eq!(vm.global_int("BACK"), Some(91));
    assert_eq!(dm.mem().read_int(block.offset(4)), 91);
    assert_eq!(dm.mem().read_int(block), 0);
    Ok(())
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct Npc {
    id: i32,
    attribute: [i32; 4],
    guild: i32,
}

rgothic_compat::impl_pin_target_pod!(Npc);

const GUILD_FIELD: Ptr32 = Ptr32(0x0089_1234);

#[test]
fn script_reaches_host_memory_and_calls_back() -> Result<()> {
    let mut b = ScriptBuilder::new();
    let alloc = b.external("MEM_ALLOC", 1, true);
    let write = b.external("MEM_WRITEINT", 2, false);
    let call = b.external("MEM_CALLBYID", 1, false);
    let block = b.int_var("BLOCK", 1);
    let hits = b.int_var("HITS", 1);

    let inc = b.begin_function("INC", 0, false);
    b.code().push_i(1).push_v(hits).op(Opcode::AddMovI).rsr();
    b.end_function(inc);

    let main = b.begin_function("SCENARIO", 0, false);
    b.code().push_i(16).be(alloc).push_v(block).op(Opcode::MovI);
    b.code().push_i(GUILD_FIELD.to_script()).push_i(42).be(write);
    b.code().push_i(inc as i32).be(call).rsr();
    b.end_function(main);
    let (mut dm, mut vm) = bridge(b)?;

    let npc = Rc::new(RefCell::new(Npc { id: 7, ..Npc::default() }));
    let target: SharedPin = npc.clone();
    let at = dm.mem_mut().pin(target, offset_of!(Npc, guild), GUILD_FIELD, size_of::<i32>() as u32, "npc.guild")?;
    assert_eq!(at, GUILD_FIELD);

    vm.call_by_name(&mut dm, "SCENARIO")?;

    let block = Ptr32::from_script(vm.global_int("BLOCK").unwrap_or(0));
    assert!(dm.mem().is_allocated_start(block));
    assert!(dm.mem().region_at(block).is_some_and(|r| r.size >= 16));
    assert_eq!(npc.borrow().guild, 42);
    assert_eq!(npc.borrow().id, 7);
    assert_eq!(vm.global_int("HITS"), Some(1));
    assert_eq!(vm.stack_len(), 0);
    Ok(())
}

#[test]
fn report_lists_bindings_and_pins() -> Result<()> {
    let mut b = ScriptBuilder::new();
    b.external("MEM_READINT", 1, true);
    b.external("HLP_RANDOM", 1, true);
    let (dm, _vm) = bridge(b)?;

    let report = dm.report();
    assert!(report.externals.bound.contains_key("MEM_ReadInt"));
    assert!(!report.externals.bound.contains_key("Hlp_Random"));
    assert!(report.externals.missing.iter().any(|n| n == "MEM_Alloc"));
    assert!(report.regions.iter().any(|r| r.label.as_deref() == Some("code stack")));

    let json = serde_json::to_string(&report)?;
    assert!(json.contains("MEM_ReadInt"));
    Ok(())
}
