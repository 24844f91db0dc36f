use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use pretty_assertions::assert_eq;

use rgothic_compat::cpu32::{ArgKind, CallConv, Cpu32, CpuHost, ExecOutcome, NativeArg, Registers};
use rgothic_compat::mem32::{Mem32, Ptr32};

struct Host(Mem32);

impl CpuHost for Host {
    fn mem(&mut self) -> &mut Mem32 {
        &mut self.0
    }
}

const BASE: Ptr32 = Ptr32(0x0040_0000);
const HANDLER: Ptr32 = Ptr32(0x0071_2340);

fn le(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

/// `call rel32` at offset `pc` of a trampoline mapped at `BASE`.
fn call_to(pc: u32, target: Ptr32) -> [u8; 5] {
    let rel = le(target.0.wrapping_sub(BASE.0 + pc + 5));
    [0xE8, rel[0], rel[1], rel[2], rel[3]]
}

#[test]
fn thiscall_receives_ecx_then_parameters_in_declaration_order() -> Result<()> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut cpu = Cpu32::new();
    let s = seen.clone();
    cpu.register(HANDLER, "oCNpc::SetAttribute(int,int)", CallConv::Thiscall, &[ArgKind::Int, ArgKind::Int], move |_, args| {
        s.borrow_mut().extend_from_slice(args);
        Some(1)
    });

    // mov ecx, 0xCAFE; push 50 (value); push 2 (attribute); call handler; retn
    let mut code = vec![0xB9];
    code.extend_from_slice(&le(0xCAFE));
    code.extend_from_slice(&[0x6A, 50, 0x6A, 2]);
    code.extend_from_slice(&call_to(code.len() as u32, HANDLER));
    code.push(0xC3);

    let out = cpu.exec(&mut Host(Mem32::default()), BASE, &code)?;
    assert_eq!(out, ExecOutcome::Returned);
    assert_eq!(*seen.borrow(), vec![NativeArg::Ptr(Ptr32(0xCAFE)), NativeArg::Int(2), NativeArg::Int(50)]);
    assert_eq!(cpu.registers().eax, 1);
    // The callee cleaned its arguments.
    assert!(cpu.stack().is_empty());
    Ok(())
}

#[test]
fn stdcall_float_and_string_arguments() -> Result<()> {
    let mut host = Host(Mem32::default());
    let text = host.0.alloc(8, "chars")?;
    host.0.write_bytes(text, b"HERO\0");
    let zstring = host.0.alloc(20, "zString")?;
    host.0.write_int(zstring.offset(8), text.to_script());
    host.0.write_int(zstring.offset(12), 4);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();
    let mut cpu = Cpu32::new();
    cpu.register(HANDLER, "Print(zSTRING const&,float)", CallConv::Stdcall, &[ArgKind::Str, ArgKind::Float], move |_, args| {
        s.borrow_mut().extend_from_slice(args);
        None
    });

    let mut code = vec![0x68];
    code.extend_from_slice(&le(1.5f32.to_bits()));
    code.push(0x68);
    code.extend_from_slice(&le(zstring.0));
    code.extend_from_slice(&call_to(code.len() as u32, HANDLER));

    assert_eq!(cpu.exec(&mut host, BASE, &code)?, ExecOutcome::EndOfSpan);
    assert_eq!(*seen.borrow(), vec![NativeArg::Str(b"HERO".to_vec()), NativeArg::Float(1.5)]);
    Ok(())
}

#[test]
fn the_same_trampoline_runs_the_same_way_twice() -> Result<()> {
    fn run() -> Result<(Registers, Vec<u8>, Vec<i32>)> {
        let mut host = Host(Mem32::new(0x1000, 0x10_0000));
        let cell = host.0.alloc(16, "cell")?;
        host.0.write_int(cell, 21);

        let calls = Rc::new(RefCell::new(Vec::new()));
        let c = calls.clone();
        let mut cpu = Cpu32::new();
        cpu.register(HANDLER, "double", CallConv::Stdcall, &[ArgKind::Int], move |_, args| {
            c.borrow_mut().push(args[0].as_int());
            Some((args[0].as_int() * 2) as u32)
        });

        // mov eax,[cell]; push eax; call double; mov [cell+4],eax; mov ecx,eax; push ecx; pop edx; retn
        let mut code = vec![0xA1];
        code.extend_from_slice(&le(cell.0));
        code.push(0x50);
        code.extend_from_slice(&call_to(code.len() as u32, HANDLER));
        code.push(0xA3);
        code.extend_from_slice(&le(cell.offset(4).0));
        code.extend_from_slice(&[0x8B, 0xC8, 0x51, 0x5A, 0xC3]);

        cpu.exec(&mut host, BASE, &code)?;
        let bytes = host.0.read_bytes(cell, 16);
        let calls = calls.borrow().clone();
        Ok((cpu.registers(), bytes, calls))
    }

    let first = run()?;
    let second = run()?;
    assert_eq!(first, second);
    assert_eq!(first.0.eax, 42);
    assert_eq!(first.0.edx, 42);
    assert_eq!(&first.1[4..8], &42i32.to_le_bytes());
    assert_eq!(first.2, vec![21]);
    Ok(())
}
