use anyhow::Result;
use pretty_assertions::assert_eq;

use rgothic_script::builder::ScriptBuilder;
use rgothic_script::nls::{Decoder, Encoding};
use rgothic_script::vm::{decode_range, ExternalHost, NullHost, Opcode, ScriptVm, VmError};
use rgothic_script::{parse_dat, DatFile};

/// Counts calls of one external and returns its argument doubled.
#[derive(Default)]
struct Doubler {
    calls: u32,
}

impl ExternalHost for Doubler {
    fn call_external(&mut self, vm: &mut dyn ScriptVm, _symbol: u32) -> Result<(), VmError> {
        self.calls += 1;
        let v = vm.pop_int(self)?;
        vm.push_int(v * 2);
        Ok(())
    }
}

fn image() -> Result<Vec<u8>> {
    let mut b = ScriptBuilder::new();
    let double = b.external("DOUBLE", 1, true);
    let out = b.int_var("OUT", 1);
    let greeting = b.string_var("GREETING", 1);
    b.symbol_mut(greeting).set_string(0, "Grüß dich");
    let f = b.begin_function("STARTUP_GLOBAL", 0, false);
    b.code().push_i(21).be(double).push_v(out).op(Opcode::MovI).rsr();
    b.end_function(f);
    let (symbols, code) = b.into_parts();
    DatFile::from_parts(symbols, code).to_bytes(&Decoder::new(Encoding::Windows1252))
}

#[test]
fn compiled_image_loads_and_runs() -> Result<()> {
    let bytes = image()?;
    let dat = parse_dat(&bytes, &Decoder::new(Encoding::Windows1252))?;
    assert_eq!(dat.symbols.len(), 4);
    let greeting = dat.symbols.iter().find(|s| s.name == "GREETING").and_then(|s| s.get_string(0));
    assert_eq!(greeting, Some("Grüß dich"));

    let mut vm = dat.into_vm();
    let mut host = Doubler::default();
    vm.call_by_name(&mut host, "startup_global")?;
    assert_eq!(vm.global_int("OUT"), Some(42));
    assert_eq!(host.calls, 1);
    Ok(())
}

#[test]
fn unbound_external_stops_the_call() -> Result<()> {
    let dat = parse_dat(&image()?, &Decoder::default())?;
    let mut vm = dat.into_vm();
    let err = vm.call_by_name(&mut NullHost, "STARTUP_GLOBAL").unwrap_err();
    assert_eq!(err, VmError::UnboundExternal { name: "DOUBLE".to_string() });
    assert_eq!(vm.global_int("OUT"), Some(0));
    Ok(())
}

#[test]
fn function_body_disassembles() -> Result<()> {
    let dat = parse_dat(&image()?, &Decoder::default())?;
    let code = &dat.code;
    let listing: Vec<Opcode> = decode_range(code, 0, code.len() as u32)?.into_iter().map(|i| i.op).collect();
    assert_eq!(listing, vec![Opcode::PushI, Opcode::Be, Opcode::PushV, Opcode::MovI, Opcode::Rsr]);
    Ok(())
}
