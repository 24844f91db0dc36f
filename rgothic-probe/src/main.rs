use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use serde::Serialize;

use rgothic_compat::{BridgeReport, CompatConfig, CompatConfigReader, DirectMemory, EngineServices, LoggerConfig};
use rgothic_script::nls::{Decoder, Encoding};
use rgothic_script::vm::{decode_range, ExternalHost, ScriptVm, VmError};
use rgothic_script::DatFile;

/// Load a compiled script image behind the Ikarus/LeGo bridge and dump what was bound.
#[derive(ClapParser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Compiled script image, e.g. GOTHIC.DAT
    #[arg(short, long, required = true)]
    input: PathBuf,

    /// Bridge configuration (JSON). Written with defaults when it does not exist.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Code page of the image: 1252, 1250, 1251 or utf8
    #[arg(short, long)]
    encoding: Option<Encoding>,

    /// Run this script function after the bridge is set up
    #[arg(long)]
    call: Option<String>,

    /// Include a listing of every script function
    #[arg(short, long)]
    disasm: bool,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct FunctionListing {
    name: String,
    address: u32,
    code: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    input: PathBuf,
    symbols: usize,
    bridge: BridgeReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    call: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    listing: Vec<FunctionListing>,
}

/// Host for externals the bridge does not implement: drops the arguments and
/// returns zero, so engine calls in the probed function are skipped.
struct StubHost;

impl ExternalHost for StubHost {
    fn call_external(&mut self, vm: &mut dyn ScriptVm, symbol: u32) -> Result<(), VmError> {
        let (name, params, returns) = match vm.symbol(symbol) {
            Some(s) => (s.name.clone(), s.count, s.has_return()),
            None => return Err(VmError::UnknownSymbol { index: symbol }),
        };
        log::debug!("stubbed external {}", name);
        for _ in 0..params {
            vm.pop_raw()?;
        }
        if returns {
            vm.push_int(0);
        }
        Ok(())
    }
}

fn init_logging(config: &LoggerConfig) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.level_filter);
    for module in ["rgothic_script", "rgothic_compat", "rgothic_probe"] {
        builder.filter_module(module, config.app_level_filter);
    }
    builder.parse_default_env();
    if builder.try_init().is_err() {
        eprintln!("logger already initialized");
    }
}

fn load_config(path: Option<&Path>) -> Result<CompatConfig> {
    match path {
        Some(p) => CompatConfigReader::read_or_create_default(p),
        None => Ok(CompatConfig::default()),
    }
}

fn listing(vm: &dyn ScriptVm) -> Vec<FunctionListing> {
    let mut starts: Vec<(u32, u32)> = vm
        .symbols()
        .iter()
        .filter(|s| s.kind.has_code() && !s.is_external() && s.address < vm.code().len() as u32)
        .map(|s| (s.address, s.index))
        .collect();
    starts.sort_unstable();
    starts.dedup_by_key(|(address, _)| *address);

    let code_len = vm.code().len() as u32;
    starts
        .iter()
        .enumerate()
        .filter_map(|(i, &(address, index))| {
            let end = starts.get(i + 1).map(|&(a, _)| a).unwrap_or(code_len);
            let sym = vm.symbol(index)?;
            let code = match decode_range(vm.code(), address, end) {
                Ok(ins) => ins.iter().map(ToString::to_string).collect(),
                Err(e) => vec![format!("<{}>", e)],
            };
            Some(FunctionListing { name: sym.name.clone(), address, code })
        })
        .collect()
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(encoding) = args.encoding {
        config.encoding = encoding;
    }
    init_logging(&config.logger_config);

    let dat = DatFile::open(&args.input, &Decoder::new(config.encoding))?;
    log::info!("{}: {} symbols, 0x{:X} bytes of code", args.input.display(), dat.symbols.len(), dat.code.len());
    let symbols = dat.symbols.len();
    let mut vm = dat.into_vm();
    let mut bridge = DirectMemory::new(config, EngineServices::default(), &mut vm)
        .with_context(|| format!("set up the bridge for {}", args.input.display()))?
        .with_fallback(Box::new(StubHost));

    let call = match &args.call {
        Some(name) => Some(match vm.call_by_name(&mut bridge, name) {
            Ok(()) => format!("{}: ok", name),
            Err(e) => {
                log::error!("{}: {}", name, e);
                format!("{}: {}", name, e)
            }
        }),
        None => None,
    };

    let report = ProbeReport {
        input: args.input.clone(),
        symbols,
        bridge: bridge.report(),
        call,
        listing: if args.disasm { listing(&vm) } else { Vec::new() },
    };

    match &args.output {
        Some(path) => {
            let mut writer = File::create(path).with_context(|| format!("create {}", path.display()))?;
            serde_yaml::to_writer(&mut writer, &report)?;
            writer.flush()?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = stdout.lock();
            serde_yaml::to_writer(&mut writer, &report)?;
            writer.flush()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgothic_script::builder::ScriptBuilder;
    use rgothic_script::vm::Opcode;

    #[test]
    fn stub_host_drops_arguments_and_returns_zero() {
        let mut b = ScriptBuilder::new();
        let ext = b.external("WLD_GETDAY", 2, true);
        let out = b.int_var("OUT", 1);
        let f = b.begin_function("F", 0, false);
        b.code().push_i(1).push_i(2).be(ext).push_v(out).op(Opcode::MovI).rsr();
        b.end_function(f);
        let mut vm = b.into_vm();
        vm.set_global_int("OUT", 9);

        vm.call_by_name(&mut StubHost, "F").unwrap();
        assert_eq!(vm.global_int("OUT"), Some(0));
        assert_eq!(vm.stack_len(), 0);
    }

    #[test]
    fn listing_splits_the_code_per_function() {
        let mut b = ScriptBuilder::new();
        let f = b.begin_function("A", 0, true);
        b.code().push_i(1).rsr();
        b.end_function(f);
        let g = b.begin_function("B", 0, false);
        b.code().rsr();
        b.end_function(g);
        let vm = b.into_vm();

        let l = listing(&vm);
        assert_eq!(l.len(), 2);
        assert_eq!(l[0].name, "A");
        assert_eq!(l[0].code.len(), 2);
        assert_eq!(l[1].address, 6);
        assert_eq!(l[1].code.len(), 1);
    }
}
