//! Binding of bridge-implemented externals to script symbols.

use std::collections::{BTreeMap, HashMap};

use rgothic_script::vm::{ScriptVm, StackValue};
use rgothic_script::SymbolKind;
use serde::Serialize;

use crate::error::{BridgeError, Result};

use super::DirectMemory;

/// An external implemented by the bridge. Arguments are popped from the VM stack
/// (last argument first) and the result, if any, is pushed back.
pub type ExternalFn = fn(&mut DirectMemory, &mut dyn ScriptVm) -> Result<()>;

#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub name: &'static str,
    pub func: ExternalFn,
}

/// Symbol index -> bridge implementation.
#[derive(Debug, Default)]
pub struct ExternalTable {
    bound: HashMap<u32, Binding>,
    /// Names from the tables the script does not declare.
    missing: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindingReport {
    pub bound: BTreeMap<String, u32>,
    pub missing: Vec<String>,
}

impl ExternalTable {
    /// Bind every entry of `table` the script knows by name.
    ///
    /// Script-defined functions (the extension packages ship Daedalus fallbacks for
    /// most of them) are overridden so `bl` reaches the bridge as well.
    pub fn bind(&mut self, vm: &mut dyn ScriptVm, table: &[(&'static str, ExternalFn)]) {
        for &(name, func) in table {
            let Some(index) = vm.find_symbol(name) else {
                self.missing.push(name);
                continue;
            };
            let kind = vm.symbol(index).map(|s| s.kind);
            if !matches!(kind, Some(SymbolKind::Function)) {
                log::warn!("{} is not a function ({:?}); not bound", name, kind);
                continue;
            }
            vm.override_function(index);
            if let Some(old) = self.bound.insert(index, Binding { name, func }) {
                log::warn!("external {} rebound over {}", name, old.name);
            }
        }
    }

    pub fn get(&self, symbol: u32) -> Option<Binding> {
        self.bound.get(&symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    pub fn report(&self) -> BindingReport {
        BindingReport {
            bound: self.bound.iter().map(|(i, b)| (b.name.to_string(), *i)).collect(),
            missing: self.missing.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A `func`-typed argument: either a pushed symbol index or a reference to the function.
pub(crate) fn pop_func(vm: &mut dyn ScriptVm) -> Result<u32> {
    match vm.pop_raw()? {
        StackValue::Int(i) => Ok(i as u32),
        StackValue::Ref { symbol, .. } => Ok(symbol),
        other => Err(BridgeError::UnresolvedFunction(format!("a {} was passed as a function", other.kind_name()))),
    }
}

impl DirectMemory {
    /// Run `symbol` in the VM with the bridge as host. Script errors go back to the VM.
    pub(crate) fn call_symbol(&mut self, vm: &mut dyn ScriptVm, symbol: u32) -> Result<()> {
        let Some(sym) = vm.symbol(symbol) else {
            log::warn!("call: unknown symbol {}", symbol);
            return Ok(());
        };
        if !sym.kind.has_code() {
            log::warn!("call: {} is not callable", sym);
            return Ok(());
        }
        vm.call_function(self, symbol)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgothic_script::builder::ScriptBuilder;

    fn noop(_: &mut DirectMemory, _: &mut dyn ScriptVm) -> Result<()> {
        Ok(())
    }

    #[test]
    fn script_functions_are_overridden_and_missing_names_listed() {
        let mut b = ScriptBuilder::new();
        let f = b.begin_function("MEM_READINT", 1, true);
        b.code().rsr();
        b.end_function(f);
        let ext = b.external("MEM_WRITEINT", 2, false);
        b.int_var("MEM_ALLOC", 1);
        let mut vm = b.into_vm();

        let mut table = ExternalTable::default();
        table.bind(&mut vm, &[("MEM_ReadInt", noop), ("MEM_WriteInt", noop), ("MEM_Alloc", noop), ("MEM_Free", noop)]);

        assert_eq!(table.len(), 2);
        assert!(vm.symbol(f).unwrap().is_external());
        assert!(table.get(ext).is_some());
        assert_eq!(table.report().missing, vec!["MEM_Free".to_string()]);
    }
}
