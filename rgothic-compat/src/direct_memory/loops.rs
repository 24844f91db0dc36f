//! `repeat`/`while` emulation.
//!
//! The script compiler knows nothing about loops; the extensions fake them with a
//! call (`repeat(i, n)` / `while(cond)`) and a closing `END;` statement, and the
//! original runtime rewrote the byte-code in place. Here every loop is paired with
//! its `END` once, ahead of time, and the bridge steers the VM with `unsafe_jump`
//! when the call, `END`, `BREAK` or `CONTINUE` is reached.

use std::collections::{BTreeMap, HashMap};

use rgothic_script::vm::{decode_range, Instruction, Opcode, ScriptVm, StackValue};
use rgothic_script::InstanceRef;
use serde::Serialize;

use crate::error::{BridgeError, Result};
use crate::trace;

use super::DirectMemory;

/// Size of `bl`, `be` and `pushv`.
const CALL_SIZE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopKind {
    Repeat,
    While,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopSite {
    pub kind: LoopKind,
    pub function: String,
    pub call_pc: u32,
    pub end_pc: u32,
    /// First instruction of the `while` condition; `None` if it could not be traced.
    pub cond_start: Option<u32>,
}

impl LoopSite {
    pub fn body(&self) -> u32 {
        self.call_pc + CALL_SIZE
    }

    pub fn exit(&self) -> u32 {
        self.end_pc + CALL_SIZE
    }
}

/// Symbols that take part in loop emulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopSymbols {
    pub repeat: Option<u32>,
    pub while_: Option<u32>,
    pub end: Option<u32>,
    pub break_: Option<u32>,
    pub continue_: Option<u32>,
    pub label: Option<u32>,
    pub goto: Option<u32>,
}

impl LoopSymbols {
    pub fn resolve(vm: &dyn ScriptVm) -> Self {
        Self {
            repeat: vm.find_symbol("REPEAT"),
            while_: vm.find_symbol("WHILE"),
            end: vm.find_symbol("END"),
            break_: vm.find_symbol("BREAK"),
            continue_: vm.find_symbol("CONTINUE"),
            label: vm.find_symbol("MEM_LABEL"),
            goto: vm.find_symbol("MEM_GOTO"),
        }
    }

    fn traps(&self) -> impl Iterator<Item = u32> {
        [self.end, self.break_, self.continue_].into_iter().flatten()
    }
}

#[derive(Debug, Clone, Copy)]
struct RepeatState {
    symbol: u32,
    index: u32,
    context: InstanceRef,
    count: i32,
}

/// Result of the static pass, plus the per-pc runtime payload.
#[derive(Debug, Default)]
pub struct LoopTable {
    symbols: LoopSymbols,
    sites: BTreeMap<u32, LoopSite>,
    by_end: HashMap<u32, u32>,
    /// `BREAK`/`CONTINUE` pc -> owning loop call pc.
    by_control: HashMap<u32, u32>,
    labels: HashMap<(u32, i32), u32>,
    /// `(start, end, symbol)` of every function body, sorted by start.
    functions: Vec<(u32, u32, u32)>,
    failures: Vec<String>,
    repeats: HashMap<u32, RepeatState>,
}

/// Serializable summary of the static pass.
#[derive(Debug, Clone, Serialize)]
pub struct LoopReport {
    pub sites: Vec<LoopSite>,
    pub labels: usize,
    pub failures: Vec<String>,
}

/// Code addresses of the functions whose calls open a loop.
struct CallTargets {
    repeat: Option<u32>,
    while_: Option<u32>,
    label: Option<u32>,
}

fn code_address(vm: &dyn ScriptVm, symbol: Option<u32>) -> Option<u32> {
    let sym = vm.symbol(symbol?)?;
    (sym.kind.has_code() && !sym.is_external()).then_some(sym.address)
}

fn calls(ins: &Instruction, symbol: Option<u32>, address: Option<u32>) -> bool {
    match ins.op {
        Opcode::Be => symbol == Some(ins.operand),
        Opcode::Bl => address == Some(ins.operand),
        _ => false,
    }
}

impl LoopTable {
    /// Scan every function body. Must run before the loop functions are overridden,
    /// since script-defined `repeat`/`while` are recognised by their code address.
    pub fn analyze(vm: &dyn ScriptVm) -> Self {
        let symbols = LoopSymbols::resolve(vm);
        let targets = CallTargets {
            repeat: code_address(vm, symbols.repeat),
            while_: code_address(vm, symbols.while_),
            label: code_address(vm, symbols.label),
        };

        let mut starts: Vec<(u32, u32)> = vm
            .symbols()
            .iter()
            .filter(|s| s.kind.has_code() && !s.is_external() && !s.is_member())
            .map(|s| (s.address, s.index))
            .collect();
        starts.sort_unstable();
        starts.dedup_by_key(|(a, _)| *a);
        let code_len = vm.code().len() as u32;
        let functions: Vec<(u32, u32, u32)> = starts
            .iter()
            .enumerate()
            .map(|(i, (start, sym))| (*start, starts.get(i + 1).map(|n| n.0).unwrap_or(code_len), *sym))
            .filter(|(start, end, _)| start < end)
            .collect();

        let mut table = Self { symbols, functions, ..Self::default() };
        if symbols.end.is_none() && (symbols.repeat.is_some() || symbols.while_.is_some()) {
            table.failures.push("END is not defined; loops are inert".to_string());
        }
        for (start, end, sym) in table.functions.clone() {
            if let Err(e) = table.scan_function(vm, &targets, start, end, sym) {
                log::error!("{}", e);
                table.failures.push(e.to_string());
            }
        }
        log::debug!(
            "loop analysis: {} loops, {} labels, {} problems",
            table.sites.len(),
            table.labels.len(),
            table.failures.len()
        );
        table
    }

    fn scan_function(
        &mut self,
        vm: &dyn ScriptVm,
        targets: &CallTargets,
        start: u32,
        end: u32,
        symbol: u32,
    ) -> Result<()> {
        let name = vm.symbol(symbol).map(|s| s.name.clone()).unwrap_or_default();
        let body = decode_range(vm.code(), start, end).map_err(|e| BridgeError::LoopAnalysisFailure {
            function: name.clone(),
            pc: start,
            reason: e.to_string(),
        })?;

        let mut open: Vec<(usize, LoopKind)> = Vec::new();
        for (i, ins) in body.iter().enumerate() {
            if calls(ins, self.symbols.repeat, targets.repeat) {
                open.push((i, LoopKind::Repeat));
            } else if calls(ins, self.symbols.while_, targets.while_) {
                open.push((i, LoopKind::While));
            } else if calls(ins, self.symbols.label, targets.label) {
                match i.checked_sub(1).map(|p| &body[p]) {
                    Some(prev) if prev.op == Opcode::PushI => {
                        self.labels.insert((symbol, prev.immediate()), ins.next());
                    }
                    _ => log::debug!("{}: MEM_Label at 0x{:X} has a computed argument", name, ins.address),
                }
            } else if ins.op == Opcode::PushV {
                let target = Some(ins.operand);
                if target == self.symbols.end {
                    let Some((at, kind)) = open.pop() else {
                        self.fail(&name, ins.address, "END without an open loop");
                        continue;
                    };
                    let call = &body[at];
                    let cond_start = match kind {
                        LoopKind::While => {
                            let traced = trace_condition(vm, &body[..at]);
                            if traced.is_none() {
                                self.fail(&name, call.address, "while condition could not be traced");
                            }
                            traced
                        }
                        LoopKind::Repeat => None,
                    };
                    let site = LoopSite { kind, function: name.clone(), call_pc: call.address, end_pc: ins.address, cond_start };
                    trace::loops(format_args!(
                        "{}: {:?} at 0x{:X} closes at 0x{:X}",
                        name, kind, site.call_pc, site.end_pc
                    ));
                    self.by_end.insert(site.end_pc, site.call_pc);
                    self.sites.insert(site.call_pc, site);
                } else if target == self.symbols.break_ || target == self.symbols.continue_ {
                    match open.last() {
                        Some((at, _)) => {
                            self.by_control.insert(ins.address, body[*at].address);
                        }
                        None => self.fail(&name, ins.address, "BREAK/CONTINUE outside of a loop"),
                    }
                }
            }
        }
        for (at, _) in open {
            self.fail(&name, body[at].address, "loop without END");
        }
        Ok(())
    }

    fn fail(&mut self, function: &str, pc: u32, reason: &str) {
        let e = BridgeError::LoopAnalysisFailure { function: function.to_string(), pc, reason: reason.to_string() };
        log::error!("{}", e);
        self.failures.push(e.to_string());
    }

    pub fn symbols(&self) -> LoopSymbols {
        self.symbols
    }

    pub fn site(&self, call_pc: u32) -> Option<&LoopSite> {
        self.sites.get(&call_pc)
    }

    pub fn sites(&self) -> impl Iterator<Item = &LoopSite> {
        self.sites.values()
    }

    pub fn label(&self, function: u32, n: i32) -> Option<u32> {
        self.labels.get(&(function, n)).copied()
    }

    /// The function whose body contains `pc`.
    pub fn function_containing(&self, pc: u32) -> Option<u32> {
        let i = self.functions.partition_point(|(start, _, _)| *start <= pc).checked_sub(1)?;
        let (_, end, sym) = self.functions[i];
        (pc < end).then_some(sym)
    }

    pub fn report(&self) -> LoopReport {
        LoopReport { sites: self.sites.values().cloned().collect(), labels: self.labels.len(), failures: self.failures.clone() }
    }
}

/// Walk backwards from the `while` call until exactly one value has been produced.
fn trace_condition(vm: &dyn ScriptVm, before: &[Instruction]) -> Option<u32> {
    let mut need: i64 = 1;
    for ins in before.iter().rev() {
        let (consumed, produced) = match ins.op {
            op if op.is_push() => (0, 1),
            op if op.is_binary() => (2, 1),
            op if op.is_unary() => (1, 1),
            Opcode::Be => call_effect(vm, Some(ins.operand))?,
            Opcode::Bl => call_effect(vm, vm.function_at(ins.operand))?,
            _ => return None,
        };
        need = need - produced + consumed;
        if need == 0 {
            return Some(ins.address);
        }
        if need < 0 {
            return None;
        }
    }
    None
}

fn call_effect(vm: &dyn ScriptVm, symbol: Option<u32>) -> Option<(i64, i64)> {
    let sym = vm.symbol(symbol?)?;
    if !sym.kind.has_code() {
        return None;
    }
    Some((sym.count as i64, sym.has_return() as i64))
}

// -------------------------
// Runtime
// -------------------------

impl DirectMemory {
    fn write_loop_var(&mut self, vm: &mut dyn ScriptVm, state: RepeatState, value: i32) {
        let is_member = vm.symbol(state.symbol).map(|s| s.is_member()).unwrap_or(false);
        if is_member {
            let offset = vm.symbol(state.symbol).map(|s| s.offset).unwrap_or(0);
            let base = self.inst_to_ptr(&*vm, state.context);
            self.write_int(vm, base.offset(offset + 4 * state.index), value);
            return;
        }
        let ok = vm.symbol_mut(state.symbol).is_some_and(|s| s.set_int(state.index, value));
        if !ok {
            log::warn!("repeat: loop variable {} is not an int", state.symbol);
        }
    }

    fn read_loop_var(&mut self, vm: &dyn ScriptVm, state: RepeatState) -> i32 {
        let Some(sym) = vm.symbol(state.symbol) else { return 0 };
        if sym.is_member() {
            let base = self.inst_to_ptr(vm, state.context);
            return self.read_int(vm, base.offset(sym.offset + 4 * state.index));
        }
        sym.get_int(state.index).unwrap_or(0)
    }

    /// `repeat(var, count)`.
    pub(crate) fn ext_repeat(&mut self, vm: &mut dyn ScriptVm) -> Result<()> {
        let count = vm.pop_int(self)?;
        let var = vm.pop_raw()?;
        let pc = vm.current_instruction();
        let Some(site) = self.loops.site(pc).cloned() else {
            log::error!("repeat at 0x{:X} was not paired with END", pc);
            return Ok(());
        };
        let StackValue::Ref { symbol, index, context } = var else {
            log::error!("repeat at 0x{:X}: loop variable is a {}", pc, var.kind_name());
            vm.unsafe_jump(site.exit());
            return Ok(());
        };
        let state = RepeatState { symbol, index, context, count };
        self.write_loop_var(vm, state, 0);
        self.loops.repeats.insert(pc, state);
        trace::loops(format_args!("repeat at 0x{:X}: {} iterations", pc, count));
        if count <= 0 {
            vm.unsafe_jump(site.exit());
        }
        Ok(())
    }

    /// `while(cond)`.
    pub(crate) fn ext_while(&mut self, vm: &mut dyn ScriptVm) -> Result<()> {
        let cond = vm.pop_int(self)?;
        let pc = vm.current_instruction();
        let Some(site) = self.loops.site(pc).cloned() else {
            log::error!("while at 0x{:X} was not paired with END", pc);
            return Ok(());
        };
        if cond == 0 {
            vm.unsafe_jump(site.exit());
        }
        Ok(())
    }

    /// Jump target for the next iteration of `site`, advancing a `repeat` counter.
    fn next_iteration(&mut self, vm: &mut dyn ScriptVm, site: &LoopSite) -> u32 {
        match site.kind {
            LoopKind::Repeat => {
                let Some(state) = self.loops.repeats.get(&site.call_pc).copied() else {
                    return site.exit();
                };
                let next = self.read_loop_var(&*vm, state).wrapping_add(1);
                self.write_loop_var(vm, state, next);
                if next < state.count { site.body() } else { site.exit() }
            }
            // The condition is re-evaluated and `while` decides again.
            LoopKind::While => site.cond_start.unwrap_or_else(|| site.exit()),
        }
    }

    /// Access trap on `END`, `BREAK` and `CONTINUE`.
    pub(crate) fn loop_trap(&mut self, vm: &mut dyn ScriptVm, symbol: u32) -> bool {
        let pc = vm.current_instruction();
        let syms = self.loops.symbols();
        let owner = if Some(symbol) == syms.end {
            self.loops.by_end.get(&pc).copied()
        } else {
            self.loops.by_control.get(&pc).copied()
        };
        let Some(site) = owner.and_then(|call| self.loops.site(call)).cloned() else {
            log::warn!("loop control at 0x{:X} has no loop", pc);
            return false;
        };
        let target = if Some(symbol) == syms.break_ { site.exit() } else { self.next_iteration(vm, &site) };
        trace::loops(format_args!("loop 0x{:X}: 0x{:X} -> 0x{:X}", site.call_pc, pc, target));
        vm.unsafe_jump(target);
        true
    }

    pub(crate) fn install_loop_traps(&mut self, vm: &mut dyn ScriptVm) {
        for s in self.loops.symbols().traps() {
            if let Some(sym) = vm.symbol_mut(s) {
                sym.access_trap = true;
            }
        }
    }

    /// `MEM_Label(n)`.
    pub(crate) fn ext_label(&mut self, vm: &mut dyn ScriptVm) -> Result<()> {
        let n = vm.pop_int(self)?;
        let pc = vm.current_instruction();
        if let Some(f) = self.loops.function_containing(pc) {
            self.loops.labels.insert((f, n), pc + CALL_SIZE);
        }
        Ok(())
    }

    /// `MEM_Goto(n)`.
    pub(crate) fn ext_goto(&mut self, vm: &mut dyn ScriptVm) -> Result<()> {
        let n = vm.pop_int(self)?;
        let pc = vm.current_instruction();
        let target = self.loops.function_containing(pc).and_then(|f| self.loops.label(f, n));
        match target {
            Some(t) => vm.unsafe_jump(t),
            None => log::error!("MEM_Goto({}) at 0x{:X}: no such label", n, pc),
        }
        Ok(())
    }

    pub fn loop_report(&self) -> LoopReport {
        self.loops.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgothic_script::builder::ScriptBuilder;

    #[test]
    fn nested_loops_pair_innermost_first() {
        let mut b = ScriptBuilder::new();
        let i = b.int_var("I", 1);
        let j = b.int_var("J", 1);
        let end = b.int_var("END", 1);
        let brk = b.int_var("BREAK", 1);
        let repeat = b.external("REPEAT", 2, false);
        let f = b.begin_function("F", 0, false);
        b.code().push_v(i).push_i(3).be(repeat);
        b.code().push_v(j).push_i(2).be(repeat);
        let inner_brk = b.code().offset();
        b.code().push_v(brk);
        let inner_end = b.code().offset();
        b.code().push_v(end);
        let outer_end = b.code().offset();
        b.code().push_v(end).rsr();
        b.end_function(f);
        let vm = b.into_vm();

        let table = LoopTable::analyze(&vm);
        let report = table.report();
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        let ends: Vec<u32> = table.sites().map(|s| s.end_pc).collect();
        assert_eq!(ends, vec![outer_end, inner_end]);
        let inner = table.sites().nth(1).unwrap().call_pc;
        assert_eq!(table.by_control.get(&inner_brk), Some(&inner));
    }

    #[test]
    fn while_condition_start_is_traced() {
        let mut b = ScriptBuilder::new();
        let x = b.int_var("X", 1);
        let end = b.int_var("END", 1);
        let while_ = b.external("WHILE", 1, false);
        let f = b.begin_function("F", 0, false);
        b.code().push_i(1).push_i(2);
        let cond = b.code().offset();
        b.code().push_i(10).push_v(x).op(Opcode::Lt).be(while_);
        b.code().push_v(end).rsr();
        b.end_function(f);
        let vm = b.into_vm();

        let table = LoopTable::analyze(&vm);
        let site = table.sites().next().unwrap();
        assert_eq!(site.kind, LoopKind::While);
        assert_eq!(site.cond_start, Some(cond));
    }

    #[test]
    fn unmatched_end_is_reported() {
        let mut b = ScriptBuilder::new();
        let end = b.int_var("END", 1);
        b.external("REPEAT", 2, false);
        let f = b.begin_function("F", 0, false);
        b.code().push_v(end).rsr();
        b.end_function(f);
        let table = LoopTable::analyze(&b.into_vm());
        assert_eq!(table.report().failures.len(), 1);
        assert_eq!(table.sites().count(), 0);
    }

    #[test]
    fn labels_are_prescanned_per_function() {
        let mut b = ScriptBuilder::new();
        let label = b.external("MEM_LABEL", 1, false);
        let f = b.begin_function("F", 0, false);
        b.code().push_i(7).be(label);
        let after = b.code().offset();
        b.code().rsr();
        b.end_function(f);
        let table = LoopTable::analyze(&b.into_vm());
        assert_eq!(table.label(f, 7), Some(after));
        assert_eq!(table.function_containing(after), Some(f));
    }
}
