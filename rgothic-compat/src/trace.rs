use std::env;
use std::fmt;
use std::sync::OnceLock;

/// Trace categories, enabled via environment variables.
///
/// Supported:
/// - RGOTHIC_TRACE="mem,cpu,loop,extern" (comma/space separated; "all" enables all)
/// - RGOTHIC_TRACE_MEM=1, RGOTHIC_TRACE_CPU=1, RGOTHIC_TRACE_LOOP=1, RGOTHIC_TRACE_EXTERN=1
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceKind {
    Mem,
    Cpu,
    Loop,
    Extern,
}

const M_MEM: u32 = 1 << 0;
const M_CPU: u32 = 1 << 1;
const M_LOOP: u32 = 1 << 2;
const M_EXTERN: u32 = 1 << 3;

fn parse_bool_env(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            !(s.is_empty() || s == "0" || s == "false" || s == "no" || s == "off")
        }
        Err(_) => false,
    }
}

fn parse_mask_from_trace_list(s: &str) -> u32 {
    let mut mask = 0u32;
    for raw in s.split(|c: char| c == ',' || c == ';' || c.is_whitespace()) {
        let t = raw.trim().to_ascii_lowercase();
        match t.as_str() {
            "all" => mask |= M_MEM | M_CPU | M_LOOP | M_EXTERN,
            "mem" => mask |= M_MEM,
            "cpu" | "asm" => mask |= M_CPU,
            "loop" => mask |= M_LOOP,
            "extern" | "ext" => mask |= M_EXTERN,
            _ => {}
        }
    }
    mask
}

fn build_mask() -> u32 {
    let mut mask = 0u32;

    if let Ok(list) = env::var("RGOTHIC_TRACE") {
        mask |= parse_mask_from_trace_list(&list);
    }
    if parse_bool_env("RGOTHIC_TRACE_MEM") {
        mask |= M_MEM;
    }
    if parse_bool_env("RGOTHIC_TRACE_CPU") {
        mask |= M_CPU;
    }
    if parse_bool_env("RGOTHIC_TRACE_LOOP") {
        mask |= M_LOOP;
    }
    if parse_bool_env("RGOTHIC_TRACE_EXTERN") {
        mask |= M_EXTERN;
    }
    mask
}

fn mask() -> u32 {
    static MASK: OnceLock<u32> = OnceLock::new();
    *MASK.get_or_init(build_mask)
}

pub fn enabled(k: TraceKind) -> bool {
    let m = mask();
    match k {
        TraceKind::Mem => (m & M_MEM) != 0,
        TraceKind::Cpu => (m & M_CPU) != 0,
        TraceKind::Loop => (m & M_LOOP) != 0,
        TraceKind::Extern => (m & M_EXTERN) != 0,
    }
}

pub fn mem(args: fmt::Arguments) {
    if !enabled(TraceKind::Mem) {
        return;
    }
    log::info!("{}", args);
}

pub fn cpu(args: fmt::Arguments) {
    if !enabled(TraceKind::Cpu) {
        return;
    }
    log::info!("{}", args);
}

pub fn loops(args: fmt::Arguments) {
    if !enabled(TraceKind::Loop) {
        return;
    }
    log::info!("{}", args);
}

pub fn external(args: fmt::Arguments) {
    if !enabled(TraceKind::Extern) {
        return;
    }
    log::info!("{}", args);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_list_accepts_aliases() {
        assert_eq!(parse_mask_from_trace_list("mem, asm;ext"), M_MEM | M_CPU | M_EXTERN);
        assert_eq!(parse_mask_from_trace_list("ALL"), M_MEM | M_CPU | M_LOOP | M_EXTERN);
        assert_eq!(parse_mask_from_trace_list("render"), 0);
    }
}
