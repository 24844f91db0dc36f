//! rgothic-script
//!
//! Compiled Daedalus script support: the `.DAT` image loader, the symbol model,
//! a byte-code decoder and a small reference VM. The compatibility layer in
//! `rgothic-compat` only depends on the [`vm::ScriptVm`] and [`vm::ExternalHost`]
//! traits, so any VM that implements them can host legacy scripts.

pub mod builder;
pub mod dat;
pub mod nls;
pub mod symbol;
pub mod vm;

pub use dat::{parse_dat, DatFile};
pub use symbol::{InstanceRef, Symbol, SymbolFlags, SymbolKind, SymbolValues};
