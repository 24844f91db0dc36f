//! This crate implements the compatibility layer for the Ikarus and LeGo script packages
//!
//! It emulates the 32-bit address space the packages expect ([`mem32`]), runs the tiny
//! x86 trampolines they assemble at runtime ([`cpu32`]) and bridges both to the script
//! VM through [`direct_memory::DirectMemory`].

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod cpu32;
pub mod direct_memory;
pub mod engine;
pub mod error;
pub mod ikarus;
pub mod lego;
pub mod mem32;
pub mod trace;

pub use config::{CompatConfig, CompatConfigBuilder, CompatConfigReader, LoggerConfig};
pub use direct_memory::{BridgeReport, DirectMemory};
pub use engine::EngineServices;
pub use error::{BridgeError, Result};
pub use mem32::{Mem32, Ptr32};
