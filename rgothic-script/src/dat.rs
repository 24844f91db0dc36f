use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::path::Path;

use crate::nls::{Decoder, TextDecoder};
use crate::symbol::{
    Symbol, SymbolFlags, SymbolKind, SymbolValues, BITFIELD_COUNT_MASK, BITFIELD_FLAGS_SHIFT, BITFIELD_TYPE_SHIFT,
};
use crate::vm::DaedalusVm;

/// A compiled script image (`GOTHIC.DAT`, `MENU.DAT`, ...).
#[derive(Debug, Clone)]
pub struct DatFile {
    pub version: u8,
    pub symbols: Vec<Symbol>,
    /// Symbol indices in name order, as written by the compiler.
    pub sort_table: Vec<u32>,
    pub code: Vec<u8>,
}

fn read_u8(bytes: &[u8], off: &mut usize) -> Result<u8> {
    if *off + 1 > bytes.len() {
        bail!("unexpected EOF while reading u8 at {}", off);
    }
    let v = bytes[*off];
    *off += 1;
    Ok(v)
}

fn read_u32_le(bytes: &[u8], off: &mut usize) -> Result<u32> {
    if *off + 4 > bytes.len() {
        bail!("unexpected EOF while reading u32 at {}", off);
    }
    let v = u32::from_le_bytes([bytes[*off], bytes[*off + 1], bytes[*off + 2], bytes[*off + 3]]);
    *off += 4;
    Ok(v)
}

/// A `'\n'`-terminated byte string.
fn read_line<'a>(bytes: &'a [u8], off: &mut usize) -> Result<&'a [u8]> {
    let rest = bytes.get(*off..).unwrap_or_default();
    let Some(end) = rest.iter().position(|&b| b == b'\n') else {
        bail!("unterminated string at {}", off);
    };
    let line = &rest[..end];
    *off += end + 1;
    Ok(line)
}

/// Parse a script image.
///
/// Layout (little-endian):
/// - u8  version
/// - u32 symbol_count
/// - u32 sort_table[symbol_count]
/// - symbol_count times:
///     - u32 named, then the name up to `'\n'` when non-zero
///     - u32 offset (member offset, class size or return type)
///     - u32 bitfield: count:12 type:4 flags:6
///     - u32 file_index, line_start, line_count, char_start, char_count
///     - unless the symbol is a class member, its content:
///       f32/i32/`'\n'`-strings times count, or one i32 for code symbols and classes
///     - i32 parent (-1 for none)
/// - u32 code_size, then the byte-code
pub fn parse_dat(bytes: &[u8], decoder: &Decoder) -> Result<DatFile> {
    let mut off = 0usize;
    let version = read_u8(bytes, &mut off).context("read version")?;
    let count = read_u32_le(bytes, &mut off).context("read symbol count")? as usize;
    if count.saturating_mul(4) > bytes.len() {
        bail!("symbol count {} exceeds file size {}", count, bytes.len());
    }

    let mut sort_table = Vec::with_capacity(count);
    for _ in 0..count {
        sort_table.push(read_u32_le(bytes, &mut off).context("read sort table")?);
    }

    let mut symbols = Vec::with_capacity(count);
    for index in 0..count as u32 {
        let sym = read_symbol(bytes, &mut off, index, decoder).with_context(|| format!("read symbol {}", index))?;
        symbols.push(sym);
    }

    let code_size = read_u32_le(bytes, &mut off).context("read code size")? as usize;
    if off + code_size > bytes.len() {
        bail!("code out of range: off={} len={} total={}", off, code_size, bytes.len());
    }
    let code = bytes[off..off + code_size].to_vec();

    log::debug!("parsed script image: version={} symbols={} code={} bytes", version, count, code_size);

    Ok(DatFile { version, symbols, sort_table, code })
}

fn read_symbol(bytes: &[u8], off: &mut usize, index: u32, decoder: &Decoder) -> Result<Symbol> {
    let named = read_u32_le(bytes, off)?;
    let name = if named != 0 { decoder.decode(read_line(bytes, off)?).into_owned() } else { String::new() };

    let offset = read_u32_le(bytes, off)?;
    let bitfield = read_u32_le(bytes, off)?;
    let count = bitfield & BITFIELD_COUNT_MASK;
    let raw_kind = (bitfield >> BITFIELD_TYPE_SHIFT) & 0xF;
    let Some(kind) = SymbolKind::from_raw(raw_kind) else {
        bail!("symbol {} has unknown type {}", name, raw_kind);
    };
    let flags = SymbolFlags::from_bits_truncate((bitfield >> BITFIELD_FLAGS_SHIFT) & 0x3F);

    let file_index = read_u32_le(bytes, off)? & 0x7FFFF;
    let line = read_u32_le(bytes, off)? & 0x7FFFF;
    // line_count, char_start, char_count
    for _ in 0..3 {
        read_u32_le(bytes, off)?;
    }

    let mut sym = Symbol::new(index, name, kind, count);
    sym.flags = flags;
    sym.offset = offset;
    sym.file_index = file_index;
    sym.line = line;

    if !sym.is_member() {
        match kind {
            SymbolKind::Float => {
                let mut v = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    v.push(f32::from_bits(read_u32_le(bytes, off)?));
                }
                sym.values = SymbolValues::Floats(v);
            }
            SymbolKind::Int => {
                let mut v = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    v.push(read_u32_le(bytes, off)? as i32);
                }
                sym.values = SymbolValues::Ints(v);
            }
            SymbolKind::String => {
                let mut v = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    v.push(decoder.decode(read_line(bytes, off)?).into_owned());
                }
                sym.values = SymbolValues::Strings(v);
            }
            // Classes store their engine-side data offset in the same slot.
            SymbolKind::Class | SymbolKind::Function | SymbolKind::Prototype | SymbolKind::Instance => {
                sym.address = read_u32_le(bytes, off)?;
            }
            SymbolKind::Void => {}
        }
    }

    let parent = read_u32_le(bytes, off)? as i32;
    sym.parent = (parent >= 0).then_some(parent as u32);
    Ok(sym)
}

impl DatFile {
    pub fn open(path: impl AsRef<Path>, decoder: &Decoder) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        parse_dat(&bytes, decoder).with_context(|| format!("parse {}", path.display()))
    }

    pub fn from_parts(symbols: Vec<Symbol>, code: Vec<u8>) -> Self {
        let mut sort_table: Vec<u32> = (0..symbols.len() as u32).collect();
        sort_table.sort_by(|a, b| symbols[*a as usize].name.cmp(&symbols[*b as usize].name));
        Self { version: 50, symbols, sort_table, code }
    }

    pub fn into_vm(self) -> DaedalusVm {
        DaedalusVm::new(self.symbols, self.code)
    }

    /// Serialize back into the on-disk layout.
    pub fn to_bytes(&self, decoder: &Decoder) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.code.len() + self.symbols.len() * 64);
        out.write_u8(self.version)?;
        out.write_u32::<LittleEndian>(self.symbols.len() as u32)?;
        for i in &self.sort_table {
            out.write_u32::<LittleEndian>(*i)?;
        }

        for sym in &self.symbols {
            if sym.name.is_empty() {
                out.write_u32::<LittleEndian>(0)?;
            } else {
                out.write_u32::<LittleEndian>(1)?;
                out.extend_from_slice(&decoder.encode(&sym.name));
                out.push(b'\n');
            }
            out.write_u32::<LittleEndian>(sym.offset)?;
            out.write_u32::<LittleEndian>(sym.bitfield())?;
            out.write_u32::<LittleEndian>(sym.file_index)?;
            out.write_u32::<LittleEndian>(sym.line)?;
            for _ in 0..3 {
                out.write_u32::<LittleEndian>(0)?;
            }

            if !sym.is_member() {
                match (&sym.values, sym.kind) {
                    (SymbolValues::Floats(v), _) => {
                        for f in v {
                            out.write_f32::<LittleEndian>(*f)?;
                        }
                    }
                    (SymbolValues::Ints(v), _) => {
                        for i in v {
                            out.write_i32::<LittleEndian>(*i)?;
                        }
                    }
                    (SymbolValues::Strings(v), _) => {
                        for s in v {
                            out.extend_from_slice(&decoder.encode(s));
                            out.push(b'\n');
                        }
                    }
                    (SymbolValues::None, SymbolKind::Void) => {}
                    (SymbolValues::None, _) => out.write_u32::<LittleEndian>(sym.address)?,
                }
            }

            out.write_i32::<LittleEndian>(sym.parent.map(|p| p as i32).unwrap_or(-1))?;
        }

        out.write_u32::<LittleEndian>(self.code.len() as u32)?;
        out.extend_from_slice(&self.code);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ScriptBuilder;
    use crate::vm::Opcode;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_what_the_compiler_layout_describes() {
        let mut b = ScriptBuilder::new();
        let hp = b.int_var("HERO_HP", 2);
        b.symbol_mut(hp).set_int(1, 40);
        let greet = b.string_var("GREETING", 1);
        b.symbol_mut(greet).set_string(0, "Grüß dich");
        b.external("PRINT", 1, false);
        let f = b.begin_function("STARTUP_GLOBAL", 0, false);
        b.code().push_i(1).op(Opcode::Add).rsr();
        b.end_function(f);
        let (symbols, code) = b.into_parts();

        let decoder = Decoder::default();
        let bytes = DatFile::from_parts(symbols, code.clone()).to_bytes(&decoder).unwrap();
        let dat = parse_dat(&bytes, &decoder).unwrap();

        assert_eq!(dat.symbols.len(), 4);
        assert_eq!(dat.symbols[0].get_int(1), Some(40));
        assert_eq!(dat.symbols[1].get_string(0), Some("Grüß dich"));
        assert!(dat.symbols[2].is_external());
        assert_eq!(dat.symbols[3].name, "STARTUP_GLOBAL");
        assert_eq!(dat.symbols[3].address, 0);
        assert_eq!(dat.code, code);
        // sort table is by name
        assert_eq!(dat.sort_table, vec![1, 0, 2, 3]);
    }

    #[test]
    fn truncated_image_is_an_error() {
        let decoder = Decoder::default();
        let err = parse_dat(&[50, 2, 0, 0, 0, 0, 0, 0, 0], &decoder).unwrap_err();
        assert!(format!("{:#}", err).contains("sort table"));
    }

    #[test]
    fn members_carry_no_content() {
        let mut b = ScriptBuilder::new();
        let c = b.class("C_ITEM", 8);
        b.member(c, "C_ITEM.VALUE", SymbolKind::Int, 4);
        let (symbols, code) = b.into_parts();

        let decoder = Decoder::default();
        let bytes = DatFile::from_parts(symbols, code).to_bytes(&decoder).unwrap();
        let dat = parse_dat(&bytes, &decoder).unwrap();
        let member = &dat.symbols[1];
        assert!(member.is_member());
        assert_eq!(member.offset, 4);
        assert_eq!(member.parent, Some(0));
        assert_eq!(dat.symbols[0].count, 1);
    }
}
