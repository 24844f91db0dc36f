use bitflags::bitflags;
use std::fmt;

/// Symbol data type, stored in bits 12..16 of the on-disk bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SymbolKind {
    Void = 0,
    Float = 1,
    Int = 2,
    String = 3,
    Class = 4,
    Function = 5,
    Prototype = 6,
    Instance = 7,
}

impl SymbolKind {
    pub fn from_raw(v: u32) -> Option<Self> {
        Some(match v {
            0 => SymbolKind::Void,
            1 => SymbolKind::Float,
            2 => SymbolKind::Int,
            3 => SymbolKind::String,
            4 => SymbolKind::Class,
            5 => SymbolKind::Function,
            6 => SymbolKind::Prototype,
            7 => SymbolKind::Instance,
            _ => return None,
        })
    }

    /// Functions, prototypes and instances own a code address.
    pub fn has_code(self) -> bool {
        matches!(self, SymbolKind::Function | SymbolKind::Prototype | SymbolKind::Instance)
    }
}

bitflags! {
    /// Symbol flags, stored in bits 16..22 of the on-disk bitfield.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SymbolFlags: u32 {
        const CONST = 1 << 0;
        const RETURN = 1 << 1;
        const CLASS_VAR = 1 << 2;
        const EXTERNAL = 1 << 3;
        const MERGED = 1 << 4;
    }
}

pub const BITFIELD_COUNT_MASK: u32 = (1 << 12) - 1;
pub const BITFIELD_TYPE_SHIFT: u32 = 12;
pub const BITFIELD_FLAGS_SHIFT: u32 = 16;

/// A script instance value.
///
/// `Native` instances live inside the VM, `Memory` instances are views on the
/// emulated address space and route every member access through the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InstanceRef {
    #[default]
    Null,
    Native(u32),
    Memory(u32),
}

impl InstanceRef {
    pub fn is_null(&self) -> bool {
        matches!(self, InstanceRef::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SymbolValues {
    None,
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub index: u32,
    pub name: String,
    pub kind: SymbolKind,
    pub flags: SymbolFlags,
    /// Element count for variables, parameter count for functions, member count for classes.
    pub count: u32,
    /// Code address for functions/prototypes/instances.
    pub address: u32,
    /// Member offset for class variables, byte size for classes, return type for functions.
    pub offset: u32,
    pub parent: Option<u32>,
    pub file_index: u32,
    pub line: u32,
    pub values: SymbolValues,
    pub instance: InstanceRef,
    /// When set, the VM reports every push of this symbol to the host.
    pub access_trap: bool,
}

impl Symbol {
    pub fn new(index: u32, name: impl Into<String>, kind: SymbolKind, count: u32) -> Self {
        let values = match kind {
            SymbolKind::Int => SymbolValues::Ints(vec![0; count as usize]),
            SymbolKind::Float => SymbolValues::Floats(vec![0.0; count as usize]),
            SymbolKind::String => SymbolValues::Strings(vec![String::new(); count as usize]),
            _ => SymbolValues::None,
        };
        Self {
            index,
            name: name.into().to_uppercase(),
            kind,
            flags: SymbolFlags::empty(),
            count,
            address: 0,
            offset: 0,
            parent: None,
            file_index: 0,
            line: 0,
            values,
            instance: InstanceRef::Null,
            access_trap: false,
        }
    }

    pub fn is_external(&self) -> bool {
        self.flags.contains(SymbolFlags::EXTERNAL)
    }

    pub fn is_member(&self) -> bool {
        self.flags.contains(SymbolFlags::CLASS_VAR)
    }

    pub fn has_return(&self) -> bool {
        self.flags.contains(SymbolFlags::RETURN)
    }

    /// The packed `count | type << 12 | flags << 16` word legacy code inspects.
    pub fn bitfield(&self) -> u32 {
        (self.count & BITFIELD_COUNT_MASK)
            | ((self.kind as u32) << BITFIELD_TYPE_SHIFT)
            | (self.flags.bits() << BITFIELD_FLAGS_SHIFT)
    }

    pub fn get_int(&self, index: u32) -> Option<i32> {
        match &self.values {
            SymbolValues::Ints(v) => v.get(index as usize).copied(),
            _ => None,
        }
    }

    pub fn set_int(&mut self, index: u32, value: i32) -> bool {
        match &mut self.values {
            SymbolValues::Ints(v) => match v.get_mut(index as usize) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn get_float(&self, index: u32) -> Option<f32> {
        match &self.values {
            SymbolValues::Floats(v) => v.get(index as usize).copied(),
            _ => None,
        }
    }

    pub fn set_float(&mut self, index: u32, value: f32) -> bool {
        match &mut self.values {
            SymbolValues::Floats(v) => match v.get_mut(index as usize) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn get_string(&self, index: u32) -> Option<&str> {
        match &self.values {
            SymbolValues::Strings(v) => v.get(index as usize).map(String::as_str),
            _ => None,
        }
    }

    pub fn set_string(&mut self, index: u32, value: impl Into<String>) -> bool {
        match &mut self.values {
            SymbolValues::Strings(v) => match v.get_mut(index as usize) {
                Some(slot) => {
                    *slot = value.into();
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}({:?})", self.name, self.index, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_packs_count_type_and_flags() {
        let mut s = Symbol::new(0, "arr", SymbolKind::Int, 3);
        s.flags = SymbolFlags::CONST;
        assert_eq!(s.bitfield(), 3 | (2 << 12) | (1 << 16));
    }

    #[test]
    fn names_are_case_folded() {
        let s = Symbol::new(0, "Mem_ReadInt", SymbolKind::Function, 1);
        assert_eq!(s.name, "MEM_READINT");
    }

    #[test]
    fn typed_access_rejects_mismatch() {
        let mut s = Symbol::new(0, "x", SymbolKind::Float, 1);
        assert!(!s.set_int(0, 5));
        assert!(s.set_float(0, 1.5));
        assert_eq!(s.get_float(0), Some(1.5));
        assert_eq!(s.get_int(0), None);
    }
}
