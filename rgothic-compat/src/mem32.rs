//! Emulated 32-bit address space.
//!
//! The space is a sorted list of regions that always covers `[begin, end)` without
//! gaps. A region is either unused, backed by storage owned by the space, or pinned
//! onto an object owned by the engine. Every byte access goes through
//! [`Mem32::with_bytes`] / [`Mem32::with_bytes_mut`], the single translation point.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::trace;

pub const DEFAULT_BEGIN: u32 = 0x0000_1000;
pub const DEFAULT_END: u32 = 0x8000_0000;

const ALLOC_ALIGN: u32 = 8;
const PAGE_SHIFT: u32 = 12;

/// zString record layout (20 bytes): vtable, allocator, ptr, len, res.
pub const ZSTRING_SIZE: u32 = 20;
pub const ZSTRING_PTR: u32 = 8;
pub const ZSTRING_LEN: u32 = 12;
pub const ZSTRING_RES: u32 = 16;

/// A logical address in the emulated space. Not a host pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Ptr32(pub u32);

impl Ptr32 {
    pub const NULL: Ptr32 = Ptr32(0);
    /// Returned by lookups that failed but must still hand legacy code a pointer.
    pub const BAD: Ptr32 = Ptr32(0xBAD1_0000);

    pub fn from_script(v: i32) -> Self {
        Ptr32(v as u32)
    }

    pub fn to_script(self) -> i32 {
        self.0 as i32
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, by: u32) -> Ptr32 {
        Ptr32(self.0.wrapping_add(by))
    }
}

impl From<u32> for Ptr32 {
    fn from(v: u32) -> Self {
        Ptr32(v)
    }
}

impl fmt::Display for Ptr32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemError {
    #[error("address translation failed: {address} (+{len})")]
    TranslationFailure { address: Ptr32, len: u32 },

    #[error("region [{address}, +0x{size:X}) overlaps a used region")]
    RegionOverlap { address: Ptr32, size: u32 },

    #[error("out of memory: 0x{size:X} bytes")]
    OutOfMemory { size: u32 },

    #[error("{address} is not the start of an allocated region")]
    InvalidFree { address: Ptr32 },
}

/// Host object that can be aliased by a pinned region.
pub trait PinTarget {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

impl PinTarget for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl<const N: usize> PinTarget for [u8; N] {
    fn bytes(&self) -> &[u8] {
        self
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// Implement [`PinTarget`] for `#[repr(C)]` plain-old-data types.
#[macro_export]
macro_rules! impl_pin_target_pod {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::mem32::PinTarget for $ty {
                fn bytes(&self) -> &[u8] {
                    bytemuck::bytes_of(self)
                }

                fn bytes_mut(&mut self) -> &mut [u8] {
                    bytemuck::bytes_of_mut(self)
                }
            }
        )*
    };
}

impl_pin_target_pod!(i32, u32, f32);

pub type SharedPin = Rc<RefCell<dyn PinTarget>>;

enum Backing {
    None,
    Heap(Vec<u8>),
    /// Aliases `target.bytes()[offset..]`.
    Pinned { target: SharedPin, offset: usize },
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::None => write!(f, "None"),
            Backing::Heap(v) => write!(f, "Heap({} bytes)", v.len()),
            Backing::Pinned { offset, .. } => write!(f, "Pinned(+{})", offset),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegionStatus {
    Unused,
    Allocated,
    Pinned,
}

#[derive(Debug)]
struct Region {
    address: u32,
    size: u32,
    backing: Backing,
    label: Option<String>,
}

impl Region {
    fn unused(address: u32, size: u32) -> Self {
        Self { address, size, backing: Backing::None, label: None }
    }

    fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }

    fn status(&self) -> RegionStatus {
        match self.backing {
            Backing::None => RegionStatus::Unused,
            Backing::Heap(_) => RegionStatus::Allocated,
            Backing::Pinned { .. } => RegionStatus::Pinned,
        }
    }
}

/// Public snapshot of one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionInfo {
    pub address: Ptr32,
    pub size: u32,
    pub status: RegionStatus,
    pub label: Option<String>,
}

pub struct Mem32 {
    begin: u32,
    end: u32,
    regions: Vec<Region>,
    logged_pages: RefCell<HashSet<u32>>,
    /// Test hook: number of upcoming host allocations that fail.
    fail_host_allocs: Cell<u32>,
}

impl Default for Mem32 {
    fn default() -> Self {
        Self::new(DEFAULT_BEGIN, DEFAULT_END)
    }
}

impl fmt::Debug for Mem32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mem32")
            .field("begin", &Ptr32(self.begin))
            .field("end", &Ptr32(self.end))
            .field("regions", &self.regions.len())
            .finish()
    }
}

impl Mem32 {
    pub fn new(begin: u32, end: u32) -> Self {
        let (begin, end) = if begin < end { (begin, end) } else { (DEFAULT_BEGIN, DEFAULT_END) };
        Self {
            begin,
            end,
            regions: vec![Region::unused(begin, end - begin)],
            logged_pages: RefCell::new(HashSet::new()),
            fail_host_allocs: Cell::new(0),
        }
    }

    pub fn begin(&self) -> Ptr32 {
        Ptr32(self.begin)
    }

    pub fn end(&self) -> Ptr32 {
        Ptr32(self.end)
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.regions
            .iter()
            .map(|r| RegionInfo { address: Ptr32(r.address), size: r.size, status: r.status(), label: r.label.clone() })
            .collect()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// The region containing `address`, if it lies inside the space.
    pub fn region_at(&self, address: Ptr32) -> Option<RegionInfo> {
        let i = self.find(address.0)?;
        let r = &self.regions[i];
        Some(RegionInfo { address: Ptr32(r.address), size: r.size, status: r.status(), label: r.label.clone() })
    }

    pub fn is_allocated_start(&self, address: Ptr32) -> bool {
        self.find(address.0)
            .map(|i| self.regions[i].address == address.0 && self.regions[i].status() == RegionStatus::Allocated)
            .unwrap_or(false)
    }

    #[doc(hidden)]
    pub fn fail_next_host_allocs(&self, n: u32) {
        self.fail_host_allocs.set(n);
    }

    // -------------------------
    // Region bookkeeping
    // -------------------------

    fn find(&self, address: u32) -> Option<usize> {
        if address < self.begin || address >= self.end {
            return None;
        }
        let i = self.regions.partition_point(|r| r.end() <= address as u64);
        (i < self.regions.len()).then_some(i)
    }

    /// Replace the unused region `i` by up to three regions so that
    /// `[address, address+size)` becomes its own region. Returns its index.
    fn carve(&mut self, i: usize, address: u32, size: u32, backing: Backing, label: Option<String>) -> usize {
        let old = self.regions.remove(i);
        let mut at = i;
        if address > old.address {
            self.regions.insert(at, Region::unused(old.address, address - old.address));
            at += 1;
        }
        self.regions.insert(at, Region { address, size, backing, label });
        let tail = old.end() - (address as u64 + size as u64);
        if tail > 0 {
            self.regions.insert(at + 1, Region::unused(address + size, tail as u32));
        }
        at
    }

    fn first_fit(&self, size: u32) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| r.status() == RegionStatus::Unused && r.size >= size)
    }

    fn host_alloc(&self, size: u32) -> Option<Vec<u8>> {
        let pending = self.fail_host_allocs.get();
        if pending > 0 {
            self.fail_host_allocs.set(pending - 1);
            return None;
        }
        let mut v = Vec::new();
        v.try_reserve_exact(size as usize).ok()?;
        v.resize(size as usize, 0);
        Some(v)
    }

    /// Merge strictly adjacent unused regions.
    pub fn compactage(&mut self) {
        let before = self.regions.len();
        let mut merged: Vec<Region> = Vec::with_capacity(before);
        for r in self.regions.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.status() == RegionStatus::Unused
                    && r.status() == RegionStatus::Unused
                    && last.end() == r.address as u64
                {
                    last.size += r.size;
                    continue;
                }
            }
            merged.push(r);
        }
        self.regions = merged;
        if self.regions.len() != before {
            trace::mem(format_args!("compactage: {} -> {} regions", before, self.regions.len()));
        }
    }

    // -------------------------
    // Public contract
    // -------------------------

    /// Alias `target.bytes()[offset..offset+size]` at `address`.
    ///
    /// `address == NULL` picks the first free range that fits.
    pub fn pin(
        &mut self,
        target: SharedPin,
        offset: usize,
        address: Ptr32,
        size: u32,
        label: &str,
    ) -> Result<Ptr32, MemError> {
        let available = target.try_borrow().map(|t| t.bytes().len()).unwrap_or(0);
        if size == 0 || offset + size as usize > available {
            log::error!("pin {}: target has {} bytes, need {} at +{}", label, available, size, offset);
            return Err(MemError::TranslationFailure { address, len: size });
        }

        let i = if address.is_null() {
            self.first_fit(size.next_multiple_of(ALLOC_ALIGN))
                .ok_or(MemError::OutOfMemory { size })
                .inspect_err(|_| log::error!("pin {}: no free range for 0x{:X} bytes", label, size))?
        } else {
            match self.find(address.0) {
                Some(i)
                    if self.regions[i].status() == RegionStatus::Unused
                        && address.0 as u64 + size as u64 <= self.regions[i].end() =>
                {
                    i
                }
                _ => {
                    log::error!("pin {}: [{}, +0x{:X}) overlaps a used region", label, address, size);
                    return Err(MemError::RegionOverlap { address, size });
                }
            }
        };

        let at = if address.is_null() { self.regions[i].address } else { address.0 };
        self.carve(i, at, size, Backing::Pinned { target, offset }, Some(label.to_string()));
        trace::mem(format_args!("pin {} at {} size=0x{:X}", label, Ptr32(at), size));
        Ok(Ptr32(at))
    }

    /// Allocate zeroed storage, first fit, size rounded up to 8 bytes.
    pub fn alloc(&mut self, size: u32, label: &str) -> Result<Ptr32, MemError> {
        let rounded = size.max(1).checked_next_multiple_of(ALLOC_ALIGN).ok_or(MemError::OutOfMemory { size })?;

        let mut compacted = false;
        loop {
            let Some(i) = self.first_fit(rounded) else {
                if !compacted {
                    self.compactage();
                    compacted = true;
                    continue;
                }
                log::error!("alloc {}: no free range for 0x{:X} bytes", label, rounded);
                return Err(MemError::OutOfMemory { size });
            };
            let Some(storage) = self.host_alloc(rounded) else {
                if !compacted {
                    log::warn!("alloc {}: host allocation of 0x{:X} failed, compacting", label, rounded);
                    self.compactage();
                    compacted = true;
                    continue;
                }
                log::error!("alloc {}: host allocation of 0x{:X} failed", label, rounded);
                return Err(MemError::OutOfMemory { size });
            };

            let at = self.regions[i].address;
            let label = (!label.is_empty()).then(|| label.to_string());
            self.carve(i, at, rounded, Backing::Heap(storage), label);
            trace::mem(format_args!("alloc 0x{:X} -> {}", rounded, Ptr32(at)));
            return Ok(Ptr32(at));
        }
    }

    /// Allocate owned storage at a fixed address.
    pub fn alloc_at(&mut self, address: Ptr32, size: u32, label: &str) -> Result<Ptr32, MemError> {
        let i = match self.find(address.0) {
            Some(i)
                if self.regions[i].status() == RegionStatus::Unused
                    && address.0 as u64 + size as u64 <= self.regions[i].end() =>
            {
                i
            }
            _ => {
                log::error!("alloc_at {}: [{}, +0x{:X}) overlaps a used region", label, address, size);
                return Err(MemError::RegionOverlap { address, size });
            }
        };
        let storage = self.host_alloc(size.max(1)).ok_or(MemError::OutOfMemory { size })?;
        self.carve(i, address.0, size.max(1), Backing::Heap(storage), Some(label.to_string()));
        trace::mem(format_args!("alloc_at {} size=0x{:X} ({})", address, size, label));
        Ok(address)
    }

    pub fn free(&mut self, address: Ptr32) -> Result<(), MemError> {
        let Some(i) = self.find(address.0).filter(|&i| {
            self.regions[i].address == address.0 && self.regions[i].status() == RegionStatus::Allocated
        }) else {
            log::warn!("free: {} is not the start of an allocated region", address);
            return Err(MemError::InvalidFree { address });
        };
        let r = &mut self.regions[i];
        r.backing = Backing::None;
        r.label = None;
        trace::mem(format_args!("free {}", address));
        self.compactage();
        Ok(())
    }

    /// Allocate `size` bytes, copy the common prefix from `address`, free the old block.
    pub fn realloc(&mut self, address: Ptr32, size: u32, label: &str) -> Result<Ptr32, MemError> {
        if address.is_null() {
            return self.alloc(size, label);
        }
        let old_size = match self.find(address.0) {
            Some(i) if self.regions[i].address == address.0 && self.regions[i].status() == RegionStatus::Allocated => {
                self.regions[i].size
            }
            _ => {
                log::warn!("realloc: {} is not the start of an allocated region", address);
                return Err(MemError::InvalidFree { address });
            }
        };
        let new = self.alloc(size, label)?;
        self.copy_bytes(address, new, old_size.min(size));
        self.free(address)?;
        Ok(new)
    }

    // -------------------------
    // Translation
    // -------------------------

    fn log_translation_failure(&self, address: Ptr32, len: u32) {
        let page = address.0 >> PAGE_SHIFT;
        if self.logged_pages.borrow_mut().insert(page) {
            log::warn!("address translation failed: {} (+{})", address, len);
        }
    }

    /// Run `f` over the bytes `[address, address+len)`; the range must lie inside one
    /// allocated or pinned region.
    pub fn with_bytes<R>(&self, address: Ptr32, len: u32, f: impl FnOnce(&[u8]) -> R) -> Result<R, MemError> {
        let fail = || {
            self.log_translation_failure(address, len);
            MemError::TranslationFailure { address, len }
        };
        let i = self.find(address.0).ok_or_else(fail)?;
        let r = &self.regions[i];
        if address.0 as u64 + len as u64 > r.end() {
            return Err(fail());
        }
        let off = (address.0 - r.address) as usize;
        let len = len as usize;
        match &r.backing {
            Backing::None => Err(fail()),
            Backing::Heap(v) => Ok(f(&v[off..off + len])),
            Backing::Pinned { target, offset } => {
                let Ok(t) = target.try_borrow() else {
                    log::error!("pinned object at {} is mutably borrowed", Ptr32(r.address));
                    return Err(fail());
                };
                let start = offset + off;
                match t.bytes().get(start..start + len) {
                    Some(b) => Ok(f(b)),
                    None => Err(fail()),
                }
            }
        }
    }

    pub fn with_bytes_mut<R>(
        &mut self,
        address: Ptr32,
        len: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemError> {
        let Some(i) = self.find(address.0) else {
            self.log_translation_failure(address, len);
            return Err(MemError::TranslationFailure { address, len });
        };
        let end = self.regions[i].end();
        let base = self.regions[i].address;
        if address.0 as u64 + len as u64 > end {
            self.log_translation_failure(address, len);
            return Err(MemError::TranslationFailure { address, len });
        }
        let off = (address.0 - base) as usize;
        let ulen = len as usize;
        let result = match &mut self.regions[i].backing {
            Backing::None => None,
            Backing::Heap(v) => Some(f(&mut v[off..off + ulen])),
            Backing::Pinned { target, offset } => match target.try_borrow_mut() {
                Ok(mut t) => {
                    let start = *offset + off;
                    t.bytes_mut().get_mut(start..start + ulen).map(f)
                }
                Err(_) => {
                    log::error!("pinned object at {} is already borrowed", Ptr32(base));
                    None
                }
            },
        };
        result.ok_or_else(|| {
            self.log_translation_failure(address, len);
            MemError::TranslationFailure { address, len }
        })
    }

    pub fn read_int(&self, address: Ptr32) -> i32 {
        self.with_bytes(address, 4, LittleEndian::read_i32).unwrap_or(0)
    }

    pub fn write_int(&mut self, address: Ptr32, value: i32) {
        let _ = self.with_bytes_mut(address, 4, |b| LittleEndian::write_i32(b, value));
    }

    pub fn read_u32(&self, address: Ptr32) -> u32 {
        self.read_int(address) as u32
    }

    pub fn read_ptr(&self, address: Ptr32) -> Ptr32 {
        Ptr32(self.read_u32(address))
    }

    pub fn read_float(&self, address: Ptr32) -> f32 {
        f32::from_bits(self.read_u32(address))
    }

    pub fn write_float(&mut self, address: Ptr32, value: f32) {
        self.write_int(address, value.to_bits() as i32);
    }

    pub fn read_byte(&self, address: Ptr32) -> u8 {
        self.with_bytes(address, 1, |b| b[0]).unwrap_or(0)
    }

    pub fn write_byte(&mut self, address: Ptr32, value: u8) {
        let _ = self.with_bytes_mut(address, 1, |b| b[0] = value);
    }

    /// Reads `len` bytes; untranslatable ranges yield an empty vector.
    pub fn read_bytes(&self, address: Ptr32, len: u32) -> Vec<u8> {
        self.with_bytes(address, len, <[u8]>::to_vec).unwrap_or_default()
    }

    pub fn write_bytes(&mut self, address: Ptr32, data: &[u8]) -> bool {
        self.with_bytes_mut(address, data.len() as u32, |b| b.copy_from_slice(data)).is_ok()
    }

    /// Copy between possibly overlapping ranges, possibly in different regions.
    pub fn copy_bytes(&mut self, src: Ptr32, dst: Ptr32, size: u32) {
        if size == 0 {
            return;
        }
        let Ok(tmp) = self.with_bytes(src, size, <[u8]>::to_vec) else { return };
        self.write_bytes(dst, &tmp);
    }

    /// Bytes of a NUL-terminated string, at most `max` bytes, staying inside one region.
    pub fn read_cstr(&self, address: Ptr32, max: u32) -> Vec<u8> {
        let Some(i) = self.find(address.0) else {
            self.log_translation_failure(address, 1);
            return Vec::new();
        };
        let avail = (self.regions[i].end() - address.0 as u64).min(max as u64) as u32;
        self.with_bytes(address, avail, |b| {
            let n = b.iter().position(|&c| c == 0).unwrap_or(b.len());
            b[..n].to_vec()
        })
        .unwrap_or_default()
    }

    /// Bytes of the zString record at `address`.
    pub fn read_zstring(&self, address: Ptr32) -> Vec<u8> {
        let ptr = self.read_ptr(address.offset(ZSTRING_PTR));
        let len = self.read_int(address.offset(ZSTRING_LEN));
        if ptr.is_null() || len <= 0 {
            return Vec::new();
        }
        self.read_bytes(ptr, len as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covering(mem: &Mem32) {
        let regions = mem.regions();
        assert_eq!(regions.first().map(|r| r.address), Some(mem.begin()));
        let mut cursor = mem.begin().0 as u64;
        for r in &regions {
            assert_eq!(r.address.0 as u64, cursor);
            assert!(r.size > 0);
            cursor += r.size as u64;
        }
        assert_eq!(cursor, mem.end().0 as u64);
    }

    #[test]
    fn alloc_rounds_and_splits() {
        let mut mem = Mem32::new(0x1000, 0x10000);
        let a = mem.alloc(5, "a").unwrap();
        let b = mem.alloc(8, "b").unwrap();
        assert_eq!(a, Ptr32(0x1000));
        assert_eq!(b, Ptr32(0x1008));
        assert_eq!(mem.region_count(), 3);
        assert_covering(&mem);
    }

    #[test]
    fn free_requires_region_start() {
        let mut mem = Mem32::new(0x1000, 0x10000);
        let a = mem.alloc(16, "a").unwrap();
        assert_eq!(mem.free(a.offset(4)), Err(MemError::InvalidFree { address: a.offset(4) }));
        assert!(mem.is_allocated_start(a));
        mem.free(a).unwrap();
        assert_eq!(mem.region_count(), 1);
    }

    #[test]
    fn pin_rejects_overlap() {
        let mut mem = Mem32::new(0x1000, 0x10000);
        let obj: SharedPin = Rc::new(RefCell::new(vec![0u8; 8]));
        mem.pin(obj.clone(), 0, Ptr32(0x2000), 8, "first").unwrap();
        let err = mem.pin(obj, 0, Ptr32(0x2004), 4, "second").unwrap_err();
        assert_eq!(err, MemError::RegionOverlap { address: Ptr32(0x2004), size: 4 });
    }

    #[test]
    fn reads_outside_regions_return_zero() {
        let mut mem = Mem32::new(0x1000, 0x10000);
        assert_eq!(mem.read_int(Ptr32(0x4000)), 0);
        assert_eq!(mem.read_int(Ptr32(0xFFFF_FFF0)), 0);
        mem.write_int(Ptr32(0x4000), 1);
        let a = mem.alloc(8, "a").unwrap();
        // straddles the end of the region
        assert_eq!(mem.read_int(a.offset(6)), 0);
    }

    #[test]
    fn copy_crosses_regions() {
        let mut mem = Mem32::new(0x1000, 0x10000);
        let a = mem.alloc(8, "a").unwrap();
        let b = mem.alloc(8, "b").unwrap();
        mem.write_bytes(a, b"abcdefgh");
        mem.copy_bytes(a.offset(2), b, 4);
        assert_eq!(mem.read_bytes(b, 4), b"cdef");
    }

    #[test]
    fn realloc_keeps_prefix() {
        let mut mem = Mem32::new(0x1000, 0x10000);
        let a = mem.alloc(8, "a").unwrap();
        mem.write_int(a, 77);
        let b = mem.realloc(a, 64, "a").unwrap();
        assert_eq!(mem.read_int(b), 77);
        assert!(!mem.is_allocated_start(a) || a == b);
    }

    #[test]
    fn failed_host_alloc_compacts_and_retries() {
        let mut mem = Mem32::new(0x1000, 0x10000);
        mem.fail_next_host_allocs(1);
        let a = mem.alloc(32, "a").unwrap();
        assert_eq!(mem.read_int(a), 0);
        mem.fail_next_host_allocs(2);
        assert_eq!(mem.alloc(32, "b"), Err(MemError::OutOfMemory { size: 32 }));
        assert_covering(&mem);
    }

    #[test]
    fn zstring_record_is_dereferenced() {
        let mut mem = Mem32::new(0x1000, 0x10000);
        let chars = mem.alloc(8, "chars").unwrap();
        mem.write_bytes(chars, b"HERO\0");
        let rec = mem.alloc(ZSTRING_SIZE, "zstring").unwrap();
        mem.write_int(rec.offset(ZSTRING_PTR), chars.to_script());
        mem.write_int(rec.offset(ZSTRING_LEN), 4);
        assert_eq!(mem.read_zstring(rec), b"HERO");
        assert_eq!(mem.read_cstr(chars, 64), b"HERO");
    }
}
