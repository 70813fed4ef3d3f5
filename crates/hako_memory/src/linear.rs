//! Linear guest memory with a first-fit block allocator
//!
//! Addresses below `BASE` are reserved so that `Address::NULL` can never be
//! handed out. Blocks are 8-byte aligned and zeroed on allocation.

use crate::Result;
use std::collections::BTreeMap;
use thiserror::Error;

const ALIGN: usize = 8;
const BASE: usize = 8;

/// Default upper bound for a single linear memory (16 MiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Address inside linear guest memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u32);

impl Address {
    pub const NULL: Address = Address(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: u32) -> Address {
        Address(self.0 + bytes)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("out of guest memory: requested {requested} bytes with {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("address {0:#x} is not the start of an allocated block")]
    InvalidFree(u32),

    #[error("access of {len} bytes at {addr:#x} is out of bounds")]
    OutOfBounds { addr: u32, len: usize },

    #[error("string at {0:#x} is not NUL-terminated")]
    Unterminated(u32),

    #[error("string at {0:#x} is not valid UTF-8")]
    InvalidUtf8(u32),
}

pub struct LinearMemory {
    bytes: Vec<u8>,
    limit: usize,
    blocks: BTreeMap<u32, usize>,
    free: Vec<(u32, usize)>,
}

macro_rules! scalar_access {
    ($read:ident, $write:ident, $ty:ty) => {
        pub fn $read(&self, addr: Address) -> Result<$ty> {
            let range = self.range(addr, std::mem::size_of::<$ty>())?;
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(&self.bytes[range]);
            Ok(<$ty>::from_le_bytes(raw))
        }

        pub fn $write(&mut self, addr: Address, value: $ty) -> Result<()> {
            let range = self.range(addr, std::mem::size_of::<$ty>())?;
            self.bytes[range].copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
    };
}

impl LinearMemory {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: vec![0; BASE],
            limit: limit.max(BASE),
            blocks: BTreeMap::new(),
            free: Vec::new(),
        }
    }

    /// Allocate a zeroed block of at least `len` bytes.
    pub fn allocate(&mut self, len: usize) -> Result<Address> {
        let size = round_up(len.max(1));

        if let Some(index) = self.free.iter().position(|&(_, free_len)| free_len >= size) {
            let (addr, free_len) = self.free.remove(index);
            if free_len > size {
                self.free.push((addr + size as u32, free_len - size));
            }
            let start = addr as usize;
            self.bytes[start..start + size].fill(0);
            self.blocks.insert(addr, size);
            tracing::trace!(addr, size, "reused guest memory block");
            return Ok(Address(addr));
        }

        let start = self.bytes.len();
        let end = start + size;
        if end > self.limit || end > u32::MAX as usize {
            return Err(MemoryError::OutOfMemory {
                requested: size,
                available: self.limit.saturating_sub(self.allocated_bytes() + BASE),
            });
        }
        self.bytes.resize(end, 0);
        self.blocks.insert(start as u32, size);
        tracing::trace!(addr = start, size, "allocated guest memory block");
        Ok(Address(start as u32))
    }

    pub fn free(&mut self, addr: Address) -> Result<()> {
        let size = self
            .blocks
            .remove(&addr.0)
            .ok_or(MemoryError::InvalidFree(addr.0))?;
        self.free.push((addr.0, size));
        self.coalesce();
        Ok(())
    }

    /// Allocate a block and copy `data` into it.
    pub fn allocate_bytes(&mut self, data: &[u8]) -> Result<Address> {
        let addr = self.allocate(data.len())?;
        self.write_bytes(addr, data)?;
        Ok(addr)
    }

    pub fn block_len(&self, addr: Address) -> Option<usize> {
        self.blocks.get(&addr.0).copied()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.blocks.values().sum()
    }

    pub fn allocation_count(&self) -> usize {
        self.blocks.len()
    }

    scalar_access!(read_u8, write_u8, u8);
    scalar_access!(read_u32, write_u32, u32);
    scalar_access!(read_i32, write_i32, i32);
    scalar_access!(read_u64, write_u64, u64);
    scalar_access!(read_f64, write_f64, f64);

    pub fn write_bytes(&mut self, addr: Address, data: &[u8]) -> Result<()> {
        let range = self.range(addr, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read_bytes(&self, addr: Address, len: usize) -> Result<&[u8]> {
        let range = self.range(addr, len)?;
        Ok(&self.bytes[range])
    }

    /// Copy `len` bytes out of guest memory into a host-owned buffer.
    pub fn slice(&self, addr: Address, len: usize) -> Result<Vec<u8>> {
        self.read_bytes(addr, len).map(<[u8]>::to_vec)
    }

    pub fn copy(&mut self, src: Address, dst: Address, len: usize) -> Result<()> {
        let from = self.range(src, len)?;
        self.range(dst, len)?;
        self.bytes.copy_within(from, dst.0 as usize);
        Ok(())
    }

    /// Encode `value` as a NUL-terminated UTF-8 string in a fresh block.
    pub fn encode_str(&mut self, value: &str) -> Result<Address> {
        let addr = self.allocate(value.len() + 1)?;
        self.write_bytes(addr, value.as_bytes())?;
        self.write_u8(addr.offset(value.len() as u32), 0)?;
        Ok(addr)
    }

    pub fn decode_str(&self, addr: Address) -> Result<String> {
        let start = self.range(addr, 0)?.start;
        let nul = self.bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(MemoryError::Unterminated(addr.0))?;
        std::str::from_utf8(&self.bytes[start..start + nul])
            .map(str::to_owned)
            .map_err(|_| MemoryError::InvalidUtf8(addr.0))
    }

    fn range(&self, addr: Address, len: usize) -> Result<std::ops::Range<usize>> {
        let start = addr.0 as usize;
        let end = start.checked_add(len);
        match end {
            Some(end) if start >= BASE && end <= self.bytes.len() => Ok(start..end),
            _ => Err(MemoryError::OutOfBounds { addr: addr.0, len }),
        }
    }

    fn coalesce(&mut self) {
        self.free.sort_unstable_by_key(|&(addr, _)| addr);
        let mut merged: Vec<(u32, usize)> = Vec::with_capacity(self.free.len());
        for (addr, len) in self.free.drain(..) {
            match merged.last_mut() {
                Some((prev, prev_len)) if *prev as usize + *prev_len == addr as usize => {
                    *prev_len += len;
                }
                _ => merged.push((addr, len)),
            }
        }

        // A free run touching the end of memory is handed back to the bump region.
        if let Some(&(addr, len)) = merged.last() {
            if addr as usize + len == self.bytes.len() {
                merged.pop();
                self.bytes.truncate(addr as usize);
            }
        }
        self.free = merged;
    }
}

impl Default for LinearMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT)
    }
}

fn round_up(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_never_returns_null() {
        let mut memory = LinearMemory::default();
        let addr = memory.allocate(0).unwrap();
        assert!(!addr.is_null());
        assert_eq!(memory.block_len(addr), Some(8));
    }

    #[test]
    fn freed_blocks_are_reused() {
        let mut memory = LinearMemory::default();
        let a = memory.allocate(16).unwrap();
        let b = memory.allocate(16).unwrap();
        memory.write_u32(a, 0xdead_beef).unwrap();
        memory.free(a).unwrap();

        let c = memory.allocate(8).unwrap();
        assert_eq!(c, a);
        // Reused blocks come back zeroed
        assert_eq!(memory.read_u32(c).unwrap(), 0);
        assert_eq!(memory.allocation_count(), 2);
        memory.free(b).unwrap();
        memory.free(c).unwrap();
        assert_eq!(memory.allocated_bytes(), 0);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut memory = LinearMemory::default();
        let addr = memory.allocate(4).unwrap();
        memory.free(addr).unwrap();
        assert_eq!(memory.free(addr), Err(MemoryError::InvalidFree(addr.0)));
    }

    #[test]
    fn scalars_are_little_endian() {
        let mut memory = LinearMemory::default();
        let addr = memory.allocate(8).unwrap();
        memory.write_u32(addr, 0x0403_0201).unwrap();
        assert_eq!(memory.read_bytes(addr, 4).unwrap(), &[1, 2, 3, 4]);

        memory.write_f64(addr, -2.5).unwrap();
        assert_eq!(memory.read_f64(addr).unwrap(), -2.5);
    }

    #[test]
    fn strings_are_nul_terminated() {
        let mut memory = LinearMemory::default();
        let addr = memory.encode_str("héllo").unwrap();
        assert_eq!(memory.block_len(addr), Some(8));
        assert_eq!(memory.read_u8(addr.offset(6)).unwrap(), 0);
        assert_eq!(memory.decode_str(addr).unwrap(), "héllo");
    }

    #[test]
    fn out_of_bounds_access_fails() {
        let memory = LinearMemory::default();
        assert!(matches!(
            memory.read_u32(Address(4096)),
            Err(MemoryError::OutOfBounds { .. })
        ));
        assert!(matches!(
            memory.read_u8(Address::NULL),
            Err(MemoryError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn limit_is_enforced() {
        let mut memory = LinearMemory::new(64);
        assert!(memory.allocate(32).is_ok());
        assert!(matches!(
            memory.allocate(64),
            Err(MemoryError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn copy_moves_bytes_between_blocks() {
        let mut memory = LinearMemory::default();
        let src = memory.allocate_bytes(b"abcdef").unwrap();
        let dst = memory.allocate(6).unwrap();
        memory.copy(src, dst, 6).unwrap();
        assert_eq!(memory.slice(dst, 6).unwrap(), b"abcdef");
    }
}
