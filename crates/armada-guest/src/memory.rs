//! Guest memory contract and a flat, page-mapped reference implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::state::V128;

/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 0x1000;
const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Errors from mapping operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// Address or size is not page aligned.
    #[error("unaligned mapping: address {address:#x}, size {size:#x}")]
    Unaligned {
        /// Virtual address.
        address: u64,
        /// Requested size.
        size: u64,
    },
    /// Physical range lies outside the backing store.
    #[error("physical range {physical:#x}+{size:#x} exceeds backing store of {capacity:#x} bytes")]
    OutOfBacking {
        /// Physical start.
        physical: u64,
        /// Requested size.
        size: u64,
        /// Backing store size.
        capacity: u64,
    },
    /// Virtual range runs past the end of the address space.
    #[error("range {address:#x}+{size:#x} wraps the address space")]
    AddressOverflow {
        /// Virtual address.
        address: u64,
        /// Requested size.
        size: u64,
    },
    /// Unmap of a page that was never mapped.
    #[error("page {0:#x} is not mapped")]
    NotMapped(u64),
}

/// Guest memory as seen by translated code.
///
/// Typed accessors are little-endian and never fail: a fault is handled by the
/// implementation (see [`FlatMemory::fault_count`]).
pub trait Memory: Send + Sync {
    /// Copy `buf.len()` bytes starting at `address` into `buf`.
    fn read_bytes(&self, address: u64, buf: &mut [u8]);

    /// Store `data` starting at `address`.
    fn write_bytes(&self, address: u64, data: &[u8]);

    /// Whether `address` lies in a mapped page.
    fn is_mapped(&self, address: u64) -> bool;

    /// Host-physical offset backing `address`, if mapped.
    fn physical_address(&self, address: u64) -> Option<u64>;

    /// Map `size` bytes at `address` onto the physical range at `physical`.
    fn map(&self, address: u64, physical: u64, size: u64) -> Result<(), MemoryError>;

    /// Remove the mapping of `size` bytes at `address`.
    fn unmap(&self, address: u64, size: u64) -> Result<(), MemoryError>;

    /// Atomically replace the u32 at `address` with `desired` if it equals
    /// `expected`. Returns whether the swap happened.
    fn compare_and_swap_u32(&self, address: u64, expected: u32, desired: u32) -> bool;

    /// Atomically add one to the u32 at `address`, returning the new value.
    fn atomic_increment_u32(&self, address: u64) -> u32;

    /// Atomically subtract one from the u32 at `address`, returning the new value.
    fn atomic_decrement_u32(&self, address: u64) -> u32;

    /// Page-granular ranges inside `address..address+size` written since the
    /// last query made with the same `tracking_id`.
    fn modified_ranges(&self, address: u64, size: u64, tracking_id: u32) -> Vec<(u64, u64)>;

    /// Read one byte.
    fn read_u8(&self, address: u64) -> u8 {
        let mut buf = [0; 1];
        self.read_bytes(address, &mut buf);
        buf[0]
    }

    /// Read a little-endian u16.
    fn read_u16(&self, address: u64) -> u16 {
        let mut buf = [0; 2];
        self.read_bytes(address, &mut buf);
        u16::from_le_bytes(buf)
    }

    /// Read a little-endian u32.
    fn read_u32(&self, address: u64) -> u32 {
        let mut buf = [0; 4];
        self.read_bytes(address, &mut buf);
        u32::from_le_bytes(buf)
    }

    /// Read a little-endian u64.
    fn read_u64(&self, address: u64) -> u64 {
        let mut buf = [0; 8];
        self.read_bytes(address, &mut buf);
        u64::from_le_bytes(buf)
    }

    /// Read a 128-bit vector.
    fn read_vector128(&self, address: u64) -> V128 {
        let mut buf = [0; 16];
        self.read_bytes(address, &mut buf);
        V128(u128::from_le_bytes(buf))
    }

    /// Write one byte.
    fn write_u8(&self, address: u64, value: u8) {
        self.write_bytes(address, &[value]);
    }

    /// Write a little-endian u16.
    fn write_u16(&self, address: u64, value: u16) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    /// Write a little-endian u32.
    fn write_u32(&self, address: u64, value: u32) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    /// Write a little-endian u64.
    fn write_u64(&self, address: u64, value: u64) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    /// Write a 128-bit vector.
    fn write_vector128(&self, address: u64, value: V128) {
        self.write_bytes(address, &value.0.to_le_bytes());
    }
}

#[derive(Default)]
struct DirtyTracking {
    // page -> write generation
    versions: HashMap<u64, u64>,
    // (tracking id, page) -> generation last reported
    seen: HashMap<(u32, u64), u64>,
    generation: u64,
}

/// Byte-array backed guest memory with a virtual -> physical page table.
///
/// Reads of unmapped addresses yield zero and writes to them are dropped; both
/// bump [`FlatMemory::fault_count`].
pub struct FlatMemory {
    backing: RwLock<Vec<u8>>,
    pages: RwLock<HashMap<u64, u64>>,
    dirty: Mutex<DirtyTracking>,
    faults: AtomicU64,
}

impl std::fmt::Debug for FlatMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatMemory")
            .field("capacity", &self.capacity())
            .field("mapped_pages", &self.pages.read().len())
            .field("faults", &self.fault_count())
            .finish()
    }
}

impl FlatMemory {
    /// Allocate `capacity` bytes of physical backing with nothing mapped.
    /// `capacity` is rounded up to a whole page.
    pub fn new(capacity: u64) -> Self {
        let capacity = capacity.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        Self {
            backing: RwLock::new(vec![0; capacity as usize]),
            pages: RwLock::new(HashMap::new()),
            dirty: Mutex::new(DirtyTracking::default()),
            faults: AtomicU64::new(0),
        }
    }

    /// Backing store with virtual `0..size` mapped onto physical `0..size`.
    pub fn with_identity_map(size: u64) -> Self {
        let memory = Self::new(size);
        let capacity = memory.capacity();
        if capacity > 0 {
            let mut pages = memory.pages.write();
            for page in (0..capacity).step_by(PAGE_SIZE as usize) {
                pages.insert(page, page);
            }
        }
        memory
    }

    /// Size of the physical backing store.
    pub fn capacity(&self) -> u64 {
        self.backing.read().len() as u64
    }

    /// Number of accesses that hit an unmapped address.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Copy `data` to `address`, e.g. for loading guest code.
    pub fn load(&self, address: u64, data: &[u8]) {
        self.write_bytes(address, data);
    }

    /// Store a sequence of 32-bit instruction words starting at `address`.
    pub fn load_words(&self, address: u64, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.write_u32(address + i as u64 * 4, *word);
        }
    }

    fn translate(&self, address: u64) -> Option<u64> {
        let page = address & !PAGE_MASK;
        self.pages
            .read()
            .get(&page)
            .map(|physical| physical + (address & PAGE_MASK))
    }

    fn fault(&self, address: u64, len: usize, write: bool) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(address, len, write, "guest memory fault");
    }

    /// Split `address..address+len` at page boundaries, yielding
    /// `(offset into the request, physical address or None, chunk length)`.
    fn chunks(&self, address: u64, len: usize) -> Vec<(usize, Option<u64>, usize)> {
        let mut out = Vec::new();
        let mut done = 0usize;
        while done < len {
            let va = address.wrapping_add(done as u64);
            let room = (PAGE_SIZE - (va & PAGE_MASK)) as usize;
            let step = room.min(len - done);
            out.push((done, self.translate(va), step));
            done += step;
        }
        out
    }

    fn mark_dirty(&self, address: u64, len: usize) {
        if len == 0 {
            return;
        }
        let first = address & !PAGE_MASK;
        let last = address.wrapping_add(len as u64 - 1) & !PAGE_MASK;
        let mut dirty = self.dirty.lock();
        dirty.generation += 1;
        let generation = dirty.generation;
        let mut page = first;
        loop {
            dirty.versions.insert(page, generation);
            if page == last {
                break;
            }
            page = page.wrapping_add(PAGE_SIZE);
        }
    }

    fn with_u32<R>(&self, address: u64, f: impl FnOnce(&mut u32) -> R) -> Option<R> {
        let physical = self.translate(address)? as usize;
        if (address & PAGE_MASK) > PAGE_SIZE - 4 {
            return None;
        }
        let mut backing = self.backing.write();
        let bytes = backing.get_mut(physical..physical + 4)?;
        let mut value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let result = f(&mut value);
        bytes.copy_from_slice(&value.to_le_bytes());
        Some(result)
    }
}

/// The last page of the address space is mappable; anything past it is not.
fn check_range(address: u64, size: u64) -> Result<(), MemoryError> {
    if size > 0 && address.checked_add(size - 1).is_none() {
        return Err(MemoryError::AddressOverflow { address, size });
    }
    Ok(())
}

impl Memory for FlatMemory {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) {
        let backing = self.backing.read();
        for (offset, physical, len) in self.chunks(address, buf.len()) {
            let dst = &mut buf[offset..offset + len];
            match physical.and_then(|p| backing.get(p as usize..p as usize + len)) {
                Some(src) => dst.copy_from_slice(src),
                None => {
                    dst.fill(0);
                    self.fault(address + offset as u64, len, false);
                }
            }
        }
    }

    fn write_bytes(&self, address: u64, data: &[u8]) {
        let mut written = Vec::new();
        {
            let mut backing = self.backing.write();
            for (offset, physical, len) in self.chunks(address, data.len()) {
                let chunk = address.wrapping_add(offset as u64);
                match physical.and_then(|p| backing.get_mut(p as usize..p as usize + len)) {
                    Some(dst) => {
                        dst.copy_from_slice(&data[offset..offset + len]);
                        written.push((chunk, len));
                    }
                    None => self.fault(chunk, len, true),
                }
            }
        }
        for (chunk, len) in written {
            self.mark_dirty(chunk, len);
        }
    }

    fn is_mapped(&self, address: u64) -> bool {
        self.translate(address).is_some()
    }

    fn physical_address(&self, address: u64) -> Option<u64> {
        self.translate(address)
    }

    fn map(&self, address: u64, physical: u64, size: u64) -> Result<(), MemoryError> {
        if (address | physical | size) & PAGE_MASK != 0 {
            return Err(MemoryError::Unaligned { address, size });
        }
        check_range(address, size)?;
        let capacity = self.capacity();
        if physical.checked_add(size).is_none_or(|end| end > capacity) {
            return Err(MemoryError::OutOfBacking {
                physical,
                size,
                capacity,
            });
        }
        let mut pages = self.pages.write();
        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            pages.insert(address + offset, physical + offset);
        }
        tracing::debug!(address, physical, size, "mapped guest range");
        Ok(())
    }

    fn unmap(&self, address: u64, size: u64) -> Result<(), MemoryError> {
        if (address | size) & PAGE_MASK != 0 {
            return Err(MemoryError::Unaligned { address, size });
        }
        check_range(address, size)?;
        let mut pages = self.pages.write();
        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            if !pages.contains_key(&(address + offset)) {
                return Err(MemoryError::NotMapped(address + offset));
            }
        }
        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            pages.remove(&(address + offset));
        }
        Ok(())
    }

    fn compare_and_swap_u32(&self, address: u64, expected: u32, desired: u32) -> bool {
        let swapped = self.with_u32(address, |value| {
            if *value == expected {
                *value = desired;
                true
            } else {
                false
            }
        });
        match swapped {
            Some(true) => {
                self.mark_dirty(address, 4);
                true
            }
            Some(false) => false,
            None => {
                self.fault(address, 4, true);
                false
            }
        }
    }

    fn atomic_increment_u32(&self, address: u64) -> u32 {
        match self.with_u32(address, |value| {
            *value = value.wrapping_add(1);
            *value
        }) {
            Some(new) => {
                self.mark_dirty(address, 4);
                new
            }
            None => {
                self.fault(address, 4, true);
                0
            }
        }
    }

    fn atomic_decrement_u32(&self, address: u64) -> u32 {
        match self.with_u32(address, |value| {
            *value = value.wrapping_sub(1);
            *value
        }) {
            Some(new) => {
                self.mark_dirty(address, 4);
                new
            }
            None => {
                self.fault(address, 4, true);
                0
            }
        }
    }

    fn modified_ranges(&self, address: u64, size: u64, tracking_id: u32) -> Vec<(u64, u64)> {
        if size == 0 {
            return Vec::new();
        }
        let first = address & !PAGE_MASK;
        let end = address.saturating_add(size);
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        let mut dirty = self.dirty.lock();
        let mut page = first;
        while page < end {
            let version = dirty.versions.get(&page).copied().unwrap_or(0);
            let seen = dirty.seen.entry((tracking_id, page)).or_insert(0);
            if version > *seen {
                *seen = version;
                match ranges.last_mut() {
                    Some((start, len)) if *start + *len == page => *len += PAGE_SIZE,
                    _ => ranges.push((page, PAGE_SIZE)),
                }
            }
            page = match page.checked_add(PAGE_SIZE) {
                Some(next) => next,
                None => break,
            };
        }
        ranges
    }
}
