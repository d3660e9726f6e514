// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Linear memory: paged storage with a FIFO-fair scoped lock.
//!
//! A [`MemoryInstance`] owns its bytes directly (no `Mutex<TableInstance>`
//! wrapper at the `Store` level, unlike tables and globals) because the
//! access discipline it needs is more than mutual exclusion: concurrent
//! invocations sharing a memory must be served in the order they asked for
//! it, not whichever happens to win the scheduler's race. A plain
//! `std::sync::Mutex` makes no such promise, so the ticket-and-condvar
//! turnstile below sits in front of it.

use std::sync::{Condvar, Mutex};

use crate::Allocator;
use crate::core_compat::vec::Vec;
use crate::types::MemType;

use super::Trap;

/// A linear memory instance: a growable byte vector addressed in whole
/// [`MemType::PAGE_SIZE`] pages, per §3 "MemoryInstance".
pub struct MemoryInstance<A: Allocator> {
    max_bytes: Option<usize>,
    data: Mutex<Vec<u8, A>>,
    next_ticket: Mutex<u64>,
    now_serving: Mutex<u64>,
    turnstile: Condvar,
}

impl<A: Allocator> MemoryInstance<A> {
    pub(crate) fn new(ty: MemType, alloc: A) -> Self {
        let mut data = Vec::new_in(alloc);
        data.resize(ty.min_size_bytes(), 0);
        Self {
            max_bytes: ty.max_size_bytes(),
            data: Mutex::new(data),
            next_ticket: Mutex::new(0),
            now_serving: Mutex::new(0),
            turnstile: Condvar::new(),
        }
    }

    // The memory's declared maximum, in pages, if any. Used by instantiation
    // to check an imported memory against the importing module's declared
    // limits.
    pub(crate) fn max_pages(&self) -> Option<u32> {
        self.max_bytes.map(|bytes| (bytes / MemType::PAGE_SIZE) as u32)
    }

    /// Acquires the memory's scoped lock, blocking until every caller that
    /// asked before this one has released it.
    pub fn lock(&self) -> MemoryGuard<'_, A> {
        let ticket = {
            let mut next = self.next_ticket.lock().expect("ticket counter lock poisoned");
            let ticket = *next;
            *next = next.wrapping_add(1);
            ticket
        };
        let mut serving = self.now_serving.lock().expect("turnstile state lock poisoned");
        while *serving != ticket {
            serving = self.turnstile.wait(serving).expect("turnstile wait poisoned");
        }
        drop(serving);
        // No other holder can be mid-access once our ticket is being served,
        // so this acquisition never actually blocks.
        let bytes = self.data.lock().expect("memory data lock poisoned");
        MemoryGuard {
            memory: self,
            bytes,
        }
    }
}

/// Exclusive, scoped access to a [`MemoryInstance`]'s bytes. Released (and
/// the next ticket admitted) on drop.
pub struct MemoryGuard<'a, A: Allocator> {
    memory: &'a MemoryInstance<A>,
    bytes: std::sync::MutexGuard<'a, Vec<u8, A>>,
}

impl<A: Allocator> Drop for MemoryGuard<'_, A> {
    fn drop(&mut self) {
        let mut serving = self.memory.now_serving.lock().expect("turnstile state lock poisoned");
        *serving = serving.wrapping_add(1);
        self.memory.turnstile.notify_all();
    }
}

impl<A: Allocator> MemoryGuard<'_, A> {
    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn size_pages(&self) -> u32 {
        (self.bytes.len() / MemType::PAGE_SIZE) as u32
    }

    fn checked_range(&self, offset: u64, len: usize) -> Result<core::ops::Range<usize>, Trap> {
        let end = offset.checked_add(len as u64).ok_or(Trap::MemoryOutOfBounds)?;
        if end > self.bytes.len() as u64 {
            return Err(Trap::MemoryOutOfBounds);
        }
        Ok((offset as usize)..(end as usize))
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<&[u8], Trap> {
        let range = self.checked_range(offset, len)?;
        Ok(&self.bytes[range])
    }

    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), Trap> {
        let range = self.checked_range(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8, Trap> {
        Ok(self.read_bytes(offset, 1)?[0])
    }

    pub fn read_i8(&self, offset: u64) -> Result<i8, Trap> {
        Ok(self.read_u8(offset)? as i8)
    }

    pub fn read_u16(&self, offset: u64) -> Result<u16, Trap> {
        let bytes = self.read_bytes(offset, 2)?;
        Ok(u16::from_le_bytes(bytes.try_into().expect("checked length")))
    }

    pub fn read_i16(&self, offset: u64) -> Result<i16, Trap> {
        Ok(self.read_u16(offset)? as i16)
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, Trap> {
        let bytes = self.read_bytes(offset, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("checked length")))
    }

    pub fn read_i32(&self, offset: u64) -> Result<i32, Trap> {
        Ok(self.read_u32(offset)? as i32)
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64, Trap> {
        let bytes = self.read_bytes(offset, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("checked length")))
    }

    pub fn read_f32(&self, offset: u64) -> Result<f32, Trap> {
        Ok(f32::from_bits(self.read_u32(offset)?))
    }

    pub fn read_f64(&self, offset: u64) -> Result<f64, Trap> {
        Ok(f64::from_bits(self.read_u64(offset)?))
    }

    pub fn write_u8(&mut self, offset: u64, value: u8) -> Result<(), Trap> {
        self.write_bytes(offset, &[value])
    }

    pub fn write_u16(&mut self, offset: u64, value: u16) -> Result<(), Trap> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, offset: u64, value: u32) -> Result<(), Trap> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<(), Trap> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_f32(&mut self, offset: u64, value: f32) -> Result<(), Trap> {
        self.write_u32(offset, value.to_bits())
    }

    pub fn write_f64(&mut self, offset: u64, value: f64) -> Result<(), Trap> {
        self.write_u64(offset, value.to_bits())
    }

    // Grows the memory by `delta` pages, zero-initializing the new pages.
    // Returns the previous page count, or `u32::MAX` on failure (exceeding
    // the declared maximum, the hard-coded 4 GiB address-space ceiling, or
    // allocation failure), per the WASM `memory.grow` convention.
    pub fn grow(&mut self, delta: u32) -> u32 {
        const MAX_PAGES: u32 = 0x1_0000; // 2^16 pages = 4 GiB, i32 address space limit.

        let current_pages = self.size_pages();
        let Some(new_pages) = current_pages.checked_add(delta) else {
            return u32::MAX;
        };
        if new_pages > MAX_PAGES {
            return u32::MAX;
        }
        let new_bytes = (new_pages as usize) * MemType::PAGE_SIZE;
        if let Some(max_bytes) = self.memory.max_bytes
            && new_bytes > max_bytes
        {
            return u32::MAX;
        }
        if self.bytes.try_reserve_exact(new_bytes - self.bytes.len()).is_err() {
            return u32::MAX;
        }
        self.bytes.resize(new_bytes, 0);
        current_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_compat::alloc::Global;
    use crate::types::Limits;

    fn memory(min: u32, max: Option<u32>) -> MemoryInstance<Global> {
        MemoryInstance::new(MemType::new(Limits { min, max }), Global)
    }

    #[test]
    fn read_write_round_trip_little_endian() {
        let mem = memory(1, None);
        let mut guard = mem.lock();
        guard.write_u32(0, 0x0102_0304).unwrap();
        assert_eq!(guard.read_bytes(0, 4).unwrap(), &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(guard.read_u32(0).unwrap(), 0x0102_0304);

        guard.write_f64(8, 1.5).unwrap();
        assert_eq!(guard.read_f64(8).unwrap(), 1.5);
    }

    #[test]
    fn out_of_bounds_access_traps() {
        let mem = memory(1, None);
        let guard = mem.lock();
        let page = MemType::PAGE_SIZE as u64;
        assert!(matches!(guard.read_u8(page), Err(Trap::MemoryOutOfBounds)));
        assert!(matches!(
            guard.read_u32(page - 2),
            Err(Trap::MemoryOutOfBounds)
        ));
    }

    #[test]
    fn grow_zero_initializes_and_respects_max() {
        let mem = memory(1, Some(2));
        let mut guard = mem.lock();
        assert_eq!(guard.grow(1), 1);
        assert_eq!(guard.size_pages(), 2);
        assert_eq!(guard.read_u64(MemType::PAGE_SIZE as u64).unwrap(), 0);
        assert_eq!(guard.grow(1), u32::MAX);
    }

    // Two lock scopes racing on the same memory observe the FIFO order of
    // acquisition: whichever ticket was handed out second always writes
    // last, regardless of which OS thread the scheduler happened to wake
    // first.
    #[test]
    fn concurrent_lock_scopes_are_fifo_ordered() {
        let mem = std::sync::Arc::new(memory(1, None));

        let first_holds = mem.lock();
        let mem2 = mem.clone();
        let second_ticket_requested = std::sync::Arc::new(std::sync::Barrier::new(2));
        let barrier = second_ticket_requested.clone();
        let writer = std::thread::spawn(move || {
            barrier.wait();
            let mut guard = mem2.lock();
            guard.write_u32(0, 0xBBBB_BBBB).unwrap();
        });

        second_ticket_requested.wait();
        // Give the spawned thread a chance to block on the turnstile before
        // this scope releases it; the ticket counter guarantees ordering
        // even without this, but the sleep makes the intended race concrete.
        std::thread::sleep(std::time::Duration::from_millis(20));
        {
            let mut guard = first_holds;
            guard.write_u32(0, 0xAAAA_AAAA).unwrap();
        }

        writer.join().expect("writer thread panicked");
        let guard = mem.lock();
        assert_eq!(guard.read_u32(0).unwrap(), 0xBBBB_BBBB);
    }
}
