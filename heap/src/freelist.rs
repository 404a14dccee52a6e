//! Segregated free lists for paged space.
//!
//! Blocks of up to `NUM_CLASSES - 1` allocation units live in exact-size
//! lists; everything bigger goes to a single first-fit list. Every free block
//! is formatted as a [`FreeListElement`] so pages stay linearly walkable.

use object::{FreeListElement, OBJECT_ALIGNMENT};

pub const NUM_CLASSES: usize = 128;
const LARGE_CLASS: usize = NUM_CLASSES;

#[derive(Debug)]
pub struct FreeList {
    heads: [usize; NUM_CLASSES + 1],
    /// Bytes currently held by the lists.
    available: usize,
    /// Fill freed executable memory with traps before formatting.
    is_executable: bool,
}

#[inline(always)]
fn class_index(size: usize) -> usize {
    let units = size / OBJECT_ALIGNMENT;
    if units < NUM_CLASSES { units } else { LARGE_CLASS }
}

#[inline(always)]
unsafe fn element<'a>(addr: usize) -> &'a mut FreeListElement {
    unsafe { &mut *(addr as *mut FreeListElement) }
}

impl FreeList {
    pub fn new(is_executable: bool) -> Self {
        Self { heads: [0; NUM_CLASSES + 1], available: 0, is_executable }
    }

    pub fn reset(&mut self) {
        self.heads = [0; NUM_CLASSES + 1];
        self.available = 0;
    }

    pub fn available(&self) -> usize {
        self.available
    }

    /// Returns `size` bytes at `addr` to the list.
    ///
    /// # Safety
    ///
    /// The range must be writable, unused, and inside a page of this list.
    pub unsafe fn free(&mut self, addr: usize, size: usize) {
        debug_assert!(size >= FreeListElement::MIN_SIZE);
        debug_assert!(addr % OBJECT_ALIGNMENT == 0);
        if self.is_executable {
            unsafe { core::ptr::write_bytes(addr as *mut u8, 0xCC, size) };
        }
        let index = class_index(size);
        unsafe {
            let elem = FreeListElement::initialize(addr, size);
            (*elem).next = self.heads[index];
        }
        self.heads[index] = addr;
        self.available += size;
    }

    /// Takes a block of exactly `size` bytes, splitting a bigger one when
    /// no exact match exists.
    pub fn try_allocate(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size % OBJECT_ALIGNMENT == 0 && size > 0);
        let index = class_index(size);
        if index < LARGE_CLASS {
            for i in index..NUM_CLASSES {
                if self.heads[i] != 0 {
                    return Some(self.pop_and_split(i, size));
                }
            }
        }
        self.allocate_large(size)
    }

    fn pop_and_split(&mut self, index: usize, size: usize) -> usize {
        let addr = self.heads[index];
        let elem = unsafe { element(addr) };
        let block_size = elem.size();
        self.heads[index] = elem.next;
        self.available -= block_size;
        self.split_remainder(addr, block_size, size);
        addr
    }

    fn allocate_large(&mut self, size: usize) -> Option<usize> {
        let mut prev = 0usize;
        let mut current = self.heads[LARGE_CLASS];
        while current != 0 {
            let elem = unsafe { element(current) };
            let block_size = elem.size();
            if block_size >= size {
                if prev == 0 {
                    self.heads[LARGE_CLASS] = elem.next;
                } else {
                    unsafe { element(prev).next = elem.next };
                }
                self.available -= block_size;
                self.split_remainder(current, block_size, size);
                return Some(current);
            }
            prev = current;
            current = elem.next;
        }
        None
    }

    fn split_remainder(&mut self, addr: usize, block_size: usize, size: usize) {
        let remainder = block_size - size;
        if remainder > 0 {
            unsafe { self.free(addr + size, remainder) };
        }
    }

    /// Walks every free block. Used by verification and tests.
    pub fn for_each_block(&self, mut f: impl FnMut(usize, usize)) {
        for &head in &self.heads {
            let mut current = head;
            while current != 0 {
                let elem = unsafe { element(current) };
                f(current, elem.size());
                current = elem.next;
            }
        }
    }
}
