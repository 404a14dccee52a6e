//! Young generation: two semispaces and a Cheney-style copying collector.
//!
//! Objects are bump-allocated in to-space at `16n + 8`. A scavenge flips the
//! spaces, evacuates everything reachable from the roots and the store
//! buffer, and promotes objects that already survived one scavenge (those
//! below `survivor_end`) or that no longer fit in to-space.

use std::alloc::Layout;
use std::ptr::NonNull;

use object::{
    Header, HeaderFlags, NEW_OBJECT_ALIGNMENT_OFFSET, OBJECT_ALIGNMENT, Value, WeakProperty, cid,
};
use rustc_hash::FxHashMap;

use crate::pages::{PageSpace, PageType};
use crate::store_buffer::StoreBuffer;
use crate::system::{self, Protection};
use crate::{GrowthPolicy, RootProvider, SizeFn, TraceFn, WeakSetVisitor};

#[derive(Debug)]
pub struct Scavenger {
    memory: NonNull<u8>,
    semi_space_size: usize,
    to_start: usize,
    from_start: usize,
    top: usize,
    end: usize,
    /// Objects below this address in to-space survived a scavenge already.
    survivor_end: usize,
    pub(crate) peers: FxHashMap<usize, usize>,
}

unsafe impl Send for Scavenger {}

/// Outcome of one scavenge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScavengeStats {
    pub copied_bytes: usize,
    pub promoted_bytes: usize,
    /// To-space ran out and survivors were promoted early.
    pub promotion_failure: bool,
    /// Old space hit its cap while promoting. The scavenge still completed,
    /// possibly by growing past the cap.
    pub old_space_exhausted: bool,
}

pub(crate) struct ScavengeContext<'a> {
    pub old_space: &'a mut PageSpace,
    pub store_buffer: &'a mut StoreBuffer,
    pub roots: &'a mut dyn RootProvider,
    pub trace_fn: TraceFn,
    pub size_fn: SizeFn,
    pub invoke_callbacks: bool,
    pub null_value: Value,
}

impl Scavenger {
    pub fn new(semi_space_size: usize) -> Option<Self> {
        let memory = system::map_memory(semi_space_size * 2)?;
        let to_start = memory.as_ptr() as usize;
        let from_start = to_start + semi_space_size;
        let top = to_start + NEW_OBJECT_ALIGNMENT_OFFSET;
        Some(Self {
            memory,
            semi_space_size,
            to_start,
            from_start,
            top,
            end: to_start + semi_space_size - NEW_OBJECT_ALIGNMENT_OFFSET,
            survivor_end: top,
            peers: FxHashMap::default(),
        })
    }

    #[inline(always)]
    fn object_start(&self) -> usize {
        self.to_start + NEW_OBJECT_ALIGNMENT_OFFSET
    }

    #[inline(always)]
    pub fn try_allocate(&mut self, size: usize) -> Option<usize> {
        let result = self.top;
        let new_top = result + size;
        if new_top <= self.end {
            self.top = new_top;
            Some(result)
        } else {
            None
        }
    }

    /// True for addresses inside the active semispace.
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.to_start && addr < self.to_start + self.semi_space_size
    }

    pub fn used(&self) -> usize {
        self.top - self.object_start()
    }

    pub fn capacity(&self) -> usize {
        self.end - self.object_start()
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn semi_space_size(&self) -> usize {
        self.semi_space_size
    }

    /// Visits every object in to-space.
    pub fn visit_objects(&self, size_fn: SizeFn, f: &mut dyn FnMut(usize)) {
        let mut addr = self.object_start();
        while addr < self.top {
            f(addr);
            addr += unsafe { size_fn(addr as *const u8) };
        }
    }

    pub fn write_protect(&self, read_only: bool) {
        let protection = if read_only { Protection::READ } else { Protection::READ_WRITE };
        if !system::protect_memory(self.memory, self.semi_space_size * 2, protection) {
            log::warn!("mprotect({:?}) failed for new space", protection);
        }
    }

    fn flip(&mut self) -> usize {
        std::mem::swap(&mut self.to_start, &mut self.from_start);
        let previous_survivor_end = self.survivor_end;
        self.top = self.object_start();
        self.end = self.to_start + self.semi_space_size - NEW_OBJECT_ALIGNMENT_OFFSET;
        previous_survivor_end
    }

    pub(crate) fn scavenge(&mut self, ctx: ScavengeContext<'_>) -> ScavengeStats {
        let survivor_end = self.flip();
        let scan_start = self.object_start();
        let mut ev = Evacuator {
            from_start: self.from_start,
            from_end: self.from_start + self.semi_space_size,
            top: self.top,
            end: self.end,
            survivor_end,
            old_space: ctx.old_space,
            size_fn: ctx.size_fn,
            trace_fn: ctx.trace_fn,
            promo_stack: Vec::new(),
            delayed_weak: Vec::new(),
            stats: ScavengeStats::default(),
        };

        // Old objects recorded by the write barrier.
        for owner in ctx.store_buffer.drain() {
            let header = unsafe { owner.header() };
            header.clear_remembered();
            ev.scan_strong(owner.addr());
            if ev.has_young_pointers(owner.addr()) {
                header.set_remembered();
                ctx.store_buffer.add(owner);
            }
        }

        ctx.roots.visit_roots(!ctx.invoke_callbacks, &mut |slot| ev.scavenge_pointer(slot));

        let mut scan = scan_start;
        loop {
            ev.process(&mut scan, ctx.store_buffer);
            let mut progress = ev.process_delayed_weak_properties(ctx.store_buffer);
            if ctx.roots.visit_weak_reference_sets(&mut ev) {
                progress = true;
            }
            if !progress {
                break;
            }
        }
        ev.process(&mut scan, ctx.store_buffer);

        ctx.roots.visit_weak_roots(ctx.invoke_callbacks, &mut |slot| ev.update_weak(slot));

        for addr in ev.delayed_weak.drain(..) {
            let property = unsafe { &mut *(addr as *mut WeakProperty) };
            property.key = ctx.null_value;
            property.value = ctx.null_value;
        }

        self.top = ev.top;
        let stats = ev.stats;
        let old_space = ev.old_space;

        let peers = std::mem::take(&mut self.peers);
        for (addr, peer) in peers {
            let header = unsafe { Header::from_addr(addr) };
            if !header.is_forwarded() {
                continue;
            }
            let new_addr = header.forwarding_address();
            if self.contains(new_addr) {
                self.peers.insert(new_addr, peer);
            } else {
                old_space.peers.insert(new_addr, peer);
            }
        }

        unsafe {
            core::ptr::write_bytes(self.from_start as *mut u8, 0, self.semi_space_size);
        }
        self.survivor_end = self.top;
        stats
    }
}

impl Drop for Scavenger {
    fn drop(&mut self) {
        system::unmap_memory(self.memory, self.semi_space_size * 2);
    }
}

// ── Evacuation ────────────────────────────────────────────────────────

struct Evacuator<'a> {
    from_start: usize,
    from_end: usize,
    top: usize,
    end: usize,
    survivor_end: usize,
    old_space: &'a mut PageSpace,
    size_fn: SizeFn,
    trace_fn: TraceFn,
    promo_stack: Vec<usize>,
    delayed_weak: Vec<usize>,
    stats: ScavengeStats,
}

impl Evacuator<'_> {
    #[inline(always)]
    fn in_from_space(&self, value: Value) -> bool {
        value.is_new_object() && value.addr() >= self.from_start && value.addr() < self.from_end
    }

    fn scavenge_pointer(&mut self, slot: &mut Value) {
        let value = *slot;
        if !self.in_from_space(value) {
            return;
        }
        let addr = value.addr();
        let header = unsafe { Header::from_addr(addr) };
        if header.is_forwarded() {
            *slot = Value::from_addr(header.forwarding_address());
            return;
        }

        let size = unsafe { (self.size_fn)(addr as *const u8) };
        let (new_addr, promoted) = if addr < self.survivor_end {
            self.promote(size)
        } else if let Some(new_addr) = self.bump(size) {
            (new_addr, false)
        } else {
            self.stats.promotion_failure = true;
            self.promote(size)
        };

        unsafe {
            core::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, size);
        }
        header.forward_to(new_addr);

        if promoted {
            let copy = unsafe { Header::from_addr(new_addr) };
            copy.remove_flag(HeaderFlags::REMEMBERED);
            copy.clear_mark();
            self.promo_stack.push(new_addr);
            self.stats.promoted_bytes += size;
        } else {
            self.stats.copied_bytes += size;
        }
        *slot = Value::from_addr(new_addr);
    }

    fn bump(&mut self, size: usize) -> Option<usize> {
        if self.top + size > self.end {
            return None;
        }
        let addr = self.top;
        self.top += size;
        Some(addr)
    }

    /// Returns the new address and whether it is in old space. When old
    /// space is full the object stays young if to-space has room, and
    /// otherwise old space grows past its cap so the scavenge can finish.
    fn promote(&mut self, size: usize) -> (usize, bool) {
        if let Some(addr) = self.old_space.try_allocate(size, PageType::Data, GrowthPolicy::ForceGrowth) {
            return (addr, true);
        }
        if !self.stats.old_space_exhausted {
            log::warn!("scavenge: old space exhausted promoting {} bytes", size);
        }
        self.stats.old_space_exhausted = true;
        if let Some(addr) = self.bump(size) {
            return (addr, false);
        }
        match self.old_space.try_allocate(size, PageType::Data, GrowthPolicy::ExceedLimit) {
            Some(addr) => (addr, true),
            None => {
                log::error!("scavenge: cannot map {} bytes for promotion", size);
                let layout = Layout::from_size_align(size, OBJECT_ALIGNMENT).unwrap_or(Layout::new::<u128>());
                std::alloc::handle_alloc_error(layout)
            }
        }
    }

    fn scan_strong(&mut self, obj: usize) {
        let trace = self.trace_fn;
        unsafe { trace(obj as *const u8, &mut |slot| self.scavenge_pointer(slot)) };
    }

    /// Scans `obj`, delaying weak properties whose key is still unreached.
    fn scan(&mut self, obj: usize) {
        let header = unsafe { Header::from_addr(obj) };
        if header.class_id() == cid::WEAK_PROPERTY {
            let key = unsafe { (*(obj as *const WeakProperty)).key };
            if self.in_from_space(key) && !unsafe { key.header() }.is_forwarded() {
                self.delayed_weak.push(obj);
                return;
            }
        }
        self.scan_strong(obj);
    }

    fn has_young_pointers(&self, obj: usize) -> bool {
        let mut found = false;
        unsafe {
            (self.trace_fn)(obj as *const u8, &mut |slot| {
                found |= slot.is_new_object();
            });
        }
        found
    }

    /// Scans copied and promoted objects until both work lists are empty.
    fn process(&mut self, scan: &mut usize, store_buffer: &mut StoreBuffer) {
        loop {
            while *scan < self.top {
                let obj = *scan;
                let size = unsafe { (self.size_fn)(obj as *const u8) };
                self.scan(obj);
                *scan += size;
            }
            let Some(obj) = self.promo_stack.pop() else {
                if *scan >= self.top {
                    return;
                }
                continue;
            };
            self.scan(obj);
            self.remember_if_needed(obj, store_buffer);
        }
    }

    /// Records a promoted object that still points into the young generation.
    fn remember_if_needed(&self, obj: usize, store_buffer: &mut StoreBuffer) {
        if Value::from_addr(obj).is_new_object() || !self.has_young_pointers(obj) {
            return;
        }
        let header = unsafe { Header::from_addr(obj) };
        let prev = header.fetch_or_flags(HeaderFlags::REMEMBERED);
        if !prev.contains(HeaderFlags::REMEMBERED) {
            store_buffer.add(Value::from_addr(obj));
        }
    }

    fn process_delayed_weak_properties(&mut self, store_buffer: &mut StoreBuffer) -> bool {
        let delayed = std::mem::take(&mut self.delayed_weak);
        let mut progress = false;
        for obj in delayed {
            let key = unsafe { (*(obj as *const WeakProperty)).key };
            if unsafe { key.header() }.is_forwarded() {
                self.scan_strong(obj);
                self.remember_if_needed(obj, store_buffer);
                progress = true;
            } else {
                self.delayed_weak.push(obj);
            }
        }
        progress
    }

    fn is_alive_value(&self, value: Value) -> bool {
        !self.in_from_space(value) || unsafe { value.header() }.is_forwarded()
    }

    fn update_weak(&mut self, slot: &mut Value) -> bool {
        let value = *slot;
        if !self.in_from_space(value) {
            return true;
        }
        let header = unsafe { value.header() };
        if header.is_forwarded() {
            *slot = Value::from_addr(header.forwarding_address());
            true
        } else {
            false
        }
    }
}

impl WeakSetVisitor for Evacuator<'_> {
    fn is_alive(&self, value: Value) -> bool {
        self.is_alive_value(value)
    }

    fn mark_live(&mut self, slot: &mut Value) {
        self.scavenge_pointer(slot);
    }
}
