//! Old-generation paged space.
//!
//! Pages are `page_size`-aligned mappings described by side metadata, so an
//! object's address is enough to find its page. Objects larger than a page
//! get a dedicated large page that is either kept or freed as a whole.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use object::{FreeListElement, Header, OBJECT_ALIGNMENT, cid};
use rustc_hash::FxHashMap;

use crate::freelist::FreeList;
use crate::system::{self, OS_PAGE_SIZE, Protection};
use crate::{GrowthPolicy, SizeFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    Data,
    Executable,
}

impl PageType {
    #[inline(always)]
    fn index(self) -> usize {
        match self {
            PageType::Data => 0,
            PageType::Executable => 1,
        }
    }
}

#[derive(Debug)]
pub struct Page {
    memory: NonNull<u8>,
    size: usize,
    kind: PageType,
    is_large: bool,
}

impl Page {
    #[inline(always)]
    pub fn start(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn kind(&self) -> PageType {
        self.kind
    }

    #[inline(always)]
    pub fn is_large(&self) -> bool {
        self.is_large
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Visits every object on the page, free blocks included.
    ///
    /// # Safety
    ///
    /// The page must be walkable: every byte belongs to an object or a free
    /// block with a valid header.
    pub unsafe fn visit_objects(&self, size_fn: SizeFn, mut f: impl FnMut(usize, usize)) {
        let mut addr = self.start();
        let end = if self.is_large { addr + OBJECT_ALIGNMENT } else { self.end() };
        while addr < end {
            let size = unsafe { size_fn(addr as *const u8) };
            debug_assert!(size > 0, "zero-sized object at 0x{addr:x}");
            f(addr, size);
            addr += size;
        }
    }

    fn protect(&self, read_only: bool) {
        let protection = match (self.kind, read_only) {
            (PageType::Data, true) => Protection::READ,
            (PageType::Executable, true) => Protection::READ_EXECUTE,
            (_, false) => Protection::READ_WRITE,
        };
        if !system::protect_memory(self.memory, self.size, protection) {
            log::warn!(
                "mprotect({:?}) failed for page at 0x{:x}",
                protection,
                self.start()
            );
        }
    }

    fn release(self) {
        system::unmap_memory(self.memory, self.size);
    }
}

// ── Growth controller ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct CollectionRecord {
    gc_time: Duration,
    wall_time: Duration,
}

/// Decides whether old space may add pages instead of collecting.
#[derive(Debug)]
pub struct PageSpaceController {
    enabled: Arc<AtomicBool>,
    /// Pages the heap may still add before the next mark-sweep.
    grow_heap: isize,
    heap_growth_space_ratio: usize,
    heap_growth_time_ratio: usize,
    heap_growth_rate: usize,
    history: VecDeque<CollectionRecord>,
}

const HISTORY_LENGTH: usize = 4;

impl PageSpaceController {
    pub fn new(space_ratio: usize, time_ratio: usize, rate: usize) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
            grow_heap: rate as isize,
            heap_growth_space_ratio: space_ratio,
            heap_growth_time_ratio: time_ratio,
            heap_growth_rate: rate,
            history: VecDeque::with_capacity(HISTORY_LENGTH),
        }
    }

    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn grow_heap(&self) -> isize {
        self.grow_heap
    }

    /// Consumes growth budget for `pages` new pages.
    pub fn can_grow(&mut self, pages: usize) -> bool {
        if !self.is_enabled() || self.heap_growth_space_ratio == 100 {
            return true;
        }
        if self.grow_heap <= 0 {
            return false;
        }
        self.grow_heap -= pages as isize;
        true
    }

    /// Updates the growth budget after a mark-sweep.
    ///
    /// Growth is denied when the collection reclaimed at least the space
    /// ratio and recent collections used at most the time ratio of the
    /// wall clock.
    pub fn evaluate(
        &mut self,
        used_before: usize,
        used_after: usize,
        gc_time: Duration,
        wall_time: Duration,
    ) {
        if self.history.len() == HISTORY_LENGTH {
            self.history.pop_front();
        }
        self.history.push_back(CollectionRecord { gc_time, wall_time });

        let collected_percent = if used_before == 0 {
            100
        } else {
            used_before.saturating_sub(used_after) * 100 / used_before
        };
        let total_gc: Duration = self.history.iter().map(|r| r.gc_time).sum();
        let total_wall: Duration = self.history.iter().map(|r| r.wall_time).sum();
        let time_percent = if total_wall.is_zero() {
            0
        } else {
            (total_gc.as_nanos() * 100 / total_wall.as_nanos()) as usize
        };

        if collected_percent >= self.heap_growth_space_ratio
            && time_percent <= self.heap_growth_time_ratio
        {
            self.grow_heap = 0;
        } else {
            self.grow_heap = self.heap_growth_rate as isize;
        }
        log::debug!(
            "growth controller: collected {}%, gc time {}%, grow_heap {}",
            collected_percent,
            time_percent,
            self.grow_heap
        );
    }
}

// ── PageSpace ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PageSpace {
    page_size: usize,
    pages: Vec<Page>,
    large_pages: Vec<Page>,
    freelists: [FreeList; 2],
    capacity: [usize; 2],
    max_capacity: [usize; 2],
    /// Bytes handed out by allocation since the last sweep, plus survivors.
    used: [usize; 2],
    pub(crate) controller: PageSpaceController,
    pub(crate) peers: FxHashMap<usize, usize>,
    read_only: bool,
}

unsafe impl Send for PageSpace {}

impl PageSpace {
    pub fn new(
        page_size: usize,
        old_capacity: usize,
        code_capacity: usize,
        controller: PageSpaceController,
    ) -> Self {
        Self {
            page_size,
            pages: Vec::new(),
            large_pages: Vec::new(),
            freelists: [FreeList::new(false), FreeList::new(true)],
            capacity: [0; 2],
            max_capacity: [old_capacity, code_capacity],
            used: [0; 2],
            controller,
            peers: FxHashMap::default(),
            read_only: false,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn large_pages(&self) -> &[Page] {
        &self.large_pages
    }

    pub fn used(&self, kind: PageType) -> usize {
        self.used[kind.index()]
    }

    pub fn capacity(&self, kind: PageType) -> usize {
        self.capacity[kind.index()]
    }

    /// Bytes that can still be allocated before the capacity cap is hit.
    pub fn headroom(&self, kind: PageType) -> usize {
        let index = kind.index();
        self.max_capacity[index].saturating_sub(self.used[index])
    }

    /// True once mapped pages exceed the cap.
    pub fn exceeds_limit(&self, kind: PageType) -> bool {
        let index = kind.index();
        self.capacity[index] > self.max_capacity[index]
    }

    pub fn total_used(&self) -> usize {
        self.used[0] + self.used[1]
    }

    /// Largest object that fits a regular page.
    #[inline(always)]
    fn max_regular_size(&self) -> usize {
        self.page_size
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.page_of(addr).is_some()
    }

    pub fn contains_kind(&self, addr: usize, kind: PageType) -> bool {
        self.page_of(addr).is_some_and(|p| p.kind == kind)
    }

    pub fn page_of(&self, addr: usize) -> Option<&Page> {
        let base = addr & !(self.page_size - 1);
        self.pages
            .iter()
            .find(|p| p.start() == base)
            .or_else(|| self.large_pages.iter().find(|p| p.contains(addr)))
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates `size` bytes without collecting. Returns `None` when the
    /// free list is exhausted and growth is denied or capped.
    pub fn try_allocate(
        &mut self,
        size: usize,
        kind: PageType,
        growth: GrowthPolicy,
    ) -> Option<usize> {
        debug_assert!(!self.read_only, "allocation in a write-protected heap");
        debug_assert!(size % OBJECT_ALIGNMENT == 0);
        if size > self.max_regular_size() {
            return self.allocate_large(size, kind, growth);
        }
        let index = kind.index();
        if let Some(addr) = self.freelists[index].try_allocate(size) {
            self.used[index] += size;
            return Some(addr);
        }
        if !self.may_grow(self.page_size, kind, growth) {
            return None;
        }
        self.add_page(kind)?;
        let addr = self.freelists[index].try_allocate(size)?;
        self.used[index] += size;
        Some(addr)
    }

    fn may_grow(&mut self, bytes: usize, kind: PageType, growth: GrowthPolicy) -> bool {
        let index = kind.index();
        if growth != GrowthPolicy::ExceedLimit && self.capacity[index] + bytes > self.max_capacity[index] {
            return false;
        }
        match growth {
            GrowthPolicy::ForceGrowth | GrowthPolicy::ExceedLimit => true,
            GrowthPolicy::ControlGrowth => {
                let pages = bytes.div_ceil(self.page_size);
                self.controller.can_grow(pages)
            }
        }
    }

    fn add_page(&mut self, kind: PageType) -> Option<()> {
        let memory = system::map_aligned(self.page_size, self.page_size)?;
        let page = Page { memory, size: self.page_size, kind, is_large: false };
        let index = kind.index();
        unsafe { self.freelists[index].free(page.start(), page.size()) };
        self.capacity[index] += page.size();
        log::trace!("old space: new {:?} page at 0x{:x}", kind, page.start());
        self.pages.push(page);
        Some(())
    }

    fn allocate_large(
        &mut self,
        size: usize,
        kind: PageType,
        growth: GrowthPolicy,
    ) -> Option<usize> {
        let mapped = size.div_ceil(OS_PAGE_SIZE) * OS_PAGE_SIZE;
        if !self.may_grow(mapped, kind, growth) {
            return None;
        }
        let memory = system::map_aligned(mapped, self.page_size)?;
        let page = Page { memory, size: mapped, kind, is_large: true };
        let index = kind.index();
        self.capacity[index] += mapped;
        self.used[index] += size;
        let addr = page.start();
        log::trace!("old space: large {:?} page of {} bytes at 0x{:x}", kind, mapped, addr);
        self.large_pages.push(page);
        Some(addr)
    }

    // ── Sweeping ──────────────────────────────────────────────────────

    /// Rebuilds the free lists from mark bits, clearing marks of survivors.
    /// Returns the bytes still in use.
    pub fn sweep(&mut self, size_fn: SizeFn) -> usize {
        for list in &mut self.freelists {
            list.reset();
        }
        self.used = [0; 2];

        let pages = std::mem::take(&mut self.pages);
        let mut kept = Vec::with_capacity(pages.len());
        for page in pages {
            let index = page.kind.index();
            let (live, whole_page_free) =
                unsafe { sweep_page(&page, size_fn, &mut self.freelists[index]) };
            if whole_page_free && self.pages_of_kind(&kept, page.kind) > 0 {
                self.drop_page_from_freelist(&page);
                self.capacity[index] -= page.size();
                page.release();
                continue;
            }
            self.used[index] += live;
            kept.push(page);
        }
        self.pages = kept;

        let large = std::mem::take(&mut self.large_pages);
        for page in large {
            let index = page.kind.index();
            let header = unsafe { Header::from_addr(page.start()) };
            if header.is_marked() {
                header.clear_mark();
                self.used[index] += unsafe { size_fn(page.start() as *const u8) };
                self.large_pages.push(page);
            } else {
                self.capacity[index] -= page.size();
                page.release();
            }
        }
        self.total_used()
    }

    fn pages_of_kind(&self, pages: &[Page], kind: PageType) -> usize {
        pages.iter().filter(|p| p.kind == kind).count()
    }

    /// Removes the single free block covering `page` from its list.
    fn drop_page_from_freelist(&mut self, page: &Page) {
        let index = page.kind.index();
        let mut blocks = Vec::new();
        self.freelists[index].for_each_block(|addr, size| {
            if !page.contains(addr) {
                blocks.push((addr, size));
            }
        });
        let list = &mut self.freelists[index];
        list.reset();
        for (addr, size) in blocks.into_iter().rev() {
            unsafe { list.free(addr, size) };
        }
    }

    // ── Iteration ─────────────────────────────────────────────────────

    /// Visits every live object (free blocks skipped) of the given kinds.
    pub fn visit_objects(
        &self,
        size_fn: SizeFn,
        kinds: &[PageType],
        f: &mut dyn FnMut(usize),
    ) {
        for page in self.pages.iter().chain(self.large_pages.iter()) {
            if !kinds.contains(&page.kind) {
                continue;
            }
            unsafe {
                page.visit_objects(size_fn, |addr, _| {
                    if Header::from_addr(addr).class_id() != cid::FREE_LIST_ELEMENT {
                        f(addr);
                    }
                });
            }
        }
    }

    pub fn write_protect(&mut self, read_only: bool) {
        self.read_only = read_only;
        for page in self.pages.iter().chain(self.large_pages.iter()) {
            page.protect(read_only);
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    // ── Peers ─────────────────────────────────────────────────────────

    pub fn prune_peers(&mut self) {
        self.peers.retain(|&addr, _| unsafe { Header::from_addr(addr).is_marked() });
    }
}

impl Drop for PageSpace {
    fn drop(&mut self) {
        if self.read_only {
            self.write_protect(false);
        }
        for page in self.pages.drain(..).chain(self.large_pages.drain(..)) {
            page.release();
        }
    }
}

/// Sweeps one regular page. Returns the live bytes and whether the page
/// turned into a single free block.
///
/// # Safety
///
/// The page must be walkable.
unsafe fn sweep_page(page: &Page, size_fn: SizeFn, list: &mut FreeList) -> (usize, bool) {
    let mut live = 0usize;
    let mut free_start = 0usize;
    let mut addr = page.start();
    let end = page.end();
    while addr < end {
        let header = unsafe { Header::from_addr(addr) };
        let size = unsafe { size_fn(addr as *const u8) };
        let is_free = header.class_id() == cid::FREE_LIST_ELEMENT;
        if !is_free && header.is_marked() {
            header.clear_mark();
            live += size;
            if free_start != 0 {
                unsafe { list.free(free_start, addr - free_start) };
                free_start = 0;
            }
        } else if free_start == 0 {
            free_start = addr;
        }
        addr += size;
    }
    if free_start == page.start() {
        unsafe { list.free(free_start, end - free_start) };
        return (0, true);
    }
    if free_start != 0 {
        unsafe { list.free(free_start, end - free_start) };
    }
    (live, false)
}

const _: () = assert!(FreeListElement::MIN_SIZE == OBJECT_ALIGNMENT);
