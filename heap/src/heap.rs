//! Generational heap.
//!
//! A young semispace collected by copying, and an old paged space collected
//! by mark-sweep. Old objects that point into the young generation are kept
//! in a store buffer maintained by the write barrier.
//!
//! This crate is decoupled from any specific runtime. Consumers provide:
//! - A [`TraceFn`] to enumerate Value edges of heap objects.
//! - A [`SizeFn`] to compute an object's size from its header and layout.
//! - A [`RootProvider`] to supply strong and weak roots at GC time.

use std::{
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use object::{Header, HeaderFlags, OBJECT_ALIGNMENT, Value, cid, needs_no_barrier};
use rustc_hash::FxHashSet;

use crate::marker::Marker;
use crate::pages::{PageSpace, PageSpaceController, PageType};
use crate::scavenger::{ScavengeContext, ScavengeStats, Scavenger};
use crate::store_buffer::StoreBuffer;
use crate::system::OS_PAGE_SIZE;

// ── Public API types ──────────────────────────────────────────────────

/// Function that traces all Value edges of a heap object.
///
/// Given a pointer to a heap object (whose first bytes are an [`object::Header`]),
/// the function must call `visitor` for every [`Value`] field that may be a heap
/// reference. The visitor may rewrite the Value in place.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object with a valid [`Header`].
pub type TraceFn = unsafe fn(obj: *const u8, visitor: &mut dyn FnMut(&mut Value));

/// Function that returns the size in bytes of a heap object.
///
/// # Safety
///
/// `obj` must point to a valid heap object with an unforwarded header.
pub type SizeFn = unsafe fn(obj: *const u8) -> usize;

/// Liveness queries handed to weak reference sets during a collection.
pub trait WeakSetVisitor {
    /// Whether `value` is known to survive the current collection.
    fn is_alive(&self, value: Value) -> bool;
    /// Keeps `slot`'s referent alive, updating the slot if it moves.
    fn mark_live(&mut self, slot: &mut Value);
}

/// Consumers implement this to provide GC roots.
///
/// Called from inside a collection. Strong roots receive `&mut Value` so the
/// scavenger can update them in place.
pub trait RootProvider {
    /// Visits every strong root. When `include_prologue_weak` is true,
    /// prologue weak handles are reported here as strong roots.
    fn visit_roots(&mut self, include_prologue_weak: bool, visitor: &mut dyn FnMut(&mut Value));

    /// Visits weak roots. The visitor returns `false` for a dead referent;
    /// the provider then clears the root and schedules its finalizer.
    /// When `include_prologue_weak` is true, prologue weak handles are
    /// treated as weak.
    fn visit_weak_roots(
        &mut self,
        include_prologue_weak: bool,
        visitor: &mut dyn FnMut(&mut Value) -> bool,
    ) {
        let _ = (include_prologue_weak, visitor);
    }

    /// Keeps the values of every weak reference set whose keys are alive.
    /// Returns `true` if any value was newly kept alive.
    fn visit_weak_reference_sets(&mut self, visitor: &mut dyn WeakSetVisitor) -> bool {
        let _ = visitor;
        false
    }

    /// Called before a collection that invokes API callbacks.
    fn gc_prologue(&mut self) {}

    /// Called after a collection that invokes API callbacks.
    fn gc_epilogue(&mut self) {}

    /// Called after every collection, once the heap is consistent again.
    fn gc_finished(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    New,
    Old,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    NewSpace,
    PromotionFailure,
    OldSpace,
    Full,
    GcAtAlloc,
    TestCase,
}

/// Whether a collection runs the embedder's prologue/epilogue callbacks.
/// Prologue weak handles are only weak during collections that do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiCallbacks {
    Ignore,
    Invoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPolicy {
    ControlGrowth,
    ForceGrowth,
    /// Ignores the capacity cap. Only a scavenge that must finish uses it.
    ExceedLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory { space: Space, requested: usize },
    InvalidSettings(&'static str),
}

impl core::fmt::Display for HeapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HeapError::OutOfMemory { space, requested } => {
                write!(f, "out of memory: {requested} bytes in {space:?} space")
            }
            HeapError::InvalidSettings(msg) => write!(f, "invalid heap settings: {msg}"),
        }
    }
}

impl std::error::Error for HeapError {}

// ── Heap settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Size of one young semispace. Must be a multiple of the OS page size.
    pub semi_space_size: usize,
    /// Maximum bytes of data pages.
    pub old_capacity: usize,
    /// Maximum bytes of executable pages.
    pub code_capacity: usize,
    /// Size and alignment of an old-space page. Power of two.
    pub page_size: usize,
    /// Percent of old space a collection must reclaim to deny growth.
    pub heap_growth_space_ratio: usize,
    /// Percent of wall time spent in GC above which growth is allowed.
    pub heap_growth_time_ratio: usize,
    /// Pages granted each time growth is allowed.
    pub heap_growth_rate: usize,
    /// Owners per store buffer block.
    pub store_buffer_block_size: usize,
    pub verbose_gc: bool,
    pub verify_before_gc: bool,
    pub verify_after_gc: bool,
    /// Collect before every allocation that may collect.
    pub gc_at_alloc: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            semi_space_size: 2 * 1024 * 1024,    // 2 MB
            old_capacity: 512 * 1024 * 1024,    // 512 MB
            code_capacity: 64 * 1024 * 1024,    // 64 MB
            page_size: 256 * 1024,              // 256 KB = 2^18
            heap_growth_space_ratio: 10,        // 10%
            heap_growth_time_ratio: 3,          // 3%
            heap_growth_rate: 4,                // pages
            store_buffer_block_size: 1024,
            verbose_gc: false,
            verify_before_gc: false,
            verify_after_gc: false,
            gc_at_alloc: false,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.semi_space_size == 0 || self.page_size == 0 {
            return Err("Sizes must be > 0");
        }
        if self.semi_space_size % OS_PAGE_SIZE != 0 {
            return Err("semi_space_size must match OS page alignment");
        }
        if !self.page_size.is_power_of_two() || self.page_size < OS_PAGE_SIZE {
            return Err("page_size must be a power of two of at least one OS page");
        }
        if self.old_capacity < self.page_size || self.code_capacity < self.page_size {
            return Err("capacities must hold at least one page");
        }
        if self.heap_growth_space_ratio > 100 || self.heap_growth_time_ratio > 100 {
            return Err("growth ratios are percentages");
        }
        if self.store_buffer_block_size == 0 {
            return Err("store_buffer_block_size must be > 0");
        }
        Ok(())
    }
}

// ── Statistics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    pub new_used: usize,
    pub old_used: usize,
    pub code_used: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct GcStats {
    pub reason: GcReason,
    pub space: Space,
    pub duration: Duration,
    pub before: SpaceUsage,
    pub after: SpaceUsage,
    pub scavenge: Option<ScavengeStats>,
}

// ── Scopes ────────────────────────────────────────────────────────────

/// While alive, allocation that may collect is a bug (checked in debug builds).
#[must_use]
pub struct NoGcScope {
    depth: Arc<AtomicUsize>,
}

impl Drop for NoGcScope {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Lets old space grow without consulting the growth controller.
#[must_use]
pub struct NoGrowthControlScope {
    enabled: Arc<AtomicBool>,
    previous: bool,
}

impl Drop for NoGrowthControlScope {
    fn drop(&mut self) {
        self.enabled.store(self.previous, Ordering::Relaxed);
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

pub struct Heap {
    settings: HeapSettings,
    new_space: Scavenger,
    old_space: PageSpace,
    store_buffer: StoreBuffer,
    trace_fn: TraceFn,
    size_fn: SizeFn,
    null_value: Value,
    no_gc_depth: Arc<AtomicUsize>,
    gc_in_progress: bool,
    last_gc: Option<GcStats>,
    scavenge_count: usize,
    mark_sweep_count: usize,
    last_mark_sweep_end: Instant,
}

// SAFETY: the heap owns its mappings; it is only used by one thread at a
// time (the thread that has entered the owning isolate).
unsafe impl Send for Heap {}

impl Heap {
    pub fn new(settings: HeapSettings, trace_fn: TraceFn, size_fn: SizeFn) -> Result<Self, HeapError> {
        settings.validate().map_err(HeapError::InvalidSettings)?;
        let new_space = Scavenger::new(settings.semi_space_size).ok_or(HeapError::OutOfMemory {
            space: Space::New,
            requested: settings.semi_space_size * 2,
        })?;
        let controller = PageSpaceController::new(
            settings.heap_growth_space_ratio,
            settings.heap_growth_time_ratio,
            settings.heap_growth_rate,
        );
        let old_space = PageSpace::new(
            settings.page_size,
            settings.old_capacity,
            settings.code_capacity,
            controller,
        );
        Ok(Self {
            store_buffer: StoreBuffer::new(settings.store_buffer_block_size),
            settings,
            new_space,
            old_space,
            trace_fn,
            size_fn,
            null_value: Value::from_i64(0),
            no_gc_depth: Arc::new(AtomicUsize::new(0)),
            gc_in_progress: false,
            last_gc: None,
            scavenge_count: 0,
            mark_sweep_count: 0,
            last_mark_sweep_end: Instant::now(),
        })
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    /// The value written into cleared weak properties.
    pub fn set_null_value(&mut self, null: Value) {
        self.null_value = null;
    }

    pub fn null_value(&self) -> Value {
        self.null_value
    }

    pub fn trace_fn(&self) -> TraceFn {
        self.trace_fn
    }

    pub fn size_fn(&self) -> SizeFn {
        self.size_fn
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Objects at least this big skip the young generation.
    #[inline(always)]
    fn too_large_for_new_space(&self, size: usize) -> bool {
        size >= self.settings.semi_space_size / 4
    }

    /// Allocates without collecting. The memory is uninitialized.
    pub fn try_allocate(&mut self, size: usize, space: Space) -> Option<NonNull<u8>> {
        debug_assert!(size > 0 && size % OBJECT_ALIGNMENT == 0);
        let addr = match space {
            Space::New => self.new_space.try_allocate(size),
            Space::Old => self.old_space.try_allocate(size, PageType::Data, GrowthPolicy::ControlGrowth),
            Space::Code => {
                self.old_space.try_allocate(size, PageType::Executable, GrowthPolicy::ControlGrowth)
            }
        }?;
        NonNull::new(addr as *mut u8)
    }

    /// Allocates `size` bytes, collecting and growing as needed.
    ///
    /// Young allocation falls back to a scavenge and then to old space. Old
    /// allocation falls back to mark-sweep and then to forced growth.
    pub fn allocate(
        &mut self,
        size: usize,
        space: Space,
        roots: &mut dyn RootProvider,
    ) -> Result<NonNull<u8>, HeapError> {
        debug_assert!(size > 0 && size % OBJECT_ALIGNMENT == 0);
        debug_assert_eq!(
            self.no_gc_depth.load(Ordering::Relaxed),
            0,
            "allocation inside a NoGcScope"
        );
        debug_assert!(!self.gc_in_progress, "allocation during GC");

        if space == Space::New && !self.too_large_for_new_space(size) {
            if self.settings.gc_at_alloc {
                self.collect_garbage_with(Space::New, GcReason::GcAtAlloc, ApiCallbacks::Ignore, roots);
            }
            if let Some(addr) = self.new_space.try_allocate(size) {
                return Ok(non_null(addr));
            }
            self.collect_garbage_with(Space::New, GcReason::NewSpace, ApiCallbacks::Ignore, roots);
            if self.old_space_exhausted() {
                log::error!("out of memory: old space exhausted by scavenge");
                return Err(HeapError::OutOfMemory { space: Space::Old, requested: size });
            }
            if let Some(addr) = self.new_space.try_allocate(size) {
                return Ok(non_null(addr));
            }
            return self.allocate_old(size, PageType::Data, roots);
        }

        let kind = if space == Space::Code { PageType::Executable } else { PageType::Data };
        if self.settings.gc_at_alloc {
            self.collect_garbage_with(Space::Old, GcReason::GcAtAlloc, ApiCallbacks::Ignore, roots);
        }
        self.allocate_old(size, kind, roots)
    }

    fn allocate_old(
        &mut self,
        size: usize,
        kind: PageType,
        roots: &mut dyn RootProvider,
    ) -> Result<NonNull<u8>, HeapError> {
        if let Some(addr) = self.old_space.try_allocate(size, kind, GrowthPolicy::ControlGrowth) {
            return Ok(non_null(addr));
        }
        self.collect_garbage_with(Space::Old, GcReason::OldSpace, ApiCallbacks::Ignore, roots);
        if let Some(addr) = self.old_space.try_allocate(size, kind, GrowthPolicy::ControlGrowth) {
            return Ok(non_null(addr));
        }
        if let Some(addr) = self.old_space.try_allocate(size, kind, GrowthPolicy::ForceGrowth) {
            return Ok(non_null(addr));
        }
        let space = if kind == PageType::Executable { Space::Code } else { Space::Old };
        log::error!("out of memory: {} bytes in {:?} space", size, space);
        Err(HeapError::OutOfMemory { space, requested: size })
    }

    // ── Write barrier ─────────────────────────────────────────────────

    /// Generational write barrier.
    ///
    /// Call after storing `value` into a slot of `owner`. Records `owner` in
    /// the store buffer the first time an old owner receives a young value.
    #[inline(always)]
    pub fn write_barrier(&mut self, owner: Value, value: Value) {
        if value.is_smi() || needs_no_barrier(owner, value) {
            return;
        }
        let header = unsafe { owner.header() };
        // Fast path: already recorded.
        if header.is_remembered() {
            return;
        }
        let prev = header.fetch_or_flags(HeaderFlags::REMEMBERED);
        if !prev.contains(HeaderFlags::REMEMBERED) {
            self.record_store_buffer(owner);
        }
    }

    #[cold]
    fn record_store_buffer(&mut self, owner: Value) {
        self.store_buffer.add(owner);
    }

    /// Stores `value` into `slot` of `owner` and applies the barrier.
    ///
    /// # Safety
    ///
    /// `slot` must be a tagged slot inside `owner`.
    #[inline(always)]
    pub unsafe fn store(&mut self, owner: Value, slot: *mut Value, value: Value) {
        unsafe { *slot = value };
        self.write_barrier(owner, value);
    }

    pub fn store_buffer(&self) -> &StoreBuffer {
        &self.store_buffer
    }

    // ── Collection ────────────────────────────────────────────────────

    pub fn collect_garbage(&mut self, space: Space, roots: &mut dyn RootProvider) {
        let reason = match space {
            Space::New => GcReason::NewSpace,
            Space::Old | Space::Code => GcReason::OldSpace,
        };
        self.collect_garbage_with(space, reason, ApiCallbacks::Ignore, roots);
    }

    /// Scavenges, then mark-sweeps old space, running API callbacks.
    pub fn collect_all_garbage(&mut self, roots: &mut dyn RootProvider) {
        self.collect_garbage_with(Space::New, GcReason::Full, ApiCallbacks::Invoke, roots);
        self.collect_garbage_with(Space::Old, GcReason::Full, ApiCallbacks::Invoke, roots);
    }

    pub fn collect_garbage_with(
        &mut self,
        space: Space,
        reason: GcReason,
        callbacks: ApiCallbacks,
        roots: &mut dyn RootProvider,
    ) {
        debug_assert!(!self.gc_in_progress, "recursive GC");
        debug_assert!(!self.old_space.is_read_only(), "GC of a write-protected heap");
        let invoke = callbacks == ApiCallbacks::Invoke;
        let start = Instant::now();
        let before = self.usage();
        if self.settings.verify_before_gc {
            assert!(self.verify(), "heap verification failed before GC");
        }
        if invoke {
            roots.gc_prologue();
        }
        self.gc_in_progress = true;
        log::debug!("gc start: {:?} ({:?})", space, reason);

        let scavenge = match space {
            Space::New => {
                // Every young byte may be promoted.
                if self.old_space.headroom(PageType::Data) < self.new_space.used() {
                    log::debug!("old space headroom below young usage, mark-sweeping first");
                    self.mark_sweep(invoke, roots, start);
                }
                Some(self.scavenge(invoke, roots))
            }
            Space::Old | Space::Code => {
                self.mark_sweep(invoke, roots, start);
                None
            }
        };

        self.gc_in_progress = false;
        if self.settings.verify_after_gc {
            assert!(self.verify(), "heap verification failed after GC");
        }
        if invoke {
            roots.gc_epilogue();
        }
        roots.gc_finished();

        let mut reason = reason;
        if scavenge.is_some_and(|s| s.promotion_failure) && reason == GcReason::NewSpace {
            reason = GcReason::PromotionFailure;
        }
        let stats = GcStats {
            reason,
            space,
            duration: start.elapsed(),
            before,
            after: self.usage(),
            scavenge,
        };
        log::debug!("gc end: {:?} in {:?}", space, stats.duration);
        if self.settings.verbose_gc {
            log::info!(
                "[gc] {:?} {:?}: new {}K->{}K, old {}K->{}K, code {}K->{}K, {:.3}ms",
                stats.space,
                stats.reason,
                before.new_used / 1024,
                stats.after.new_used / 1024,
                before.old_used / 1024,
                stats.after.old_used / 1024,
                before.code_used / 1024,
                stats.after.code_used / 1024,
                stats.duration.as_secs_f64() * 1000.0
            );
        }
        self.last_gc = Some(stats);
    }

    fn scavenge(&mut self, invoke: bool, roots: &mut dyn RootProvider) -> ScavengeStats {
        self.scavenge_count += 1;
        self.new_space.scavenge(ScavengeContext {
            old_space: &mut self.old_space,
            store_buffer: &mut self.store_buffer,
            roots,
            trace_fn: self.trace_fn,
            size_fn: self.size_fn,
            invoke_callbacks: invoke,
            null_value: self.null_value,
        })
    }

    fn mark_sweep(&mut self, invoke: bool, roots: &mut dyn RootProvider, start: Instant) {
        self.mark_sweep_count += 1;
        let used_before = self.old_space.total_used();
        let mut marker = Marker::new(&self.old_space, self.trace_fn, self.size_fn);
        marker.mark(roots, &self.new_space, invoke, self.null_value);
        log::trace!("marked {} bytes", marker.marked_bytes());
        drop(marker);

        self.store_buffer.retain(|owner| unsafe { owner.header() }.is_marked());
        self.old_space.prune_peers();
        let used_after = self.old_space.sweep(self.size_fn);

        let gc_time = start.elapsed();
        let wall_time = self.last_mark_sweep_end.elapsed();
        self.old_space.controller.evaluate(used_before, used_after, gc_time, wall_time);
        self.last_mark_sweep_end = Instant::now();
    }

    /// True when the last scavenge could not promote within the old-space
    /// cap, or old space is still mapped past it.
    pub fn old_space_exhausted(&self) -> bool {
        self.old_space.exceeds_limit(PageType::Data)
            || self
                .last_gc
                .as_ref()
                .and_then(|gc| gc.scavenge)
                .is_some_and(|s| s.old_space_exhausted)
    }

    pub fn gc_in_progress(&self) -> bool {
        self.gc_in_progress
    }

    pub fn last_gc(&self) -> Option<&GcStats> {
        self.last_gc.as_ref()
    }

    pub fn scavenge_count(&self) -> usize {
        self.scavenge_count
    }

    pub fn mark_sweep_count(&self) -> usize {
        self.mark_sweep_count
    }

    // ── Scopes ────────────────────────────────────────────────────────

    pub fn no_gc_scope(&self) -> NoGcScope {
        self.no_gc_depth.fetch_add(1, Ordering::Relaxed);
        NoGcScope { depth: self.no_gc_depth.clone() }
    }

    pub fn no_growth_control_scope(&self) -> NoGrowthControlScope {
        let enabled = self.old_space.controller.enabled_flag();
        let previous = enabled.swap(false, Ordering::Relaxed);
        NoGrowthControlScope { enabled, previous }
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn new_contains(&self, addr: usize) -> bool {
        self.new_space.contains(addr)
    }

    pub fn old_contains(&self, addr: usize) -> bool {
        self.old_space.contains_kind(addr, PageType::Data)
    }

    pub fn code_contains(&self, addr: usize) -> bool {
        self.old_space.contains_kind(addr, PageType::Executable)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.new_contains(addr) || self.old_space.contains(addr)
    }

    pub fn used(&self, space: Space) -> usize {
        match space {
            Space::New => self.new_space.used(),
            Space::Old => self.old_space.used(PageType::Data),
            Space::Code => self.old_space.used(PageType::Executable),
        }
    }

    pub fn capacity(&self, space: Space) -> usize {
        match space {
            Space::New => self.new_space.capacity(),
            Space::Old => self.old_space.capacity(PageType::Data),
            Space::Code => self.old_space.capacity(PageType::Executable),
        }
    }

    fn usage(&self) -> SpaceUsage {
        SpaceUsage {
            new_used: self.used(Space::New),
            old_used: self.used(Space::Old),
            code_used: self.used(Space::Code),
        }
    }

    pub fn print_sizes(&self) {
        log::info!(
            "new space {}K/{}K, old space {}K/{}K, code space {}K/{}K",
            self.used(Space::New) / 1024,
            self.capacity(Space::New) / 1024,
            self.used(Space::Old) / 1024,
            self.capacity(Space::Old) / 1024,
            self.used(Space::Code) / 1024,
            self.capacity(Space::Code) / 1024
        );
    }

    /// Visits every object in the heap, free blocks excluded.
    pub fn iterate_objects(&self, visitor: &mut dyn FnMut(Value)) {
        self.new_space.visit_objects(self.size_fn, &mut |addr| visitor(Value::from_addr(addr)));
        self.old_space.visit_objects(
            self.size_fn,
            &[PageType::Data, PageType::Executable],
            &mut |addr| visitor(Value::from_addr(addr)),
        );
    }

    pub fn find_object_in_code_space(&self, predicate: &mut dyn FnMut(Value) -> bool) -> Option<Value> {
        let mut found = None;
        self.old_space.visit_objects(self.size_fn, &[PageType::Executable], &mut |addr| {
            let value = Value::from_addr(addr);
            if found.is_none() && predicate(value) {
                found = Some(value);
            }
        });
        found
    }

    // ── Peers ─────────────────────────────────────────────────────────

    /// Associates an embedder word with `obj`. A zero peer removes it.
    pub fn set_peer(&mut self, obj: Value, peer: usize) {
        debug_assert!(obj.is_heap_object());
        let table = if obj.is_new_object() {
            &mut self.new_space.peers
        } else {
            &mut self.old_space.peers
        };
        if peer == 0 {
            table.remove(&obj.addr());
        } else {
            table.insert(obj.addr(), peer);
        }
    }

    pub fn peer(&self, obj: Value) -> Option<usize> {
        let table = if obj.is_new_object() { &self.new_space.peers } else { &self.old_space.peers };
        table.get(&obj.addr()).copied()
    }

    pub fn peer_count(&self) -> usize {
        self.new_space.peers.len() + self.old_space.peers.len()
    }

    // ── Protection ────────────────────────────────────────────────────

    pub fn write_protect(&mut self, read_only: bool) {
        self.new_space.write_protect(read_only);
        self.old_space.write_protect(read_only);
    }

    pub fn is_read_only(&self) -> bool {
        self.old_space.is_read_only()
    }

    // ── Verification ──────────────────────────────────────────────────

    /// Checks that young pointers lead to live to-space objects and that
    /// every old object holding a young pointer is in the store buffer.
    pub fn verify(&self) -> bool {
        let remembered: FxHashSet<Value> = self.store_buffer.iter().collect();
        let mut ok = true;
        let trace = self.trace_fn;
        let new_space = &self.new_space;
        let check_slot = |slot: &mut Value, ok: &mut bool| {
            let value = *slot;
            if !value.is_new_object() {
                return;
            }
            let addr = value.addr();
            if !new_space.contains(addr) || addr >= new_space.top() {
                log::error!("verify: young pointer {:?} outside to-space", value);
                *ok = false;
                return;
            }
            let header = unsafe { Header::from_addr(addr) };
            if header.is_forwarded() || header.class_id() == cid::ILLEGAL {
                log::error!("verify: young pointer {:?} to a dead object", value);
                *ok = false;
            }
        };

        self.new_space.visit_objects(self.size_fn, &mut |addr| unsafe {
            trace(addr as *const u8, &mut |slot| check_slot(slot, &mut ok));
        });
        self.old_space.visit_objects(
            self.size_fn,
            &[PageType::Data, PageType::Executable],
            &mut |addr| {
                let mut points_young = false;
                unsafe {
                    trace(addr as *const u8, &mut |slot| {
                        points_young |= slot.is_new_object();
                        check_slot(slot, &mut ok);
                    });
                }
                let owner = Value::from_addr(addr);
                if points_young
                    && !(unsafe { owner.header() }.is_remembered() && remembered.contains(&owner))
                {
                    log::error!("verify: {:?} points young but is not remembered", owner);
                    ok = false;
                }
            },
        );
        ok
    }
}

#[inline(always)]
fn non_null(addr: usize) -> NonNull<u8> {
    debug_assert!(addr != 0);
    // SAFETY: every space hands out addresses inside live mappings
    unsafe { NonNull::new_unchecked(addr as *mut u8) }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Array, WeakProperty};

    unsafe fn test_trace(obj: *const u8, visitor: &mut dyn FnMut(&mut Value)) {
        unsafe { object::visit_pointers(obj, visitor) }
    }

    unsafe fn test_size(obj: *const u8) -> usize {
        unsafe { object::object_size(obj) }
    }

    /// A root provider holding strong and weak values.
    #[derive(Default)]
    struct TestRoots {
        roots: Vec<Value>,
        weak: Vec<Value>,
        dead: usize,
        prologue_calls: usize,
        epilogue_calls: usize,
    }

    impl RootProvider for TestRoots {
        fn visit_roots(&mut self, _include_prologue_weak: bool, visitor: &mut dyn FnMut(&mut Value)) {
            for root in &mut self.roots {
                visitor(root);
            }
        }

        fn visit_weak_roots(
            &mut self,
            _include_prologue_weak: bool,
            visitor: &mut dyn FnMut(&mut Value) -> bool,
        ) {
            for weak in &mut self.weak {
                if weak.is_heap_object() && !visitor(weak) {
                    *weak = Value::from_i64(0);
                    self.dead += 1;
                }
            }
        }

        fn gc_prologue(&mut self) {
            self.prologue_calls += 1;
        }

        fn gc_epilogue(&mut self) {
            self.epilogue_calls += 1;
        }
    }

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            semi_space_size: 64 * 1024,  // 64 KB
            old_capacity: 4 * 1024 * 1024,
            code_capacity: 1024 * 1024,
            page_size: 64 * 1024,
            verify_before_gc: true,
            verify_after_gc: true,
            ..HeapSettings::default()
        }
    }

    fn create_heap() -> Heap {
        let _ = env_logger::builder().is_test(true).try_init();
        Heap::new(create_test_settings(), test_trace, test_size).unwrap()
    }

    fn new_array(heap: &mut Heap, len: usize, space: Space, roots: &mut TestRoots) -> Value {
        try_new_array(heap, len, space, roots).unwrap()
    }

    fn try_new_array(heap: &mut Heap, len: usize, space: Space, roots: &mut TestRoots) -> Result<Value, HeapError> {
        let size = Array::allocation_size(len);
        let ptr = heap.allocate(size, space, roots)?;
        let addr = ptr.as_ptr() as usize;
        unsafe {
            Header::initialize(addr, cid::ARRAY, size);
            let array = &mut *(addr as *mut Array);
            array.type_arguments = Value::from_i64(0);
            array.length = Value::from_usize(len);
            for i in 0..len {
                array.set_at_raw(i, Value::from_i64(0));
            }
        }
        Ok(Value::from_addr(addr))
    }

    fn new_weak_property(heap: &mut Heap, key: Value, value: Value, space: Space, roots: &mut TestRoots) -> Value {
        let ptr = heap.allocate(WeakProperty::SIZE, space, roots).unwrap();
        let addr = ptr.as_ptr() as usize;
        unsafe {
            Header::initialize(addr, cid::WEAK_PROPERTY, WeakProperty::SIZE);
            let wp = &mut *(addr as *mut WeakProperty);
            wp.key = key;
            wp.value = value;
        }
        Value::from_addr(addr)
    }

    fn array_at(v: Value, i: usize) -> Value {
        unsafe { v.as_ref::<Array>() }.at(i)
    }

    fn array_store(heap: &mut Heap, owner: Value, i: usize, value: Value) {
        let slot = unsafe { owner.as_ref::<Array>() }.slot_addr(i);
        unsafe { heap.store(owner, slot, value) };
    }

    // ── Settings ──────────────────────────────────────────────────────

    #[test]
    fn default_settings_validate() {
        assert!(HeapSettings::default().validate().is_ok());
    }

    #[test]
    fn bad_settings_are_rejected() {
        let settings = HeapSettings { page_size: 3000, ..HeapSettings::default() };
        assert!(matches!(
            Heap::new(settings, test_trace, test_size),
            Err(HeapError::InvalidSettings(_))
        ));
    }

    // ── Allocation ────────────────────────────────────────────────────

    #[test]
    fn young_and_old_alignment() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let young = new_array(&mut heap, 2, Space::New, &mut roots);
        let old = new_array(&mut heap, 2, Space::Old, &mut roots);
        assert!(young.is_new_object());
        assert!(heap.new_contains(young.addr()));
        assert!(old.is_old_object());
        assert!(heap.old_contains(old.addr()));
        assert!(!heap.code_contains(old.addr()));
    }

    #[test]
    fn exact_fill_scavenges_on_next_allocation() {
        // Raw chunks carry no headers, so the heap cannot be walked.
        let settings = HeapSettings {
            verify_before_gc: false,
            verify_after_gc: false,
            ..create_test_settings()
        };
        let mut heap = Heap::new(settings, test_trace, test_size).unwrap();
        let mut roots = TestRoots::default();
        let capacity = heap.capacity(Space::New);
        let chunk = 1024;
        while heap.capacity(Space::New) - heap.used(Space::New) >= chunk {
            heap.allocate(chunk, Space::New, &mut roots).unwrap();
        }
        let rest = capacity - heap.used(Space::New);
        if rest > 0 {
            heap.allocate(rest, Space::New, &mut roots).unwrap();
        }
        assert_eq!(heap.used(Space::New), capacity);
        assert_eq!(heap.scavenge_count(), 0);
        heap.allocate(16, Space::New, &mut roots).unwrap();
        assert_eq!(heap.scavenge_count(), 1);
    }

    #[test]
    fn big_objects_skip_new_space() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let size = heap.settings().semi_space_size / 4;
        let ptr = heap.allocate(size, Space::New, &mut roots).unwrap();
        assert!(heap.old_contains(ptr.as_ptr() as usize));
    }

    #[test]
    fn code_space_is_separate() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let ptr = heap.allocate(64, Space::Code, &mut roots).unwrap();
        assert!(heap.code_contains(ptr.as_ptr() as usize));
        assert_eq!(heap.used(Space::Code), 64);
    }

    // ── Write barrier ─────────────────────────────────────────────────

    #[test]
    fn barrier_records_old_owner_once() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let owner = new_array(&mut heap, 2, Space::Old, &mut roots);
        let young = new_array(&mut heap, 1, Space::New, &mut roots);
        assert!(!unsafe { owner.header() }.is_remembered());

        array_store(&mut heap, owner, 0, young);
        array_store(&mut heap, owner, 1, young);
        assert!(unsafe { owner.header() }.is_remembered());
        assert_eq!(heap.store_buffer().count(owner), 1);
    }

    #[test]
    fn barrier_ignores_smis_and_young_owners() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let old = new_array(&mut heap, 1, Space::Old, &mut roots);
        let young = new_array(&mut heap, 1, Space::New, &mut roots);
        array_store(&mut heap, old, 0, Value::from_i64(5));
        array_store(&mut heap, young, 0, old);
        assert!(heap.store_buffer().is_empty());
    }

    // ── Scavenge ──────────────────────────────────────────────────────

    #[test]
    fn scavenge_updates_roots_and_frees_garbage() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let live = new_array(&mut heap, 1, Space::New, &mut roots);
        let _garbage = new_array(&mut heap, 8, Space::New, &mut roots);
        array_store(&mut heap, live, 0, Value::from_i64(99));
        roots.roots.push(live);

        heap.collect_garbage(Space::New, &mut roots);
        let moved = roots.roots[0];
        assert_ne!(moved, live);
        assert!(moved.is_new_object());
        assert_eq!(array_at(moved, 0), Value::from_i64(99));
        assert_eq!(heap.used(Space::New), Array::allocation_size(1));
    }

    #[test]
    fn second_scavenge_promotes_survivors() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let v = new_array(&mut heap, 1, Space::New, &mut roots);
        roots.roots.push(v);
        heap.collect_garbage(Space::New, &mut roots);
        assert!(roots.roots[0].is_new_object());
        heap.collect_garbage(Space::New, &mut roots);
        assert!(roots.roots[0].is_old_object());
        assert!(heap.old_contains(roots.roots[0].addr()));
    }

    #[test]
    fn old_to_young_pointer_survives_scavenge() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let a = new_array(&mut heap, 1, Space::Old, &mut roots);
        roots.roots.push(a);
        let v = new_array(&mut heap, 1, Space::New, &mut roots);
        array_store(&mut heap, v, 0, Value::from_i64(7));

        assert!(!heap.store_buffer().contains(a));
        array_store(&mut heap, a, 0, v);
        assert!(unsafe { a.header() }.is_remembered());
        assert_eq!(heap.store_buffer().count(a), 1);

        heap.collect_garbage(Space::New, &mut roots);
        let forwarded = array_at(a, 0);
        assert_ne!(forwarded, v);
        assert_eq!(array_at(forwarded, 0), Value::from_i64(7));
        // Still young, so the owner stays remembered exactly once.
        assert_eq!(heap.store_buffer().count(a), 1);

        heap.collect_garbage(Space::New, &mut roots);
        assert!(array_at(a, 0).is_old_object());
        assert!(!heap.store_buffer().contains(a));
        assert!(!unsafe { a.header() }.is_remembered());
    }

    #[test]
    fn promotion_failure_falls_through_to_old() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        // Fill new space with rooted objects so survivors cannot all fit
        // next to the ones already copied.
        let per = Array::allocation_size(100);
        let count = heap.capacity(Space::New) / per;
        for _ in 0..count {
            let v = new_array(&mut heap, 100, Space::New, &mut roots);
            roots.roots.push(v);
        }
        heap.collect_garbage(Space::New, &mut roots);
        for v in &roots.roots {
            assert_eq!(unsafe { v.header() }.class_id(), cid::ARRAY);
        }
        let young = roots.roots.iter().filter(|v| v.is_new_object()).count();
        assert_eq!(young, count);

        // Refill: survivors get promoted, new objects copied.
        for _ in 0..count {
            let v = new_array(&mut heap, 100, Space::New, &mut roots);
            roots.roots.push(v);
        }
        heap.collect_garbage(Space::New, &mut roots);
        for v in &roots.roots {
            assert_eq!(unsafe { v.header() }.class_id(), cid::ARRAY);
            assert!(heap.contains(v.addr()));
        }
    }

    #[test]
    fn exhausted_old_space_reports_out_of_memory() {
        let _ = env_logger::builder().is_test(true).try_init();
        let settings = HeapSettings { old_capacity: 64 * 1024, ..create_test_settings() };
        let mut heap = Heap::new(settings, test_trace, test_size).unwrap();
        let mut roots = TestRoots::default();
        let big = new_array(&mut heap, 7000, Space::Old, &mut roots);
        roots.roots.push(big);
        for _ in 0..20 {
            let v = new_array(&mut heap, 200, Space::New, &mut roots);
            roots.roots.push(v);
        }

        heap.collect_garbage(Space::New, &mut roots);
        assert!(!heap.old_space_exhausted());
        heap.collect_garbage(Space::New, &mut roots);
        assert!(heap.old_space_exhausted());
        assert!(heap.mark_sweep_count() >= 2);
        for v in &roots.roots[1..] {
            assert!(heap.contains(v.addr()));
            assert_eq!(unsafe { v.as_ref::<Array>() }.len(), 200);
        }
        assert_eq!(unsafe { roots.roots[0].as_ref::<Array>() }.len(), 7000);

        // Filling new space forces another scavenge that still cannot promote.
        let mut result = Ok(());
        for _ in 0..1000 {
            if let Err(err) = try_new_array(&mut heap, 100, Space::New, &mut roots) {
                result = Err(err);
                break;
            }
        }
        assert!(matches!(result, Err(HeapError::OutOfMemory { space: Space::Old, .. })));
    }

    #[test]
    fn weak_root_cleared_when_unreachable() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let strong = new_array(&mut heap, 1, Space::New, &mut roots);
        let weak = new_array(&mut heap, 1, Space::New, &mut roots);
        roots.roots.push(strong);
        roots.weak.push(weak);
        roots.weak.push(strong);
        heap.collect_garbage(Space::New, &mut roots);
        assert_eq!(roots.dead, 1);
        assert_eq!(roots.weak[0], Value::from_i64(0));
        assert_eq!(roots.weak[1], roots.roots[0]);
    }

    #[test]
    fn weak_property_cleared_when_key_dies() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let key = new_array(&mut heap, 1, Space::New, &mut roots);
        let value = new_array(&mut heap, 1, Space::New, &mut roots);
        let ptr = heap.allocate(WeakProperty::SIZE, Space::New, &mut roots).unwrap();
        let addr = ptr.as_ptr() as usize;
        unsafe {
            Header::initialize(addr, cid::WEAK_PROPERTY, WeakProperty::SIZE);
            let wp = &mut *(addr as *mut WeakProperty);
            wp.key = key;
            wp.value = value;
        }
        roots.roots.push(Value::from_addr(addr));
        heap.set_null_value(Value::from_i64(-1));
        heap.collect_garbage(Space::New, &mut roots);
        let wp = unsafe { roots.roots[0].as_ref::<WeakProperty>() };
        assert_eq!(wp.key, Value::from_i64(-1));
        assert_eq!(wp.value, Value::from_i64(-1));
    }

    #[test]
    fn weak_property_kept_while_key_lives() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let key = new_array(&mut heap, 1, Space::New, &mut roots);
        let value = new_array(&mut heap, 1, Space::New, &mut roots);
        array_store(&mut heap, value, 0, Value::from_i64(3));
        let ptr = heap.allocate(WeakProperty::SIZE, Space::New, &mut roots).unwrap();
        let addr = ptr.as_ptr() as usize;
        unsafe {
            Header::initialize(addr, cid::WEAK_PROPERTY, WeakProperty::SIZE);
            let wp = &mut *(addr as *mut WeakProperty);
            wp.key = key;
            wp.value = value;
        }
        roots.roots.push(Value::from_addr(addr));
        roots.roots.push(key);
        heap.collect_garbage(Space::New, &mut roots);
        let wp = unsafe { roots.roots[0].as_ref::<WeakProperty>() };
        assert_eq!(wp.key, roots.roots[1]);
        assert_eq!(array_at(wp.value, 0), Value::from_i64(3));
    }

    #[test]
    fn young_peers_follow_objects() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let live = new_array(&mut heap, 1, Space::New, &mut roots);
        let dead = new_array(&mut heap, 1, Space::New, &mut roots);
        roots.roots.push(live);
        heap.set_peer(live, 11);
        heap.set_peer(dead, 22);
        assert_eq!(heap.peer_count(), 2);
        heap.collect_garbage(Space::New, &mut roots);
        assert_eq!(heap.peer_count(), 1);
        assert_eq!(heap.peer(roots.roots[0]), Some(11));
        heap.collect_garbage(Space::New, &mut roots);
        assert!(roots.roots[0].is_old_object());
        assert_eq!(heap.peer(roots.roots[0]), Some(11));
    }

    // ── Mark-sweep ────────────────────────────────────────────────────

    #[test]
    fn mark_sweep_reclaims_unreachable_old_objects() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let live = new_array(&mut heap, 4, Space::Old, &mut roots);
        let child = new_array(&mut heap, 4, Space::Old, &mut roots);
        array_store(&mut heap, live, 0, child);
        let _dead = new_array(&mut heap, 4, Space::Old, &mut roots);
        roots.roots.push(live);
        let before = heap.used(Space::Old);
        heap.collect_garbage(Space::Old, &mut roots);
        assert_eq!(heap.used(Space::Old), before - Array::allocation_size(4));
        assert!(!unsafe { live.header() }.is_marked());
        assert_eq!(unsafe { child.header() }.class_id(), cid::ARRAY);
    }

    #[test]
    fn young_objects_keep_old_objects_alive() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let old = new_array(&mut heap, 1, Space::Old, &mut roots);
        let young = new_array(&mut heap, 1, Space::New, &mut roots);
        array_store(&mut heap, young, 0, old);
        heap.collect_garbage(Space::Old, &mut roots);
        assert_eq!(unsafe { old.header() }.class_id(), cid::ARRAY);
    }

    #[test]
    fn young_weak_property_does_not_keep_old_key_alive() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let key = new_array(&mut heap, 4, Space::Old, &mut roots);
        let value = new_array(&mut heap, 4, Space::Old, &mut roots);
        let wp = new_weak_property(&mut heap, key, value, Space::New, &mut roots);
        assert!(wp.is_new_object());
        heap.set_null_value(Value::from_i64(-1));
        let before = heap.used(Space::Old);

        heap.collect_garbage(Space::Old, &mut roots);
        let property = unsafe { wp.as_ref::<WeakProperty>() };
        assert_eq!(property.key, Value::from_i64(-1));
        assert_eq!(property.value, Value::from_i64(-1));
        assert_eq!(heap.used(Space::Old), before - 2 * Array::allocation_size(4));
    }

    #[test]
    fn young_weak_property_keeps_value_while_key_lives() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let key = new_array(&mut heap, 1, Space::Old, &mut roots);
        let value = new_array(&mut heap, 1, Space::Old, &mut roots);
        array_store(&mut heap, value, 0, Value::from_i64(8));
        roots.roots.push(key);
        let wp = new_weak_property(&mut heap, key, value, Space::New, &mut roots);

        heap.collect_garbage(Space::Old, &mut roots);
        let property = unsafe { wp.as_ref::<WeakProperty>() };
        assert_eq!(property.key, key);
        assert_eq!(property.value, value);
        assert_eq!(array_at(value, 0), Value::from_i64(8));
    }

    #[test]
    fn dead_owners_leave_the_store_buffer() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let owner = new_array(&mut heap, 1, Space::Old, &mut roots);
        let young = new_array(&mut heap, 1, Space::New, &mut roots);
        roots.roots.push(young);
        array_store(&mut heap, owner, 0, young);
        assert_eq!(heap.store_buffer().len(), 1);
        heap.collect_garbage(Space::Old, &mut roots);
        assert!(heap.store_buffer().is_empty());
    }

    #[test]
    fn full_gc_runs_callbacks_and_clears_weak_old() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let old = new_array(&mut heap, 1, Space::Old, &mut roots);
        roots.weak.push(old);
        heap.collect_all_garbage(&mut roots);
        assert_eq!(roots.prologue_calls, 2);
        assert_eq!(roots.epilogue_calls, 2);
        assert_eq!(roots.dead, 1);
        assert_eq!(heap.last_gc().map(|s| s.reason), Some(GcReason::Full));
    }

    #[test]
    fn old_peers_are_pruned() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let dead = new_array(&mut heap, 1, Space::Old, &mut roots);
        heap.set_peer(dead, 5);
        heap.collect_garbage(Space::Old, &mut roots);
        assert_eq!(heap.peer_count(), 0);
    }

    // ── Scopes and queries ────────────────────────────────────────────

    #[test]
    fn no_growth_control_scope_restores() {
        let heap = create_heap();
        {
            let _scope = heap.no_growth_control_scope();
            assert!(!heap.old_space.controller.is_enabled());
        }
        assert!(heap.old_space.controller.is_enabled());
    }

    #[test]
    fn no_gc_scope_counts_nesting() {
        let heap = create_heap();
        let a = heap.no_gc_scope();
        let b = heap.no_gc_scope();
        assert_eq!(heap.no_gc_depth.load(Ordering::Relaxed), 2);
        drop(b);
        drop(a);
        assert_eq!(heap.no_gc_depth.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn iterate_and_find_in_code_space() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        new_array(&mut heap, 1, Space::New, &mut roots);
        new_array(&mut heap, 1, Space::Old, &mut roots);
        let code = new_array(&mut heap, 3, Space::Code, &mut roots);
        let mut count = 0;
        heap.iterate_objects(&mut |_| count += 1);
        assert_eq!(count, 3);
        let found = heap.find_object_in_code_space(&mut |v| v == code);
        assert_eq!(found, Some(code));
    }

    #[test]
    fn verify_flags_unremembered_old_to_young() {
        let mut heap = create_heap();
        let mut roots = TestRoots::default();
        let owner = new_array(&mut heap, 1, Space::Old, &mut roots);
        let young = new_array(&mut heap, 1, Space::New, &mut roots);
        unsafe { owner.as_ref::<Array>() }.set_at_raw(0, young);
        assert!(!heap.verify());
        heap.write_barrier(owner, young);
        assert!(heap.verify());
    }
}
