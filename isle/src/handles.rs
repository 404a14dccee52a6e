//! Handles: stable, GC-visible references held by native code.
//!
//! Local handles belong to the innermost handle scope and die with it.
//! Persistent handles live until deleted. Weak persistent handles do not
//! keep their referent alive; when it dies the handle reads as null and its
//! finalizer runs once with the handle's peer.
//!
//! A handle is an index plus a generation, so a handle that outlived its
//! scope or was deleted is detected instead of reading a reused slot.

use heap::WeakSetVisitor;
use object::Value;

use crate::error::ApiError;

pub type WeakHandleFinalizer = Box<dyn FnOnce(usize) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Local,
    Persistent,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    kind: HandleKind,
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn kind(self) -> HandleKind {
        self.kind
    }
}

/// A handle onto an error object, returned by failing API calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorHandle(pub Handle);

impl ErrorHandle {
    pub fn handle(self) -> Handle {
        self.0
    }
}

// ── Slot table ─────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Free-list backed table with generation-checked indices.
#[derive(Debug)]
pub(crate) struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> SlotTable<T> {
    pub fn insert(&mut self, value: T) -> (u32, u32) {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return (index, slot.generation);
        }
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ((self.slots.len() - 1) as u32, 0)
    }

    pub fn get(&self, index: u32, generation: u32) -> Option<&T> {
        let slot = self.slots.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(index);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|s| s.value.as_mut())
    }

    pub fn drain(&mut self) -> Vec<T> {
        let out = self.slots.iter_mut().filter_map(|s| s.value.take()).collect();
        self.slots.clear();
        self.free.clear();
        out
    }
}

// ── Weak entries ───────────────────────────────────────────────────

pub(crate) struct WeakEntry {
    pub value: Value,
    pub peer: usize,
    pub finalizer: Option<WeakHandleFinalizer>,
    /// Weak only during collections that run the API callbacks.
    pub prologue: bool,
}

/// Values kept alive for one collection while any key is alive.
#[derive(Debug, Default)]
pub(crate) struct WeakReferenceSet {
    keys: Vec<Value>,
    values: Vec<Value>,
    kept: bool,
}

// ── API state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ScopeMark {
    locals: usize,
    buffers: usize,
}

/// Handle storage of one isolate.
pub(crate) struct ApiState {
    locals: Vec<(Value, u32)>,
    scopes: Vec<ScopeMark>,
    buffers: Vec<Box<[u8]>>,
    next_epoch: u32,
    persistent: SlotTable<Value>,
    weak: SlotTable<WeakEntry>,
    weak_sets: Vec<WeakReferenceSet>,
    pending_finalizers: Vec<(WeakHandleFinalizer, usize)>,
    null: Value,
}

impl ApiState {
    pub fn new(null: Value) -> Self {
        Self {
            locals: Vec::with_capacity(64),
            scopes: Vec::new(),
            buffers: Vec::new(),
            next_epoch: 1,
            persistent: SlotTable::default(),
            weak: SlotTable::default(),
            weak_sets: Vec::new(),
            pending_finalizers: Vec::new(),
            null,
        }
    }

    // ── Scopes ─────────────────────────────────────────────────────

    pub fn enter_scope(&mut self) {
        self.scopes.push(ScopeMark {
            locals: self.locals.len(),
            buffers: self.buffers.len(),
        });
    }

    pub fn exit_scope(&mut self) -> Result<(), ApiError> {
        let mark = self.scopes.pop().ok_or(ApiError::InvalidArgument("no handle scope to exit"))?;
        self.locals.truncate(mark.locals);
        self.buffers.truncate(mark.buffers);
        Ok(())
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Unwinds every scope entered after `depth`.
    pub fn unwind_scopes_to(&mut self, depth: usize) {
        while self.scopes.len() > depth {
            let _ = self.exit_scope();
        }
    }

    /// Zeroed bytes that live until the current scope exits.
    pub fn scope_allocate(&mut self, size: usize) -> &mut [u8] {
        self.buffers.push(vec![0u8; size].into_boxed_slice());
        let last = self.buffers.len() - 1;
        &mut self.buffers[last]
    }

    // ── Locals ─────────────────────────────────────────────────────

    pub fn new_local(&mut self, value: Value) -> Handle {
        let epoch = self.next_epoch;
        self.next_epoch = self.next_epoch.wrapping_add(1).max(1);
        self.locals.push((value, epoch));
        Handle {
            kind: HandleKind::Local,
            index: (self.locals.len() - 1) as u32,
            generation: epoch,
        }
    }

    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }

    // ── Persistent and weak ────────────────────────────────────────

    pub fn new_persistent(&mut self, value: Value) -> Handle {
        let (index, generation) = self.persistent.insert(value);
        Handle {
            kind: HandleKind::Persistent,
            index,
            generation,
        }
    }

    pub fn new_weak(
        &mut self,
        value: Value,
        peer: usize,
        finalizer: Option<WeakHandleFinalizer>,
        prologue: bool,
    ) -> Handle {
        let (index, generation) = self.weak.insert(WeakEntry {
            value,
            peer,
            finalizer,
            prologue,
        });
        Handle {
            kind: HandleKind::Weak,
            index,
            generation,
        }
    }

    pub fn delete(&mut self, handle: Handle) -> Result<(), ApiError> {
        let removed = match handle.kind {
            HandleKind::Persistent => self.persistent.remove(handle.index, handle.generation).is_some(),
            HandleKind::Weak => self.weak.remove(handle.index, handle.generation).is_some(),
            HandleKind::Local => false,
        };
        if removed {
            Ok(())
        } else {
            Err(ApiError::InvalidHandle)
        }
    }

    pub fn get(&self, handle: Handle) -> Result<Value, ApiError> {
        let value = match handle.kind {
            HandleKind::Local => self
                .locals
                .get(handle.index as usize)
                .filter(|(_, epoch)| *epoch == handle.generation)
                .map(|(v, _)| *v),
            HandleKind::Persistent => self.persistent.get(handle.index, handle.generation).copied(),
            HandleKind::Weak => self.weak.get(handle.index, handle.generation).map(|e| e.value),
        };
        value.ok_or(ApiError::InvalidHandle)
    }

    pub fn set(&mut self, handle: Handle, value: Value) -> Result<(), ApiError> {
        let slot = match handle.kind {
            HandleKind::Local => self
                .locals
                .get_mut(handle.index as usize)
                .filter(|(_, epoch)| *epoch == handle.generation)
                .map(|(v, _)| v),
            HandleKind::Persistent => self.persistent.get_mut(handle.index, handle.generation),
            HandleKind::Weak => self.weak.get_mut(handle.index, handle.generation).map(|e| &mut e.value),
        };
        let slot = slot.ok_or(ApiError::InvalidHandle)?;
        *slot = value;
        Ok(())
    }

    pub fn is_weak(&self, handle: Handle) -> bool {
        handle.kind == HandleKind::Weak && self.weak.get(handle.index, handle.generation).is_some()
    }

    pub fn is_prologue_weak(&self, handle: Handle) -> bool {
        handle.kind == HandleKind::Weak
            && self.weak.get(handle.index, handle.generation).is_some_and(|e| e.prologue)
    }

    pub fn weak_peer(&self, handle: Handle) -> Option<usize> {
        if handle.kind != HandleKind::Weak {
            return None;
        }
        self.weak.get(handle.index, handle.generation).map(|e| e.peer)
    }

    pub fn num_persistent(&self) -> usize {
        self.persistent.len()
    }

    pub fn num_weak(&self) -> usize {
        self.weak.len()
    }

    pub fn new_weak_reference_set(&mut self, keys: Vec<Value>, values: Vec<Value>) {
        self.weak_sets.push(WeakReferenceSet {
            keys,
            values,
            kept: false,
        });
    }

    pub fn num_weak_reference_sets(&self) -> usize {
        self.weak_sets.len()
    }

    // ── GC ─────────────────────────────────────────────────────────

    pub fn visit_strong(&mut self, include_prologue_weak: bool, visitor: &mut dyn FnMut(&mut Value)) {
        for (value, _) in &mut self.locals {
            visitor(value);
        }
        for value in self.persistent.iter_mut() {
            visitor(value);
        }
        if include_prologue_weak {
            for entry in self.weak.iter_mut().filter(|e| e.prologue) {
                visitor(&mut entry.value);
            }
        }
    }

    /// Clears weak handles whose referent died and queues their finalizers.
    pub fn visit_weak(&mut self, include_prologue_weak: bool, visitor: &mut dyn FnMut(&mut Value) -> bool) {
        let null = self.null;
        for entry in self.weak.iter_mut() {
            if entry.prologue && !include_prologue_weak {
                continue;
            }
            if entry.value == null || !entry.value.is_heap_object() {
                continue;
            }
            if !visitor(&mut entry.value) {
                entry.value = null;
                if let Some(finalizer) = entry.finalizer.take() {
                    self.pending_finalizers.push((finalizer, entry.peer));
                }
            }
        }
    }

    pub fn visit_weak_reference_sets(&mut self, visitor: &mut dyn WeakSetVisitor) -> bool {
        let mut changed = false;
        for set in &mut self.weak_sets {
            if set.kept || !set.keys.iter().any(|&k| visitor.is_alive(k)) {
                continue;
            }
            set.kept = true;
            changed = true;
            for value in &mut set.values {
                visitor.mark_live(value);
            }
        }
        changed
    }

    /// Sets only describe the collection they were registered for.
    pub fn clear_weak_reference_sets(&mut self) {
        self.weak_sets.clear();
    }

    pub fn run_pending_finalizers(&mut self) {
        for (finalizer, peer) in std::mem::take(&mut self.pending_finalizers) {
            finalizer(peer);
        }
    }

    /// Shutdown: every weak handle fires its finalizer.
    pub fn finalize_all_weak(&mut self) {
        for entry in self.weak.drain() {
            if let Some(finalizer) = entry.finalizer {
                finalizer(entry.peer);
            }
        }
        self.run_pending_finalizers();
    }
}
