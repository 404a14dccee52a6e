//! Old-generation marking.
//!
//! Marks every old object reachable from the roots and from the young
//! generation. Young objects act as roots and are never marked. Objects
//! outside this heap's pages (the read-only VM heap) are treated as live and
//! never touched.

use object::{Header, Value, WeakProperty, cid};

use crate::pages::PageSpace;
use crate::scavenger::Scavenger;
use crate::{RootProvider, SizeFn, TraceFn, WeakSetVisitor};

pub(crate) struct Marker<'a> {
    old_space: &'a PageSpace,
    trace_fn: TraceFn,
    stack: Vec<usize>,
    delayed_weak: Vec<usize>,
    marked_bytes: usize,
    size_fn: SizeFn,
}

impl<'a> Marker<'a> {
    pub fn new(old_space: &'a PageSpace, trace_fn: TraceFn, size_fn: SizeFn) -> Self {
        Self {
            old_space,
            trace_fn,
            stack: Vec::new(),
            delayed_weak: Vec::new(),
            marked_bytes: 0,
            size_fn,
        }
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    #[inline]
    fn mark_value(&mut self, value: Value) {
        if !value.is_old_object() {
            return;
        }
        let addr = value.addr();
        if !self.old_space.contains(addr) {
            return;
        }
        let header = unsafe { Header::from_addr(addr) };
        if header.is_marked() {
            return;
        }
        header.set_mark();
        self.marked_bytes += unsafe { (self.size_fn)(addr as *const u8) };
        self.stack.push(addr);
    }

    fn is_live(&self, value: Value) -> bool {
        if !value.is_old_object() || !self.old_space.contains(value.addr()) {
            return true;
        }
        unsafe { value.header() }.is_marked()
    }

    fn trace(&mut self, obj: usize) {
        let trace = self.trace_fn;
        unsafe { trace(obj as *const u8, &mut |slot| self.mark_value(*slot)) };
    }

    /// Traces `obj`, delaying weak properties whose key is not marked yet.
    fn visit(&mut self, obj: usize) {
        let header = unsafe { Header::from_addr(obj) };
        if header.class_id() == cid::WEAK_PROPERTY {
            let key = unsafe { (*(obj as *const WeakProperty)).key };
            if !self.is_live(key) {
                self.delayed_weak.push(obj);
                return;
            }
        }
        self.trace(obj);
    }

    fn drain(&mut self) {
        while let Some(obj) = self.stack.pop() {
            self.visit(obj);
        }
    }

    fn process_delayed_weak_properties(&mut self) -> bool {
        let delayed = std::mem::take(&mut self.delayed_weak);
        let mut progress = false;
        for obj in delayed {
            let key = unsafe { (*(obj as *const WeakProperty)).key };
            if self.is_live(key) {
                self.trace(obj);
                progress = true;
            } else {
                self.delayed_weak.push(obj);
            }
        }
        progress
    }

    /// Runs a full marking pass.
    pub fn mark(
        &mut self,
        roots: &mut dyn RootProvider,
        new_space: &Scavenger,
        invoke_callbacks: bool,
        null_value: Value,
    ) {
        roots.visit_roots(!invoke_callbacks, &mut |slot| self.mark_value(*slot));
        let size_fn = self.size_fn;
        new_space.visit_objects(size_fn, &mut |obj| self.visit(obj));

        loop {
            self.drain();
            let mut progress = self.process_delayed_weak_properties();
            if roots.visit_weak_reference_sets(self) {
                progress = true;
            }
            if !progress {
                break;
            }
        }
        self.drain();

        for obj in self.delayed_weak.drain(..) {
            let property = unsafe { &mut *(obj as *mut WeakProperty) };
            property.key = null_value;
            property.value = null_value;
        }

        let old_space = self.old_space;
        roots.visit_weak_roots(invoke_callbacks, &mut |slot| {
            let value = *slot;
            !value.is_old_object()
                || !old_space.contains(value.addr())
                || unsafe { value.header() }.is_marked()
        });
    }
}

impl WeakSetVisitor for Marker<'_> {
    fn is_alive(&self, value: Value) -> bool {
        self.is_live(value)
    }

    fn mark_live(&mut self, slot: &mut Value) {
        self.mark_value(*slot);
    }
}
