use crate::Value;
use crate::class_id::{ClassId, cid};
use core::marker::PhantomData;

/// A typed tagged value.
///
/// The bits are those of a [`Value`]; `T` names the layout expected when the
/// value is a heap object. Dereferencing is unsafe: the caller guarantees the
/// value really points at a live `T`.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Tagged<T> {
    value: Value,
    _marker: PhantomData<*const T>,
}

impl<T> Tagged<T> {
    #[inline(always)]
    pub fn from_value(value: Value) -> Self {
        Self { value, _marker: PhantomData }
    }

    #[inline(always)]
    pub fn value(self) -> Value {
        self.value
    }

    #[inline(always)]
    pub fn is_smi(self) -> bool {
        self.value.is_smi()
    }

    #[inline(always)]
    pub fn is_heap_object(self) -> bool {
        self.value.is_heap_object()
    }

    /// Class id of the value; smis report [`cid::SMI`].
    ///
    /// # Safety
    ///
    /// A heap value must point to a live, unforwarded object.
    #[inline(always)]
    pub unsafe fn class_id(self) -> ClassId {
        if self.value.is_smi() {
            cid::SMI
        } else {
            unsafe { self.value.header().class_id() }
        }
    }

    // ── Smi helpers ────────────────────────────────────────────────

    /// # Safety
    ///
    /// The value must be a smi.
    #[inline(always)]
    pub unsafe fn as_i64(self) -> i64 {
        debug_assert!(self.value.is_smi());
        self.value.to_i64()
    }

    /// # Safety
    ///
    /// The value must be a non-negative smi.
    #[inline(always)]
    pub unsafe fn as_usize(self) -> usize {
        let n = self.value.to_i64();
        debug_assert!(n >= 0, "as_usize on negative smi: {n}");
        n as usize
    }

    // ── Reference helpers ──────────────────────────────────────────

    /// # Safety
    ///
    /// The value must be a reference to a valid, live `T`.
    #[inline(always)]
    pub unsafe fn as_ref(&self) -> &T {
        unsafe { self.value.as_ref() }
    }

    /// # Safety
    ///
    /// The value must be a reference to a valid, live `T`, and no other
    /// references to it may exist.
    #[inline(always)]
    pub unsafe fn as_mut(&mut self) -> &mut T {
        unsafe { self.value.as_mut() }
    }

    /// Reinterprets the value as a different layout.
    #[inline(always)]
    pub fn cast<U>(self) -> Tagged<U> {
        Tagged::from_value(self.value)
    }
}

impl<T> core::fmt::Debug for Tagged<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Tagged({:?})", self.value)
    }
}

impl<T> From<Value> for Tagged<T> {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

impl<T> From<Tagged<T>> for Value {
    fn from(handle: Tagged<T>) -> Self {
        handle.value
    }
}
