use crate::header::Header;

pub const WORD_SIZE: usize = 8;

/// Every heap object starts on a 16-byte boundary plus a generation offset.
pub const OBJECT_ALIGNMENT: usize = 16;
pub const OBJECT_ALIGNMENT_MASK: usize = OBJECT_ALIGNMENT - 1;
/// Young objects live at `16n + 8`, old objects at `16n`.
pub const NEW_OBJECT_ALIGNMENT_OFFSET: usize = WORD_SIZE;
pub const OLD_OBJECT_ALIGNMENT_OFFSET: usize = 0;

const SMI_TAG_MASK: u64 = 0b1;
const SMI_TAG: u64 = 0b0;
const HEAP_OBJECT_TAG: u64 = 0b1;

pub const SMI_BITS: u32 = 62;
pub const SMI_MAX: i64 = (1i64 << SMI_BITS) - 1;
pub const SMI_MIN: i64 = -(1i64 << SMI_BITS);

#[inline(always)]
pub const fn round_up_to_alignment(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT_MASK) & !OBJECT_ALIGNMENT_MASK
}

/// A tagged 64-bit word.
///
/// Encoding:
/// - **Smi**:         `...XXXXX0`: 63-bit signed integer (low bit 0).
/// - **Heap object**: `...XXXXX1`: object address + 1.
///
/// Young objects are allocated at an address offset of one word from the
/// 16-byte alignment, so bit 3 of a tagged young pointer is set and bit 3 of
/// a tagged old pointer is clear.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // ── Smi ────────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_smi(self) -> bool {
        self.0 & SMI_TAG_MASK == SMI_TAG
    }

    #[inline(always)]
    pub const fn is_smi_range(n: i64) -> bool {
        n >= SMI_MIN && n <= SMI_MAX
    }

    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        debug_assert!(Self::is_smi_range(n), "smi overflow: {n}");
        Self((n << 1) as u64)
    }

    #[inline(always)]
    pub fn try_from_i64(n: i64) -> Option<Self> {
        if Self::is_smi_range(n) {
            Some(Self((n << 1) as u64))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn from_usize(n: usize) -> Self {
        Self::from_i64(n as i64)
    }

    /// Arithmetic shift of the word; meaningless unless `is_smi()`.
    #[inline(always)]
    pub const fn to_i64(self) -> i64 {
        (self.0 as i64) >> 1
    }

    #[inline(always)]
    pub const fn to_usize(self) -> usize {
        self.to_i64() as usize
    }

    // ── Heap object ────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_heap_object(self) -> bool {
        self.0 & SMI_TAG_MASK == HEAP_OBJECT_TAG
    }

    #[inline(always)]
    pub fn from_addr(addr: usize) -> Self {
        debug_assert!(addr & (WORD_SIZE - 1) == 0, "object not word aligned");
        Self(addr as u64 + HEAP_OBJECT_TAG)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::from_addr(ptr as usize)
    }

    #[inline(always)]
    pub const fn addr(self) -> usize {
        (self.0 - HEAP_OBJECT_TAG) as usize
    }

    #[inline(always)]
    pub const fn as_ptr<T>(self) -> *mut T {
        self.addr() as *mut T
    }

    #[inline(always)]
    pub const fn is_new_object(self) -> bool {
        self.is_heap_object()
            && (self.0 as usize & NEW_OBJECT_ALIGNMENT_OFFSET) != 0
    }

    #[inline(always)]
    pub const fn is_old_object(self) -> bool {
        self.is_heap_object()
            && (self.0 as usize & NEW_OBJECT_ALIGNMENT_OFFSET) == 0
    }

    /// # Safety
    ///
    /// The value must be a reference to a live heap object.
    #[inline(always)]
    pub unsafe fn header<'a>(self) -> &'a Header {
        debug_assert!(self.is_heap_object());
        unsafe { &*(self.addr() as *const Header) }
    }

    /// # Safety
    ///
    /// The value must be a reference to a valid, live `T`.
    #[inline(always)]
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        debug_assert!(self.is_heap_object());
        unsafe { &*(self.addr() as *const T) }
    }

    /// # Safety
    ///
    /// The value must be a reference to a valid, live `T`, and no other
    /// references to it may exist.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<'a, T>(self) -> &'a mut T {
        debug_assert!(self.is_heap_object());
        unsafe { &mut *(self.addr() as *mut T) }
    }
}

/// The barrier test: non-zero unless `value` is young and `owner` is old.
#[inline(always)]
pub const fn needs_no_barrier(owner: Value, value: Value) -> bool {
    ((!value.0 | owner.0) as usize & NEW_OBJECT_ALIGNMENT_OFFSET) != 0
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_smi() {
            write!(f, "Smi({})", self.to_i64())
        } else if self.is_new_object() {
            write!(f, "New(0x{:x})", self.addr())
        } else {
            write!(f, "Old(0x{:x})", self.addr())
        }
    }
}
