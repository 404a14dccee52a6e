use std::sync::atomic::{AtomicU64, Ordering};

use crate::class_id::{self, ClassId};
use crate::value::OBJECT_ALIGNMENT;

/// GC / bookkeeping bits stored in the header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeaderFlags(pub u64);

impl HeaderFlags {
    pub const NONE: Self = Self(0);
    pub const MARKED: Self = Self(1 << 2);
    pub const CANONICAL: Self = Self(1 << 3);
    pub const REMEMBERED: Self = Self(1 << 4);
    pub const FROM_SNAPSHOT: Self = Self(1 << 5);

    const ALL: u64 = Self::MARKED.0
        | Self::CANONICAL.0
        | Self::REMEMBERED.0
        | Self::FROM_SNAPSHOT.0;

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

const HEADER_TAG: u64 = 0b11;
const TAG_MASK: u64 = 0b11;
const FORWARDED_TAG: u64 = 0b01;

const SIZE_TAG_SHIFT: u32 = 8;
const SIZE_TAG_BITS: u32 = 8;
const SIZE_TAG_MASK: u64 = ((1u64 << SIZE_TAG_BITS) - 1) << SIZE_TAG_SHIFT;
const CLASS_ID_SHIFT: u32 = 16;
const CLASS_ID_MASK: u64 = 0xFFFF << CLASS_ID_SHIFT;
const INSTANCE_SIZE_SHIFT: u32 = 32;

/// Largest size the size tag can represent; bigger objects store 0.
pub const MAX_SIZE_TAG: usize = ((1 << SIZE_TAG_BITS) - 1) * OBJECT_ALIGNMENT;

/// The header word at the start of every heap object.
///
/// ```text
/// bits 0‥1:   tag = 0b11 (0b01 once the object has been forwarded)
/// bit  2:     marked
/// bit  3:     canonical
/// bit  4:     remembered
/// bit  5:     created from snapshot
/// bits 8‥15:  size in 16-byte units, 0 = "ask the layout"
/// bits 16‥31: class id
/// bits 32‥63: instance size in 16-byte units, only for user instances
///             whose size tag overflowed
/// ```
///
/// A forwarded object's header holds the tagged address of its copy.
#[repr(transparent)]
pub struct Header(AtomicU64);

const _: () = assert!(size_of::<Header>() == 8);

impl Header {
    #[inline(always)]
    pub const fn encode(class_id: ClassId, size: usize) -> u64 {
        let units = (size / OBJECT_ALIGNMENT) as u64;
        let (size_tag, instance_size) = if size <= MAX_SIZE_TAG {
            (units, 0)
        } else if class_id::is_user_cid(class_id) {
            (0, units)
        } else {
            (0, 0)
        };
        HEADER_TAG
            | (size_tag << SIZE_TAG_SHIFT)
            | ((class_id as u64) << CLASS_ID_SHIFT)
            | (instance_size << INSTANCE_SIZE_SHIFT)
    }

    pub fn new(class_id: ClassId, size: usize) -> Self {
        Self(AtomicU64::new(Self::encode(class_id, size)))
    }

    /// # Safety
    ///
    /// `addr` must be the start of a heap object.
    #[inline(always)]
    pub unsafe fn from_addr<'a>(addr: usize) -> &'a Header {
        unsafe { &*(addr as *const Header) }
    }

    /// Writes a fresh header at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point to writable memory of at least `size` bytes.
    #[inline(always)]
    pub unsafe fn initialize(addr: usize, class_id: ClassId, size: usize) {
        unsafe {
            (addr as *mut u64).write(Self::encode(class_id, size));
        }
    }

    #[inline(always)]
    pub fn raw(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_raw(&self, raw: u64) {
        self.0.store(raw, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn class_id(&self) -> ClassId {
        debug_assert!(!self.is_forwarded());
        ((self.raw() & CLASS_ID_MASK) >> CLASS_ID_SHIFT) as ClassId
    }

    /// Size in bytes from the size tag, or 0 for oversized objects.
    #[inline(always)]
    pub fn size_tag(&self) -> usize {
        (((self.raw() & SIZE_TAG_MASK) >> SIZE_TAG_SHIFT) as usize)
            * OBJECT_ALIGNMENT
    }

    /// Class instance size recorded for an oversized user instance, else 0.
    #[inline(always)]
    pub fn instance_size(&self) -> usize {
        ((self.raw() >> INSTANCE_SIZE_SHIFT) as usize) * OBJECT_ALIGNMENT
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags(self.raw() & HeaderFlags::ALL)
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: HeaderFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn add_flag(&self, flag: HeaderFlags) {
        self.0.fetch_or(flag.0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn remove_flag(&self, flag: HeaderFlags) {
        self.0.fetch_and(!flag.0, Ordering::Relaxed);
    }

    /// Atomically OR flags and return the *previous* flags value.
    #[inline(always)]
    pub fn fetch_or_flags(&self, flag: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.0.fetch_or(flag.0, Ordering::Relaxed) & HeaderFlags::ALL)
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.has_flag(HeaderFlags::MARKED)
    }

    #[inline(always)]
    pub fn set_mark(&self) {
        self.add_flag(HeaderFlags::MARKED);
    }

    #[inline(always)]
    pub fn clear_mark(&self) {
        self.remove_flag(HeaderFlags::MARKED);
    }

    #[inline(always)]
    pub fn is_canonical(&self) -> bool {
        self.has_flag(HeaderFlags::CANONICAL)
    }

    #[inline(always)]
    pub fn set_canonical(&self) {
        self.add_flag(HeaderFlags::CANONICAL);
    }

    #[inline(always)]
    pub fn clear_canonical(&self) {
        self.remove_flag(HeaderFlags::CANONICAL);
    }

    #[inline(always)]
    pub fn is_remembered(&self) -> bool {
        self.has_flag(HeaderFlags::REMEMBERED)
    }

    #[inline(always)]
    pub fn set_remembered(&self) {
        self.add_flag(HeaderFlags::REMEMBERED);
    }

    #[inline(always)]
    pub fn clear_remembered(&self) {
        self.remove_flag(HeaderFlags::REMEMBERED);
    }

    #[inline(always)]
    pub fn is_from_snapshot(&self) -> bool {
        self.has_flag(HeaderFlags::FROM_SNAPSHOT)
    }

    #[inline(always)]
    pub fn set_from_snapshot(&self) {
        self.add_flag(HeaderFlags::FROM_SNAPSHOT);
    }

    // ── forwarding ─────────────────────────────────────────────────

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        self.raw() & TAG_MASK == FORWARDED_TAG
    }

    /// Address of the copy of a forwarded object.
    #[inline(always)]
    pub fn forwarding_address(&self) -> usize {
        debug_assert!(self.is_forwarded());
        (self.raw() - FORWARDED_TAG) as usize
    }

    #[inline(always)]
    pub fn forward_to(&self, new_addr: usize) {
        debug_assert!(new_addr as u64 & TAG_MASK == 0);
        self.set_raw(new_addr as u64 | FORWARDED_TAG);
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_forwarded() {
            return write!(f, "Header(forwarded 0x{:x})", self.forwarding_address());
        }
        f.debug_struct("Header")
            .field("class_id", &self.class_id())
            .field("size_tag", &self.size_tag())
            .field("flags", &self.flags())
            .finish()
    }
}
