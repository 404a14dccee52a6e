//! Binary layouts of the built-in object kinds.
//!
//! Every layout starts with a [`Header`] and is padded to
//! [`OBJECT_ALIGNMENT`]. Variable-length objects keep their length as a smi
//! so the heap can compute their size when the size tag overflows.

use crate::class_id::{self, ClassId, cid};
use crate::header::Header;
use crate::value::{OBJECT_ALIGNMENT, Value, WORD_SIZE, round_up_to_alignment};

const HEADER_SIZE: usize = size_of::<Header>();

#[inline(always)]
unsafe fn trailing<T, E>(obj: &T, offset: usize) -> *mut E {
    unsafe { (obj as *const T as *mut u8).add(offset) as *mut E }
}

// ── Array ──────────────────────────────────────────────────────────

/// A fixed-length array of tagged values.
///
/// ```text
/// [Header] [type_arguments] [length: smi] [elem_0] [elem_1] ...
/// ```
#[repr(C)]
pub struct Array {
    pub header: Header,
    pub type_arguments: Value,
    pub length: Value,
}

const _: () = assert!(size_of::<Array>() == 24);

impl Array {
    pub const DATA_OFFSET: usize = size_of::<Array>();

    #[inline(always)]
    pub const fn allocation_size(length: usize) -> usize {
        round_up_to_alignment(Self::DATA_OFFSET + length * WORD_SIZE)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length.to_usize()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn data_ptr(&self) -> *mut Value {
        unsafe { trailing(self, Self::DATA_OFFSET) }
    }

    /// # Safety
    ///
    /// The array must be fully initialized.
    #[inline(always)]
    pub unsafe fn elements(&self) -> &[Value] {
        unsafe { core::slice::from_raw_parts(self.data_ptr(), self.len()) }
    }

    /// # Safety
    ///
    /// The array must be fully initialized; no other reference to its
    /// elements may be live.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn elements_mut(&self) -> &mut [Value] {
        unsafe { core::slice::from_raw_parts_mut(self.data_ptr(), self.len()) }
    }

    #[inline(always)]
    pub fn at(&self, index: usize) -> Value {
        debug_assert!(index < self.len(), "array index {index} out of range");
        unsafe { *self.data_ptr().add(index) }
    }

    /// Raw store. The caller is responsible for the write barrier.
    #[inline(always)]
    pub fn set_at_raw(&self, index: usize, value: Value) {
        debug_assert!(index < self.len(), "array index {index} out of range");
        unsafe { *self.data_ptr().add(index) = value }
    }

    #[inline(always)]
    pub fn slot_addr(&self, index: usize) -> *mut Value {
        unsafe { self.data_ptr().add(index) }
    }
}

// ── GrowableObjectArray ────────────────────────────────────────────

#[repr(C)]
pub struct GrowableObjectArray {
    pub header: Header,
    pub type_arguments: Value,
    pub length: Value,
    /// Backing [`Array`]; its length is the capacity.
    pub data: Value,
}

const _: () = assert!(size_of::<GrowableObjectArray>() == 32);

impl GrowableObjectArray {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length.to_usize()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Numbers ────────────────────────────────────────────────────────

#[repr(C)]
pub struct Double {
    pub header: Header,
    pub value: f64,
}

const _: () = assert!(size_of::<Double>() == OBJECT_ALIGNMENT);

#[repr(C)]
pub struct Mint {
    pub header: Header,
    pub value: i64,
}

const _: () = assert!(size_of::<Mint>() == OBJECT_ALIGNMENT);

/// Arbitrary precision integer, little-endian base 2^32 digits.
///
/// ```text
/// [Header] [used: smi] [negative: smi] [digit_0: u32] [digit_1: u32] ...
/// ```
#[repr(C)]
pub struct Bigint {
    pub header: Header,
    pub used: Value,
    pub negative: Value,
}

impl Bigint {
    pub const DIGITS_OFFSET: usize = size_of::<Bigint>();

    #[inline(always)]
    pub const fn allocation_size(digits: usize) -> usize {
        round_up_to_alignment(Self::DIGITS_OFFSET + digits * 4)
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        self.used.to_usize()
    }

    #[inline(always)]
    pub fn is_negative(&self) -> bool {
        self.negative.to_i64() != 0
    }

    #[inline(always)]
    pub fn digits(&self) -> &[u32] {
        unsafe {
            core::slice::from_raw_parts(
                trailing(self, Self::DIGITS_OFFSET),
                self.used(),
            )
        }
    }

    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub fn digits_mut(&self) -> &mut [u32] {
        unsafe {
            core::slice::from_raw_parts_mut(
                trailing(self, Self::DIGITS_OFFSET),
                self.used(),
            )
        }
    }
}

// ── Strings ────────────────────────────────────────────────────────

/// Shared prefix of every string layout.
#[repr(C)]
pub struct StringHeader {
    pub header: Header,
    pub length: Value,
    /// Cached hash as a smi, 0 until computed.
    pub hash: Value,
}

impl StringHeader {
    pub const DATA_OFFSET: usize = size_of::<StringHeader>();

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length.to_usize()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[repr(C)]
pub struct OneByteString {
    pub base: StringHeader,
}

impl OneByteString {
    #[inline(always)]
    pub const fn allocation_size(length: usize) -> usize {
        round_up_to_alignment(StringHeader::DATA_OFFSET + length)
    }

    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                trailing(self, StringHeader::DATA_OFFSET),
                self.base.len(),
            )
        }
    }

    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub fn bytes_mut(&self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                trailing(self, StringHeader::DATA_OFFSET),
                self.base.len(),
            )
        }
    }
}

#[repr(C)]
pub struct TwoByteString {
    pub base: StringHeader,
}

impl TwoByteString {
    #[inline(always)]
    pub const fn allocation_size(length: usize) -> usize {
        round_up_to_alignment(StringHeader::DATA_OFFSET + length * 2)
    }

    #[inline(always)]
    pub fn units(&self) -> &[u16] {
        unsafe {
            core::slice::from_raw_parts(
                trailing(self, StringHeader::DATA_OFFSET),
                self.base.len(),
            )
        }
    }

    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub fn units_mut(&self) -> &mut [u16] {
        unsafe {
            core::slice::from_raw_parts_mut(
                trailing(self, StringHeader::DATA_OFFSET),
                self.base.len(),
            )
        }
    }
}

/// String whose characters live outside the heap.
#[repr(C)]
pub struct ExternalString {
    pub base: StringHeader,
    pub data: *const u8,
    /// Embedder peer handed back to the finalizer.
    pub peer: usize,
}

impl ExternalString {
    pub const SIZE: usize = round_up_to_alignment(size_of::<ExternalString>());
}

// ── Typed data ─────────────────────────────────────────────────────

/// ```text
/// [Header] [length: smi] [element bytes ...]
/// ```
#[repr(C)]
pub struct TypedData {
    pub header: Header,
    pub length: Value,
}

impl TypedData {
    pub const DATA_OFFSET: usize = size_of::<TypedData>();

    #[inline(always)]
    pub const fn allocation_size(class_id: ClassId, length: usize) -> usize {
        round_up_to_alignment(
            Self::DATA_OFFSET + length * class_id::element_size(class_id),
        )
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length.to_usize()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { trailing(self, Self::DATA_OFFSET) }
    }

    #[inline(always)]
    pub fn length_in_bytes(&self) -> usize {
        self.len() * class_id::element_size(self.header.class_id())
    }
}

#[repr(C)]
pub struct ExternalTypedData {
    pub header: Header,
    pub length: Value,
    pub data: *mut u8,
    pub peer: usize,
}

const _: () = assert!(size_of::<ExternalTypedData>() == 32);

impl ExternalTypedData {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length.to_usize()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn length_in_bytes(&self) -> usize {
        self.len() * class_id::element_size(self.header.class_id())
    }
}

// ── Context & closure ──────────────────────────────────────────────

/// Captured variables of a closure scope.
///
/// ```text
/// [Header] [num_variables: smi] [parent] [var_0] [var_1] ...
/// ```
#[repr(C)]
pub struct Context {
    pub header: Header,
    pub num_variables: Value,
    pub parent: Value,
}

const _: () = assert!(size_of::<Context>() == 24);

impl Context {
    pub const VARIABLES_OFFSET: usize = size_of::<Context>();

    #[inline(always)]
    pub const fn allocation_size(num_variables: usize) -> usize {
        round_up_to_alignment(Self::VARIABLES_OFFSET + num_variables * WORD_SIZE)
    }

    #[inline(always)]
    pub fn num_variables(&self) -> usize {
        self.num_variables.to_usize()
    }

    #[inline(always)]
    pub fn variable_addr(&self, index: usize) -> *mut Value {
        debug_assert!(index < self.num_variables());
        unsafe { trailing::<_, Value>(self, Self::VARIABLES_OFFSET).add(index) }
    }

    #[inline(always)]
    pub fn at(&self, index: usize) -> Value {
        unsafe { *self.variable_addr(index) }
    }
}

/// A function paired with its captured context.
///
/// The function slot holds the function's id as a smi.
#[repr(C)]
pub struct Closure {
    pub header: Header,
    pub type_arguments: Value,
    pub function: Value,
    pub context: Value,
}

const _: () = assert!(size_of::<Closure>() == 32);

// ── Errors ─────────────────────────────────────────────────────────

/// Layout shared by api, language and unwind errors.
#[repr(C)]
pub struct MessageError {
    pub header: Header,
    pub message: Value,
}

const _: () = assert!(size_of::<MessageError>() == OBJECT_ALIGNMENT);

#[repr(C)]
pub struct UnhandledException {
    pub header: Header,
    pub exception: Value,
    pub stacktrace: Value,
}

impl UnhandledException {
    pub const SIZE: usize = round_up_to_alignment(size_of::<Self>());
}

/// Captured call stack: parallel arrays of function ids and pc offsets.
#[repr(C)]
pub struct Stacktrace {
    pub header: Header,
    pub functions: Value,
    pub pc_offsets: Value,
}

impl Stacktrace {
    pub const SIZE: usize = round_up_to_alignment(size_of::<Self>());
}

// ── Singletons ─────────────────────────────────────────────────────

#[repr(C)]
pub struct Null {
    pub header: Header,
    _pad: u64,
}

const _: () = assert!(size_of::<Null>() == OBJECT_ALIGNMENT);

#[repr(C)]
pub struct Bool {
    pub header: Header,
    pub value: Value,
}

const _: () = assert!(size_of::<Bool>() == OBJECT_ALIGNMENT);

// ── Misc ───────────────────────────────────────────────────────────

/// Key/value pair whose value is only kept alive while the key is.
#[repr(C)]
pub struct WeakProperty {
    pub header: Header,
    pub key: Value,
    pub value: Value,
}

impl WeakProperty {
    pub const SIZE: usize = round_up_to_alignment(size_of::<Self>());
}

#[repr(C)]
pub struct RegExp {
    pub header: Header,
    pub pattern: Value,
    pub flags: Value,
    pub num_groups: Value,
}

const _: () = assert!(size_of::<RegExp>() == 32);

/// Send and receive ports only carry the raw 64-bit port id.
#[repr(C)]
pub struct Port {
    pub header: Header,
    pub id: u64,
}

const _: () = assert!(size_of::<Port>() == OBJECT_ALIGNMENT);

/// Vector of type arguments; each entry is a class id as a smi.
#[repr(C)]
pub struct TypeArguments {
    pub header: Header,
    pub length: Value,
}

impl TypeArguments {
    pub const TYPES_OFFSET: usize = size_of::<TypeArguments>();

    #[inline(always)]
    pub const fn allocation_size(length: usize) -> usize {
        round_up_to_alignment(Self::TYPES_OFFSET + length * WORD_SIZE)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length.to_usize()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn types(&self) -> &[Value] {
        unsafe {
            core::slice::from_raw_parts(
                trailing(self, Self::TYPES_OFFSET),
                self.len(),
            )
        }
    }

    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub fn types_mut(&self) -> &mut [Value] {
        unsafe {
            core::slice::from_raw_parts_mut(
                trailing(self, Self::TYPES_OFFSET),
                self.len(),
            )
        }
    }
}

// ── Instructions ───────────────────────────────────────────────────

/// Machine-code payload of a `Code`.
///
/// ```text
/// [Header] [size: smi] [code_id: smi] [pad] [payload ...]
///                                           ^ entry point
/// ```
///
/// `entry - HEADER_SIZE` recovers the object.
#[repr(C)]
pub struct Instructions {
    pub header: Header,
    pub size: Value,
    pub code_id: Value,
    _pad: u64,
}

const _: () = assert!(size_of::<Instructions>() == 32);

impl Instructions {
    pub const HEADER_SIZE: usize = size_of::<Instructions>();

    #[inline(always)]
    pub const fn allocation_size(payload: usize) -> usize {
        round_up_to_alignment(Self::HEADER_SIZE + payload)
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size.to_usize()
    }

    #[inline(always)]
    pub fn entry_point(&self) -> usize {
        self as *const Self as usize + Self::HEADER_SIZE
    }

    /// # Safety
    ///
    /// `entry` must be the entry point of a live `Instructions` object.
    #[inline(always)]
    pub unsafe fn from_entry_point<'a>(entry: usize) -> &'a Instructions {
        unsafe { &*((entry - Self::HEADER_SIZE) as *const Instructions) }
    }

    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self.entry_point() as *const u8,
                self.size(),
            )
        }
    }
}

// ── Free list element ──────────────────────────────────────────────

/// A free block in old space. Keeps pages walkable.
///
/// ```text
/// [Header] [next: raw address] [size: raw, only when the size tag is 0]
/// ```
#[repr(C)]
pub struct FreeListElement {
    pub header: Header,
    pub next: usize,
}

impl FreeListElement {
    pub const MIN_SIZE: usize = OBJECT_ALIGNMENT;
    const SIZE_OFFSET: usize = 16;

    /// Formats `size` bytes at `addr` as a free block.
    ///
    /// # Safety
    ///
    /// `addr` must be writable for `size` bytes and `size` a multiple of
    /// the object alignment.
    pub unsafe fn initialize(addr: usize, size: usize) -> *mut FreeListElement {
        debug_assert!(size >= Self::MIN_SIZE);
        debug_assert!(size % OBJECT_ALIGNMENT == 0);
        unsafe {
            Header::initialize(addr, cid::FREE_LIST_ELEMENT, size);
            let elem = addr as *mut FreeListElement;
            (*elem).next = 0;
            if Header::from_addr(addr).size_tag() == 0 {
                *((addr + Self::SIZE_OFFSET) as *mut usize) = size;
            }
            elem
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        let tagged = self.header.size_tag();
        if tagged != 0 {
            tagged
        } else {
            unsafe {
                *((self as *const Self as usize + Self::SIZE_OFFSET)
                    as *const usize)
            }
        }
    }
}

// ── Instances ──────────────────────────────────────────────────────

/// A user-class instance: header followed by tagged fields.
#[repr(C)]
pub struct Instance {
    pub header: Header,
}

impl Instance {
    pub const FIELDS_OFFSET: usize = HEADER_SIZE;

    #[inline(always)]
    pub fn field_addr(&self, offset: usize) -> *mut Value {
        debug_assert!(offset >= Self::FIELDS_OFFSET);
        debug_assert!(offset % WORD_SIZE == 0);
        unsafe { trailing(self, offset) }
    }

    #[inline(always)]
    pub fn field(&self, offset: usize) -> Value {
        unsafe { *self.field_addr(offset) }
    }

    /// Raw store. The caller is responsible for the write barrier.
    #[inline(always)]
    pub fn set_field_raw(&self, offset: usize, value: Value) {
        unsafe { *self.field_addr(offset) = value }
    }
}

// ── Size and pointer visiting ──────────────────────────────────────

/// Size in bytes of the object at `obj`.
///
/// # Safety
///
/// `obj` must point to a live object with an unforwarded header.
pub unsafe fn object_size(obj: *const u8) -> usize {
    let header = unsafe { Header::from_addr(obj as usize) };
    let tagged = header.size_tag();
    if tagged != 0 {
        return tagged;
    }
    let class_id = header.class_id();
    unsafe {
        match class_id {
            c if class_id::is_user_cid(c) => header.instance_size(),
            cid::ARRAY | cid::IMMUTABLE_ARRAY => {
                Array::allocation_size((*(obj as *const Array)).len())
            }
            cid::ONE_BYTE_STRING => {
                OneByteString::allocation_size((*(obj as *const StringHeader)).len())
            }
            cid::TWO_BYTE_STRING => {
                TwoByteString::allocation_size((*(obj as *const StringHeader)).len())
            }
            cid::BIGINT => Bigint::allocation_size((*(obj as *const Bigint)).used()),
            cid::CONTEXT => {
                Context::allocation_size((*(obj as *const Context)).num_variables())
            }
            cid::TYPE_ARGUMENTS => TypeArguments::allocation_size(
                (*(obj as *const TypeArguments)).len(),
            ),
            cid::INSTRUCTIONS => Instructions::allocation_size(
                (*(obj as *const Instructions)).size(),
            ),
            cid::FREE_LIST_ELEMENT => (*(obj as *const FreeListElement)).size(),
            c if class_id::is_internal_typed_data_cid(c) => {
                TypedData::allocation_size(c, (*(obj as *const TypedData)).len())
            }
            _ => {
                debug_assert!(
                    false,
                    "{} has no size tag and no variable layout",
                    class_id::class_name(class_id)
                );
                OBJECT_ALIGNMENT
            }
        }
    }
}

/// Calls `visitor` on every tagged slot of the object at `obj`.
///
/// # Safety
///
/// `obj` must point to a live, fully initialized object.
pub unsafe fn visit_pointers(obj: *const u8, visitor: &mut dyn FnMut(&mut Value)) {
    let header = unsafe { Header::from_addr(obj as usize) };
    let class_id = header.class_id();
    let addr = obj as usize;
    let slot = |offset: usize| unsafe { &mut *((addr + offset) as *mut Value) };
    let range = |visitor: &mut dyn FnMut(&mut Value), from: usize, count: usize| {
        for i in 0..count {
            visitor(unsafe { &mut *((addr + from + i * WORD_SIZE) as *mut Value) });
        }
    };
    unsafe {
        match class_id {
            cid::ARRAY | cid::IMMUTABLE_ARRAY => {
                let array = &*(obj as *const Array);
                visitor(slot(8));
                range(visitor, Array::DATA_OFFSET, array.len());
            }
            cid::GROWABLE_OBJECT_ARRAY => {
                visitor(slot(8));
                visitor(slot(24));
            }
            cid::CONTEXT => {
                let context = &*(obj as *const Context);
                visitor(slot(16));
                range(visitor, Context::VARIABLES_OFFSET, context.num_variables());
            }
            cid::CLOSURE => {
                visitor(slot(8));
                visitor(slot(24));
            }
            cid::API_ERROR | cid::LANGUAGE_ERROR | cid::UNWIND_ERROR => {
                visitor(slot(8));
            }
            cid::UNHANDLED_EXCEPTION | cid::STACKTRACE | cid::WEAK_PROPERTY => {
                visitor(slot(8));
                visitor(slot(16));
            }
            cid::REGEXP => visitor(slot(8)),
            cid::TYPE_ARGUMENTS => {
                let args = &*(obj as *const TypeArguments);
                range(visitor, TypeArguments::TYPES_OFFSET, args.len());
            }
            cid::FREE_LIST_ELEMENT
            | cid::INSTRUCTIONS
            | cid::NULL
            | cid::BOOL
            | cid::MINT
            | cid::BIGINT
            | cid::DOUBLE
            | cid::SEND_PORT
            | cid::RECEIVE_PORT => {}
            c if class_id::is_string_cid(c) || class_id::is_typed_data_cid(c) => {}
            _ => {
                let size = object_size(obj);
                range(visitor, HEADER_SIZE, (size - HEADER_SIZE) / WORD_SIZE);
            }
        }
    }
}
